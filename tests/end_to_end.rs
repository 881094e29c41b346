use std::fmt::Write;

use undercut::data::{read_laps, read_pit_events};
use undercut::model::FallbackReason;
use undercut::strategy::ANY_COMPOUND;
use undercut::{
    compute_tyre_age, FallbackLevel, LapRecord, ModelSet, ParameterScope, ParameterStore, PitEvent,
    SimulationScenario, UndercutConfig, UndercutError, UndercutSimulator,
};

// ten cars, thirty laps, everyone stops on lap 15 (MEDIUM -> HARD), safety
// car on laps 8 and 9. Car 12 has a duplicate, aborted pit entry.
fn race() -> (Vec<LapRecord>, Vec<PitEvent>) {
    let mut laps = String::from("driver_number,LapNumber,lap_duration,tire_compound,TrackStatus\n");
    let mut pits = String::from("driver_number,lap_number,pit_duration\n12,15,38.0\n");

    for d in 0..10u32 {
        let driver = 10 + d;
        let mut age = 0u32;
        for lap in 1..=30u32 {
            let neutralized = lap == 8 || lap == 9;
            if lap == 1 || lap == 15 {
                age = 1;
            } else if !neutralized {
                age += 1;
            }
            let x = age as f64;
            let noise = (((lap * 13 + d * 7) % 9) as f64 - 4.0) * 0.02;
            let mut time = 90.0 + 0.03 * d as f64 + 0.05 * x + 0.003 * x * x + noise;
            if lap == 15 {
                time += 2.0;
            }
            let (time, status) = if neutralized { (121.0, "4") } else { (time, "1") };
            let compound = if lap < 15 { "M" } else { "H" };
            writeln!(laps, "{driver},{lap},{time:.3},{compound},{status}").unwrap();
        }
        writeln!(pits, "{driver},15,{:.1}", 20.0 + 0.2 * d as f64).unwrap();
    }

    (read_laps(laps.as_bytes()).unwrap(), read_pit_events(pits.as_bytes()).unwrap())
}

fn scenario(gap: f64, horizon: u32, p: f64) -> SimulationScenario {
    SimulationScenario {
        gap_now: gap,
        compound_a: "HARD".into(),
        tyre_age_b: 15,
        horizon_laps: horizon,
        p_pit_next: p,
    }
}

#[test]
fn tyre_ages_from_csv_telemetry() {
    let (laps, pits) = race();
    let aged = compute_tyre_age(&laps, &pits).unwrap();
    let car: Vec<u32> = aged.iter().filter(|l| l.competitor_id == "10").map(|l| l.tyre_age).collect();
    assert_eq!(&car[..10], &[1, 2, 3, 4, 5, 6, 7, 7, 7, 8]);
    assert_eq!(car[14], 1);
    assert_eq!(car[29], 16);
}

#[test]
fn full_pipeline_uses_local_fits() {
    let config = UndercutConfig::default();
    let (laps, pits) = race();
    let aged = compute_tyre_age(&laps, &pits).unwrap();

    let models = ModelSet::resolve(Some(&aged), Some(&pits), "shanghai", "HARD", None, &config).unwrap();
    assert_eq!(models.degradation.level, FallbackLevel::LocalFit);
    assert_eq!(models.outlap.level, FallbackLevel::LocalFit);
    assert_eq!(models.pit_loss.level, FallbackLevel::LocalFit);

    // the aborted 38s entry for car 12 is dropped
    assert_eq!(models.pit_loss.value.sample_count, 10);
    assert!((models.pit_loss.value.mean() - 23.9).abs() < 1e-6);
    assert!((models.outlap.value.mean() - 1.6).abs() < 0.4);
    assert_eq!(models.outlap.value.compound.as_deref(), Some("HARD"));

    let deg = &models.degradation.value;
    assert!(deg.predict(20.0) > deg.predict(5.0));
}

#[test]
fn fixed_seed_runs_are_reproducible() {
    let config = UndercutConfig::default();
    let (laps, pits) = race();
    let aged = compute_tyre_age(&laps, &pits).unwrap();
    let models = ModelSet::resolve(Some(&aged), Some(&pits), "shanghai", "HARD", None, &config).unwrap();
    let sim = UndercutSimulator::new(&models, config.simulator.clone());

    let s = scenario(25.0, 2, 1.0);
    let first = sim.simulate_seeded(&s, 1000, 2024).unwrap();
    let second = sim.simulate_seeded(&s, 1000, 2024).unwrap();
    assert_eq!(first.probability_of_success, second.probability_of_success);
    assert_eq!(first.expected_margin, second.expected_margin);
    assert_eq!(first, second);

    assert!((0.0..=1.0).contains(&first.probability_of_success));
    assert!(first.ci_lower <= first.expected_margin && first.expected_margin <= first.ci_upper);
    assert_eq!(first.assumptions.b_pits_count, 1000);
}

#[test]
fn larger_gap_is_strictly_better() {
    let config = UndercutConfig::default();
    let (laps, pits) = race();
    let aged = compute_tyre_age(&laps, &pits).unwrap();
    let models = ModelSet::resolve(Some(&aged), Some(&pits), "shanghai", "HARD", None, &config).unwrap();
    let sim = UndercutSimulator::new(&models, config.simulator.clone());

    let small = sim.simulate_seeded(&scenario(5.0, 3, 0.5), 2000, 7).unwrap();
    let large = sim.simulate_seeded(&scenario(30.0, 3, 0.5), 2000, 7).unwrap();
    assert!(large.probability_of_success > small.probability_of_success);
}

#[test]
fn sparse_history_falls_back_to_persisted_parameters() {
    let config = UndercutConfig::default();
    let dir = tempfile::tempdir().unwrap();
    let (laps, pits) = race();
    let aged = compute_tyre_age(&laps, &pits).unwrap();

    {
        let store = ParameterStore::open(dir.path()).unwrap();
        let models = ModelSet::resolve(Some(&aged), Some(&pits), "shanghai", "HARD", Some(&store), &config).unwrap();
        let scope = ParameterScope::CircuitCompound;
        let mut records = Vec::new();
        records.extend(models.degradation.value.to_record("shanghai", "HARD", scope));
        records.push(models.outlap.value.to_record("shanghai", "HARD", scope));
        records.push(models.pit_loss.value.to_record("shanghai", ANY_COMPOUND, scope));
        store.save(&records).unwrap();
    }

    let store = ParameterStore::open(dir.path()).unwrap();
    let few_laps: Vec<LapRecord> = aged.iter().take(4).cloned().collect();
    let one_stop = vec![pits[1].clone()];
    let models =
        ModelSet::resolve(Some(&few_laps), Some(&one_stop), "SHANGHAI", "hard", Some(&store), &config).unwrap();

    let stored = FallbackLevel::Stored(ParameterScope::CircuitCompound);
    assert_eq!(models.degradation.level, stored);
    assert_eq!(models.pit_loss.level, stored);
    assert!(matches!(models.degradation.reasons[0], FallbackReason::Insufficient { .. }));
    assert!((models.pit_loss.value.mean() - 23.9).abs() < 1e-6);

    // another circuit sees nothing at circuit or compound level
    let elsewhere = ModelSet::resolve(None, None, "suzuka", "HARD", Some(&store), &config).unwrap();
    assert_eq!(elsewhere.degradation.level, FallbackLevel::Hardcoded);
}

#[test]
fn compound_level_records_serve_other_circuits() {
    let config = UndercutConfig::default();
    let store = ParameterStore::in_memory();
    let (laps, pits) = race();
    let aged = compute_tyre_age(&laps, &pits).unwrap();
    let local = ModelSet::resolve(Some(&aged), Some(&pits), "pooled", "HARD", None, &config).unwrap();
    let record = local
        .degradation
        .value
        .to_record("pooled", "HARD", ParameterScope::CompoundOnly)
        .unwrap();
    store.save(&[record]).unwrap();

    let models = ModelSet::resolve(None, None, "suzuka", "Hard", Some(&store), &config).unwrap();
    assert_eq!(models.degradation.level, FallbackLevel::Stored(ParameterScope::CompoundOnly));
    assert_eq!(models.degradation.value.b, local.degradation.value.b);
    assert_eq!(models.pit_loss.level, FallbackLevel::Hardcoded);
}

#[test]
fn disabled_defaults_surface_exhaustion() {
    let mut config = UndercutConfig::default();
    config.store.allow_hardcoded_defaults = false;
    let store = ParameterStore::in_memory();
    let err = ModelSet::resolve(None, None, "monaco", "SOFT", Some(&store), &config).unwrap_err();
    assert!(matches!(err, UndercutError::FallbackExhausted { model: "degradation", .. }));
    let message = err.to_string();
    assert!(message.contains("no local data"), "{message}");
    assert!(message.contains("no stored record passes the gate"), "{message}");
}

#[test]
fn missing_identity_column_is_rejected_at_ingestion() {
    let err = read_laps("lap_time,compound\n90.0,SOFT\n".as_bytes()).unwrap_err();
    assert!(matches!(err, UndercutError::DataValidation(_)));
}
