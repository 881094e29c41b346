use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use undercut::data::{load_laps, load_pit_events};
use undercut::model::FallbackLevel;
use undercut::strategy::ANY_COMPOUND;
use undercut::tyre_age::average_stint_length;
use undercut::{
    ModelSet, ParameterScope, ParameterStore, SimulationScenario, TyreAgeEngine, UndercutConfig, UndercutSimulator,
};

/// Undercut predictor
///
/// Rebuilds tyre ages from lap and pit telemetry, resolves the degradation,
/// outlap and pit-loss models, then estimates the chance that pitting now
/// gets car A ahead of car B.
#[derive(Parser, Debug)]
#[command(name = "undercut")]
#[command(version, about, long_about = None)]
struct Args {
    /// Lap telemetry CSV
    laps: PathBuf,

    /// Pit event CSV
    pits: PathBuf,

    /// Circuit the telemetry comes from
    #[arg(long, default_value = "unknown")]
    circuit: String,

    /// Compound car A fits at the stop
    #[arg(long, default_value = "MEDIUM")]
    compound: String,

    /// Seconds of cushion car A holds over car B
    #[arg(long, default_value = "20")]
    gap: f64,

    /// Laps already on car B's tyres
    #[arg(long, default_value = "15")]
    tyre_age_b: u32,

    /// Laps simulated after the stop
    #[arg(long, default_value = "3")]
    horizon: u32,

    /// Probability that car B pits on the next lap (0.0-1.0)
    #[arg(long, default_value = "0.5")]
    p_pit_next: f64,

    /// Monte Carlo trials
    #[arg(short = 'n', long, default_value = "10000")]
    samples: usize,

    /// Random seed for reproducible results
    #[arg(long, default_value = "42")]
    seed: u64,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Parameter store directory, overriding the configuration
    #[arg(long)]
    store: Option<PathBuf>,

    /// Save local fits to the parameter store
    #[arg(long)]
    save: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("UNDERCUT_LOG").unwrap_or_else(|_| EnvFilter::new("undercut=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => UndercutConfig::load(path).with_context(|| format!("loading config {}", path.display()))?,
        None => UndercutConfig::default(),
    };
    if let Some(dir) = &args.store {
        config.store.path = Some(dir.clone());
    }

    // load telemetry and rebuild tyre ages
    let laps = load_laps(&args.laps).with_context(|| format!("reading {}", args.laps.display()))?;
    let pits = load_pit_events(&args.pits).with_context(|| format!("reading {}", args.pits.display()))?;
    if laps.is_empty() {
        bail!("no laps found in {}", args.laps.display());
    }
    info!(laps = laps.len(), pits = pits.len(), "telemetry loaded");

    let engine = TyreAgeEngine::new(config.tyre_age.clone());
    let aged = engine.compute(&laps, &pits)?;
    let stints = engine.stints(&laps, &pits)?;

    println!("Avg stint length ({} stints):", stints.len());
    for compound in ["SOFT", "MEDIUM", "HARD"] {
        println!("- {:6} : {:5.1} laps", compound, average_stint_length(&stints, compound, 0.0));
    }

    // fit or fall back for each model
    let store = ParameterStore::from_config(&config.store)?;
    let models = ModelSet::resolve(Some(&aged), Some(&pits), &args.circuit, &args.compound, Some(&store), &config)?;

    println!("\nModels ({} / {}):", args.circuit, models.compound);
    println!("- degradation : {}", models.degradation.level);
    for reason in &models.degradation.reasons {
        println!("    skipped: {}", reason);
    }
    if let Some(mae) = models.degradation.value.mean_absolute_error(&aged, &config.degradation) {
        println!("    mean absolute error: {:.3} s/lap", mae);
    }
    println!("- outlap      : {}", models.outlap.level);
    println!("- pit loss    : {}", models.pit_loss.level);
    let window = models.pit_loss.value.summary();
    println!(
        "    pit window: mean {:.2}s, p10 {:.2}s, p90 {:.2}s, P(<25s) {:.2}",
        window.mean, window.p10, window.p90, window.prob_under_25s
    );

    if args.save {
        let scope = ParameterScope::CircuitCompound;
        let mut records = Vec::new();
        if models.degradation.level == FallbackLevel::LocalFit {
            records.extend(models.degradation.value.to_record(&args.circuit, &models.compound, scope));
        }
        if models.outlap.level == FallbackLevel::LocalFit {
            records.push(models.outlap.value.to_record(&args.circuit, &models.compound, scope));
        }
        if models.pit_loss.level == FallbackLevel::LocalFit {
            records.push(models.pit_loss.value.to_record(&args.circuit, ANY_COMPOUND, scope));
        }
        store.save(&records)?;
        println!("\nSaved {} parameter records", records.len());
    }

    match store.path() {
        Some(dir) => println!("\nParameter store ({}):", dir.display()),
        None => println!("\nParameter store (in memory):"),
    }
    for kind in store.summary() {
        let quality = kind.mean_quality.map_or("-".to_string(), |q| format!("{q:.3}"));
        println!(
            "- {:11} : {:3} records, {} circuits, {} compounds, mean quality {}",
            kind.kind.as_str(), kind.records, kind.circuits, kind.compounds, quality
        );
    }

    let scenario = SimulationScenario {
        gap_now: args.gap,
        compound_a: args.compound.clone(),
        tyre_age_b: args.tyre_age_b,
        horizon_laps: args.horizon,
        p_pit_next: args.p_pit_next,
    };
    let simulator = UndercutSimulator::new(&models, config.simulator.clone());
    let result = simulator.simulate_seeded(&scenario, args.samples, args.seed)?;

    println!(
        "\n--- Undercut (gap {:.1}s, horizon {} laps, P(rival pits) {:.2}) ---",
        scenario.gap_now, scenario.horizon_laps, scenario.p_pit_next
    );
    println!("P(success)      : {:.3}", result.probability_of_success);
    println!("Expected margin : {:+.2}s", result.expected_margin);
    println!("90% interval    : [{:+.2}s, {:+.2}s]", result.ci_lower, result.ci_upper);
    println!("{}", serde_json::to_string_pretty(&result.assumptions)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn defaults_and_equals_syntax() {
        let args = Args::try_parse_from(["undercut", "laps.csv", "pits.csv", "--gap=5", "--p-pit-next", "0.8"]).unwrap();
        assert_eq!(args.laps, PathBuf::from("laps.csv"));
        assert_eq!(args.gap, 5.0);
        assert_eq!(args.p_pit_next, 0.8);
        assert_eq!(args.compound, "MEDIUM");
        assert_eq!(args.tyre_age_b, 15);
        assert_eq!(args.samples, 10_000);
        assert_eq!(args.seed, 42);
        assert!(!args.save);
        assert!(args.store.is_none());
    }

    #[test]
    fn help_is_not_a_parse_failure() {
        let err = Args::try_parse_from(["undercut", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        assert_eq!(err.exit_code(), 0);
    }

    #[test]
    fn missing_inputs_and_bad_values_are_rejected() {
        assert!(Args::try_parse_from(["undercut", "laps.csv"]).is_err());
        assert!(Args::try_parse_from(["undercut", "laps.csv", "pits.csv", "--horizon", "three"]).is_err());
    }
}
