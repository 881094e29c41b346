//! Monte Carlo evaluation of an undercut.
//!
//! Car A pits now. Car B either pits at the end of the next lap or stays
//! out for the whole horizon, decided per trial by a Bernoulli draw. Each
//! trial samples pit losses and outlap penalties, adds the deterministic
//! per-lap tyre costs of both cars and records the resulting margin. A
//! positive margin means A comes out ahead.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{SimulatorConfig, UndercutConfig};
use crate::data::{normalize_compound, LapRecord, PitEvent};
use crate::error::{Result, UndercutError};
use crate::model::{
    DegradationModel, FallbackChain, FallbackLevel, OutlapModel, OutlapPenalty, PitLossModel, Resolved,
};
use crate::params::{ModelKind, ParameterStore};
use crate::stats;

/// Compound key for models that do not depend on the tyre compound.
pub const ANY_COMPOUND: &str = "ANY";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationScenario {
    /// Seconds of cushion A holds over B before A stops.
    pub gap_now: f64,
    /// Compound A fits at the stop.
    pub compound_a: String,
    /// Laps already on B's tyres.
    pub tyre_age_b: u32,
    pub horizon_laps: u32,
    /// Probability that B responds by pitting on the next lap.
    pub p_pit_next: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationAssumptions {
    pub compound: String,
    pub n_samples: usize,
    pub pit_loss_mean_a: f64,
    pub pit_loss_std_a: f64,
    pub outlap_mean_a: f64,
    pub outlap_std_a: f64,
    /// `None` when B never pitted in any trial.
    pub pit_loss_mean_b: Option<f64>,
    pub b_pits_count: usize,
    pub b_stays_count: usize,
    pub margin_std: f64,
    pub degradation_level: String,
    pub outlap_level: String,
    pub pit_loss_level: String,
    pub fresh_grip_s: f64,
    pub fresh_decay: f64,
    pub aging_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationResult {
    pub probability_of_success: f64,
    pub expected_margin: f64,
    /// 5th percentile of the margin, never above the expected margin.
    pub ci_lower: f64,
    /// 95th percentile of the margin, never below the expected margin.
    pub ci_upper: f64,
    pub assumptions: SimulationAssumptions,
}

/// The three resolved models one simulation runs on. Built per request;
/// nothing here is shared between requests.
#[derive(Debug, Clone)]
pub struct ModelSet {
    /// Normalized compound the models describe.
    pub compound: String,
    pub degradation: Resolved<DegradationModel>,
    pub outlap: Resolved<OutlapPenalty>,
    pub pit_loss: Resolved<PitLossModel>,
}

impl ModelSet {
    pub fn new(
        compound: &str,
        degradation: Resolved<DegradationModel>,
        outlap: Resolved<OutlapPenalty>,
        pit_loss: Resolved<PitLossModel>,
    ) -> Result<Self> {
        let compound = compound_key(compound)?;
        Ok(Self { compound, degradation, outlap, pit_loss })
    }

    /// Built-in parameters for every model.
    pub fn hardcoded(compound: &str, config: &UndercutConfig) -> Result<Self> {
        Ok(Self {
            compound: compound_key(compound)?,
            degradation: fixed(DegradationModel::hardcoded()),
            outlap: fixed(OutlapPenalty::hardcoded(&config.outlap)),
            pit_loss: fixed(PitLossModel::hardcoded(&config.pit_loss)),
        })
    }

    /// Resolves all three models for `circuit` and `compound` from the
    /// given history, falling back through `store` and the defaults.
    /// `laps` must already carry tyre ages.
    pub fn resolve(
        laps: Option<&[LapRecord]>,
        pits: Option<&[PitEvent]>,
        circuit: &str,
        compound: &str,
        store: Option<&ParameterStore>,
        config: &UndercutConfig,
    ) -> Result<Self> {
        let compound = compound_key(compound)?;
        let allow = config.store.allow_hardcoded_defaults;
        let chain = |kind, key, gate| FallbackChain {
            store,
            ..FallbackChain::new(kind, circuit, key, gate).allow_default(allow)
        };

        let degradation = DegradationModel::resolve(
            laps,
            &chain(ModelKind::Degradation, compound.as_str(), DegradationModel::quality_gate(&config.degradation)),
            &config.degradation,
        )?;
        let outlap = OutlapModel::resolve(
            laps,
            &chain(ModelKind::Outlap, compound.as_str(), OutlapModel::quality_gate(&config.outlap)),
            &config.outlap,
        )?;
        let pit_loss = PitLossModel::resolve(
            pits,
            &chain(ModelKind::PitLoss, ANY_COMPOUND, PitLossModel::quality_gate(&config.pit_loss)),
            &config.pit_loss,
        )?;

        info!(
            circuit,
            compound = %compound,
            degradation = %degradation.level,
            outlap = %outlap.level,
            pit_loss = %pit_loss.level,
            "models resolved"
        );
        Ok(Self { compound, degradation, outlap, pit_loss })
    }
}

fn compound_key(raw: &str) -> Result<String> {
    normalize_compound(raw).ok_or_else(|| UndercutError::DataValidation(format!("unknown tyre compound {raw:?}")))
}

fn fixed<T>(value: T) -> Resolved<T> {
    Resolved { value, level: FallbackLevel::Hardcoded, reasons: Vec::new() }
}

// per-lap tyre costs over the horizon; fixed for a scenario, shared by all trials
#[derive(Debug, Clone)]
struct LapCosts {
    a_fresh: f64,
    b_stays: f64,
    b_pits: f64,
}

pub struct UndercutSimulator<'m> {
    models: &'m ModelSet,
    config: SimulatorConfig,
}

impl<'m> UndercutSimulator<'m> {
    pub fn new(models: &'m ModelSet, config: SimulatorConfig) -> Self {
        Self { models, config }
    }

    /// Rejects scenarios outside sane bounds before any sampling.
    pub fn validate(&self, scenario: &SimulationScenario, n_samples: usize) -> Result<()> {
        let out_of_range = |msg: String| Err(UndercutError::SimulationInputOutOfRange(msg));
        let cfg = &self.config;

        if !scenario.gap_now.is_finite() || !scenario.p_pit_next.is_finite() {
            return out_of_range("gap and pit probability must be finite".into());
        }
        if scenario.gap_now < 0.0 || scenario.gap_now > cfg.max_gap_s {
            return out_of_range(format!("gap {} outside [0, {}]", scenario.gap_now, cfg.max_gap_s));
        }
        if scenario.horizon_laps == 0 || scenario.horizon_laps > cfg.max_horizon_laps {
            return out_of_range(format!(
                "horizon {} outside [1, {}]",
                scenario.horizon_laps, cfg.max_horizon_laps
            ));
        }
        if !(0.0..=1.0).contains(&scenario.p_pit_next) {
            return out_of_range(format!("pit probability {} outside [0, 1]", scenario.p_pit_next));
        }
        if n_samples == 0 || n_samples > cfg.max_samples {
            return out_of_range(format!("sample count {} outside [1, {}]", n_samples, cfg.max_samples));
        }
        if scenario.tyre_age_b > cfg.max_tyre_age {
            return out_of_range(format!("tyre age {} above {}", scenario.tyre_age_b, cfg.max_tyre_age));
        }
        if normalize_compound(&scenario.compound_a).as_deref() != Some(self.models.compound.as_str()) {
            return out_of_range(format!(
                "compound {:?} does not match models resolved for {}",
                scenario.compound_a, self.models.compound
            ));
        }
        Ok(())
    }

    // fresh tyres: degradation at age k less a grip bonus that fades each lap
    fn fresh_cost(&self, k: u32) -> f64 {
        let bonus = self.config.fresh_grip_s * self.config.fresh_decay.powi(k as i32 - 1);
        self.models.degradation.value.predict(k as f64) - bonus
    }

    // old tyres: degradation at the running age, growing faster each lap
    fn old_cost(&self, age: u32, laps_out: u32) -> f64 {
        self.models.degradation.value.predict(age as f64) * self.config.aging_multiplier.powi(laps_out as i32 - 1)
    }

    fn lap_costs(&self, scenario: &SimulationScenario) -> LapCosts {
        let h = scenario.horizon_laps;
        let age_b = scenario.tyre_age_b;

        let a_fresh: f64 = (1..=h).map(|lap| self.fresh_cost(lap)).sum();
        let b_stays: f64 = (1..=h).map(|lap| self.old_cost(age_b + lap, lap)).sum();
        // B completes the next lap on old tyres, then runs new ones
        let b_pits = self.old_cost(age_b + 1, 1) + (2..=h).map(|lap| self.fresh_cost(lap - 1)).sum::<f64>();

        debug!(a_fresh, b_stays, b_pits, horizon = h, "lap costs");
        LapCosts { a_fresh, b_stays, b_pits }
    }

    pub fn simulate<R: Rng + ?Sized>(
        &self,
        scenario: &SimulationScenario,
        n_samples: usize,
        rng: &mut R,
    ) -> Result<SimulationResult> {
        self.validate(scenario, n_samples)?;

        let costs = self.lap_costs(scenario);
        let pit = &self.models.pit_loss.value;
        let outlap = &self.models.outlap.value;
        let b_outlap_counts = scenario.horizon_laps >= 2;

        let mut margins = Vec::with_capacity(n_samples);
        let mut pit_a_draws = Vec::with_capacity(n_samples);
        let mut out_a_draws = Vec::with_capacity(n_samples);
        let mut pit_b_draws = Vec::new();

        for _ in 0..n_samples {
            let pit_a = pit.draw(rng);
            let out_a = outlap.draw(rng);
            let mut margin = scenario.gap_now - pit_a - out_a - costs.a_fresh;

            if rng.gen_bool(scenario.p_pit_next) {
                let pit_b = pit.draw(rng);
                let out_b = outlap.draw(rng);
                margin += costs.b_pits + pit_b;
                if b_outlap_counts {
                    margin += out_b;
                }
                pit_b_draws.push(pit_b);
            } else {
                margin += costs.b_stays;
            }

            pit_a_draws.push(pit_a);
            out_a_draws.push(out_a);
            margins.push(margin);
        }

        let successes = margins.iter().filter(|m| **m > 0.0).count();
        let expected_margin = stats::mean(&margins).unwrap_or(0.0);
        let mut sorted = margins.clone();
        stats::sort_floats(&mut sorted);
        let p5 = stats::percentile_sorted(&sorted, 5.0).unwrap_or(expected_margin);
        let p95 = stats::percentile_sorted(&sorted, 95.0).unwrap_or(expected_margin);

        let result = SimulationResult {
            probability_of_success: successes as f64 / n_samples as f64,
            expected_margin,
            ci_lower: p5.min(expected_margin),
            ci_upper: p95.max(expected_margin),
            assumptions: SimulationAssumptions {
                compound: self.models.compound.clone(),
                n_samples,
                pit_loss_mean_a: stats::mean(&pit_a_draws).unwrap_or(pit.mean()),
                pit_loss_std_a: stats::sample_std(&pit_a_draws),
                outlap_mean_a: stats::mean(&out_a_draws).unwrap_or(outlap.mean()),
                outlap_std_a: stats::sample_std(&out_a_draws),
                pit_loss_mean_b: stats::mean(&pit_b_draws),
                b_pits_count: pit_b_draws.len(),
                b_stays_count: n_samples - pit_b_draws.len(),
                margin_std: stats::sample_std(&margins),
                degradation_level: self.models.degradation.level.to_string(),
                outlap_level: self.models.outlap.level.to_string(),
                pit_loss_level: self.models.pit_loss.level.to_string(),
                fresh_grip_s: self.config.fresh_grip_s,
                fresh_decay: self.config.fresh_decay,
                aging_multiplier: self.config.aging_multiplier,
            },
        };

        info!(
            gap = scenario.gap_now,
            horizon = scenario.horizon_laps,
            p_pit_next = scenario.p_pit_next,
            n_samples,
            probability = result.probability_of_success,
            expected_margin = result.expected_margin,
            "undercut simulated"
        );
        Ok(result)
    }

    /// Same as [`Self::simulate`] with a ChaCha8 generator seeded from `seed`.
    pub fn simulate_seeded(
        &self,
        scenario: &SimulationScenario,
        n_samples: usize,
        seed: u64,
    ) -> Result<SimulationResult> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.simulate(scenario, n_samples, &mut rng)
    }
}
