use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// All tunables of the core, loadable from a JSON file.
/// Any field left out of the file keeps its default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UndercutConfig {
    pub tyre_age: TyreAgeConfig,
    pub degradation: DegradationConfig,
    pub outlap: OutlapConfig,
    pub pit_loss: PitLossConfig,
    pub simulator: SimulatorConfig,
    pub store: StoreConfig,
}

impl UndercutConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TyreAgeConfig {
    /// A lap slower than baseline * (1 + threshold) counts as neutralized
    /// when no track status is available.
    pub neutralization_threshold: f64,
    /// Track status values that mean safety car or virtual safety car.
    pub neutralized_statuses: Vec<String>,
    /// Baseline used when no lap times are available to estimate one.
    pub fallback_baseline_s: f64,
}

impl Default for TyreAgeConfig {
    fn default() -> Self {
        Self {
            neutralization_threshold: 0.30,
            neutralized_statuses: ["4", "6", "SC", "VSC"].iter().map(|s| s.to_string()).collect(),
            fallback_baseline_s: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub min_points: usize,
    pub cv_folds: usize,
    pub min_cv_r2: f64,
    /// Huber tuning constant, in units of the robust residual scale.
    pub huber_k: f64,
    pub max_iterations: usize,
    pub min_lap_time_s: f64,
    pub max_lap_time_s: f64,
    pub max_tyre_age: u32,
    pub iqr_k: f64,
    pub baseline_percentile: f64,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            min_points: 10,
            cv_folds: 5,
            min_cv_r2: 0.1,
            huber_k: 1.345,
            max_iterations: 50,
            min_lap_time_s: 60.0,
            max_lap_time_s: 200.0,
            max_tyre_age: 50,
            iqr_k: 1.5,
            baseline_percentile: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlapConfig {
    /// Penalty bands tried in order until enough outlaps survive.
    pub band_stages: Vec<(f64, f64)>,
    pub min_points: usize,
    pub std_floor_s: f64,
    pub baseline_percentile: f64,
    /// First tyre age counted as a warmed lap.
    pub warm_from_age: u32,
    pub min_quality: f64,
    pub min_samples: usize,
}

impl Default for OutlapConfig {
    fn default() -> Self {
        Self {
            band_stages: vec![(0.0, 8.0), (0.0, 12.0), (0.0, 20.0)],
            min_points: 3,
            std_floor_s: 0.1,
            baseline_percentile: 25.0,
            warm_from_age: 3,
            min_quality: 0.0,
            min_samples: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PitLossConfig {
    /// Added to pit lane duration when no total loss was recorded.
    pub lane_overhead_s: f64,
    pub plausible_min_s: f64,
    pub plausible_max_s: f64,
    pub trim_sigma: f64,
    /// Above this removed share the trimmed fit is abandoned for a robust one.
    pub max_trim_fraction: f64,
    pub min_points: usize,
    pub std_floor_s: f64,
    pub min_quality: f64,
    pub min_samples: usize,
}

impl Default for PitLossConfig {
    fn default() -> Self {
        Self {
            lane_overhead_s: 3.0,
            plausible_min_s: 10.0,
            plausible_max_s: 60.0,
            trim_sigma: 3.0,
            max_trim_fraction: 0.5,
            min_points: 3,
            std_floor_s: 0.1,
            min_quality: 0.0,
            min_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Extra grip of a new set on its first lap, in seconds.
    pub fresh_grip_s: f64,
    /// Per-lap retention of that extra grip (diminishing returns).
    pub fresh_decay: f64,
    /// Per-lap growth of the cost of staying out on old tyres.
    pub aging_multiplier: f64,
    pub max_horizon_laps: u32,
    pub max_samples: usize,
    pub max_gap_s: f64,
    pub max_tyre_age: u32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            fresh_grip_s: 0.3,
            fresh_decay: 0.85,
            aging_multiplier: 1.05,
            max_horizon_laps: 10,
            max_samples: 100_000,
            max_gap_s: 120.0,
            max_tyre_age: 80,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory for persisted parameters; in-memory only when unset.
    pub path: Option<PathBuf>,
    /// Use built-in constants when neither a local fit nor stored parameters qualify.
    pub allow_hardcoded_defaults: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: None, allow_hardcoded_defaults: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: UndercutConfig =
            serde_json::from_str(r#"{"simulator": {"fresh_decay": 0.9}, "degradation": {"cv_folds": 4}}"#)
                .unwrap();
        assert_eq!(cfg.simulator.fresh_decay, 0.9);
        assert_eq!(cfg.simulator.aging_multiplier, 1.05);
        assert_eq!(cfg.degradation.cv_folds, 4);
        assert_eq!(cfg.degradation.min_points, 10);
        assert_eq!(cfg.tyre_age.neutralization_threshold, 0.30);
        assert!(cfg.store.allow_hardcoded_defaults);
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("undercut.json");
        fs::write(&path, r#"{"outlap": {"band_stages": [[0.0, 6.0]]}}"#).unwrap();
        let cfg = UndercutConfig::load(&path).unwrap();
        assert_eq!(cfg.outlap.band_stages, vec![(0.0, 6.0)]);
    }
}
