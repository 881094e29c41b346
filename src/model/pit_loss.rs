//! Total time lost to a pit stop, as a Normal distribution clamped to a
//! physically plausible window.

use rand::Rng;
use tracing::{debug, info, warn};

use super::{FallbackChain, FallbackReason, NormalFit, Resolved};
use crate::config::PitLossConfig;
use crate::data::{dedup_pit_events, PitEvent};
use crate::error::{Result, UndercutError};
use crate::params::{Coefficients, ModelKind, ModelParameterRecord, ParameterScope, QualityGate};
use crate::stats;

// MAD to standard deviation under normal errors
const MAD_SCALE: f64 = 1.4826;

#[derive(Debug, Clone, PartialEq)]
pub struct PitLossModel {
    pub dist: NormalFit,
    /// Share of observations kept after the sanity band and sigma trim.
    pub quality: f64,
    pub sample_count: usize,
    /// Median/MAD estimate used because trimming removed too much.
    pub robust: bool,
}

/// Pit-window digest, all values in seconds or probabilities.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PitWindowSummary {
    pub mean: f64,
    pub std: f64,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub prob_under_25s: f64,
    pub prob_over_30s: f64,
}

impl PitLossModel {
    pub fn hardcoded(config: &PitLossConfig) -> Self {
        Self::with_params(23.0, 2.0, config, 0.0, 0)
    }

    fn with_params(mean: f64, std: f64, config: &PitLossConfig, quality: f64, sample_count: usize) -> Self {
        let band = (config.plausible_min_s, config.plausible_max_s);
        let mean = mean.clamp(band.0.min(band.1), band.0.max(band.1));
        Self {
            dist: NormalFit::new(mean, std, config.std_floor_s, band),
            quality,
            sample_count,
            robust: false,
        }
    }

    /// Fits on pit events. An event counts with its observed total loss,
    /// or its lane duration plus the configured overhead when that is all
    /// there is. Duplicate entries for one stop count once.
    pub fn fit(events: &[PitEvent], config: &PitLossConfig) -> Result<Self> {
        let observed: Vec<f64> = dedup_pit_events(events)
            .iter()
            .filter_map(|ev| {
                ev.total_time_loss
                    .or_else(|| ev.pit_duration.map(|d| d + config.lane_overhead_s))
            })
            .filter(|v| v.is_finite())
            .collect();

        let sane: Vec<f64> = observed
            .iter()
            .copied()
            .filter(|v| *v >= config.plausible_min_s && *v <= config.plausible_max_s)
            .collect();
        let needed = config.min_points.max(2);
        if sane.len() < needed {
            return Err(UndercutError::DataInsufficiency {
                model: ModelKind::PitLoss.as_str(),
                needed,
                got: sane.len(),
            });
        }

        let mean = stats::mean(&sane).unwrap_or(0.0);
        let std = stats::sample_std(&sane);
        let trimmed: Vec<f64> = if std > 0.0 {
            sane.iter().copied().filter(|v| (v - mean).abs() <= config.trim_sigma * std).collect()
        } else {
            sane.clone()
        };
        let removed = 1.0 - trimmed.len() as f64 / sane.len() as f64;

        let model = if trimmed.len() < needed || removed > config.max_trim_fraction {
            warn!(kept = trimmed.len(), removed, "sigma trim too aggressive, using median and MAD");
            let median = stats::median(&sane).unwrap_or(mean);
            let spread = stats::mad(&sane).unwrap_or(0.0) * MAD_SCALE;
            let quality = sane.len() as f64 / observed.len() as f64;
            Self { robust: true, ..Self::with_params(median, spread, config, quality, sane.len()) }
        } else {
            let quality = trimmed.len() as f64 / observed.len() as f64;
            let trimmed_mean = stats::mean(&trimmed).unwrap_or(mean);
            Self::with_params(trimmed_mean, stats::sample_std(&trimmed), config, quality, trimmed.len())
        };

        debug!(observed = observed.len(), sane = sane.len(), trimmed = trimmed.len(), "pit loss observations");
        info!(
            mean = model.mean(),
            std = model.std(),
            samples = model.sample_count,
            robust = model.robust,
            "pit loss model fitted"
        );
        Ok(model)
    }

    pub fn resolve(
        events: Option<&[PitEvent]>,
        chain: &FallbackChain<'_>,
        config: &PitLossConfig,
    ) -> Result<Resolved<Self>> {
        let threshold = config.min_quality;
        chain.resolve(
            events.map(|e| Self::fit(e, config)),
            |m: &Self| {
                if m.quality >= threshold {
                    Ok(())
                } else {
                    Err(FallbackReason::QualityRejected { score: m.quality, threshold })
                }
            },
            |r| Self::from_record(r, config),
            || Self::hardcoded(config),
        )
    }

    pub fn quality_gate(config: &PitLossConfig) -> QualityGate {
        QualityGate::new(config.min_quality, config.min_samples)
    }

    pub fn mean(&self) -> f64 {
        self.dist.mean
    }

    pub fn std(&self) -> f64 {
        self.dist.std
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        self.dist.draw(rng)
    }

    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<f64> {
        self.dist.sample(n, rng)
    }

    /// P(loss < threshold) under the fitted Normal.
    pub fn probability_faster_than(&self, threshold_s: f64) -> f64 {
        self.dist.cdf(threshold_s)
    }

    /// `(p, loss)` pairs for each percentile strictly inside (0, 100).
    /// Others are skipped.
    pub fn percentiles(&self, ps: &[f64]) -> Vec<(f64, f64)> {
        ps.iter()
            .filter_map(|&p| self.dist.quantile(p / 100.0).map(|v| (p, v)))
            .collect()
    }

    pub fn summary(&self) -> PitWindowSummary {
        let q = |p: f64| self.dist.quantile(p).unwrap_or(self.dist.mean);
        PitWindowSummary {
            mean: self.mean(),
            std: self.std(),
            p10: q(0.10),
            p50: q(0.50),
            p90: q(0.90),
            prob_under_25s: self.probability_faster_than(25.0),
            prob_over_30s: 1.0 - self.probability_faster_than(30.0),
        }
    }

    pub fn from_record(record: &ModelParameterRecord, config: &PitLossConfig) -> Option<Self> {
        match record.coefficients {
            Coefficients::Normal { mean, std } => {
                Some(Self::with_params(mean, std, config, record.quality, record.sample_count))
            }
            Coefficients::Quadratic { .. } => None,
        }
    }

    pub fn to_record(&self, circuit: &str, compound: &str, scope: ParameterScope) -> ModelParameterRecord {
        ModelParameterRecord {
            kind: ModelKind::PitLoss,
            circuit: circuit.to_string(),
            compound: compound.to_string(),
            coefficients: Coefficients::Normal { mean: self.dist.mean, std: self.dist.std },
            quality: self.quality,
            rmse: None,
            sample_count: self.sample_count,
            scope,
        }
    }
}
