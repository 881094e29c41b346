//! Cold-tyre outlap penalty: time lost on the first lap of a new set
//! against the same car's warmed-tyre pace.

use rand::Rng;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{FallbackChain, FallbackReason, NormalFit, Resolved};
use crate::config::OutlapConfig;
use crate::data::{normalize_compound, LapRecord};
use crate::error::{Result, UndercutError};
use crate::params::{Coefficients, ModelKind, ModelParameterRecord, ParameterScope, QualityGate};
use crate::stats;

const MODEL: &str = "outlap";

#[derive(Debug, Clone, PartialEq)]
pub struct OutlapPenalty {
    /// `None` for the compound-agnostic fit.
    pub compound: Option<String>,
    pub dist: NormalFit,
    /// Share of candidate outlaps that fell inside the accepted band.
    pub quality: f64,
    pub sample_count: usize,
}

impl OutlapPenalty {
    pub fn hardcoded(config: &OutlapConfig) -> Self {
        let band = config.band_stages.first().copied().unwrap_or((0.0, 8.0));
        Self {
            compound: None,
            dist: NormalFit::new(1.5, 0.5, config.std_floor_s, band),
            quality: 0.0,
            sample_count: 0,
        }
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

    /// `n` penalty draws, clipped to the band the fit was accepted in.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<f64> {
        self.dist.sample(n, rng)
    }

    pub fn from_record(record: &ModelParameterRecord, config: &OutlapConfig) -> Option<Self> {
        let Coefficients::Normal { mean, std } = record.coefficients else {
            return None;
        };
        Some(Self {
            compound: normalize_compound(&record.compound),
            dist: NormalFit::new(mean, std, config.std_floor_s, band_envelope(config)),
            quality: record.quality,
            sample_count: record.sample_count,
        })
    }

    pub fn to_record(&self, circuit: &str, compound: &str, scope: ParameterScope) -> ModelParameterRecord {
        ModelParameterRecord {
            kind: ModelKind::Outlap,
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

/// Per-compound penalties plus a pooled fit used when a compound is
/// unknown or too thin to fit on its own.
#[derive(Debug, Clone)]
pub struct OutlapModel {
    pub pooled: OutlapPenalty,
    pub by_compound: BTreeMap<String, OutlapPenalty>,
}

impl OutlapModel {
    /// Fits on laps with tyre ages computed. Fails with `DataInsufficiency`
    /// only when even the pooled fit cannot be made.
    pub fn fit(laps: &[LapRecord], config: &OutlapConfig) -> Result<Self> {
        let all: Vec<&LapRecord> = laps.iter().collect();
        let pooled = fit_group(&all, None, config)?;

        let mut groups: BTreeMap<&str, Vec<&LapRecord>> = BTreeMap::new();
        for lap in laps {
            if let Some(c) = lap.compound.as_deref() {
                groups.entry(c).or_default().push(lap);
            }
        }

        let mut by_compound = BTreeMap::new();
        for (compound, group) in groups {
            match fit_group(&group, Some(compound), config) {
                Ok(penalty) => {
                    by_compound.insert(compound.to_string(), penalty);
                }
                Err(e) => debug!(compound, error = %e, "no outlap fit for compound"),
            }
        }

        info!(
            pooled_mean = pooled.mean(),
            pooled_std = pooled.std(),
            compounds = by_compound.len(),
            "outlap model fitted"
        );
        Ok(Self { pooled, by_compound })
    }

    pub fn penalty_for(&self, compound: &str) -> &OutlapPenalty {
        normalize_compound(compound)
            .and_then(|c| self.by_compound.get(&c))
            .unwrap_or(&self.pooled)
    }

    /// Penalty for the chain's compound: local fit, stored, or hardcoded.
    pub fn resolve(
        laps: Option<&[LapRecord]>,
        chain: &FallbackChain<'_>,
        config: &OutlapConfig,
    ) -> Result<Resolved<OutlapPenalty>> {
        let threshold = config.min_quality;
        let local = laps.map(|l| Self::fit(l, config).map(|m| m.penalty_for(chain.compound).clone()));
        chain.resolve(
            local,
            |p: &OutlapPenalty| {
                if p.quality >= threshold {
                    Ok(())
                } else {
                    Err(FallbackReason::QualityRejected { score: p.quality, threshold })
                }
            },
            |r| OutlapPenalty::from_record(r, config),
            || OutlapPenalty::hardcoded(config),
        )
    }

    pub fn quality_gate(config: &OutlapConfig) -> QualityGate {
        QualityGate::new(config.min_quality, config.min_samples)
    }
}

fn band_envelope(config: &OutlapConfig) -> (f64, f64) {
    config
        .band_stages
        .iter()
        .copied()
        .reduce(|(lo, hi), (l, h)| (lo.min(l), hi.max(h)))
        .unwrap_or((0.0, 20.0))
}

fn is_outlap(lap: &LapRecord) -> bool {
    lap.tyre_age == 1 || lap.is_pit_out_lap
}

fn fit_group(laps: &[&LapRecord], compound: Option<&str>, config: &OutlapConfig) -> Result<OutlapPenalty> {
    let insufficient = |got| UndercutError::DataInsufficiency { model: MODEL, needed: config.min_points, got };

    let mut warm_by_competitor: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for lap in laps.iter().filter(|l| !is_outlap(l) && l.tyre_age >= config.warm_from_age) {
        if let Some(t) = lap.lap_time {
            warm_by_competitor.entry(lap.competitor_id.as_str()).or_default().push(t);
        }
    }
    let all_warm: Vec<f64> = warm_by_competitor.values().flatten().copied().collect();
    let pooled_baseline = stats::percentile(&all_warm, config.baseline_percentile).ok_or_else(|| insufficient(0))?;

    let candidates: Vec<f64> = laps
        .iter()
        .filter(|l| is_outlap(l))
        .filter_map(|l| {
            let t = l.lap_time?;
            let baseline = warm_by_competitor
                .get(l.competitor_id.as_str())
                .filter(|w| w.len() >= 2)
                .and_then(|w| stats::percentile(w, config.baseline_percentile))
                .unwrap_or(pooled_baseline);
            Some(t - baseline)
        })
        .collect();

    let mut best = 0;
    for &(lo, hi) in &config.band_stages {
        let kept: Vec<f64> = candidates.iter().copied().filter(|p| *p >= lo && *p <= hi).collect();
        if kept.len() < config.min_points.max(1) {
            best = best.max(kept.len());
            debug!(compound, lo, hi, kept = kept.len(), "outlap band too strict, widening");
            continue;
        }

        let mean = stats::mean(&kept).ok_or_else(|| insufficient(0))?;
        let std = stats::sample_std(&kept);
        return Ok(OutlapPenalty {
            compound: compound.map(str::to_string),
            dist: NormalFit::new(mean, std, config.std_floor_s, (lo, hi)),
            quality: kept.len() as f64 / candidates.len() as f64,
            sample_count: kept.len(),
        });
    }
    Err(insufficient(best))
}
