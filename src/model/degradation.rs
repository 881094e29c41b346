//! Tyre degradation curve: lap-time delta over a fast-lap baseline as a
//! quadratic in tyre age, `delta(age) = c + b * age + a * age^2`.

use linfa::prelude::*;
use linfa_linear::LinearRegression;
use nalgebra::{Matrix3, Vector3};
use ndarray::{Array1, Array2};
use tracing::{debug, info};

use super::{FallbackChain, FallbackReason, Resolved};
use crate::config::DegradationConfig;
use crate::data::LapRecord;
use crate::error::{Result, UndercutError};
use crate::params::{Coefficients, ModelKind, ModelParameterRecord, ParameterScope, QualityGate};
use crate::stats;

// MAD to standard deviation under normal errors
const MAD_TO_SIGMA: f64 = 0.6745;
const CONVERGENCE_TOL: f64 = 1e-8;

/// Diagnostics of a fit on local data.
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    pub baseline_s: f64,
    pub r2: f64,
    pub rmse: f64,
    pub cv_r2: f64,
    pub fold_r2: Vec<f64>,
    pub sample_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DegradationModel {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    /// Present only when the coefficients were fitted here.
    pub report: Option<FitReport>,
}

impl DegradationModel {
    pub fn new(a: f64, b: f64, c: f64) -> Self {
        Self { a, b, c, report: None }
    }

    /// Last-resort curve: roughly 0.15s per lap, gently accelerating.
    pub fn hardcoded() -> Self {
        Self::new(0.001, 0.15, 0.0)
    }

    /// Robust fit on laps with tyre ages already computed.
    ///
    /// Raises `DataInsufficiency` when fewer than `min_points` laps survive
    /// cleaning. Quality is measured but not judged here; see [`Self::resolve`].
    pub fn fit(laps: &[LapRecord], config: &DegradationConfig) -> Result<Self> {
        let points = clean(laps, config);
        if points.len() < config.min_points.max(3) {
            return Err(UndercutError::DataInsufficiency {
                model: ModelKind::Degradation.as_str(),
                needed: config.min_points.max(3),
                got: points.len(),
            });
        }

        let times: Vec<f64> = points.iter().map(|p| p.1).collect();
        let baseline_s = stats::percentile(&times, config.baseline_percentile)
            .ok_or_else(|| UndercutError::DataValidation("no lap times to baseline".into()))?;
        let ages: Vec<f64> = points.iter().map(|p| p.0).collect();
        let deltas: Vec<f64> = times.iter().map(|t| t - baseline_s).collect();

        let [c, b, a] = huber_irls(&ages, &deltas, config).ok_or_else(|| {
            UndercutError::DataInsufficiency {
                model: ModelKind::Degradation.as_str(),
                needed: 3,
                got: distinct_ages(&ages),
            }
        })?;

        let fitted: Vec<f64> = ages.iter().map(|&x| c + b * x + a * x * x).collect();
        let fold_r2 = cross_validate(&ages, &deltas, config);
        let cv_r2 = stats::mean(&fold_r2).unwrap_or(0.0);

        let report = FitReport {
            baseline_s,
            r2: stats::r_squared(&deltas, &fitted),
            rmse: stats::rmse(&deltas, &fitted),
            cv_r2,
            fold_r2,
            sample_count: points.len(),
        };
        info!(
            a, b, c,
            cv_r2 = report.cv_r2, r2 = report.r2, samples = report.sample_count,
            "degradation curve fitted"
        );
        Ok(Self { a, b, c, report: Some(report) })
    }

    /// Local fit if it cross-validates, else stored, else hardcoded.
    pub fn resolve(
        laps: Option<&[LapRecord]>,
        chain: &FallbackChain<'_>,
        config: &DegradationConfig,
    ) -> Result<Resolved<Self>> {
        let threshold = config.min_cv_r2;
        chain.resolve(
            laps.map(|l| Self::fit(l, config)),
            |m: &Self| {
                let score = m.report.as_ref().map_or(0.0, |r| r.cv_r2);
                if score >= threshold {
                    Ok(())
                } else {
                    Err(FallbackReason::QualityRejected { score, threshold })
                }
            },
            Self::from_record,
            Self::hardcoded,
        )
    }

    pub fn quality_gate(config: &DegradationConfig) -> QualityGate {
        QualityGate::new(config.min_cv_r2, config.min_points)
    }

    /// Non-negative lap-time cost at a tyre age.
    pub fn predict(&self, age: f64) -> f64 {
        (self.c + self.b * age + self.a * age * age).max(0.0)
    }

    pub fn fresh_tire_advantage(&self, old_age: f64, new_age: f64) -> f64 {
        (self.predict(old_age) - self.predict(new_age)).max(0.0)
    }

    /// Mean absolute error of predicted deltas on `laps`, measured against
    /// their own baseline. `None` if nothing survives cleaning.
    pub fn mean_absolute_error(&self, laps: &[LapRecord], config: &DegradationConfig) -> Option<f64> {
        let points = clean(laps, config);
        let times: Vec<f64> = points.iter().map(|p| p.1).collect();
        let baseline = stats::percentile(&times, config.baseline_percentile)?;
        let errors: Vec<f64> = points
            .iter()
            .map(|&(age, t)| ((t - baseline) - self.predict(age)).abs())
            .collect();
        stats::mean(&errors)
    }

    pub fn from_record(record: &ModelParameterRecord) -> Option<Self> {
        match record.coefficients {
            Coefficients::Quadratic { a, b, c } => Some(Self::new(a, b, c)),
            Coefficients::Normal { .. } => None,
        }
    }

    /// Record for persistence. Only local fits carry the quality needed.
    pub fn to_record(&self, circuit: &str, compound: &str, scope: ParameterScope) -> Option<ModelParameterRecord> {
        let report = self.report.as_ref()?;
        Some(ModelParameterRecord {
            kind: ModelKind::Degradation,
            circuit: circuit.to_string(),
            compound: compound.to_string(),
            coefficients: Coefficients::Quadratic { a: self.a, b: self.b, c: self.c },
            quality: report.cv_r2,
            rmse: Some(report.rmse),
            sample_count: report.sample_count,
            scope,
        })
    }
}

// (age, lap time) pairs fit for regression: green racing laps inside the
// plausible window, then an IQR fence on lap time.
fn clean(laps: &[LapRecord], config: &DegradationConfig) -> Vec<(f64, f64)> {
    let candidates: Vec<(f64, f64)> = laps
        .iter()
        .filter(|l| !l.is_pit_out_lap)
        .filter(|l| l.tyre_age >= 1 && l.tyre_age <= config.max_tyre_age)
        .filter_map(|l| l.lap_time.map(|t| (l.tyre_age as f64, t)))
        .filter(|(_, t)| t.is_finite() && *t >= config.min_lap_time_s && *t <= config.max_lap_time_s)
        .collect();

    let times: Vec<f64> = candidates.iter().map(|p| p.1).collect();
    let Some((lo, hi)) = stats::iqr_bounds(&times, config.iqr_k) else {
        return candidates;
    };
    let kept: Vec<(f64, f64)> = candidates.into_iter().filter(|(_, t)| *t >= lo && *t <= hi).collect();
    debug!(kept = kept.len(), dropped = times.len() - kept.len(), "degradation laps cleaned");
    kept
}

fn distinct_ages(ages: &[f64]) -> usize {
    let mut sorted = ages.to_vec();
    stats::sort_floats(&mut sorted);
    sorted.dedup();
    sorted.len()
}

// ordinary least squares start, through linfa; None when the design is singular
fn ols_start(ages: &[f64], y: &[f64]) -> Option<[f64; 3]> {
    let feats: Vec<f64> = ages.iter().flat_map(|&x| [x, x * x]).collect();
    let x = Array2::from_shape_vec((ages.len(), 2), feats).ok()?;
    let ds = Dataset::new(x, Array1::from_vec(y.to_vec()));
    let fitted = LinearRegression::new().fit(&ds).ok()?;
    let params = fitted.params();
    let beta = [fitted.intercept(), params[0], params[1]];
    beta.iter().all(|v| v.is_finite()).then_some(beta)
}

// weighted normal equations (X'WX) beta = X'Wy for the [1, age, age^2] design
fn weighted_lstsq(ages: &[f64], y: &[f64], w: &[f64]) -> Option<[f64; 3]> {
    let mut xtx = Matrix3::<f64>::zeros();
    let mut xty = Vector3::<f64>::zeros();
    for ((&x, &yi), &wi) in ages.iter().zip(y).zip(w) {
        let row = Vector3::new(1.0, x, x * x);
        xtx += row * row.transpose() * wi;
        xty += row * (wi * yi);
    }
    let beta = match xtx.cholesky() {
        Some(ch) => ch.solve(&xty),
        None => xtx.try_inverse()? * xty,
    };
    let beta = [beta[0], beta[1], beta[2]];
    beta.iter().all(|v| v.is_finite()).then_some(beta)
}

/// Iteratively reweighted least squares with Huber weights. Residuals
/// beyond `huber_k` robust standard deviations get weight `k / |r|`.
fn huber_irls(ages: &[f64], y: &[f64], config: &DegradationConfig) -> Option<[f64; 3]> {
    if distinct_ages(ages) < 3 {
        return None;
    }
    let unit = vec![1.0; ages.len()];
    let mut beta = ols_start(ages, y).or_else(|| weighted_lstsq(ages, y, &unit))?;

    for iteration in 0..config.max_iterations {
        let residuals: Vec<f64> = ages
            .iter()
            .zip(y)
            .map(|(&x, &yi)| yi - (beta[0] + beta[1] * x + beta[2] * x * x))
            .collect();
        let scale = match stats::mad(&residuals) {
            Some(m) if m > 1e-12 => m / MAD_TO_SIGMA,
            _ => break,
        };
        let k = config.huber_k * scale;
        let weights: Vec<f64> = residuals
            .iter()
            .map(|r| if r.abs() <= k { 1.0 } else { k / r.abs() })
            .collect();

        let next = weighted_lstsq(ages, y, &weights)?;
        let change = next.iter().zip(&beta).map(|(n, o)| (n - o).abs()).fold(0.0, f64::max);
        beta = next;
        if change < CONVERGENCE_TOL {
            debug!(iteration, "huber irls converged");
            break;
        }
    }
    Some(beta)
}

// interleaved folds: point i belongs to fold i % k
fn cross_validate(ages: &[f64], y: &[f64], config: &DegradationConfig) -> Vec<f64> {
    let k = config.cv_folds.min(ages.len());
    if k < 2 {
        return Vec::new();
    }
    let mut scores = Vec::with_capacity(k);
    for fold in 0..k {
        let (mut train_x, mut train_y, mut test_x, mut test_y) = (vec![], vec![], vec![], vec![]);
        for (i, (&x, &yi)) in ages.iter().zip(y).enumerate() {
            if i % k == fold {
                test_x.push(x);
                test_y.push(yi);
            } else {
                train_x.push(x);
                train_y.push(yi);
            }
        }
        let Some([c, b, a]) = huber_irls(&train_x, &train_y, config) else {
            continue;
        };
        let predicted: Vec<f64> = test_x.iter().map(|&x| c + b * x + a * x * x).collect();
        scores.push(stats::r_squared(&test_y, &predicted));
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    // three stints of 25 laps on a rising curve with small alternating noise
    fn worn_laps() -> Vec<LapRecord> {
        let mut laps = Vec::new();
        let mut n = 0u32;
        for driver in ["1", "16", "44"] {
            for age in 1..=25u32 {
                n += 1;
                let x = age as f64;
                let noise = ((n * 7) % 5) as f64 * 0.04 - 0.08;
                let mut lap = LapRecord::new(driver, age).with_time(90.0 + 0.05 * x + 0.004 * x * x + noise);
                lap.tyre_age = age;
                laps.push(lap);
            }
        }
        laps
    }

    #[test]
    fn fits_increasing_curve_with_good_cv() {
        let config = DegradationConfig::default();
        let model = DegradationModel::fit(&worn_laps(), &config).unwrap();
        let report = model.report.clone().unwrap();
        assert!(report.cv_r2 > 0.8, "cv r2 {}", report.cv_r2);
        assert_eq!(report.fold_r2.len(), 5);
        assert_eq!(report.sample_count, 75);
        assert!(model.a > 0.0);

        for age in 0..40 {
            let (x1, x2) = (age as f64, age as f64 + 1.0);
            assert!(model.predict(x1) >= 0.0);
            assert!(model.predict(x2) >= model.predict(x1) - 0.05);
        }
        assert!(model.fresh_tire_advantage(20.0, 1.0) > 1.0);
        assert_eq!(model.fresh_tire_advantage(1.0, 20.0), 0.0);
    }

    #[test]
    fn outliers_are_contained() {
        let config = DegradationConfig::default();
        let mut laps = worn_laps();
        for (i, age) in [5u32, 12, 18].iter().enumerate() {
            let mut lap = LapRecord::new("63", i as u32 + 1).with_time(140.0);
            lap.tyre_age = *age;
            laps.push(lap);
        }
        let mut pit_out = LapRecord::new("63", 9).with_time(115.0).pit_out();
        pit_out.tyre_age = 1;
        laps.push(pit_out);

        let model = DegradationModel::fit(&laps, &config).unwrap();
        assert_eq!(model.report.as_ref().unwrap().sample_count, 75);
        assert!(model.mean_absolute_error(&worn_laps(), &config).unwrap() < 0.2);
    }

    #[test]
    fn too_few_points_is_insufficient() {
        let laps: Vec<LapRecord> = worn_laps().into_iter().take(6).collect();
        let err = DegradationModel::fit(&laps, &DegradationConfig::default()).unwrap_err();
        assert!(matches!(err, UndercutError::DataInsufficiency { needed: 10, got: 6, .. }));
    }

    #[test]
    fn flat_noise_is_rejected_and_falls_back() {
        let config = DegradationConfig::default();
        let laps: Vec<LapRecord> = (0..40u32)
            .map(|i| {
                let mut lap = LapRecord::new("7", i + 1).with_time(90.0 + ((i * 37) % 11) as f64 * 0.1);
                lap.tyre_age = (i % 20) + 1;
                lap
            })
            .collect();
        let chain = FallbackChain::new(
            ModelKind::Degradation,
            "bahrain",
            "SOFT",
            DegradationModel::quality_gate(&config),
        );
        let resolved = DegradationModel::resolve(Some(&laps), &chain, &config).unwrap();
        assert_eq!(resolved.level, crate::model::FallbackLevel::Hardcoded);
        assert!(matches!(resolved.reasons[0], FallbackReason::QualityRejected { threshold, .. } if threshold == 0.1));
        assert_eq!(resolved.value, DegradationModel::hardcoded());
    }

    #[test]
    fn record_keeps_coefficients() {
        let config = DegradationConfig::default();
        let model = DegradationModel::fit(&worn_laps(), &config).unwrap();
        let record = model.to_record("monza", "MEDIUM", ParameterScope::CircuitCompound).unwrap();
        assert_eq!(record.sample_count, 75);
        let back = DegradationModel::from_record(&record).unwrap();
        assert_eq!((back.a, back.b, back.c), (model.a, model.b, model.c));
        assert!(DegradationModel::hardcoded().to_record("monza", "MEDIUM", ParameterScope::Global).is_none());
    }
}
