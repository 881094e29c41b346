//! Statistical models feeding the undercut simulation, and the fallback
//! chain they share.
//!
//! Every model resolves the same way: a fit on the supplied history if it
//! has enough data and passes its quality predicate, else the best stored
//! record from the [`ParameterStore`] scope hierarchy, else a built-in
//! constant. The level used and the reasons earlier levels were skipped
//! travel with the model as [`Resolved`].

pub mod degradation;
pub mod outlap;
pub mod pit_loss;

pub use degradation::{DegradationModel, FitReport};
pub use outlap::{OutlapModel, OutlapPenalty};
pub use pit_loss::{PitLossModel, PitWindowSummary};

use rand::Rng;
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;
use tracing::{info, warn};

use crate::error::{Result, UndercutError};
use crate::params::{ModelKind, ModelParameterRecord, ParameterScope, ParameterStore, QualityGate};

/// Where a resolved model's parameters came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackLevel {
    LocalFit,
    Stored(ParameterScope),
    Hardcoded,
}

impl fmt::Display for FallbackLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackLevel::LocalFit => f.write_str("local_fit"),
            FallbackLevel::Stored(scope) => write!(f, "stored:{scope}"),
            FallbackLevel::Hardcoded => f.write_str("hardcoded"),
        }
    }
}

/// Why a level of the chain was passed over.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    NoLocalData,
    Insufficient { needed: usize, got: usize },
    /// The fit completed but scored below the acceptance threshold.
    QualityRejected { score: f64, threshold: f64 },
    NoStore,
    NoStoredRecord,
    StoredRecordUnusable,
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::NoLocalData => f.write_str("no local data"),
            FallbackReason::Insufficient { needed, got } => {
                write!(f, "insufficient data ({got} of {needed} points)")
            }
            FallbackReason::QualityRejected { score, threshold } => {
                write!(f, "fit quality {score:.3} below {threshold:.3}")
            }
            FallbackReason::NoStore => f.write_str("no parameter store"),
            FallbackReason::NoStoredRecord => f.write_str("no stored record passes the gate"),
            FallbackReason::StoredRecordUnusable => f.write_str("stored record has the wrong shape"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolved<T> {
    pub value: T,
    pub level: FallbackLevel,
    pub reasons: Vec<FallbackReason>,
}

impl<T> Resolved<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolved<U> {
        Resolved { value: f(self.value), level: self.level, reasons: self.reasons }
    }
}

/// Key and policy for resolving one model.
#[derive(Clone, Copy)]
pub struct FallbackChain<'a> {
    pub kind: ModelKind,
    pub circuit: &'a str,
    pub compound: &'a str,
    pub store: Option<&'a ParameterStore>,
    pub gate: QualityGate,
    pub allow_default: bool,
}

impl<'a> FallbackChain<'a> {
    pub fn new(kind: ModelKind, circuit: &'a str, compound: &'a str, gate: QualityGate) -> Self {
        Self { kind, circuit, compound, store: None, gate, allow_default: true }
    }

    pub fn with_store(mut self, store: &'a ParameterStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn allow_default(mut self, allow: bool) -> Self {
        self.allow_default = allow;
        self
    }

    /// Walks local fit, stored scopes, then the hardcoded default.
    ///
    /// `local` is `None` when no history was supplied. Insufficient data
    /// moves on to the next level; any other fitting error is returned.
    pub fn resolve<T>(
        &self,
        local: Option<Result<T>>,
        accept: impl Fn(&T) -> std::result::Result<(), FallbackReason>,
        decode: impl Fn(&ModelParameterRecord) -> Option<T>,
        default: impl FnOnce() -> T,
    ) -> Result<Resolved<T>> {
        let mut reasons = Vec::new();
        let kind = self.kind;

        match local {
            None => reasons.push(FallbackReason::NoLocalData),
            Some(Ok(fit)) => match accept(&fit) {
                Ok(()) => {
                    info!(kind = %kind, circuit = self.circuit, compound = self.compound, "using local fit");
                    return Ok(Resolved { value: fit, level: FallbackLevel::LocalFit, reasons });
                }
                Err(reason) => {
                    warn!(kind = %kind, compound = self.compound, %reason, "local fit rejected");
                    reasons.push(reason);
                }
            },
            Some(Err(UndercutError::DataInsufficiency { needed, got, .. })) => {
                warn!(kind = %kind, compound = self.compound, needed, got, "too little data for a local fit");
                reasons.push(FallbackReason::Insufficient { needed, got });
            }
            Some(Err(e)) => return Err(e),
        }

        match self.store {
            None => reasons.push(FallbackReason::NoStore),
            Some(store) => match store.get(kind, self.circuit, self.compound, &self.gate) {
                None => reasons.push(FallbackReason::NoStoredRecord),
                Some(record) => match decode(&record) {
                    Some(value) => {
                        info!(kind = %kind, scope = %record.scope, quality = record.quality, "using stored parameters");
                        return Ok(Resolved { value, level: FallbackLevel::Stored(record.scope), reasons });
                    }
                    None => reasons.push(FallbackReason::StoredRecordUnusable),
                },
            },
        }

        if !self.allow_default {
            return Err(UndercutError::FallbackExhausted { model: kind.as_str(), reasons });
        }
        warn!(kind = %kind, circuit = self.circuit, compound = self.compound, "falling back to hardcoded parameters");
        Ok(Resolved { value: default(), level: FallbackLevel::Hardcoded, reasons })
    }
}

/// A Normal distribution whose draws are clipped to `[lower, upper]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalFit {
    pub mean: f64,
    pub std: f64,
    pub lower: f64,
    pub upper: f64,
}

impl NormalFit {
    pub fn new(mean: f64, std: f64, std_floor: f64, bounds: (f64, f64)) -> Self {
        let (lower, upper) = if bounds.0 <= bounds.1 { bounds } else { (bounds.1, bounds.0) };
        Self { mean, std: std.max(std_floor), lower, upper }
    }

    fn normal(&self) -> Option<Normal> {
        Normal::new(self.mean, self.std).ok()
    }

    /// One draw by inverse-CDF of a single uniform. Consumes exactly one
    /// value from `rng`, which keeps seeded runs aligned.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u: f64 = rng.gen();
        let u = u.clamp(f64::EPSILON, 1.0 - f64::EPSILON);
        let x = self.normal().map_or(self.mean, |n| n.inverse_cdf(u));
        x.clamp(self.lower, self.upper)
    }

    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<f64> {
        (0..n).map(|_| self.draw(rng)).collect()
    }

    /// P(X < x) of the unclipped distribution.
    pub fn cdf(&self, x: f64) -> f64 {
        match self.normal() {
            Some(n) => n.cdf(x),
            None if x > self.mean => 1.0,
            None => 0.0,
        }
    }

    /// Quantile for a probability strictly inside (0, 1).
    pub fn quantile(&self, p: f64) -> Option<f64> {
        if !(p > 0.0 && p < 1.0) {
            return None;
        }
        Some(self.normal().map_or(self.mean, |n| n.inverse_cdf(p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Coefficients;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn stored(quality: f64, scope: ParameterScope) -> ModelParameterRecord {
        ModelParameterRecord {
            kind: ModelKind::PitLoss,
            circuit: "monza".into(),
            compound: "SOFT".into(),
            coefficients: Coefficients::Normal { mean: 24.0, std: 1.5 },
            quality,
            rmse: None,
            sample_count: 20,
            scope,
        }
    }

    fn decode(r: &ModelParameterRecord) -> Option<f64> {
        match r.coefficients {
            Coefficients::Normal { mean, .. } => Some(mean),
            _ => None,
        }
    }

    fn at_least(threshold: f64) -> impl Fn(&f64) -> std::result::Result<(), FallbackReason> {
        move |v| {
            if *v >= threshold {
                Ok(())
            } else {
                Err(FallbackReason::QualityRejected { score: *v, threshold })
            }
        }
    }

    #[test]
    fn accepted_local_fit_wins() {
        let chain = FallbackChain::new(ModelKind::PitLoss, "monza", "SOFT", QualityGate::new(0.0, 0));
        let r = chain.resolve(Some(Ok(30.0)), at_least(10.0), decode, || 23.0).unwrap();
        assert_eq!(r.level, FallbackLevel::LocalFit);
        assert_eq!(r.value, 30.0);
        assert!(r.reasons.is_empty());
    }

    #[test]
    fn rejected_fit_falls_to_store_and_is_recorded() {
        let store = ParameterStore::in_memory();
        store.save(&[stored(0.9, ParameterScope::CompoundOnly)]).unwrap();
        let chain = FallbackChain::new(ModelKind::PitLoss, "spa", "soft", QualityGate::new(0.5, 5)).with_store(&store);

        let r = chain.resolve(Some(Ok(3.0)), at_least(10.0), decode, || 23.0).unwrap();
        assert_eq!(r.level, FallbackLevel::Stored(ParameterScope::CompoundOnly));
        assert_eq!(r.value, 24.0);
        assert_eq!(r.reasons, vec![FallbackReason::QualityRejected { score: 3.0, threshold: 10.0 }]);
    }

    #[test]
    fn insufficient_data_reaches_hardcoded() {
        let store = ParameterStore::in_memory();
        store.save(&[stored(0.2, ParameterScope::Global)]).unwrap();
        let chain = FallbackChain::new(ModelKind::PitLoss, "spa", "SOFT", QualityGate::new(0.5, 5)).with_store(&store);

        let local = Err(UndercutError::DataInsufficiency { model: "pit_loss", needed: 3, got: 1 });
        let r = chain.resolve(Some(local), at_least(0.0), decode, || 23.0).unwrap();
        assert_eq!(r.level, FallbackLevel::Hardcoded);
        assert_eq!(r.value, 23.0);
        assert_eq!(
            r.reasons,
            vec![FallbackReason::Insufficient { needed: 3, got: 1 }, FallbackReason::NoStoredRecord]
        );
    }

    #[test]
    fn exhausted_chain_errors_when_defaults_disabled() {
        let chain =
            FallbackChain::new(ModelKind::Outlap, "spa", "SOFT", QualityGate::new(0.0, 0)).allow_default(false);
        let err = chain.resolve(None, at_least(0.0), decode, || 1.0).unwrap_err();
        match &err {
            UndercutError::FallbackExhausted { model, reasons } => {
                assert_eq!(*model, "outlap");
                assert_eq!(reasons, &vec![FallbackReason::NoLocalData, FallbackReason::NoStore]);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("no local data; no parameter store"));
    }

    #[test]
    fn validation_errors_are_not_absorbed() {
        let chain = FallbackChain::new(ModelKind::Degradation, "spa", "SOFT", QualityGate::new(0.0, 0));
        let local = Err(UndercutError::DataValidation("bad".into()));
        assert!(chain.resolve(Some(local), at_least(0.0), decode, || 1.0).is_err());
    }

    #[test]
    fn normal_draws_stay_in_band_and_repeat_with_seed() {
        let fit = NormalFit::new(2.0, 3.0, 0.1, (0.0, 5.0));
        let a = fit.sample(500, &mut ChaCha8Rng::seed_from_u64(7));
        let b = fit.sample(500, &mut ChaCha8Rng::seed_from_u64(7));
        assert_eq!(a, b);
        assert!(a.iter().all(|x| (0.0..=5.0).contains(x)));
    }

    #[test]
    fn std_is_floored_and_quantiles_are_bounded() {
        let fit = NormalFit::new(1.0, 0.0, 0.1, (0.0, 8.0));
        assert_eq!(fit.std, 0.1);
        assert_eq!(fit.quantile(0.0), None);
        assert_eq!(fit.quantile(1.0), None);
        assert!((fit.quantile(0.5).unwrap() - 1.0).abs() < 1e-9);
        assert!((fit.cdf(1.0) - 0.5).abs() < 1e-9);
    }
}
