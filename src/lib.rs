//! Undercut prediction for race strategy.
//!
//! Lap and pit telemetry go through [`tyre_age`] to recover per-lap tyre
//! ages. Those feed three statistical models in [`model`], each resolved
//! through a local-fit / stored-parameter / default fallback chain backed by
//! [`params::ParameterStore`]. [`strategy::UndercutSimulator`] combines the
//! resolved models in a seeded Monte Carlo run.

pub mod config;
pub mod data;
pub mod error;
pub mod model;
pub mod params;
pub mod stats;
pub mod strategy;
pub mod tyre_age;

pub use config::UndercutConfig;
pub use data::{LapRecord, PitEvent};
pub use error::{Result, UndercutError};
pub use model::{DegradationModel, FallbackLevel, OutlapModel, PitLossModel, Resolved};
pub use params::{ModelKind, ModelParameterRecord, ParameterScope, ParameterStore, QualityGate};
pub use strategy::{ModelSet, SimulationResult, SimulationScenario, UndercutSimulator};
pub use tyre_age::{compute_tyre_age, TyreAgeEngine, TyreStint};
