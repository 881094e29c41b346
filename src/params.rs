//! Persistent store of fitted model parameters keyed by circuit, compound and scope.
//!
//! Lookups walk a fixed hierarchy, most specific first:
//! circuit + compound, then compound pooled across circuits, then global.
//! Each level applies the caller's quality gate and keeps the best candidate.
//!
//! Every model kind lives in its own CSV file under the store directory.
//! Saves replace all records of the scopes they touch and land through a
//! temp-file rename, so readers never see a half-written file.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Result, UndercutError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterScope {
    CircuitCompound,
    CompoundOnly,
    Global,
}

impl ParameterScope {
    pub const FALLBACK_ORDER: [ParameterScope; 3] =
        [ParameterScope::CircuitCompound, ParameterScope::CompoundOnly, ParameterScope::Global];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterScope::CircuitCompound => "circuit_compound",
            ParameterScope::CompoundOnly => "compound_only",
            ParameterScope::Global => "global",
        }
    }
}

impl fmt::Display for ParameterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    Degradation,
    Outlap,
    PitLoss,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [ModelKind::Degradation, ModelKind::Outlap, ModelKind::PitLoss];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Degradation => "degradation",
            ModelKind::Outlap => "outlap",
            ModelKind::PitLoss => "pit_loss",
        }
    }

    fn file_name(&self) -> String {
        format!("{}_params.csv", self.as_str())
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Coefficients {
    /// delta(age) = c + b * age + a * age^2
    Quadratic { a: f64, b: f64, c: f64 },
    Normal { mean: f64, std: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelParameterRecord {
    pub kind: ModelKind,
    pub circuit: String,
    pub compound: String,
    pub coefficients: Coefficients,
    /// Cross-validated R² for degradation, retained share of data for the
    /// Normal-distribution models.
    pub quality: f64,
    pub rmse: Option<f64>,
    pub sample_count: usize,
    pub scope: ParameterScope,
}

impl ModelParameterRecord {
    fn matches(&self, scope: ParameterScope, circuit: &str, compound: &str) -> bool {
        if self.scope != scope {
            return false;
        }
        match scope {
            ParameterScope::CircuitCompound => {
                self.circuit.trim().eq_ignore_ascii_case(circuit)
                    && self.compound.trim().eq_ignore_ascii_case(compound)
            }
            ParameterScope::CompoundOnly => self.compound.trim().eq_ignore_ascii_case(compound),
            ParameterScope::Global => true,
        }
    }
}

/// Minimum quality and sample count a stored record must meet.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub min_quality: f64,
    pub min_samples: usize,
}

impl QualityGate {
    pub fn new(min_quality: f64, min_samples: usize) -> Self {
        Self { min_quality, min_samples }
    }

    pub fn admits(&self, record: &ModelParameterRecord) -> bool {
        record.quality >= self.min_quality && record.sample_count >= self.min_samples
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KindSummary {
    pub kind: ModelKind,
    pub records: usize,
    pub circuits: usize,
    pub compounds: usize,
    pub mean_quality: Option<f64>,
}

// flat on-disk row; unused coefficient columns stay empty
#[derive(Debug, Serialize, Deserialize)]
struct StoredRow {
    kind: ModelKind,
    circuit: String,
    compound: String,
    scope: ParameterScope,
    a: Option<f64>,
    b: Option<f64>,
    c: Option<f64>,
    mean: Option<f64>,
    std: Option<f64>,
    quality: f64,
    rmse: Option<f64>,
    sample_count: usize,
}

impl From<&ModelParameterRecord> for StoredRow {
    fn from(r: &ModelParameterRecord) -> Self {
        let (a, b, c, mean, std) = match r.coefficients {
            Coefficients::Quadratic { a, b, c } => (Some(a), Some(b), Some(c), None, None),
            Coefficients::Normal { mean, std } => (None, None, None, Some(mean), Some(std)),
        };
        StoredRow {
            kind: r.kind,
            circuit: r.circuit.clone(),
            compound: r.compound.clone(),
            scope: r.scope,
            a,
            b,
            c,
            mean,
            std,
            quality: r.quality,
            rmse: r.rmse,
            sample_count: r.sample_count,
        }
    }
}

impl StoredRow {
    fn into_record(self) -> Option<ModelParameterRecord> {
        let coefficients = match (self.a, self.b, self.c, self.mean, self.std) {
            (Some(a), Some(b), Some(c), _, _) => Coefficients::Quadratic { a, b, c },
            (_, _, _, Some(mean), Some(std)) => Coefficients::Normal { mean, std },
            _ => return None,
        };
        Some(ModelParameterRecord {
            kind: self.kind,
            circuit: self.circuit,
            compound: self.compound,
            coefficients,
            quality: self.quality,
            rmse: self.rmse,
            sample_count: self.sample_count,
            scope: self.scope,
        })
    }
}

/// Learned-parameter store. Reads are lock-free apart from a short cache
/// lookup; writes are serialized.
pub struct ParameterStore {
    root: Option<PathBuf>,
    cache: RwLock<HashMap<ModelKind, Arc<Vec<ModelParameterRecord>>>>,
    write_lock: Mutex<()>,
}

impl ParameterStore {
    /// A store that lives only as long as this value.
    pub fn in_memory() -> Self {
        Self { root: None, cache: RwLock::new(HashMap::new()), write_lock: Mutex::new(()) }
    }

    /// A store persisted under `dir`, created if missing.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let root = dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        debug!(path = %root.display(), "parameter store opened");
        Ok(Self { root: Some(root), cache: RwLock::new(HashMap::new()), write_lock: Mutex::new(()) })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.path {
            Some(dir) => Self::open(dir),
            None => Ok(Self::in_memory()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Persists a batch. For each model kind in the batch, every stored
    /// record whose scope appears in the batch is dropped before the new
    /// records are added.
    ///
    /// A stored file that cannot be read fails the save and is left as is.
    pub fn save(&self, records: &[ModelParameterRecord]) -> Result<()> {
        if records.is_empty() {
            warn!("no parameter records to save");
            return Ok(());
        }
        let _guard = self.write_lock.lock();

        // merge every kind before writing any, so a bad file aborts the whole batch
        let mut pending = Vec::new();
        for kind in ModelKind::ALL {
            let batch: Vec<&ModelParameterRecord> = records.iter().filter(|r| r.kind == kind).collect();
            if batch.is_empty() {
                continue;
            }
            let replaced: HashSet<ParameterScope> = batch.iter().map(|r| r.scope).collect();

            let mut merged: Vec<ModelParameterRecord> =
                self.current(kind)?.into_iter().filter(|r| !replaced.contains(&r.scope)).collect();
            merged.extend(batch.into_iter().cloned());
            pending.push((kind, merged, replaced.len()));
        }

        for (kind, merged, scopes) in pending {
            if let Some(root) = &self.root {
                write_atomically(&root.join(kind.file_name()), &merged)?;
            }
            info!(kind = %kind, records = merged.len(), scopes, "saved parameter records");
            self.cache.write().insert(kind, Arc::new(merged));
        }
        Ok(())
    }

    /// Best record for (circuit, compound) passing `gate`, searching the scope
    /// hierarchy in order. `None` when no level qualifies or nothing is stored.
    pub fn get(
        &self,
        kind: ModelKind,
        circuit: &str,
        compound: &str,
        gate: &QualityGate,
    ) -> Option<ModelParameterRecord> {
        let records = self.records(kind);
        let circuit = circuit.trim();
        let compound = compound.trim();

        for scope in ParameterScope::FALLBACK_ORDER {
            let best = records
                .iter()
                .filter(|r| r.matches(scope, circuit, compound) && gate.admits(r))
                .max_by(|x, y| {
                    x.quality
                        .partial_cmp(&y.quality)
                        .unwrap_or(Ordering::Equal)
                        .then(x.sample_count.cmp(&y.sample_count))
                });
            if let Some(best) = best {
                debug!(
                    kind = %kind, circuit, compound, scope = %scope,
                    quality = best.quality, samples = best.sample_count,
                    "stored parameters found"
                );
                return Some(best.clone());
            }
        }

        debug!(kind = %kind, circuit, compound, "no stored parameters pass the quality gate");
        None
    }

    /// All records of one kind, loading from disk on first use.
    pub fn records(&self, kind: ModelKind) -> Arc<Vec<ModelParameterRecord>> {
        if let Some(cached) = self.cache.read().get(&kind) {
            return Arc::clone(cached);
        }
        let loaded = Arc::new(self.read_disk(kind));
        self.cache.write().entry(kind).or_insert_with(|| Arc::clone(&loaded));
        loaded
    }

    /// Drops cached records so the next read goes back to disk.
    /// An in-memory store has nothing to reload and keeps its records.
    pub fn reload(&self) {
        if self.root.is_some() {
            self.cache.write().clear();
        }
    }

    pub fn summary(&self) -> Vec<KindSummary> {
        ModelKind::ALL
            .iter()
            .map(|&kind| {
                let records = self.records(kind);
                let circuits: BTreeSet<String> = records.iter().map(|r| r.circuit.to_lowercase()).collect();
                let compounds: BTreeSet<String> = records.iter().map(|r| r.compound.to_uppercase()).collect();
                let qualities: Vec<f64> = records.iter().map(|r| r.quality).collect();
                KindSummary {
                    kind,
                    records: records.len(),
                    circuits: circuits.len(),
                    compounds: compounds.len(),
                    mean_quality: crate::stats::mean(&qualities),
                }
            })
            .collect()
    }

    // the writer's view: fresh from disk when persisted, so a save never
    // merges against a stale cache
    fn current(&self, kind: ModelKind) -> Result<Vec<ModelParameterRecord>> {
        match &self.root {
            Some(root) => load_file(&root.join(kind.file_name()), kind),
            None => Ok(self.records(kind).as_ref().clone()),
        }
    }

    // readers treat an unreadable file as an empty one
    fn read_disk(&self, kind: ModelKind) -> Vec<ModelParameterRecord> {
        let Some(root) = &self.root else {
            return Vec::new();
        };
        let path = root.join(kind.file_name());
        match load_file(&path, kind) {
            Ok(records) => {
                debug!(kind = %kind, records = records.len(), "loaded parameter records");
                records
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable parameter file");
                Vec::new()
            }
        }
    }
}

fn load_file(path: &Path, kind: ModelKind) -> Result<Vec<ModelParameterRecord>> {
    if !path.exists() {
        debug!(path = %path.display(), "parameter file not found");
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut records = Vec::new();
    for (line, row) in reader.deserialize::<StoredRow>().enumerate() {
        let record = row?.into_record().ok_or_else(|| {
            UndercutError::DataValidation(format!(
                "{}: row {} has no usable coefficients",
                path.display(),
                line + 1
            ))
        })?;
        if record.kind == kind {
            records.push(record);
        }
    }
    Ok(records)
}

fn write_atomically(path: &Path, records: &[ModelParameterRecord]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    {
        let mut writer = csv::Writer::from_writer(tmp.as_file_mut());
        for r in records {
            writer.serialize(StoredRow::from(r))?;
        }
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
