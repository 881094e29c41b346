//! Per-lap tyre age reconstruction from lap and pit telemetry.
//!
//! Age is 1 on the first lap of a set (the out-lap), grows by one per racing
//! lap, and is held flat under safety car or virtual safety car. Duplicate pit
//! entries on the same lap collapse to a single stop.

use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

use crate::config::TyreAgeConfig;
use crate::data::{dedup_pit_events, LapRecord, PitEvent};
use crate::error::{Result, UndercutError};
use crate::stats;

/// A maximal run of laps on one set of tyres.
#[derive(Debug, Clone, PartialEq)]
pub struct TyreStint {
    pub competitor_id: String,
    pub compound: Option<String>,
    pub start_lap: u32,
    pub end_lap: u32,
    pub lap_count: u32,
}

#[derive(Debug, Clone, Copy)]
struct LapAge {
    index: usize,
    age: u32,
    reset: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TyreAgeEngine {
    config: TyreAgeConfig,
}

impl TyreAgeEngine {
    pub fn new(config: TyreAgeConfig) -> Self {
        Self { config }
    }

    /// Returns the laps, in input order, with `tyre_age` filled in.
    pub fn compute(&self, laps: &[LapRecord], pits: &[PitEvent]) -> Result<Vec<LapRecord>> {
        if laps.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = laps.to_vec();
        for per_competitor in self.walk(laps, pits)?.values() {
            for la in per_competitor {
                out[la.index].tyre_age = la.age;
            }
        }
        Ok(out)
    }

    /// Splits every competitor's laps into stints at each tyre change.
    pub fn stints(&self, laps: &[LapRecord], pits: &[PitEvent]) -> Result<Vec<TyreStint>> {
        let mut stints = Vec::new();
        for (competitor, ages) in self.walk(laps, pits)? {
            let mut current: Option<TyreStint> = None;
            for la in ages {
                let lap = &laps[la.index];
                if let (false, Some(stint)) = (la.reset, current.as_mut()) {
                    stint.end_lap = lap.lap_number;
                    stint.lap_count += 1;
                    if stint.compound.is_none() {
                        stint.compound = lap.compound.clone();
                    }
                    continue;
                }
                stints.extend(current.take());
                current = Some(TyreStint {
                    competitor_id: competitor.to_string(),
                    compound: lap.compound.clone(),
                    start_lap: lap.lap_number,
                    end_lap: lap.lap_number,
                    lap_count: 1,
                });
            }
            stints.extend(current);
        }
        Ok(stints)
    }

    /// Whether a lap ran under a neutralization period. An explicit track
    /// status is authoritative; otherwise the lap time is compared against
    /// `baseline_s` scaled by the configured threshold.
    pub fn is_neutralized(&self, lap: &LapRecord, baseline_s: f64) -> bool {
        if let Some(status) = lap.track_status.as_deref() {
            return self.status_is_neutralized(status);
        }
        match lap.lap_time {
            Some(t) => t > baseline_s * (1.0 + self.config.neutralization_threshold),
            None => false,
        }
    }

    // multi-digit statuses list every state seen during the lap, e.g. "124"
    fn status_is_neutralized(&self, status: &str) -> bool {
        let status = status.trim();
        let codes = &self.config.neutralized_statuses;
        if codes.iter().any(|c| c.eq_ignore_ascii_case(status)) {
            return true;
        }
        status.len() > 1
            && status.chars().all(|c| c.is_ascii_digit())
            && status.chars().any(|c| codes.iter().any(|code| code.len() == 1 && code.starts_with(c)))
    }

    /// Field-wide median of green-flag, non-pit lap times.
    pub fn estimate_baseline(&self, laps: &[LapRecord]) -> f64 {
        let times: Vec<f64> = laps
            .iter()
            .filter(|l| !l.is_pit_out_lap)
            .filter(|l| l.track_status.as_deref().map_or(true, |s| !self.status_is_neutralized(s)))
            .filter_map(|l| l.lap_time)
            .filter(|t| t.is_finite() && *t > 0.0)
            .collect();
        stats::median(&times).unwrap_or(self.config.fallback_baseline_s)
    }

    fn walk<'a>(
        &self,
        laps: &'a [LapRecord],
        pits: &[PitEvent],
    ) -> Result<BTreeMap<&'a str, Vec<LapAge>>> {
        validate_identity(laps, pits)?;

        let mut pit_laps: HashMap<String, HashSet<u32>> = HashMap::new();
        for ev in dedup_pit_events(pits) {
            pit_laps.entry(ev.competitor_id).or_default().insert(ev.lap_number);
        }

        let mut by_competitor: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (i, lap) in laps.iter().enumerate() {
            by_competitor.entry(lap.competitor_id.as_str()).or_default().push(i);
        }

        let baseline = self.estimate_baseline(laps);
        let no_pits = HashSet::new();
        let mut result = BTreeMap::new();

        for (competitor, mut indices) in by_competitor {
            indices.sort_by_key(|&i| laps[i].lap_number);
            let stops = pit_laps.get(competitor).unwrap_or(&no_pits);

            let mut ages = Vec::with_capacity(indices.len());
            let mut current_age = 0u32;
            let mut neutralized = 0usize;

            for (pos, &i) in indices.iter().enumerate() {
                let lap = &laps[i];
                let reset = lap.is_pit_out_lap || stops.contains(&lap.lap_number);

                if reset {
                    current_age = 1;
                } else if pos == 0 {
                    // the first lap of a competitor's data starts a fresh count
                    current_age = 1;
                } else if self.is_neutralized(lap, baseline) {
                    neutralized += 1;
                } else {
                    current_age += 1;
                }
                ages.push(LapAge { index: i, age: current_age, reset: reset || pos == 0 });
            }

            debug!(competitor, laps = ages.len(), stops = stops.len(), neutralized, "tyre ages computed");
            result.insert(competitor, ages);
        }
        Ok(result)
    }
}

fn validate_identity(laps: &[LapRecord], pits: &[PitEvent]) -> Result<()> {
    if let Some(lap) = laps.iter().find(|l| l.competitor_id.trim().is_empty()) {
        return Err(UndercutError::DataValidation(format!(
            "lap {} has no competitor id",
            lap.lap_number
        )));
    }
    if let Some(ev) = pits.iter().find(|p| p.competitor_id.trim().is_empty()) {
        return Err(UndercutError::DataValidation(format!(
            "pit event on lap {} has no competitor id",
            ev.lap_number
        )));
    }
    Ok(())
}

/// Tyre ages with the default neutralization settings.
pub fn compute_tyre_age(laps: &[LapRecord], pits: &[PitEvent]) -> Result<Vec<LapRecord>> {
    TyreAgeEngine::default().compute(laps, pits)
}

// average stint length per compound; a competitor running two sets of the
// same compound counts as two stints, which a compound-change scan would miss.
pub fn average_stint_length(stints: &[TyreStint], compound: &str, default: f64) -> f64 {
    let lengths: Vec<f64> = stints
        .iter()
        .filter(|s| s.compound.as_deref().map_or(false, |c| c.eq_ignore_ascii_case(compound)))
        .map(|s| s.lap_count as f64)
        .collect();
    stats::mean(&lengths).unwrap_or(default)
}
