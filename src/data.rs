use csv::{ReaderBuilder, StringRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Result, UndercutError};

/// One timed lap of one competitor, as delivered by telemetry ingestion.
///
/// `tyre_age` is derived; it stays 0 until [`crate::tyre_age`] fills it in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LapRecord {
    pub competitor_id: String,
    pub lap_number: u32,
    pub lap_time: Option<f64>,
    pub tyre_age: u32,
    pub compound: Option<String>,
    pub is_pit_out_lap: bool,
    pub track_status: Option<String>,
}

impl LapRecord {
    pub fn new(competitor_id: impl Into<String>, lap_number: u32) -> Self {
        Self {
            competitor_id: competitor_id.into(),
            lap_number,
            lap_time: None,
            tyre_age: 0,
            compound: None,
            is_pit_out_lap: false,
            track_status: None,
        }
    }

    pub fn with_time(mut self, seconds: f64) -> Self {
        self.lap_time = Some(seconds);
        self
    }

    pub fn with_compound(mut self, compound: &str) -> Self {
        self.compound = normalize_compound(compound);
        self
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.track_status = Some(status.to_string());
        self
    }

    pub fn pit_out(mut self) -> Self {
        self.is_pit_out_lap = true;
        self
    }
}

/// A pit-lane visit. Several entries may share one (competitor, lap).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitEvent {
    pub competitor_id: String,
    pub lap_number: u32,
    pub pit_duration: Option<f64>,
    pub total_time_loss: Option<f64>,
}

impl PitEvent {
    pub fn new(competitor_id: impl Into<String>, lap_number: u32) -> Self {
        Self {
            competitor_id: competitor_id.into(),
            lap_number,
            pit_duration: None,
            total_time_loss: None,
        }
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.pit_duration = Some(seconds);
        self
    }

    pub fn with_time_loss(mut self, seconds: f64) -> Self {
        self.total_time_loss = Some(seconds);
        self
    }
}

// canonical field -> accepted header names. resolved once per file so the
// rest of the crate only ever sees the canonical names.
#[derive(Debug, Clone, Copy)]
pub struct ColumnSpec {
    pub canonical: &'static str,
    pub aliases: &'static [&'static str],
    pub required: bool,
}

const COMPETITOR_ALIASES: &[&str] = &["driver_number", "driver", "Driver", "DriverNumber"];

pub const LAP_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { canonical: "competitor_id", aliases: COMPETITOR_ALIASES, required: true },
    ColumnSpec { canonical: "lap_number", aliases: &["LapNumber", "lap"], required: true },
    ColumnSpec {
        canonical: "lap_time",
        aliases: &["lap_duration", "laptime", "LapTimeSeconds_lap", "LapTime"],
        required: false,
    },
    ColumnSpec {
        canonical: "compound",
        aliases: &["tire_compound", "tyre_compound", "Compound_lap", "Compound"],
        required: false,
    },
    ColumnSpec {
        canonical: "is_pit_out_lap",
        aliases: &["pit_out", "PitOutTime"],
        required: false,
    },
    ColumnSpec { canonical: "track_status", aliases: &["TrackStatus"], required: false },
];

pub const PIT_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { canonical: "competitor_id", aliases: COMPETITOR_ALIASES, required: true },
    ColumnSpec { canonical: "lap_number", aliases: &["LapNumber", "lap"], required: true },
    ColumnSpec {
        canonical: "pit_duration",
        aliases: &["duration", "pit_lane_duration"],
        required: false,
    },
    ColumnSpec { canonical: "total_time_loss", aliases: &["time_loss"], required: false },
];

/// Header positions of the canonical fields found in one file.
#[derive(Debug, Clone)]
pub struct ColumnMap {
    indices: HashMap<&'static str, usize>,
}

impl ColumnMap {
    pub fn resolve(headers: &StringRecord, specs: &[ColumnSpec]) -> Result<Self> {
        let mut indices = HashMap::new();
        let mut missing = Vec::new();

        for spec in specs {
            let found = headers.iter().position(|h| {
                let h = h.trim();
                h.eq_ignore_ascii_case(spec.canonical)
                    || spec.aliases.iter().any(|a| h.eq_ignore_ascii_case(a))
            });
            match found {
                Some(i) => {
                    indices.insert(spec.canonical, i);
                }
                None if spec.required => missing.push(spec.canonical),
                None => debug!(column = spec.canonical, "optional column absent"),
            }
        }

        if !missing.is_empty() {
            return Err(UndercutError::DataValidation(format!(
                "missing required columns: {}",
                missing.join(", ")
            )));
        }
        Ok(Self { indices })
    }

    /// Trimmed, non-empty cell for a canonical field.
    pub fn get<'r>(&self, record: &'r StringRecord, canonical: &str) -> Option<&'r str> {
        let i = *self.indices.get(canonical)?;
        record.get(i).map(str::trim).filter(|s| !s.is_empty())
    }

    fn get_f64(&self, record: &StringRecord, canonical: &str) -> Option<f64> {
        self.get(record, canonical)
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| v.is_finite())
    }
}

/// Upper-cases a compound label and expands the single-letter forms.
pub fn normalize_compound(raw: &str) -> Option<String> {
    let upper = raw.trim().to_uppercase();
    let name = match upper.as_str() {
        "" | "NAN" | "NONE" | "UNKNOWN" => return None,
        "S" => "SOFT",
        "M" => "MEDIUM",
        "H" => "HARD",
        "I" | "INTER" => "INTERMEDIATE",
        "W" => "WET",
        other => other,
    };
    Some(name.to_string())
}

fn parse_lap_number(raw: &str) -> Option<u32> {
    let v = raw.parse::<f64>().ok()?;
    if v.is_finite() && v >= 0.0 {
        Some(v.round() as u32)
    } else {
        None
    }
}

// a timestamp in PitOutTime also means "this lap left the pits"
fn parse_flag(raw: &str) -> bool {
    !matches!(raw.to_ascii_lowercase().as_str(), "false" | "0" | "0.0" | "no" | "nat" | "nan")
}

pub fn read_laps<R: io::Read>(reader: R) -> Result<Vec<LapRecord>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
    let columns = ColumnMap::resolve(rdr.headers()?, LAP_COLUMNS)?;

    let mut laps = Vec::new();
    let mut skipped = 0usize;
    for row in rdr.records() {
        let row = row?;
        let competitor = columns.get(&row, "competitor_id");
        let lap_number = columns.get(&row, "lap_number").and_then(parse_lap_number);
        let (Some(competitor), Some(lap_number)) = (competitor, lap_number) else {
            skipped += 1;
            continue;
        };

        laps.push(LapRecord {
            competitor_id: competitor.to_string(),
            lap_number,
            lap_time: columns.get_f64(&row, "lap_time").filter(|t| *t > 0.0),
            tyre_age: 0,
            compound: columns.get(&row, "compound").and_then(normalize_compound),
            is_pit_out_lap: columns.get(&row, "is_pit_out_lap").map_or(false, parse_flag),
            track_status: columns.get(&row, "track_status").map(str::to_string),
        });
    }

    if skipped > 0 {
        warn!(skipped, "dropped lap rows without competitor id or lap number");
    }
    Ok(laps)
}

pub fn read_pit_events<R: io::Read>(reader: R) -> Result<Vec<PitEvent>> {
    let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
    let columns = ColumnMap::resolve(rdr.headers()?, PIT_COLUMNS)?;

    let mut events = Vec::new();
    let mut skipped = 0usize;
    for row in rdr.records() {
        let row = row?;
        let competitor = columns.get(&row, "competitor_id");
        let lap_number = columns.get(&row, "lap_number").and_then(parse_lap_number);
        let (Some(competitor), Some(lap_number)) = (competitor, lap_number) else {
            skipped += 1;
            continue;
        };

        events.push(PitEvent {
            competitor_id: competitor.to_string(),
            lap_number,
            pit_duration: columns.get_f64(&row, "pit_duration").filter(|d| *d > 0.0),
            total_time_loss: columns.get_f64(&row, "total_time_loss").filter(|d| *d > 0.0),
        });
    }

    if skipped > 0 {
        warn!(skipped, "dropped pit rows without competitor id or lap number");
    }
    Ok(events)
}

pub fn load_laps<P: AsRef<Path>>(path: P) -> Result<Vec<LapRecord>> {
    read_laps(File::open(path)?)
}

pub fn load_pit_events<P: AsRef<Path>>(path: P) -> Result<Vec<PitEvent>> {
    read_pit_events(File::open(path)?)
}

/// Collapses pit entries sharing (competitor, lap) into the last one seen.
/// Repeated entries come from unsafe-release retries; the final one is the real stop.
pub fn dedup_pit_events(events: &[PitEvent]) -> Vec<PitEvent> {
    let mut last: BTreeMap<(&str, u32), &PitEvent> = BTreeMap::new();
    for ev in events {
        last.insert((ev.competitor_id.as_str(), ev.lap_number), ev);
    }
    last.into_values().cloned().collect()
}
