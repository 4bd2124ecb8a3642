//! Plate authorization store
//!
//! The admin surface that edits the plate list is an external collaborator;
//! the core reads it at startup and only ever looks records up. Plate is the
//! unique key, normalized on load so lookups and stored records agree.

use crate::domain::types::PlateNumber;
use anyhow::Context;
use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// One authorized (or explicitly blocked) plate
#[derive(Debug, Clone)]
pub struct AuthorizationRecord {
    pub plate: PlateNumber,
    pub owner: String,
    pub vehicle_type: Option<String>,
    pub authorized: bool,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl AuthorizationRecord {
    /// True when the record authorizes access at `now`:
    /// flagged authorized and inside the validity window (open ends pass).
    pub fn permits(&self, now: DateTime<Utc>) -> bool {
        if !self.authorized {
            return false;
        }
        if let Some(from) = self.valid_from {
            if now < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if now > until {
                return false;
            }
        }
        true
    }
}

/// Lookup seam consumed by the decision engine
pub trait AuthorizationStore: Send + Sync {
    fn lookup(&self, plate: &PlateNumber) -> Option<AuthorizationRecord>;
}

/// Wire format of one entry in the plates TOML file
#[derive(Debug, Deserialize)]
struct PlateEntry {
    plate: String,
    #[serde(default)]
    owner: String,
    #[serde(default)]
    vehicle_type: Option<String>,
    #[serde(default = "default_authorized")]
    authorized: bool,
    /// RFC 3339 timestamp string, e.g. "2026-01-01T00:00:00Z"
    #[serde(default)]
    valid_from: Option<DateTime<Utc>>,
    #[serde(default)]
    valid_until: Option<DateTime<Utc>>,
}

fn default_authorized() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PlatesFile {
    #[serde(default)]
    plates: Vec<PlateEntry>,
}

/// In-memory store loaded from the plates TOML file
pub struct StaticAuthStore {
    records: FxHashMap<PlateNumber, AuthorizationRecord>,
}

impl StaticAuthStore {
    pub fn from_records(records: impl IntoIterator<Item = AuthorizationRecord>) -> Self {
        let mut map = FxHashMap::default();
        for record in records {
            if let Some(prev) =
                map.insert(record.plate.clone(), record)
            {
                warn!(plate = %prev.plate, "duplicate_plate_entry_replaced");
            }
        }
        Self { records: map }
    }

    /// Load the plate list from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read plates file {}", path.display()))?;
        let file: PlatesFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse plates file {}", path.display()))?;

        let mut records = Vec::with_capacity(file.plates.len());
        for entry in file.plates {
            let Some(plate) = PlateNumber::normalize(&entry.plate) else {
                warn!(raw = %entry.plate, "plate_entry_unparseable_skipped");
                continue;
            };
            records.push(AuthorizationRecord {
                plate,
                owner: entry.owner,
                vehicle_type: entry.vehicle_type,
                authorized: entry.authorized,
                valid_from: entry.valid_from,
                valid_until: entry.valid_until,
            });
        }

        let store = Self::from_records(records);
        info!(path = %path.display(), plates = %store.len(), "plates_loaded");
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl AuthorizationStore for StaticAuthStore {
    fn lookup(&self, plate: &PlateNumber) -> Option<AuthorizationRecord> {
        self.records.get(plate).cloned()
    }
}
