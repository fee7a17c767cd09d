use std::collections::VecDeque;

use anyhow::{Context, Result};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::calibration::SensorCalibration;
use crate::db::{Db, HISTORY_KEY};
use crate::reading::SoilReading;

/// Maximum number of readings retained in memory and on disk.
pub const MAX_HISTORY: usize = 100;

/// Number of daily placeholder readings shown before any real data exists.
const MOCK_DAYS: i64 = 7;

/// `state` tag carried by placeholder readings, so they stay recognisable
/// once persisted alongside real ones.
pub const MOCK_STATE: &str = "mock";

// ---------------------------------------------------------------------------
// In-memory history
// ---------------------------------------------------------------------------

/// Bounded, oldest-first sequence of readings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    readings: VecDeque<SoilReading>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push at the end and drop from the front past [`MAX_HISTORY`].
    pub fn append(&mut self, reading: SoilReading) {
        self.readings.push_back(reading);
        while self.readings.len() > MAX_HISTORY {
            self.readings.pop_front();
        }
    }

    /// Most recent reading by timestamp.
    pub fn latest(&self) -> Option<&SoilReading> {
        self.readings.iter().max_by_key(|r| r.timestamp)
    }

    pub fn readings(&self) -> impl DoubleEndedIterator<Item = &SoilReading> + ExactSizeIterator {
        self.readings.iter()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Rebuild from persisted entries: entries that fail to decode are
    /// skipped, the rest are ordered by timestamp and capped.
    fn from_entries(entries: Vec<serde_json::Value>) -> Self {
        let mut readings: Vec<SoilReading> = entries
            .into_iter()
            .enumerate()
            .filter_map(|(i, v)| match serde_json::from_value(v) {
                Ok(r) => Some(r),
                Err(e) => {
                    warn!(index = i, "skipping unreadable history entry: {e}");
                    None
                }
            })
            .collect();
        readings.sort_by_key(|r| r.timestamp);

        let excess = readings.len().saturating_sub(MAX_HISTORY);
        Self {
            readings: readings.into_iter().skip(excess).collect(),
        }
    }

    /// One placeholder reading per day for the last week, ending at `now`.
    pub fn seed_mock(now: OffsetDateTime) -> Self {
        let calibration = SensorCalibration::default();
        let mut history = Self::new();
        for days_ago in (0..MOCK_DAYS).rev() {
            let raw = fastrand::i64(1800..=2900);
            history.append(SoilReading::new(
                raw,
                calibration.raw_to_percent(raw),
                MOCK_STATE,
                now - Duration::days(days_ago),
            ));
        }
        history
    }
}

/// Split a persisted blob into entries. `None` when the blob itself is not
/// a JSON array.
fn parse_entries(text: &str) -> Option<Vec<serde_json::Value>> {
    match serde_json::from_str(text) {
        Ok(entries) => Some(entries),
        Err(e) => {
            warn!("persisted history is not a JSON array: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Outcome of [`HistoryStore::load`].
#[derive(Debug)]
pub struct Loaded {
    pub history: History,
    /// Nothing was stored, or the stored list was `[]`.
    pub blank: bool,
}

#[derive(Clone)]
pub struct HistoryStore {
    db: Db,
}

impl HistoryStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Load whatever was persisted. Unreadable storage yields an empty
    /// history that is not [`blank`](Loaded::blank).
    pub async fn load(&self) -> Result<Loaded> {
        let Some(text) = self.db.get(HISTORY_KEY).await? else {
            return Ok(Loaded {
                history: History::new(),
                blank: true,
            });
        };
        Ok(match parse_entries(&text) {
            Some(entries) => Loaded {
                blank: entries.is_empty(),
                history: History::from_entries(entries),
            },
            None => Loaded {
                history: History::new(),
                blank: false,
            },
        })
    }

    /// [`load`](Self::load), but a blank store is replaced with a week of
    /// placeholder readings. The placeholders are not written back.
    pub async fn load_or_seed(&self, now: OffsetDateTime) -> Result<History> {
        let Loaded { history, blank } = self.load().await?;
        if blank {
            info!(entries = MOCK_DAYS, "no stored history; showing placeholder readings");
            return Ok(History::seed_mock(now));
        }
        if history.is_empty() {
            warn!("stored history had no readable entries; starting empty");
        } else {
            info!(entries = history.len(), "history loaded");
        }
        Ok(history)
    }

    /// Persist the snapshot in its current order. Saving the same history
    /// twice leaves the store unchanged.
    pub async fn save(&self, history: &History) -> Result<()> {
        let excess = history.len().saturating_sub(MAX_HISTORY);
        let snapshot: Vec<&SoilReading> = history.readings().skip(excess).collect();
        let json = serde_json::to_string(&snapshot).context("encode history")?;
        self.db.put(HISTORY_KEY, &json).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================
