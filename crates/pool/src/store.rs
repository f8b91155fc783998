//! # Pool Store
//!
//! Persistence for the contribution ledger.
//!
//! ## State Shape
//!
//! ```text
//! { "version": 1, "contributions": [ … ] }
//! ```
//!
//! ## Write Discipline
//!
//! Every mutation is a mutex-serialized read-modify-write: load the full
//! state, apply the append (or detect the duplicate), persist via
//! temp-file + rename, then recompute the summaries the caller gets back.
//! The rename is the commit point; a crash mid-write leaves the previous
//! state intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::contribution::{Contribution, ContributionInput, PoolError};
use crate::summary::{monthly_summary, user_summary, MonthSummary, UserSummary};

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct PoolState {
    pub version: u32,
    pub contributions: Vec<Contribution>,
}

impl Default for PoolState {
    fn default() -> Self {
        PoolState {
            version: STATE_VERSION,
            contributions: Vec::new(),
        }
    }
}

/// Result of a `record_contribution` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub record: Contribution,
    /// True when an existing record with the same `external_event_id`
    /// was returned instead of writing.
    pub duplicate: bool,
    pub user_summary: UserSummary,
    pub month_summary: MonthSummary,
}

/// The contribution ledger seam the services depend on.
pub trait PoolStore: Send + Sync {
    /// Idempotent append. See [`RecordOutcome`].
    fn record_contribution(&self, input: ContributionInput) -> Result<RecordOutcome, PoolError>;

    /// Current full log (read-only copy) for aggregation.
    fn contributions(&self) -> Result<Vec<Contribution>, PoolError>;
}

/// Apply one input to the state; shared by both store implementations.
/// Returns the record and whether it was a duplicate (no write happened).
fn apply_record(
    state: &mut PoolState,
    input: ContributionInput,
) -> Result<(Contribution, bool), PoolError> {
    let external_event_id = input
        .external_event_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    if let Some(key) = &external_event_id {
        if let Some(existing) = state
            .contributions
            .iter()
            .find(|c| c.external_event_id.as_deref() == Some(key.as_str()))
        {
            return Ok((existing.clone(), true));
        }
    }

    let record = input.into_record(Uuid::new_v4().to_string())?;
    state.contributions.push(record.clone());
    Ok((record, false))
}

fn outcome(state: &PoolState, record: Contribution, duplicate: bool) -> RecordOutcome {
    let user_summary = user_summary(&state.contributions, &record.user_id);
    let month_summary = monthly_summary(&state.contributions, &record.month);
    RecordOutcome {
        record,
        duplicate,
        user_summary,
        month_summary,
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// JSON-FILE STORE
// ════════════════════════════════════════════════════════════════════════════════

pub struct JsonPoolStore {
    path: PathBuf,
    /// Serialization point for read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonPoolStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<PoolState, PoolError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| PoolError::Store(format!("corrupt pool state: {}", e))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(PoolState::default()),
            Err(err) => Err(PoolError::Store(err.to_string())),
        }
    }

    fn persist(&self, state: &PoolState) -> Result<(), PoolError> {
        let json = serde_json::to_vec_pretty(state).map_err(|e| PoolError::Store(e.to_string()))?;
        persist_atomically(&self.path, &json).map_err(|e| PoolError::Store(e.to_string()))
    }
}

/// Write `bytes` to a sibling temp file, flush + sync, then rename over
/// `path`. Rename is the commit point.
pub(crate) fn persist_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)
}

impl PoolStore for JsonPoolStore {
    fn record_contribution(&self, input: ContributionInput) -> Result<RecordOutcome, PoolError> {
        let _guard = self.write_lock.lock();
        let mut state = self.load()?;
        let (record, duplicate) = apply_record(&mut state, input)?;
        if !duplicate {
            self.persist(&state)?;
            debug!(id = %record.id, month = %record.month, cents = record.amount_usd_cents, "contribution recorded");
        }
        Ok(outcome(&state, record, duplicate))
    }

    fn contributions(&self) -> Result<Vec<Contribution>, PoolError> {
        Ok(self.load()?.contributions)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// IN-MEMORY STORE
// ════════════════════════════════════════════════════════════════════════════════

/// Test double with the same write discipline, no disk.
#[derive(Default)]
pub struct MemoryPoolStore {
    state: Mutex<PoolState>,
}

impl MemoryPoolStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PoolStore for MemoryPoolStore {
    fn record_contribution(&self, input: ContributionInput) -> Result<RecordOutcome, PoolError> {
        let mut state = self.state.lock();
        let (record, duplicate) = apply_record(&mut state, input)?;
        Ok(outcome(&state, record, duplicate))
    }

    fn contributions(&self) -> Result<Vec<Contribution>, PoolError> {
        Ok(self.state.lock().contributions.clone())
    }
}
