//! # Execution Records
//!
//! Persisted outcomes of the monthly driver: [`BatchExecution`] (one
//! attempted/planned retirement batch) and [`ReconciliationRun`] (one
//! driver invocation wrapping optional sync + batch).
//!
//! ## Store Discipline
//!
//! Same as the pool ledger: mutex-serialized read-modify-write over one
//! JSON state file, temp-file + rename as the commit point. The store is
//! also the concurrency guard: `begin_execution` refuses to open a second
//! `in_progress` execution for the same `(month, credit_type)`, which is
//! what keeps two broadcasts for one month from racing.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use verdant_pool::SyncSummary;

const STATE_VERSION: u32 = 1;

// ════════════════════════════════════════════════════════════════════════════════
// SERDE HELPERS
// ════════════════════════════════════════════════════════════════════════════════

/// u128 micro amounts ride as decimal strings in persisted JSON.
pub(crate) mod u128_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid u128 string {:?}", raw)))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// TYPES
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Success,
    Failed,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    DryRun,
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
    Blocked,
}

/// One contributor's exact slice of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributorAttribution {
    pub user_id: String,
    /// Display share, floored parts-per-million of the month's pool.
    pub share_ppm: u32,
    pub contribution_usd_cents: u64,
    pub attributed_budget_usd_cents: u64,
    #[serde(with = "u128_string")]
    pub attributed_cost_micro: u128,
    /// Credits attributed, 6-decimal string.
    pub attributed_quantity: String,
    pub payment_denom: String,
}

/// Outcome (or plan, for dry runs) of one batch retirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchExecution {
    pub id: String,
    pub month: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_type: Option<String>,
    pub dry_run: bool,
    pub status: BatchStatus,
    pub reason: String,
    pub budget_usd_cents: u64,
    #[serde(with = "u128_string")]
    pub spent_micro: u128,
    pub spent_denom: String,
    /// 6-decimal string.
    pub retired_quantity: String,
    #[serde(default)]
    pub attributions: Vec<ContributorAttribution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retirement_id: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    None,
    Customer,
    AllCustomers,
}

/// One driver invocation: optional sync, gating decision, batch outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub id: String,
    pub month: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_type: Option<String>,
    pub sync_scope: SyncScope,
    pub execution_mode: ExecutionMode,
    pub preflight_only: bool,
    pub force: bool,
    pub status: RunStatus,
    /// Free-form policy code (`dry_run`, `executed`, `blocked_preflight`, …).
    pub batch_status: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("an execution for {month} ({credit_type:?}) is already in progress")]
    AlreadyRunning {
        month: String,
        credit_type: Option<String>,
    },
    #[error("execution store failure: {0}")]
    Store(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// STORE
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExecState {
    version: u32,
    executions: Vec<BatchExecution>,
    runs: Vec<ReconciliationRun>,
}

impl Default for ExecState {
    fn default() -> Self {
        ExecState {
            version: STATE_VERSION,
            executions: Vec::new(),
            runs: Vec::new(),
        }
    }
}

pub trait ExecutionStore: Send + Sync {
    /// Open an `in_progress` execution, enforcing at most one active per
    /// `(month, credit_type)`.
    fn begin_execution(
        &self,
        month: &str,
        credit_type: Option<&str>,
        dry_run: bool,
        budget_usd_cents: u64,
    ) -> Result<BatchExecution, ExecutionError>;

    /// Replace the stored execution with its finished form (matched by
    /// id).
    fn finish_execution(&self, execution: BatchExecution) -> Result<(), ExecutionError>;

    /// Most recent successful dry run for the gate check.
    fn latest_successful_dry_run(
        &self,
        month: &str,
        credit_type: Option<&str>,
    ) -> Result<Option<BatchExecution>, ExecutionError>;

    fn list_executions(&self, month: Option<&str>) -> Result<Vec<BatchExecution>, ExecutionError>;

    /// Insert or replace (by id) a reconciliation run record.
    fn record_run(&self, run: ReconciliationRun) -> Result<(), ExecutionError>;

    fn list_runs(&self, month: Option<&str>) -> Result<Vec<ReconciliationRun>, ExecutionError>;
}

fn new_in_progress(
    month: &str,
    credit_type: Option<&str>,
    dry_run: bool,
    budget_usd_cents: u64,
) -> BatchExecution {
    BatchExecution {
        id: Uuid::new_v4().to_string(),
        month: month.to_string(),
        credit_type: credit_type.map(str::to_string),
        dry_run,
        status: BatchStatus::InProgress,
        reason: String::new(),
        budget_usd_cents,
        spent_micro: 0,
        spent_denom: String::new(),
        retired_quantity: "0.000000".to_string(),
        attributions: Vec::new(),
        tx_hash: None,
        block_height: None,
        retirement_id: None,
        executed_at: Utc::now(),
    }
}

fn begin_in(
    state: &mut ExecState,
    month: &str,
    credit_type: Option<&str>,
    dry_run: bool,
    budget_usd_cents: u64,
) -> Result<BatchExecution, ExecutionError> {
    let conflict = state.executions.iter().any(|e| {
        e.status == BatchStatus::InProgress
            && e.month == month
            && e.credit_type.as_deref() == credit_type
    });
    if conflict {
        return Err(ExecutionError::AlreadyRunning {
            month: month.to_string(),
            credit_type: credit_type.map(str::to_string),
        });
    }
    let execution = new_in_progress(month, credit_type, dry_run, budget_usd_cents);
    state.executions.push(execution.clone());
    Ok(execution)
}

fn finish_in(state: &mut ExecState, execution: BatchExecution) {
    match state.executions.iter_mut().find(|e| e.id == execution.id) {
        Some(slot) => *slot = execution,
        None => state.executions.push(execution),
    }
}

fn latest_dry_run_in(
    state: &ExecState,
    month: &str,
    credit_type: Option<&str>,
) -> Option<BatchExecution> {
    state
        .executions
        .iter()
        .filter(|e| {
            e.dry_run
                && e.status == BatchStatus::Success
                && e.month == month
                && e.credit_type.as_deref() == credit_type
        })
        .max_by_key(|e| e.executed_at)
        .cloned()
}

fn record_run_in(state: &mut ExecState, run: ReconciliationRun) {
    match state.runs.iter_mut().find(|r| r.id == run.id) {
        Some(slot) => *slot = run,
        None => state.runs.push(run),
    }
}

// ── JSON-file store ─────────────────────────────────────────────────────

pub struct JsonExecutionStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonExecutionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<ExecState, ExecutionError> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ExecutionError::Store(format!("corrupt execution state: {}", e))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ExecState::default()),
            Err(err) => Err(ExecutionError::Store(err.to_string())),
        }
    }

    fn persist(&self, state: &ExecState) -> Result<(), ExecutionError> {
        let json =
            serde_json::to_vec_pretty(state).map_err(|e| ExecutionError::Store(e.to_string()))?;
        persist_atomically(&self.path, &json).map_err(|e| ExecutionError::Store(e.to_string()))
    }
}

fn persist_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
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

impl ExecutionStore for JsonExecutionStore {
    fn begin_execution(
        &self,
        month: &str,
        credit_type: Option<&str>,
        dry_run: bool,
        budget_usd_cents: u64,
    ) -> Result<BatchExecution, ExecutionError> {
        let _guard = self.write_lock.lock();
        let mut state = self.load()?;
        let execution = begin_in(&mut state, month, credit_type, dry_run, budget_usd_cents)?;
        self.persist(&state)?;
        debug!(id = %execution.id, month, "execution opened");
        Ok(execution)
    }

    fn finish_execution(&self, execution: BatchExecution) -> Result<(), ExecutionError> {
        let _guard = self.write_lock.lock();
        let mut state = self.load()?;
        finish_in(&mut state, execution);
        self.persist(&state)
    }

    fn latest_successful_dry_run(
        &self,
        month: &str,
        credit_type: Option<&str>,
    ) -> Result<Option<BatchExecution>, ExecutionError> {
        Ok(latest_dry_run_in(&self.load()?, month, credit_type))
    }

    fn list_executions(&self, month: Option<&str>) -> Result<Vec<BatchExecution>, ExecutionError> {
        let state = self.load()?;
        Ok(state
            .executions
            .into_iter()
            .filter(|e| month.map_or(true, |m| e.month == m))
            .collect())
    }

    fn record_run(&self, run: ReconciliationRun) -> Result<(), ExecutionError> {
        let _guard = self.write_lock.lock();
        let mut state = self.load()?;
        record_run_in(&mut state, run);
        self.persist(&state)
    }

    fn list_runs(&self, month: Option<&str>) -> Result<Vec<ReconciliationRun>, ExecutionError> {
        let state = self.load()?;
        Ok(state
            .runs
            .into_iter()
            .filter(|r| month.map_or(true, |m| r.month == m))
            .collect())
    }
}

// ── In-memory store ─────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryExecutionStore {
    state: Mutex<ExecState>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecutionStore for MemoryExecutionStore {
    fn begin_execution(
        &self,
        month: &str,
        credit_type: Option<&str>,
        dry_run: bool,
        budget_usd_cents: u64,
    ) -> Result<BatchExecution, ExecutionError> {
        begin_in(&mut self.state.lock(), month, credit_type, dry_run, budget_usd_cents)
    }

    fn finish_execution(&self, execution: BatchExecution) -> Result<(), ExecutionError> {
        finish_in(&mut self.state.lock(), execution);
        Ok(())
    }

    fn latest_successful_dry_run(
        &self,
        month: &str,
        credit_type: Option<&str>,
    ) -> Result<Option<BatchExecution>, ExecutionError> {
        Ok(latest_dry_run_in(&self.state.lock(), month, credit_type))
    }

    fn list_executions(&self, month: Option<&str>) -> Result<Vec<BatchExecution>, ExecutionError> {
        Ok(self
            .state
            .lock()
            .executions
            .iter()
            .filter(|e| month.map_or(true, |m| e.month == m))
            .cloned()
            .collect())
    }

    fn record_run(&self, run: ReconciliationRun) -> Result<(), ExecutionError> {
        record_run_in(&mut self.state.lock(), run);
        Ok(())
    }

    fn list_runs(&self, month: Option<&str>) -> Result<Vec<ReconciliationRun>, ExecutionError> {
        Ok(self
            .state
            .lock()
            .runs
            .iter()
            .filter(|r| month.map_or(true, |m| r.month == m))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_progress_guard_blocks_second_execution() {
        let store = MemoryExecutionStore::new();
        let first = store
            .begin_execution("2026-03", Some("carbon"), false, 1000)
            .unwrap();
        let err = store
            .begin_execution("2026-03", Some("carbon"), false, 1000)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::AlreadyRunning { .. }));

        // different credit type is independent
        store
            .begin_execution("2026-03", Some("biodiversity"), false, 1000)
            .unwrap();

        // finishing releases the guard
        let mut finished = first;
        finished.status = BatchStatus::Failed;
        finished.reason = "broadcast failed".to_string();
        store.finish_execution(finished).unwrap();
        store
            .begin_execution("2026-03", Some("carbon"), false, 1000)
            .unwrap();
    }

    #[test]
    fn latest_dry_run_picks_most_recent_success() {
        let store = MemoryExecutionStore::new();
        let mut older = store
            .begin_execution("2026-03", None, true, 500)
            .unwrap();
        older.status = BatchStatus::Success;
        older.executed_at = Utc::now() - chrono::Duration::hours(10);
        store.finish_execution(older.clone()).unwrap();

        let mut newer = store.begin_execution("2026-03", None, true, 800).unwrap();
        newer.status = BatchStatus::Success;
        store.finish_execution(newer.clone()).unwrap();

        let found = store
            .latest_successful_dry_run("2026-03", None)
            .unwrap()
            .unwrap();
        assert_eq!(found.id, newer.id);

        // failed dry runs never gate
        assert!(store
            .latest_successful_dry_run("2026-04", None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn json_store_round_trips_executions_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batch.json");

        {
            let store = JsonExecutionStore::new(&path);
            let mut execution = store
                .begin_execution("2026-03", None, false, 1000)
                .unwrap();
            execution.status = BatchStatus::Success;
            execution.spent_micro = 350_000_000_000_000_000_000u128; // > u64::MAX
            execution.spent_denom = "uusdc".to_string();
            execution.retired_quantity = "2.250000".to_string();
            execution.attributions = vec![ContributorAttribution {
                user_id: "alice".to_string(),
                share_ppm: 1_000_000,
                contribution_usd_cents: 1000,
                attributed_budget_usd_cents: 975,
                attributed_cost_micro: 3_500,
                attributed_quantity: "2.250000".to_string(),
                payment_denom: "uusdc".to_string(),
            }];
            store.finish_execution(execution).unwrap();

            store
                .record_run(ReconciliationRun {
                    id: "run-1".to_string(),
                    month: "2026-03".to_string(),
                    credit_type: None,
                    sync_scope: SyncScope::AllCustomers,
                    execution_mode: ExecutionMode::Live,
                    preflight_only: false,
                    force: false,
                    status: RunStatus::Completed,
                    batch_status: "executed".to_string(),
                    started_at: Utc::now(),
                    finished_at: Some(Utc::now()),
                    sync: None,
                    message: None,
                })
                .unwrap();
        }

        let store = JsonExecutionStore::new(&path);
        let executions = store.list_executions(Some("2026-03")).unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].spent_micro, 350_000_000_000_000_000_000u128);
        assert_eq!(executions[0].attributions.len(), 1);
        let runs = store.list_runs(None).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].batch_status, "executed");
    }
}
