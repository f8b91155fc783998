//! # Verdant Pool Crate
//!
//! Pooled-contribution accounting: an append-only, externally-keyed
//! idempotent ledger of USD contributions, pure monthly/user aggregation,
//! and the subscription-invoice sync that feeds it.
//!
//! ## Modules
//! - `contribution`: Record types, input validation, user-id derivation
//! - `store`: [`PoolStore`] trait, JSON-file and in-memory stores
//! - `summary`: Pure aggregations over the contribution log
//! - `sync`: Paginated gateway-invoice ingestion
//!
//! ## Idempotency Invariant
//!
//! For any non-empty `external_event_id` there is at most one stored
//! contribution; replays return the existing record with
//! `duplicate = true` and write nothing.

pub mod contribution;
pub mod store;
pub mod summary;
pub mod sync;

pub use contribution::{Contribution, ContributionInput, ContributionSource, PoolError};
pub use store::{JsonPoolStore, MemoryPoolStore, PoolStore, RecordOutcome};
pub use summary::{ContributorTotal, MonthSummary, MonthTotal, UserSummary};
pub use sync::{SubscriptionSync, SyncConfig, SyncRequest, SyncSummary};
