//! # Verdant Retire Crate
//!
//! The purchase-and-retire core: cheapest-first order selection, the
//! single-retirement pipeline with marketplace fallback, exact
//! remainder-preserving attribution, and the monthly batch driver that
//! turns a pooled month into on-chain retirements.
//!
//! ## Modules
//! - `selector`: Quantity- and budget-bounded order selection
//! - `allocate`: Largest-remainder proportional allocation
//! - `service`: One retirement, authorize → broadcast → capture → poll
//! - `execution`: BatchExecution / ReconciliationRun records and stores
//! - `batch`: The monthly driver with preflight gating
//!
//! ## Failure Posture
//!
//! [`service::RetirementService::execute`] never surfaces an error: every
//! failure becomes a marketplace fallback carrying a human-readable
//! message, and any uncaptured hold is released on the way out.

pub mod allocate;
pub mod batch;
pub mod execution;
pub mod selector;
pub mod service;

pub use allocate::{allocate_proportional, share_ppm};
pub use batch::{BatchService, DriverConfig, ReconciliationRequest};
pub use execution::{
    BatchExecution, BatchStatus, ContributorAttribution, ExecutionMode, ExecutionStore,
    JsonExecutionStore, MemoryExecutionStore, ReconciliationRun, RunStatus, SyncScope,
};
pub use selector::{
    BudgetSelection, CreditType, OrderSelector, QuantitySelection, SelectedOrder, SelectorError,
};
pub use service::{
    PrepaidBalance, RetirementOutcome, RetirementRequest, RetirementService, ServiceConfig,
};
