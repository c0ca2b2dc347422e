// Stipend Ledger - Core Library
// Exposes all modules for use in CLI, API server, and tests

pub mod error;
pub mod config;
pub mod money;
pub mod db;
pub mod entities;
pub mod periods;
pub mod ledger;         // Append-only ledger store
pub mod balance;        // Replay of ledger entries into balances
pub mod remeasurement;  // Metrics imports and opening-balance backfill
pub mod workflow;       // Request state machine
pub mod allocation;
pub mod reconciliation;
pub mod notify;
pub mod export;
pub mod engine;

#[cfg(feature = "server")]
pub mod api;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use error::{LedgerError, Result};
pub use config::EngineConfig;
pub use db::{Event, get_events_for_entity, insert_event, setup_database};
pub use entities::{Portfolio, Practice, PracticeReassignment};
pub use periods::{PayPeriod, PeriodRef};
pub use ledger::{LedgerEntry, NewEntry, OwnerRef, TransactionType};
pub use balance::{Balance, PortfolioSummary};
pub use remeasurement::{
    MetricsImportSummary, MetricsRow, OpeningBalanceImportSummary, OpeningBalanceRow, RowFailure,
};
pub use workflow::{
    Actor, NewRequest, PeriodLine, PeriodLineStatus, RequestStatus, RequestType, Role,
    StipendRequest,
};
pub use allocation::{
    Allocation, AllocationKind, AllocationLeg, AllocationStatus, PortfolioTransfer,
    PracticeTransfer, SuspenseDistribution,
};
pub use reconciliation::{
    Discrepancy, DiscrepancyCategory, ReconciliationEngine, ReconciliationReport,
    ReconciliationResult,
};
pub use notify::{LogSink, Notification, NotificationSink, RecordingSink};
pub use engine::StipendEngine;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
