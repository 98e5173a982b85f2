//! `cardrecon`: credit-card statement to ledger reconciliation engine.
//!
//! Pure engine crate: receives raw statement rows and a ledger snapshot,
//! returns match outcomes, fee allocations and write-back instructions.
//! No CLI dependencies; storage is reached only through the `store` traits.

pub mod config;
pub mod error;
pub mod evidence;
pub mod fees;
pub mod index;
pub mod lock;
pub mod matcher;
pub mod model;
pub mod normalize;
pub mod run;
pub mod service;
pub mod store;

pub use config::ReconConfig;
pub use error::{ReconError, StoreError};
pub use index::CandidateIndex;
pub use lock::{RunKey, RunLock, RunSlots};
pub use model::{LedgerEntry, MatchResult, RawRow, StatementLine};
pub use normalize::StatementNormalizer;
pub use run::{ReconciliationRun, RunReport, RunState};
pub use service::Reconciler;
pub use store::{LedgerStore, MemoryLedger, MemoryStatementStore, StatementStore};
