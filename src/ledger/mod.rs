//! Status ledger for mirrored objects.
//!
//! The ledger remembers every key observed in the bucket and the outcome of
//! the last attempt to mirror it. It is what makes repeated runs incremental:
//! - new keys are recorded once per listing page
//! - completed and skipped keys are not downloaded again
//! - failed keys are kept for inspection and re-drive
//! - per-cycle statistics feed the `status` command

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{Ledger, SqliteLedger};
pub use error::LedgerError;
pub use types::{CycleStats, Entry, EntryStatus, LedgerSummary};
