//! Background sweeps that reconcile the two scopes after the fact

pub mod hold_expiry;
pub mod issuance_promotion;
pub mod scheduler;

pub use hold_expiry::{HoldExpiryReport, HoldExpirySweep};
pub use issuance_promotion::{IssuancePromotionReport, IssuancePromotionSweep};
pub use scheduler::Scheduler;

/// Errors that abort a sweep run; the scheduler only logs them
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("database error: {0}")]
    Database(#[from] crate::database::error::DatabaseError),

    #[error("coin ledger error: {0}")]
    Ledger(#[from] crate::services::coin_ledger::CoinLedgerError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
