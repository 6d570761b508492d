use rust_decimal::Decimal;
use thiserror::Error;

/// Bank node errors.
#[derive(Debug, Error)]
pub enum BankError {
    #[error("Source account '{0}' not found")]
    SourceAccountNotFound(String),

    #[error("Destination account '{0}' not found")]
    DestinationAccountNotFound(String),

    #[error("Account '{0}' not found")]
    AccountNotFound(String),

    #[error("Account '{0}' already exists")]
    AccountExists(String),

    #[error("Account '{0}' is closed")]
    AccountClosed(String),

    #[error("Account '{account}' still holds {balance}")]
    AccountNotEmpty { account: String, balance: Decimal },

    #[error("Insufficient funds on '{account}': available {available}, requested {requested}")]
    InsufficientFunds {
        account: String,
        available: Decimal,
        requested: Decimal,
    },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Currency mismatch: expected '{expected}', got '{actual}'")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("Source and destination account are the same")]
    SameAccount,

    #[error("Payment not authorized: {0}")]
    Unauthorized(String),

    #[error("Transfer '{0}' already exists")]
    DuplicateTransfer(String),

    #[error("Payment '{0}' not found")]
    PaymentNotFound(String),

    #[error("Illegal transition for '{id}': {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Saga '{trace}' out of order: expected '{expected}', got '{actual}'")]
    StageViolation {
        trace: String,
        expected: String,
        actual: String,
    },

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl BankError {
    pub fn stage_violation(trace: &str, expected: &str, actual: &str) -> Self {
        Self::StageViolation {
            trace: trace.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Storage(format!("{context}: {err}"))
    }
}

/// Outcome classification of a failed call to a peer node.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer '{peer}' rejected the request ({status}): {message}")]
    Rejected {
        peer: String,
        status: u16,
        message: String,
    },

    #[error("peer '{peer}' timed out")]
    Timeout { peer: String },

    #[error("transport to peer '{peer}' failed: {message}")]
    Transport { peer: String, message: String },

    #[error("peer '{peer}' answered outside the protocol: {message}")]
    Protocol { peer: String, message: String },

    #[error("peer '{0}' is not in the directory")]
    UnknownPeer(String),
}
