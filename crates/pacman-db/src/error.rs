//! Error taxonomy shared by the connection manager, validators and stores.
//!
//! Every error is `Clone`: a single connection attempt is awaited by many
//! callers and each of them receives its own copy of the outcome.

use std::fmt;

use thiserror::Error;

/// Submitted field a [`ValidationFailure`] refers to, named as clients send it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    Score,
    Level,
    Lives,
    ElapsedTime,
    UserId,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Score => "score",
            Field::Level => "level",
            Field::Lives => "lives",
            Field::ElapsedTime => "elapsedTime",
            Field::UserId => "userId",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-correctable rejection raised before any database call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationFailure {
    pub field: Field,
    pub message: String,
}

impl ValidationFailure {
    pub fn new(field: Field, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// The database could not be reached. `target` is always redacted of credentials.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("failed to connect to database at {target}: {reason}")]
pub struct ConnectionFailure {
    pub target: String,
    pub reason: String,
}

impl ConnectionFailure {
    pub fn new(target: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self {
            target: target.into(),
            reason: reason.to_string(),
        }
    }
}

/// A read or write against an established handle failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PersistenceFailure {
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("{operation} failed: {reason}")]
    Query {
        operation: &'static str,
        reason: String,
    },
    #[error("{operation} returned a malformed row: {reason}")]
    Decode {
        operation: &'static str,
        reason: String,
    },
}

impl PersistenceFailure {
    pub fn query(operation: &'static str, err: impl fmt::Display) -> Self {
        PersistenceFailure::Query {
            operation,
            reason: err.to_string(),
        }
    }

    pub fn decode(operation: &'static str, err: impl fmt::Display) -> Self {
        PersistenceFailure::Decode {
            operation,
            reason: err.to_string(),
        }
    }
}

/// Union of everything a request can fail with on its way to storage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    #[error(transparent)]
    Validation(#[from] ValidationFailure),
    #[error(transparent)]
    Connection(#[from] ConnectionFailure),
    #[error(transparent)]
    Persistence(#[from] PersistenceFailure),
}

impl DbError {
    /// Infrastructure failures are not the client's fault and must not leak detail.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, DbError::Validation(_))
    }
}
