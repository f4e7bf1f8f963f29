//! Error taxonomy for store calls and subsystem operations

use std::fmt;
use thiserror::Error;

/// Which backend produced a [`StoreError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Volatile,
    Durable,
    Warehouse,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Volatile => "volatile",
            Tier::Durable => "durable",
            Tier::Warehouse => "warehouse",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Backend unreachable, pool exhausted, or locked.
    Unavailable,
    /// The bounded call did not finish in time.
    Timeout,
    /// A uniqueness or foreign-key constraint rejected the write.
    Conflict,
    /// Stored bytes or tags could not be decoded.
    Corrupt,
    /// A key holds a different value shape than the operation expects.
    WrongType,
    /// A ledger entry was asked to leave a terminal state.
    InvalidTransition,
}

impl fmt::Display for StoreErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StoreErrorKind::Unavailable => "unavailable",
            StoreErrorKind::Timeout => "timeout",
            StoreErrorKind::Conflict => "conflict",
            StoreErrorKind::Corrupt => "corrupt data",
            StoreErrorKind::WrongType => "wrong value type",
            StoreErrorKind::InvalidTransition => "invalid transition",
        })
    }
}

/// Failure of a single store operation
#[derive(Debug, Clone, Error)]
#[error("{tier} store {kind}: {detail}")]
pub struct StoreError {
    pub tier: Tier,
    pub kind: StoreErrorKind,
    pub detail: String,
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn new(tier: Tier, kind: StoreErrorKind, detail: impl Into<String>) -> Self {
        Self { tier, kind, detail: detail.into() }
    }

    pub fn unavailable(tier: Tier, detail: impl fmt::Display) -> Self {
        Self::new(tier, StoreErrorKind::Unavailable, detail.to_string())
    }

    pub fn timeout(tier: Tier, op: &str) -> Self {
        Self::new(tier, StoreErrorKind::Timeout, format!("{} exceeded its deadline", op))
    }

    pub fn corrupt(tier: Tier, detail: impl fmt::Display) -> Self {
        Self::new(tier, StoreErrorKind::Corrupt, detail.to_string())
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == StoreErrorKind::Timeout
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;
        let kind = match &err {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::ConstraintViolation => StoreErrorKind::Conflict,
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => StoreErrorKind::Corrupt,
                _ => StoreErrorKind::Unavailable,
            },
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => StoreErrorKind::Corrupt,
            _ => StoreErrorKind::Unavailable,
        };
        StoreError::new(Tier::Durable, kind, err.to_string())
    }
}

impl From<r2d2::Error> for StoreError {
    fn from(err: r2d2::Error) -> Self {
        StoreError::unavailable(Tier::Durable, format!("connection pool: {}", err))
    }
}

/// Errors surfaced by [`crate::cache::CacheCoordinator`] and
/// [`crate::migration::MigrationManager`].
///
/// Volatile-tier failures never appear here; they are logged and absorbed
/// inside the coordinator.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("durable tier failure: {0}")]
    Durable(#[from] StoreError),

    #[error("conversation {0} not found")]
    ConversationNotFound(String),

    #[error("migration of guest {guest_id} failed (ledger entry {ledger_id}): {source}")]
    MigrationFailed {
        guest_id: String,
        ledger_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("guest {guest_id} has a failed migration (ledger entry {ledger_id}) awaiting operator retry")]
    AwaitingOperatorRetry { guest_id: String, ledger_id: i64 },

    #[error("warehouse export failed (ledger entry {ledger_id}): {source}")]
    ExportFailed {
        ledger_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Whether the serving layer should answer with a generic retry-later.
    pub fn is_retry_later(&self) -> bool {
        match self {
            CacheError::Durable(e) => matches!(
                e.kind,
                StoreErrorKind::Unavailable | StoreErrorKind::Timeout
            ),
            CacheError::MigrationFailed { .. } | CacheError::ExportFailed { .. } => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violation_maps_to_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed".into()),
        );
        let store: StoreError = err.into();
        assert_eq!(store.tier, Tier::Durable);
        assert_eq!(store.kind, StoreErrorKind::Conflict);
    }

    #[test]
    fn durable_outage_is_retry_later() {
        let err = CacheError::from(StoreError::unavailable(Tier::Durable, "connection refused"));
        assert!(err.is_retry_later());
        assert!(!CacheError::InvalidInput("empty".into()).is_retry_later());
    }

    #[test]
    fn display_names_tier_and_kind() {
        let err = StoreError::timeout(Tier::Volatile, "get");
        assert_eq!(err.to_string(), "volatile store timeout: get exceeded its deadline");
    }
}
