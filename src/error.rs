//! Ingest error taxonomy. Kinds, not concrete upstream types: adapters and
//! DB plumbing map their failures onto one of these so the pipeline can make
//! a uniform retry/skip/abort decision per record.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Missing or invalid env/credentials; fatal at startup.
    #[error("config: {0}")]
    Config(String),

    /// HTTP timeouts, DNS, 5xx. Retried with backoff.
    #[error("transport: {0}")]
    Transport(String),

    /// 4xx or malformed payload for one record; the record is skipped.
    #[error("upstream: {0}")]
    Upstream(String),

    /// Unique violation on an idempotent upsert. Retried once by re-read;
    /// a second failure is a logic bug and is surfaced.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Category/child-exclusive breach or missing FK for an ensured entity.
    /// Aborts the enclosing transaction and fails the record.
    #[error("invariant violation on {entity} {id}: {detail}")]
    InvariantViolation {
        entity: &'static str,
        id: i64,
        detail: String,
    },

    /// Lease lost or claim failed; the unit of work is re-queued.
    #[error("lock: {0}")]
    Lock(String),

    /// Database unavailable, migration mismatch. Crashes the worker.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl IngestError {
    /// Process exit code for the CLI surface.
    pub fn exit_code(&self) -> i32 {
        match self {
            IngestError::Config(_) => 2,
            IngestError::Fatal(_) => 3,
            _ => 1,
        }
    }

    /// Whether the failing unit may be retried without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Transport(_) | IngestError::Conflict(_) | IngestError::Lock(_)
        )
    }
}

/// True when the underlying DB error is a Postgres unique violation (23505),
/// the signal for the re-read path of the ensure_* helpers.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// True for Postgres check violations and trigger-raised invariant breaches
/// (the child-count triggers raise with ERRCODE check_violation).
pub fn is_check_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23514"),
        _ => false,
    }
}

/// Map a sqlx error into the taxonomy: unique violations become `Conflict`;
/// anything else from the store is `Fatal`.
pub fn classify_db_error(err: sqlx::Error) -> IngestError {
    if is_unique_violation(&err) {
        return IngestError::Conflict(err.to_string());
    }
    IngestError::Fatal(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_cli_contract() {
        assert_eq!(IngestError::Config("x".into()).exit_code(), 2);
        assert_eq!(IngestError::Fatal("x".into()).exit_code(), 3);
        assert_eq!(IngestError::Transport("x".into()).exit_code(), 1);
        assert_eq!(
            IngestError::InvariantViolation {
                entity: "product",
                id: 1,
                detail: "both child counts".into()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn retryability_by_kind() {
        assert!(IngestError::Transport("t".into()).is_retryable());
        assert!(IngestError::Lock("l".into()).is_retryable());
        assert!(!IngestError::Upstream("u".into()).is_retryable());
        assert!(!IngestError::Fatal("f".into()).is_retryable());
    }
}
