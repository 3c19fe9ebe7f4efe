//! Error taxonomy for the Zero-Trust control plane.
//!
//! Propagation policy follows spec §7: validation and authorization failures
//! are rejected at the edge, collaborator outages degrade capability rather
//! than aborting the caller, and storage errors are retried once locally
//! before surfacing.

use thiserror::Error;

/// Crate-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input: bad MAC, missing required field.
    #[error("validation error: {0}")]
    Validation(String),

    /// Unknown device, revoked, pending approval, rejected, rate limited, etc.
    #[error("not authorized: {reason}")]
    Authz {
        /// Machine-readable reason surfaced to the caller, e.g. `rate_limit_exceeded`.
        reason: String,
    },

    /// Device, baseline, pending row, or credential absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// MAC reassignment or duplicate pending entry.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A collaborator (CA, data plane, ML predictor, honeypot) is degraded or absent.
    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    /// I/O failure on a persistent store.
    #[error("storage error: {0}")]
    Storage(String),

    /// Credential issuance or verification failure.
    #[error("security error: {0}")]
    Security(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Retry a fallible local-storage operation once before giving up (spec §7:
/// "StorageError — I/O failure on a persistent store. Retry the local
/// operation once; on second failure surface 500; supervisor must not
/// exit."). `op` must be safely repeatable — every storage call site this
/// wraps is a read or an idempotent upsert/transition.
pub async fn retry_once<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match op().await {
        Ok(v) => Ok(v),
        Err(Error::Storage(first)) => {
            tracing::warn!(error = %first, "storage operation failed, retrying once");
            op().await
        }
        Err(other) => Err(other),
    }
}
