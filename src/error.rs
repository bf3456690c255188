//! Error kinds for route resolution and synchronization

use thiserror::Error;

/// Errors surfaced by the resolver, the synchronizer and their collaborators.
///
/// The type is `Clone` so that per-vhost outcomes can travel inside
/// broadcast [`SyncEvent`](crate::sync::SyncEvent)s.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The container has no usable IP address and no override was given
    #[error("container {0} has no usable IP address")]
    NoAddress(String),

    /// The container could not be inspected (typically already removed)
    #[error("container {id} cannot be inspected: {reason}")]
    Unreachable { id: String, reason: String },

    /// An empty container identifier was passed to unbalance
    #[error("missing container id")]
    MissingId,

    /// A routing-table store operation failed
    #[error("routing store unavailable: {0}")]
    StoreUnavailable(String),

    /// Listing containers or reading the event stream failed
    #[error("container runtime error: {0}")]
    Runtime(String),
}

impl SyncError {
    /// Short machine-readable code, used in logs and admin responses
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::NoAddress(_) => "NO_ADDRESS",
            SyncError::Unreachable { .. } => "UNREACHABLE",
            SyncError::MissingId => "MISSING_ID",
            SyncError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            SyncError::Runtime(_) => "RUNTIME",
        }
    }

    pub(crate) fn unreachable(id: &str, reason: impl std::fmt::Display) -> Self {
        SyncError::Unreachable {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn store(reason: impl std::fmt::Display) -> Self {
        SyncError::StoreUnavailable(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(SyncError::NoAddress("abc".into()).code(), "NO_ADDRESS");
        assert_eq!(SyncError::unreachable("abc", "gone").code(), "UNREACHABLE");
        assert_eq!(SyncError::MissingId.code(), "MISSING_ID");
        assert_eq!(SyncError::store("refused").code(), "STORE_UNAVAILABLE");
        assert_eq!(SyncError::Runtime("boom".into()).code(), "RUNTIME");
    }

    #[test]
    fn test_error_messages() {
        let err = SyncError::unreachable("abc123", "no such container");
        assert_eq!(
            err.to_string(),
            "container abc123 cannot be inspected: no such container"
        );
        assert_eq!(SyncError::MissingId.to_string(), "missing container id");
    }
}
