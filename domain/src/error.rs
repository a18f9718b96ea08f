/// Classification of everything that can go wrong during a sync run or a
/// mount operation. Orchestration code carries these inside [`anyhow::Error`]
/// and downcasts where the retry policy needs the kind.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("throttled by remote after {0} attempts")]
    Throttled(u32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Informational: the server already knows this pre-hash, switch to the
    /// full-proof rapid upload flow.
    #[error("pre-hash matched")]
    PreHashMatched,

    #[error("entry is in the recycle bin: {0}")]
    ForbiddenInRecycleBin(String),

    #[error("integrity mismatch: expected sha1 {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("upload of part {part} failed: {reason}")]
    PartUploadFailed { part: u64, reason: String },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("canceled")]
    Canceled,

    #[error("transient: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl SyncError {
    /// Whether the automatic retry-with-backoff policy applies.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Throttled(_) | Self::Transient(_) | Self::PartUploadFailed { .. }
        )
    }

    /// Look through an [`anyhow::Error`] chain for a `SyncError`.
    pub fn of(err: &anyhow::Error) -> Option<&SyncError> {
        err.chain().find_map(|e| e.downcast_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds() {
        assert!(SyncError::Throttled(5).is_retryable());
        assert!(SyncError::Transient("connection reset".into()).is_retryable());
        assert!(SyncError::PartUploadFailed {
            part: 2,
            reason: "timeout".into()
        }
        .is_retryable());
        assert!(!SyncError::Canceled.is_retryable());
        assert!(!SyncError::ConfigInvalid("bad".into()).is_retryable());
        assert!(!SyncError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn downcast_through_anyhow_chain() {
        let err = anyhow::Error::new(SyncError::PreHashMatched).context("create file");
        assert!(matches!(SyncError::of(&err), Some(SyncError::PreHashMatched)));
        let plain = anyhow::anyhow!("nothing typed here");
        assert!(SyncError::of(&plain).is_none());
    }
}
