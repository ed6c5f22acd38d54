use uuid::Uuid;

/// Crate-wide error taxonomy.
///
/// `Duplicate` is a non-fatal signal carrying the id of the pre-existing
/// chunk; callers usually surface it as a successful no-op. `Cancelled`
/// propagates unchanged through every layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("duplicate content, existing id {existing_id}")]
    Duplicate { existing_id: Uuid },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage I/O error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("index consistency: {0}")]
    IndexConsistency(String),

    #[error("external service failed: {0}")]
    ExternalTransient(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn index(msg: impl Into<String>) -> Self {
        Self::IndexConsistency(msg.into())
    }

    /// True for errors that a caller may meaningfully retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ExternalTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_carries_existing_id() {
        let id = Uuid::new_v4();
        let err = EngineError::Duplicate { existing_id: id };
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn transient_classification() {
        assert!(EngineError::ExternalTransient("timeout".into()).is_transient());
        assert!(!EngineError::Cancelled.is_transient());
    }
}
