use thiserror::Error;

/// Error taxonomy shared by controller and agent (§7).
#[derive(Debug, Error)]
pub enum CosmosError {
    #[error("no stream registered for hostname {0}")]
    NoStream(String),

    #[error("content hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("archive entry escapes destination: {0}")]
    ArchiveTraversal(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout sending message")]
    SendTimeout,
}
