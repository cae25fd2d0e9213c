/// Persistence failures reported by a [`crate::ChatStore`] or [`crate::AccountStore`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(String),
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Every failure the relay can observe, classified by its blast radius.
///
/// Only transport errors tear a connection down; everything else drops a
/// single frame or message and keeps going. Nothing is retried.
#[derive(Clone, Debug, thiserror::Error)]
pub enum RelayError {
    // Pre-connection
    #[error("credential rejected: {0}")]
    AuthRejected(String),

    // Message-level, connection stays open
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("invalid message: {0}")]
    Validation(&'static str),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("outbound queue full")]
    DeliveryBackpressure,

    // Connection-fatal
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Whether the error ends the connection it occurred on.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthRejected(_) => "auth_rejected",
            Self::Decode(_) => "decode",
            Self::Validation(_) => "validation",
            Self::Persistence(_) => "persistence",
            Self::DeliveryBackpressure => "delivery_backpressure",
            Self::Transport(_) => "transport",
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Decode(e.to_string())
    }
}
