use relay_core::RelayError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,

    #[error("token rejected: {0}")]
    Rejected(String),

    #[error("token signing failed: {0}")]
    Signing(String),

    #[error("password hashing failed: {0}")]
    Hashing(String),
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        RelayError::AuthRejected(e.to_string())
    }
}
