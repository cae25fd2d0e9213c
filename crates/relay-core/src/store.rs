use crate::errors::StoreError;
use crate::ids::UserId;
use crate::messages::StoredMessage;

/// Durable identity and message storage consumed by the hub.
///
/// Called only from the hub's control path, so implementations see no
/// concurrent writers from the relay itself.
pub trait ChatStore: Send + Sync {
    /// Idempotent lookup-or-insert keyed by display name.
    fn get_or_create_user(&self, username: &str) -> Result<UserId, StoreError>;

    /// Durable append of one message body.
    fn save_message(&self, user_id: UserId, content: &str) -> Result<(), StoreError>;

    /// The `limit` most recent messages, oldest first.
    fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError>;
}

/// Account lookups backing the HTTP login/registration endpoints.
pub trait AccountStore: Send + Sync {
    /// Insert a user with a password hash. A taken username is `StoreError::Conflict`.
    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserId, StoreError>;

    /// Id and password hash for a username.
    fn credentials(&self, username: &str) -> Result<(UserId, String), StoreError>;

    fn username_of(&self, user_id: UserId) -> Result<String, StoreError>;
}
