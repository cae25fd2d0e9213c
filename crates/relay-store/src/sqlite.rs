use relay_core::{AccountStore, ChatStore, StoreError, StoredMessage, UserId};

use crate::database::Database;
use crate::messages::MessageRepo;
use crate::users::UserRepo;

/// SQLite-backed chat and account storage.
pub struct SqliteStore {
    users: UserRepo,
    messages: MessageRepo,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self {
            users: UserRepo::new(db.clone()),
            messages: MessageRepo::new(db),
        }
    }
}

impl ChatStore for SqliteStore {
    fn get_or_create_user(&self, username: &str) -> Result<UserId, StoreError> {
        self.users.get_or_create(username)
    }

    fn save_message(&self, user_id: UserId, content: &str) -> Result<(), StoreError> {
        self.messages.save(user_id, content)
    }

    fn recent_messages(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        self.messages.recent(limit)
    }
}

impl AccountStore for SqliteStore {
    fn create_user(&self, username: &str, password_hash: &str) -> Result<UserId, StoreError> {
        self.users.create(username, password_hash)
    }

    fn credentials(&self, username: &str) -> Result<(UserId, String), StoreError> {
        self.users.credentials(username)
    }

    fn username_of(&self, user_id: UserId) -> Result<String, StoreError> {
        self.users.username(user_id)
    }
}
