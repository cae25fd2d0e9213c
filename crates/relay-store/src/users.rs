use relay_core::{StoreError, UserId};
use rusqlite::{ErrorCode, OptionalExtension};
use tracing::instrument;

use crate::database::Database;

pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get or create a user keyed by display name.
    /// Users created this way carry an empty password hash.
    #[instrument(skip(self))]
    pub fn get_or_create(&self, username: &str) -> Result<UserId, StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO users (username) VALUES (?1)",
                [username],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM users WHERE username = ?1",
                [username],
                |row| row.get(0),
            )?;
            Ok(UserId(id))
        })
    }

    /// Register a user with a password hash.
    #[instrument(skip(self, password_hash))]
    pub fn create(&self, username: &str, password_hash: &str) -> Result<UserId, StoreError> {
        self.db.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
                rusqlite::params![username, password_hash],
            );
            match inserted {
                Ok(_) => Ok(UserId(conn.last_insert_rowid())),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(StoreError::Conflict(format!("username {username} already exists")))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Id and stored password hash for a username.
    #[instrument(skip(self))]
    pub fn credentials(&self, username: &str) -> Result<(UserId, String), StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, password_hash FROM users WHERE username = ?1",
                [username],
                |row| Ok((UserId(row.get(0)?), row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("user {username}")))
        })
    }

    #[instrument(skip(self), fields(user_id = %user_id))]
    pub fn username(&self, user_id: UserId) -> Result<String, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT username FROM users WHERE id = ?1",
                [user_id.get()],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))
        })
    }
}
