use chrono::Utc;
use relay_core::{StoreError, StoredMessage, UserId};
use tracing::instrument;

use crate::database::Database;

pub struct MessageRepo {
    db: Database,
}

impl MessageRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append a message, stamped with the current UTC time.
    #[instrument(skip(self, content), fields(user_id = %user_id, len = content.len()))]
    pub fn save(&self, user_id: UserId, content: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (user_id, content, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![user_id.get(), content, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// The `limit` most recent messages, oldest first.
    #[instrument(skip(self))]
    pub fn recent(&self, limit: usize) -> Result<Vec<StoredMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT username, content, created_at FROM (
                     SELECT u.username, m.content, m.created_at, m.id
                     FROM messages m JOIN users u ON u.id = m.user_id
                     ORDER BY m.id DESC
                     LIMIT ?1
                 ) ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([limit], |row| {
                    Ok(StoredMessage {
                        username: row.get(0)?,
                        content: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}
