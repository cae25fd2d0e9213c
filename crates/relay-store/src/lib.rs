pub mod database;
pub mod messages;
pub mod schema;
pub mod sqlite;
pub mod users;

pub use database::Database;
pub use messages::MessageRepo;
pub use sqlite::SqliteStore;
pub use users::UserRepo;
