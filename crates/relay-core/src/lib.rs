pub mod errors;
pub mod ids;
pub mod messages;
pub mod store;

pub use errors::{RelayError, StoreError};
pub use ids::{ConnectionId, Identity, UserId};
pub use messages::{BroadcastMessage, ChatMessage, StoredMessage};
pub use store::{AccountStore, ChatStore};
