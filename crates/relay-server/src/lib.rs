//! Chat relay server: the hub actor, per-connection pumps, and the HTTP
//! surface (connection upgrade plus account endpoints).

pub mod config;
pub mod connection;
pub mod handlers;
pub mod health;
pub mod hub;
pub mod responses;
pub mod server;

pub use config::{ConfigError, LivenessTimings, RelayConfig, ServerConfig};
pub use connection::{drive_connection, Connection, ConnectionExit, ConnectionHandle, PumpExit};
pub use hub::{DeliveryReport, Hub, HubCommand, HubState};
pub use server::{build_router, start, AppState, RelayServices, ServerHandle};
