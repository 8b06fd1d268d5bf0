//! Remote-console broker for compute instances.
//!
//! Negotiates VNC, SPICE, RDP and serial consoles with a compute backend and,
//! for persisted VNC consoles, records the issued token for the console keeper.

pub mod backend;
pub mod broker;
pub mod compute;
pub mod config;
pub mod console;
pub mod routes;
pub mod store;
pub mod telemetry;

pub use backend::{BackendError, ConsoleBackend, Instance};
pub use broker::{BrokerError, ConsoleBroker};
pub use config::{BrokerConfig, ConsoleKeeperConfig};
pub use console::{
    parse_endpoint, ConnectionDescriptor, ConsoleProtocol, ConsoleResponse, SessionRecord,
};
pub use store::{MemorySessionStore, RedisSessionStore, SessionStore};
