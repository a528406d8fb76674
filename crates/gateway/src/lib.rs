//! Real-time gateway: live client connections and bus delivery.
//!
//! - `connection`: the per-process `ConnectionRegistry`
//! - `bridge`: `QueueConsumerBridge`, bus queue to addressed connection
//! - `directory`: driver registration seam used by the driver endpoint
//! - `app`: axum router, WebSocket endpoints and service wiring

pub mod app;
pub mod bridge;
pub mod connection;
pub mod directory;

pub use bridge::{BridgeStats, QueueConsumerBridge};
pub use connection::{Connection, ConnectionError, ConnectionRegistry, WsConnection};
pub use directory::DriverDirectory;
