//! Call control over a persistent TCP or TLS connection per participant.

pub mod clients;
pub mod errors;
pub mod protocol;
pub mod run;
pub mod runtime;
pub mod server_engine;
pub mod server_event;
pub mod signaling_server;
pub mod tls;
pub mod transport;
pub mod types;

pub use errors::ErrorCode;
pub use server_engine::ServerEngine;
pub use signaling_server::SignalingServer;
pub use types::{ClientId, OutgoingMsg};
