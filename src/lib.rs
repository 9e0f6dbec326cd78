//! RoomCall is the signaling and session orchestration core of a real-time
//! calling service.
//!
//! It tracks who is in which call, relays the offer/answer/candidate
//! messages participants use to set up media connections, coordinates media
//! toggles that need renegotiation, and detects participants that went
//! silent. The media itself never passes through here.
//!
//! Binary:
//! - `signaling_server`: exposes the call core over a framed TCP/TLS protocol.

/// Calls, participants, negotiation relay, presence and the state machine.
pub mod call;
/// Handles configuration loading and management.
pub mod config;
/// Logging utilities for the application.
pub mod log;
/// Call-control server speaking the framed wire protocol.
pub mod signaling;
/// TLS (Transport Layer Security) utility functions.
pub mod tls_utils;
