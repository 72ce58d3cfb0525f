//! Shotcast client library
//!
//! Broadcast session orchestration for a contest broadcaster: camera device
//! management, simulcast planning, the reconnecting relay signaling channel,
//! and the SFU transport/producer lifecycle.

pub mod config;
pub mod error;
pub mod media;
pub mod network;
pub mod session;

pub use config::ClientConfig;
pub use error::{Error, Result};
pub use network::{BroadcasterIdentity, SignalingHub};
pub use session::{BroadcastSession, SessionState};
