//! Relay signaling

pub mod backoff;
pub mod signaling;
pub mod websocket;

pub use backoff::Backoff;
pub use signaling::{
    BroadcastCommandHandler, BroadcasterIdentity, ConnectErrorCallback, ConnectionState,
    ConnectionStatus, DisconnectHook, SignalingChannel, SignalingHub,
};
