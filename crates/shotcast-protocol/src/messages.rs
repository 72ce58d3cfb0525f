use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{
    Contest, ContestUser, DtlsParameters, RtpCapabilities, RtpParameters, TrackDescriptor,
    TrackKind, TransportParams,
};

/// Frames sent from the broadcaster to the relay hub
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame on every connection
    Authenticate {
        alias: String,
        shot_token: String,
        client_id: String,
    },

    /// Request that expects exactly one `Response` with the same id
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        payload: Value,
    },

    /// Acknowledgement of a pushed event that carried an ack id
    Ack {
        id: u64,
        #[serde(default)]
        data: Value,
    },

    /// Keep-alive
    Ping,
}

/// Frames sent from the relay hub to the broadcaster
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication accepted
    Authenticated { socket_id: String },

    /// Connection-level error
    Error { message: String },

    /// Reply to a `Request`
    Response {
        id: u64,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Server-pushed command; `ack` is set when the relay waits for completion
    Event {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
        event: ServerEvent,
    },

    Pong,
}

/// Commands the relay pushes to a broadcaster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    RequestStartBroadcast(BroadcastTracks),
    RequestStopBroadcast(BroadcastTracks),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastTracks {
    pub track_ids: Vec<String>,
}

/// A typed request/acknowledgement call
pub trait Rpc: Serialize {
    const METHOD: &'static str;
    type Response: DeserializeOwned;
}

/// Response that carries nothing but the acknowledgement itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GetContestInfo {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContestInfo {
    pub contest: Contest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<ContestUser>,
    /// Relay clock in milliseconds since the Unix epoch
    pub server_timestamp: i64,
}

impl Rpc for GetContestInfo {
    const METHOD: &'static str = "getContestInfo";
    type Response = ContestInfo;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmReady {
    pub shot_name: String,
    pub tracks: Vec<TrackDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmReadyResponse {
    pub transport: TransportParams,
    pub router_rtp_capabilities: RtpCapabilities,
}

impl Rpc for ConfirmReady {
    const METHOD: &'static str = "confirmReady";
    type Response = ConfirmReadyResponse;
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CancelReady {}

impl Rpc for CancelReady {
    const METHOD: &'static str = "cancelReady";
    type Response = Empty;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteConnectTransport {
    pub dtls_parameters: DtlsParameters,
}

impl Rpc for CompleteConnectTransport {
    const METHOD: &'static str = "completeConnectTransport";
    type Response = Empty;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    pub track_id: String,
    pub kind: TrackKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: String,
}

impl Rpc for Produce {
    const METHOD: &'static str = "produce";
    type Response = ProduceResponse;
}
