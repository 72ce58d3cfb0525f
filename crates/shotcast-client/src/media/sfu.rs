//! SFU client library contract
//!
//! Mirrors the device / send transport / producer object graph of an SFU
//! client library. The transport asks its [`TransportListener`] to negotiate
//! with the relay whenever it needs to connect or to register a producer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shotcast_protocol::{DtlsParameters, RtpCapabilities, RtpParameters, TrackKind, TransportParams};

use super::device::MediaTrack;
use crate::error::Result;

/// One simulcast layer as handed to the producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncoding {
    pub rid: String,
    pub scale_resolution_down_by: f64,
    /// bits per second
    pub max_bitrate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerAppData {
    pub track_id: String,
}

pub struct ProducerOptions {
    pub track: Arc<dyn MediaTrack>,
    pub encodings: Vec<RtpEncoding>,
    pub app_data: ProducerAppData,
}

impl fmt::Debug for ProducerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerOptions")
            .field("track", &self.track.id())
            .field("encodings", &self.encodings)
            .field("app_data", &self.app_data)
            .finish()
    }
}

/// What the transport needs from the relay to register a producer
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceNegotiation {
    pub kind: TrackKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: ProducerAppData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Negotiation callbacks raised by a send transport
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<()>;

    /// Returns the relay-assigned producer id
    async fn on_produce(&self, negotiation: ProduceNegotiation) -> Result<String>;
}

pub trait Producer: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn closed(&self) -> bool;
    fn close(&self);
}

impl fmt::Debug for dyn Producer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("closed", &self.closed())
            .finish()
    }
}

#[async_trait]
pub trait SendTransport: Send + Sync {
    fn id(&self) -> &str;
    fn dtls_state(&self) -> DtlsState;
    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>>;
    fn closed(&self) -> bool;
    fn close(&self);
}

#[async_trait]
pub trait SfuDevice: Send + Sync {
    /// Fails with `DeviceLoad` on capabilities this client cannot handle
    async fn load(&self, router_rtp_capabilities: &RtpCapabilities) -> Result<()>;
    fn loaded(&self) -> bool;
    fn can_produce(&self, kind: TrackKind) -> bool;
    fn create_send_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn SendTransport>>;
}

/// Entry point of the SFU client library
pub trait SfuBackend: Send + Sync {
    fn new_device(&self) -> Arc<dyn SfuDevice>;
}
