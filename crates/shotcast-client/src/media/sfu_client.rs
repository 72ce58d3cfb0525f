//! SFU client for publishing camera tracks
//!
//! Owns the device / send transport / producer graph for one signaling
//! session and keeps at most one live producer per track id. Negotiation with
//! the relay goes through a [`NegotiationSignal`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use shotcast_protocol::{
    DtlsParameters, Produce, ProduceResponse, RtpCapabilities, TrackKind, TransportParams,
};
use tokio::sync::RwLock;

use super::device::MediaTrack;
use super::sfu::{
    ProduceNegotiation, Producer, ProducerAppData, ProducerOptions, RtpEncoding, SendTransport,
    SfuBackend, SfuDevice, TransportListener,
};
use crate::error::{Error, Result};
use crate::network::DisconnectHook;

/// The part of the signaling channel the SFU client negotiates through
#[async_trait]
pub trait NegotiationSignal: Send + Sync {
    async fn connect_transport(&self, dtls_parameters: DtlsParameters) -> Result<()>;
    async fn produce(&self, request: Produce) -> Result<ProduceResponse>;
}

/// Routes transport callbacks to the relay
struct SignalBridge {
    signal: Arc<dyn NegotiationSignal>,
}

#[async_trait]
impl TransportListener for SignalBridge {
    async fn on_connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        tracing::debug!("Transport connecting, sending DTLS parameters");
        self.signal
            .connect_transport(dtls_parameters)
            .await
            .map_err(|e| Error::TransportNegotiation(e.to_string()))
    }

    async fn on_produce(&self, negotiation: ProduceNegotiation) -> Result<String> {
        let track_id = negotiation.app_data.track_id;
        tracing::debug!("Negotiating {} producer for {}", negotiation.kind.as_str(), track_id);
        let response = self
            .signal
            .produce(Produce {
                track_id,
                kind: negotiation.kind,
                rtp_parameters: negotiation.rtp_parameters,
            })
            .await
            .map_err(|e| Error::ProduceNegotiation(e.to_string()))?;
        Ok(response.producer_id)
    }
}

/// A producer together with the duplicated track it sends
struct Published {
    producer: Arc<dyn Producer>,
    track: Arc<dyn MediaTrack>,
}

impl Published {
    fn close(&self) {
        self.producer.close();
        self.track.stop();
    }
}

#[derive(Clone)]
pub struct SfuClient {
    backend: Arc<dyn SfuBackend>,
    signal: Arc<dyn NegotiationSignal>,
    device: Arc<RwLock<Option<Arc<dyn SfuDevice>>>>,
    send_transport: Arc<RwLock<Option<Arc<dyn SendTransport>>>>,
    /// trackId -> live producer
    producers: Arc<Mutex<HashMap<String, Published>>>,
    publish_locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    /// Bumped on every transport teardown; publishes started under an older value are undone
    generation: Arc<AtomicU64>,
}

impl SfuClient {
    pub fn new(backend: Arc<dyn SfuBackend>, signal: Arc<dyn NegotiationSignal>) -> Self {
        Self {
            backend,
            signal,
            device: Arc::new(RwLock::new(None)),
            send_transport: Arc::new(RwLock::new(None)),
            producers: Arc::new(Mutex::new(HashMap::new())),
            publish_locks: Arc::new(Mutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn producers(&self) -> MutexGuard<'_, HashMap<String, Published>> {
        self.producers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the SFU device with the router's capabilities (once per session)
    pub async fn load_device(&self, router_rtp_capabilities: &RtpCapabilities) -> Result<()> {
        let mut device = self.device.write().await;
        if device.as_ref().is_some_and(|d| d.loaded()) {
            tracing::debug!("SFU device already loaded");
            return Ok(());
        }

        let fresh = self.backend.new_device();
        fresh.load(router_rtp_capabilities).await?;
        if !fresh.can_produce(TrackKind::Video) {
            return Err(Error::DeviceLoad("router cannot receive video".to_string()));
        }

        tracing::info!("SFU device loaded");
        *device = Some(fresh);
        Ok(())
    }

    pub async fn device_loaded(&self) -> bool {
        self.device.read().await.as_ref().is_some_and(|d| d.loaded())
    }

    /// Create the send transport described by the relay, replacing any previous one
    pub async fn create_send_transport(&self, params: TransportParams) -> Result<()> {
        let device = self
            .device
            .read()
            .await
            .clone()
            .filter(|d| d.loaded())
            .ok_or_else(|| Error::DeviceLoad("device not loaded".to_string()))?;

        if self.send_transport.read().await.is_some() {
            self.close_send_transport().await;
        }

        let transport_id = params.id.clone();
        let listener = Arc::new(SignalBridge {
            signal: self.signal.clone(),
        });
        let transport = device.create_send_transport(params, listener)?;

        tracing::info!("Created send transport {}", transport_id);
        *self.send_transport.write().await = Some(transport);
        Ok(())
    }

    pub async fn send_transport(&self) -> Option<Arc<dyn SendTransport>> {
        self.send_transport.read().await.clone()
    }

    fn publish_lock(&self, track_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.publish_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(track_id.to_string())
            .or_default()
            .clone()
    }

    /// Publish `track` under `track_id`, or return the producer already live for it
    pub async fn publish(
        &self,
        track_id: &str,
        track: &Arc<dyn MediaTrack>,
        encodings: Vec<RtpEncoding>,
    ) -> Result<Arc<dyn Producer>> {
        let lock = self.publish_lock(track_id);
        let _publishing = lock.lock().await;

        if let Some(existing) = self.producer(track_id) {
            tracing::debug!("Track {} already published as {}", track_id, existing.id());
            return Ok(existing);
        }

        let transport = self
            .send_transport
            .read()
            .await
            .clone()
            .filter(|t| !t.closed())
            .ok_or(Error::NoSendTransport)?;
        let generation = self.generation.load(Ordering::SeqCst);

        let duplicate = track.duplicate();
        let options = ProducerOptions {
            track: duplicate.clone(),
            encodings,
            app_data: ProducerAppData {
                track_id: track_id.to_string(),
            },
        };
        tracing::debug!("Producing {:?}", options);

        let producer = match transport.produce(options).await {
            Ok(producer) => producer,
            Err(e) => {
                tracing::warn!("Failed to publish {}: {}", track_id, e);
                duplicate.stop();
                return Err(e);
            }
        };

        let published = Published {
            producer: producer.clone(),
            track: duplicate,
        };
        if self.generation.load(Ordering::SeqCst) != generation || transport.closed() {
            tracing::debug!("Producer for {} resolved after teardown, closing it", track_id);
            published.close();
            return Err(Error::Superseded("publish"));
        }

        tracing::info!("Published {} as producer {}", track_id, producer.id());
        self.producers().insert(track_id.to_string(), published);
        Ok(producer)
    }

    /// Live producer for `track_id`; closed leftovers are pruned
    pub fn producer(&self, track_id: &str) -> Option<Arc<dyn Producer>> {
        let mut producers = self.producers();
        match producers.get(track_id) {
            Some(p) if !p.producer.closed() => Some(p.producer.clone()),
            Some(_) => {
                if let Some(stale) = producers.remove(track_id) {
                    stale.track.stop();
                }
                None
            }
            None => None,
        }
    }

    pub fn published_tracks(&self) -> Vec<String> {
        self.producers()
            .iter()
            .filter(|(_, p)| !p.producer.closed())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn close_producer(&self, track_id: &str) -> bool {
        let removed = self.producers().remove(track_id);
        match removed {
            Some(published) => {
                tracing::info!("Closing producer {} for {}", published.producer.id(), track_id);
                published.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all_producers(&self) {
        let drained: Vec<(String, Published)> = self.producers().drain().collect();
        for (track_id, published) in drained {
            tracing::info!("Closing producer {} for {}", published.producer.id(), track_id);
            published.close();
        }
    }

    pub async fn close_send_transport(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.close_all_producers();
        if let Some(transport) = self.send_transport.write().await.take() {
            tracing::info!("Closing send transport {}", transport.id());
            transport.close();
        }
    }

    /// Close producers and transport and forget the loaded device
    pub async fn teardown(&self) {
        self.close_send_transport().await;
        self.device.write().await.take();
        tracing::debug!("SFU client torn down");
    }

    /// Teardown packaged as the signaling channel's disconnect hook
    pub fn teardown_hook(&self) -> DisconnectHook {
        let client = self.clone();
        Arc::new(move || {
            let client = client.clone();
            async move { client.teardown().await }.boxed()
        })
    }
}
