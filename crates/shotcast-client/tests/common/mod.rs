//! Shared fakes for integration tests: an in-memory camera stack, an
//! in-memory SFU library, and a local WebSocket relay hub.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shotcast_client::config::{ClientConfig, ReconnectConfig};
use shotcast_client::media::{
    CapturePlatform, Constrain, DtlsState, MediaDeviceInfo, MediaStream, MediaTrack,
    ProduceNegotiation, Producer, ProducerAppData, ProducerOptions, RtpEncoding, SendTransport,
    SfuBackend, SfuDevice, TrackCapabilities, TrackSettings, TrackState, TransportListener,
    ValueRange, VideoConstraints,
};
use shotcast_client::{Error, Result};
use shotcast_protocol::{
    BroadcastTracks, ClientMessage, DtlsParameters, DtlsRole, RtpCapabilities, RtpParameters,
    ServerEvent, ServerMessage, TrackKind, TransportParams,
};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Poll `check` until it holds, panicking after five seconds
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Fast timeouts and reconnects for tests
pub fn test_config(url: &str) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.signaling.url = url.to_string();
    config.signaling.request_timeout_ms = 500;
    config.signaling.reconnect = ReconnectConfig {
        initial_delay_ms: 10,
        max_delay_ms: 50,
        randomization_factor: 0.0,
        max_attempts: None,
    };
    config
}

// Camera stack

pub struct FakeTrack {
    id: String,
    device_id: String,
    state: Mutex<TrackState>,
    settings: Mutex<TrackSettings>,
}

impl FakeTrack {
    pub fn new(device_id: &str, width: u32, height: u32, frame_rate: f64) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            device_id: device_id.to_string(),
            state: Mutex::new(TrackState::Live),
            settings: Mutex::new(TrackSettings {
                device_id: Some(device_id.to_string()),
                width: Some(width),
                height: Some(height),
                frame_rate: Some(frame_rate),
                aspect_ratio: Some(width as f64 / height as f64),
            }),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_live(&self) -> bool {
        *self.state.lock().unwrap() == TrackState::Live
    }
}

#[async_trait]
impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Video
    }

    fn label(&self) -> &str {
        &self.device_id
    }

    fn ready_state(&self) -> TrackState {
        *self.state.lock().unwrap()
    }

    fn settings(&self) -> TrackSettings {
        self.settings.lock().unwrap().clone()
    }

    fn capabilities(&self) -> TrackCapabilities {
        TrackCapabilities {
            width: Some(ValueRange { min: 160, max: 3840 }),
            height: Some(ValueRange { min: 120, max: 2160 }),
            frame_rate: Some(ValueRange { min: 1.0, max: 60.0 }),
            aspect_ratio: None,
        }
    }

    async fn apply_constraints(&self, constraints: &VideoConstraints) -> Result<()> {
        if let Some(Constrain::Exact(fr)) = constraints.frame_rate {
            if fr > 60.0 {
                return Err(Error::ConstraintUnsatisfiable(format!("frameRate {}", fr)));
            }
        }
        let mut settings = self.settings.lock().unwrap();
        if let Some(width) = constraints.width {
            settings.width = Some(width.value());
        }
        if let Some(height) = constraints.height {
            settings.height = Some(height.value());
        }
        if let Some(frame_rate) = constraints.frame_rate {
            settings.frame_rate = Some(frame_rate.value());
        }
        if let (Some(w), Some(h)) = (settings.width, settings.height) {
            settings.aspect_ratio = Some(w as f64 / h as f64);
        }
        Ok(())
    }

    fn stop(&self) {
        *self.state.lock().unwrap() = TrackState::Ended;
    }

    fn duplicate(&self) -> Arc<dyn MediaTrack> {
        let settings = self.settings();
        Arc::new(FakeTrack {
            id: Uuid::new_v4().to_string(),
            device_id: self.device_id.clone(),
            state: Mutex::new(TrackState::Live),
            settings: Mutex::new(settings),
        })
    }
}

pub struct FakePlatform {
    devices: Mutex<Vec<MediaDeviceInfo>>,
    changes: broadcast::Sender<()>,
    opened: Mutex<Vec<Arc<FakeTrack>>>,
    denied: Mutex<HashSet<String>>,
    open_delay: Mutex<Option<Duration>>,
    resolutions: Mutex<HashMap<String, (u32, u32)>>,
}

impl FakePlatform {
    pub fn new(device_ids: &[&str]) -> Arc<Self> {
        let (changes, _) = broadcast::channel(8);
        Arc::new(Self {
            devices: Mutex::new(device_ids.iter().map(|id| MediaDeviceInfo::camera(*id, *id)).collect()),
            changes,
            opened: Mutex::new(Vec::new()),
            denied: Mutex::new(HashSet::new()),
            open_delay: Mutex::new(None),
            resolutions: Mutex::new(HashMap::new()),
        })
    }

    /// Replace the device list and fire a change notification
    pub fn set_devices(&self, device_ids: &[&str]) {
        *self.devices.lock().unwrap() =
            device_ids.iter().map(|id| MediaDeviceInfo::camera(*id, *id)).collect();
        let _ = self.changes.send(());
    }

    pub fn deny(&self, device_id: &str) {
        self.denied.lock().unwrap().insert(device_id.to_string());
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_resolution(&self, device_id: &str, width: u32, height: u32) {
        self.resolutions
            .lock()
            .unwrap()
            .insert(device_id.to_string(), (width, height));
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn opened(&self) -> Vec<Arc<FakeTrack>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.opened().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl CapturePlatform for FakePlatform {
    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn open(&self, device_id: &str, _constraints: &VideoConstraints) -> Result<MediaStream> {
        let delay = *self.open_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.denied.lock().unwrap().contains(device_id) {
            return Err(Error::PermissionDenied(device_id.to_string()));
        }
        if !self.devices.lock().unwrap().iter().any(|d| d.device_id == device_id) {
            return Err(Error::Platform(format!("{} is gone", device_id)));
        }

        let (width, height) = self
            .resolutions
            .lock()
            .unwrap()
            .get(device_id)
            .copied()
            .unwrap_or((1920, 1080));
        let track = FakeTrack::new(device_id, width, height, 30.0);
        self.opened.lock().unwrap().push(track.clone());
        Ok(MediaStream::new(vec![track as Arc<dyn MediaTrack>]))
    }

    fn device_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

// SFU library

#[derive(Default)]
pub struct SfuRecord {
    pub loads: AtomicUsize,
    pub reject_capabilities: AtomicBool,
    pub transports: Mutex<Vec<Arc<FakeTransport>>>,
    pub produce_delay: Mutex<Option<Duration>>,
}

impl SfuRecord {
    pub fn transport_count(&self) -> usize {
        self.transports.lock().unwrap().len()
    }

    pub fn last_transport(&self) -> Option<Arc<FakeTransport>> {
        self.transports.lock().unwrap().last().cloned()
    }

    pub fn producers(&self) -> Vec<Arc<FakeProducer>> {
        self.transports
            .lock()
            .unwrap()
            .iter()
            .flat_map(|t| t.producers.lock().unwrap().clone())
            .collect()
    }

    pub fn live_producers(&self) -> Vec<Arc<FakeProducer>> {
        self.producers().into_iter().filter(|p| !p.closed()).collect()
    }
}

pub struct FakeSfu {
    pub record: Arc<SfuRecord>,
}

impl FakeSfu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            record: Arc::new(SfuRecord::default()),
        })
    }
}

impl SfuBackend for FakeSfu {
    fn new_device(&self) -> Arc<dyn SfuDevice> {
        Arc::new(FakeDevice {
            record: self.record.clone(),
            loaded: AtomicBool::new(false),
        })
    }
}

pub struct FakeDevice {
    record: Arc<SfuRecord>,
    loaded: AtomicBool,
}

#[async_trait]
impl SfuDevice for FakeDevice {
    async fn load(&self, _router_rtp_capabilities: &RtpCapabilities) -> Result<()> {
        if self.record.reject_capabilities.load(Ordering::SeqCst) {
            return Err(Error::DeviceLoad("unsupported codecs".to_string()));
        }
        self.record.loads.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn can_produce(&self, _kind: TrackKind) -> bool {
        true
    }

    fn create_send_transport(
        &self,
        params: TransportParams,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn SendTransport>> {
        let transport = Arc::new(FakeTransport {
            id: params.id,
            listener,
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            record: self.record.clone(),
        });
        self.record.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub struct FakeTransport {
    id: String,
    listener: Arc<dyn TransportListener>,
    connected: AtomicBool,
    closed: AtomicBool,
    pub producers: Mutex<Vec<Arc<FakeProducer>>>,
    record: Arc<SfuRecord>,
}

#[async_trait]
impl SendTransport for FakeTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn dtls_state(&self) -> DtlsState {
        if self.closed.load(Ordering::SeqCst) {
            DtlsState::Closed
        } else if self.connected.load(Ordering::SeqCst) {
            DtlsState::Connected
        } else {
            DtlsState::New
        }
    }

    async fn produce(&self, options: ProducerOptions) -> Result<Arc<dyn Producer>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ProduceNegotiation("transport closed".to_string()));
        }
        if !self.connected.swap(true, Ordering::SeqCst) {
            let dtls = DtlsParameters {
                role: Some(DtlsRole::Client),
                fingerprints: Vec::new(),
            };
            if let Err(e) = self.listener.on_connect(dtls).await {
                self.connected.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        let delay = *self.record.produce_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let kind = options.track.kind();
        let id = self
            .listener
            .on_produce(ProduceNegotiation {
                kind,
                rtp_parameters: RtpParameters(json!({ "encodings": options.encodings })),
                app_data: options.app_data.clone(),
            })
            .await?;

        let producer = Arc::new(FakeProducer {
            id,
            kind,
            app_data: options.app_data,
            encodings: options.encodings,
            track: options.track,
            closed: AtomicBool::new(false),
        });
        self.producers.lock().unwrap().push(producer.clone());
        Ok(producer)
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for producer in self.producers.lock().unwrap().iter() {
            producer.close();
        }
    }
}

pub struct FakeProducer {
    id: String,
    kind: TrackKind,
    pub app_data: ProducerAppData,
    pub encodings: Vec<RtpEncoding>,
    pub track: Arc<dyn MediaTrack>,
    closed: AtomicBool,
}

impl Producer for FakeProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// Relay hub

enum RelayCommand {
    Push(ServerMessage),
    Kick,
}

#[derive(Default)]
struct RelayState {
    auths: Mutex<Vec<(String, String, String)>>,
    requests: Mutex<Vec<(String, Value)>>,
    acks: Mutex<Vec<u64>>,
    silent: Mutex<HashSet<String>>,
    rejected: Mutex<HashMap<String, String>>,
    reject_auth: AtomicBool,
    current: Mutex<Option<mpsc::UnboundedSender<RelayCommand>>>,
    next_id: AtomicU64,
}

impl RelayState {
    fn respond(&self, method: &str) -> Value {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        match method {
            "getContestInfo" => json!({
                "contest": {
                    "title": { "fallback": "Campus Contest" },
                    "startAt": "2025-05-01T09:00:00Z",
                    "duration": [5, "h"]
                },
                "user": { "id": "team-7", "name": "Team Seven" },
                "serverTimestamp": 1746090000000i64
            }),
            "confirmReady" => json!({
                "transport": {
                    "id": format!("transport-{}", n),
                    "iceParameters": { "usernameFragment": "u", "password": "p" },
                    "iceCandidates": [],
                    "dtlsParameters": { "role": "auto", "fingerprints": [] }
                },
                "routerRtpCapabilities": { "codecs": [] }
            }),
            "produce" => json!({ "producerId": format!("producer-{}", n) }),
            _ => Value::Null,
        }
    }
}

/// A local hub speaking the relay wire protocol with scripted answers
pub struct FakeRelay {
    addr: SocketAddr,
    state: Arc<RelayState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl FakeRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RelayState::default());
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        tokio::spawn(serve_connection(accept_state.clone(), stream));
                    }
                }
            }
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/shot", self.addr)
    }

    pub fn auth_count(&self) -> usize {
        self.state.auths.lock().unwrap().len()
    }

    /// (alias, client id, request path) per authentication
    pub fn auths(&self) -> Vec<(String, String, String)> {
        self.state.auths.lock().unwrap().clone()
    }

    pub fn requests(&self, method: &str) -> Vec<Value> {
        self.state
            .requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.requests(method).len()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.state.acks.lock().unwrap().clone()
    }

    pub fn set_silent(&self, method: &str) {
        self.state.silent.lock().unwrap().insert(method.to_string());
    }

    pub fn clear_silent(&self, method: &str) {
        self.state.silent.lock().unwrap().remove(method);
    }

    pub fn reject(&self, method: &str, message: &str) {
        self.state
            .rejected
            .lock()
            .unwrap()
            .insert(method.to_string(), message.to_string());
    }

    pub fn reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    fn send(&self, command: RelayCommand) {
        if let Some(tx) = self.state.current.lock().unwrap().as_ref() {
            let _ = tx.send(command);
        }
    }

    pub fn push_start(&self, track_ids: &[&str]) {
        self.send(RelayCommand::Push(ServerMessage::Event {
            ack: None,
            event: ServerEvent::RequestStartBroadcast(BroadcastTracks {
                track_ids: track_ids.iter().map(|s| s.to_string()).collect(),
            }),
        }));
    }

    /// Push a stop command; returns the ack id the client must answer
    pub fn push_stop(&self, track_ids: &[&str]) -> u64 {
        let ack = 1_000 + self.state.next_id.fetch_add(1, Ordering::SeqCst);
        self.send(RelayCommand::Push(ServerMessage::Event {
            ack: Some(ack),
            event: ServerEvent::RequestStopBroadcast(BroadcastTracks {
                track_ids: track_ids.iter().map(|s| s.to_string()).collect(),
            }),
        }));
        ack
    }

    /// Drop the current connection from the server side
    pub fn kick(&self) {
        self.send(RelayCommand::Kick);
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.kick();
    }
}

async fn serve_connection(state: Arc<RelayState>, stream: tokio::net::TcpStream) {
    let path = Arc::new(Mutex::new(String::new()));
    let captured = path.clone();
    let callback = move |request: &Request, response: Response| {
        *captured.lock().unwrap() = request.uri().to_string();
        Ok::<Response, ErrorResponse>(response)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };

    let Some(Ok(Message::Text(text))) = ws.next().await else {
        return;
    };
    let Ok(ClientMessage::Authenticate { alias, client_id, .. }) =
        serde_json::from_str::<ClientMessage>(&text)
    else {
        return;
    };

    if state.reject_auth.load(Ordering::SeqCst) {
        let reply = ServerMessage::Error {
            message: "invalid shot token".to_string(),
        };
        let _ = ws
            .send(Message::Text(serde_json::to_string(&reply).unwrap().into()))
            .await;
        return;
    }

    let socket_id = {
        let mut auths = state.auths.lock().unwrap();
        let path = path.lock().unwrap().clone();
        auths.push((alias, client_id, path));
        format!("sock-{}", auths.len())
    };
    // registered before the reply so pushes right after connect reach this socket
    let (tx, mut rx) = mpsc::unbounded_channel();
    *state.current.lock().unwrap() = Some(tx);

    let reply = ServerMessage::Authenticated { socket_id };
    if ws
        .send(Message::Text(serde_json::to_string(&reply).unwrap().into()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(RelayCommand::Push(message)) => {
                    let json = serde_json::to_string(&message).unwrap();
                    if ws.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Some(RelayCommand::Kick) | None => {
                    let _ = ws.close(None).await;
                    break;
                }
            },
            frame = ws.next() => {
                let Some(Ok(frame)) = frame else { break };
                let Message::Text(text) = frame else { continue };
                let Ok(message) = serde_json::from_str::<ClientMessage>(&text) else { continue };
                let reply = match message {
                    ClientMessage::Request { id, method, payload } => {
                        state.requests.lock().unwrap().push((method.clone(), payload));
                        if state.silent.lock().unwrap().contains(&method) {
                            continue;
                        }
                        let rejection = state.rejected.lock().unwrap().get(&method).cloned();
                        match rejection {
                            Some(error) => ServerMessage::Response { id, data: Value::Null, error: Some(error) },
                            None => ServerMessage::Response { id, data: state.respond(&method), error: None },
                        }
                    }
                    ClientMessage::Ack { id, .. } => {
                        state.acks.lock().unwrap().push(id);
                        continue;
                    }
                    ClientMessage::Ping => ServerMessage::Pong,
                    ClientMessage::Authenticate { .. } => continue,
                };
                let json = serde_json::to_string(&reply).unwrap();
                if ws.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
