//! Reconnecting signaling channel to the relay hub
//!
//! One authenticated WebSocket per broadcaster identity. Requests are matched
//! to responses by id; pushed commands are handed to a dispatcher task that
//! runs them in arrival order, off the socket read loop. When the connection
//! drops, pending requests fail, the disconnect hook runs to completion, and
//! only then is the new state published and a reconnect scheduled.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use shotcast_protocol::{
    CancelReady, ClientMessage, CompleteConnectTransport, ConfirmReady, ConfirmReadyResponse,
    ContestInfo, DtlsParameters, GetContestInfo, Produce, ProduceResponse, Rpc, ServerEvent,
    ServerMessage, TrackDescriptor,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use super::backoff::Backoff;
use super::websocket::{self, WsStream};
use crate::config::SignalingConfig;
use crate::error::{Error, Result};
use crate::media::NegotiationSignal;

/// Who is broadcasting; keys the shared channel
#[derive(Clone, PartialEq, Eq)]
pub struct BroadcasterIdentity {
    pub alias: String,
    pub shot_token: String,
}

impl BroadcasterIdentity {
    pub fn new(alias: impl Into<String>, shot_token: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            shot_token: shot_token.into(),
        }
    }
}

impl fmt::Debug for BroadcasterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcasterIdentity")
            .field("alias", &self.alias)
            .field("shot_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

/// Connection state plus the number of successful connects so far
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub epoch: u64,
}

/// Receiver of relay-pushed broadcast commands
#[async_trait]
pub trait BroadcastCommandHandler: Send + Sync {
    async fn start_broadcast(&self, track_ids: Vec<String>);

    /// The stop acknowledgement is sent once this returns
    async fn stop_broadcast(&self, track_ids: Vec<String>);
}

/// Awaited on every disconnect before the channel reports it
pub type DisconnectHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub type ConnectErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;

struct Pending {
    method: String,
    reply: oneshot::Sender<Result<Value>>,
}

struct Shared {
    config: SignalingConfig,
    identity: BroadcasterIdentity,
    client_id: String,
    status: watch::Sender<ConnectionStatus>,
    socket_id: Mutex<Option<String>>,
    /// Present only while a connection is being served
    outgoing: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    pending: Mutex<HashMap<u64, Pending>>,
    next_id: AtomicU64,
    handler: Mutex<Option<Weak<dyn BroadcastCommandHandler>>>,
    disconnect_hook: Mutex<Option<DisconnectHook>>,
    on_connect_error: Option<ConnectErrorCallback>,
    commands: mpsc::UnboundedSender<PushedCommand>,
}

/// A relay push, tagged with the connection it arrived on
struct PushedCommand {
    epoch: u64,
    ack: Option<u64>,
    event: ServerEvent,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|s| s.state = state);
    }

    fn send(&self, message: ClientMessage) -> Result<()> {
        let outgoing = lock(&self.outgoing);
        let sender = outgoing.as_ref().ok_or(Error::SignalingDisconnected)?;
        sender.send(message).map_err(|_| Error::SignalingDisconnected)
    }

    /// Send only if connection `epoch` is still the one being served
    fn send_on(&self, epoch: u64, message: ClientMessage) -> Result<()> {
        let outgoing = lock(&self.outgoing);
        let status = *self.status.borrow();
        if status.epoch != epoch || status.state != ConnectionState::Connected {
            return Err(Error::SignalingDisconnected);
        }
        let sender = outgoing.as_ref().ok_or(Error::SignalingDisconnected)?;
        sender.send(message).map_err(|_| Error::SignalingDisconnected)
    }

    fn attach(&self, socket_id: String, outgoing: mpsc::UnboundedSender<ClientMessage>) {
        *lock(&self.socket_id) = Some(socket_id);
        // the epoch moves together with the sender so `send_on` never pairs them wrongly
        let mut slot = lock(&self.outgoing);
        *slot = Some(outgoing);
        self.status.send_modify(|s| {
            s.state = ConnectionState::Connected;
            s.epoch += 1;
        });
    }

    /// Fail pending calls, run the disconnect hook, then publish `Disconnected`
    async fn on_disconnected(&self) {
        lock(&self.outgoing).take();
        lock(&self.socket_id).take();

        let pending: Vec<(u64, Pending)> = lock(&self.pending).drain().collect();
        for (id, call) in pending {
            tracing::debug!("Failing {} #{}: disconnected", call.method, id);
            let _ = call.reply.send(Err(Error::SignalingDisconnected));
        }

        let hook = lock(&self.disconnect_hook).clone();
        if let Some(hook) = hook {
            hook().await;
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Signaling channel for {} disconnected", self.identity.alias);
    }

    fn handle_text(&self, text: &str) {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Ignoring malformed frame: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::Response { id, data, error } => {
                let Some(call) = lock(&self.pending).remove(&id) else {
                    tracing::debug!("Response for unknown request #{}", id);
                    return;
                };
                tracing::debug!("<- {} #{}", call.method, id);
                let result = match error {
                    Some(message) => Err(Error::SignalingRejected {
                        method: call.method,
                        message,
                    }),
                    None => Ok(data),
                };
                let _ = call.reply.send(result);
            }
            ServerMessage::Event { ack, event } => {
                let epoch = self.status.borrow().epoch;
                if self.commands.send(PushedCommand { epoch, ack, event }).is_err() {
                    tracing::error!("Command dispatcher is gone, dropping pushed command");
                }
            }
            ServerMessage::Pong => tracing::trace!("Pong"),
            ServerMessage::Error { message } => tracing::warn!("Relay error: {}", message),
            ServerMessage::Authenticated { socket_id } => {
                tracing::debug!("Unexpected re-authentication as {}", socket_id);
            }
        }
    }

    fn handler(&self) -> Option<Arc<dyn BroadcastCommandHandler>> {
        lock(&self.handler).as_ref().and_then(Weak::upgrade)
    }
}

pub struct SignalingChannel {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Start connecting in the background; reconnects until `disconnect`
    pub fn connect(
        config: SignalingConfig,
        identity: BroadcasterIdentity,
        on_connect_error: Option<ConnectErrorCallback>,
    ) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus {
            state: ConnectionState::Connecting,
            epoch: 0,
        });
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let client_id = format!("s-{}", &Uuid::new_v4().simple().to_string()[..18]);
        tracing::info!("Opening signaling channel for {} as {}", identity.alias, client_id);

        let shared = Arc::new(Shared {
            config,
            identity,
            client_id,
            status,
            socket_id: Mutex::new(None),
            outgoing: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handler: Mutex::new(None),
            disconnect_hook: Mutex::new(None),
            on_connect_error,
            commands: commands_tx,
        });

        let connection = tokio::spawn(run_connection(shared.clone(), shutdown.subscribe()));
        let dispatcher = tokio::spawn(run_dispatcher(
            shared.clone(),
            commands_rx,
            shutdown.subscribe(),
        ));

        Arc::new(Self {
            shared,
            shutdown,
            tasks: Mutex::new(vec![connection, dispatcher]),
        })
    }

    pub fn identity(&self) -> &BroadcasterIdentity {
        &self.shared.identity
    }

    /// Stable across reconnects
    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn socket_id(&self) -> Option<String> {
        lock(&self.shared.socket_id).clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.outgoing).is_some()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the channel reaches `state`; fails if the channel shuts down first
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<ConnectionStatus> {
        let mut status = self.subscribe_status();
        let reached = status
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| Error::SignalingDisconnected)?;
        Ok(*reached)
    }

    /// Only a weak reference is kept; the caller owns the handler
    pub fn set_command_handler(&self, handler: &Arc<dyn BroadcastCommandHandler>) {
        *lock(&self.shared.handler) = Some(Arc::downgrade(handler));
    }

    pub fn set_disconnect_hook(&self, hook: DisconnectHook) {
        *lock(&self.shared.disconnect_hook) = Some(hook);
    }

    pub fn clear_disconnect_hook(&self) {
        lock(&self.shared.disconnect_hook).take();
    }

    /// Raw request/acknowledgement call
    pub async fn call(&self, method: &str, payload: Value) -> Result<Value> {
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let outgoing = lock(&self.shared.outgoing);
            let sender = outgoing.as_ref().ok_or(Error::SignalingDisconnected)?;
            lock(&self.shared.pending).insert(
                id,
                Pending {
                    method: method.to_string(),
                    reply: reply_tx,
                },
            );
            let request = ClientMessage::Request {
                id,
                method: method.to_string(),
                payload,
            };
            if sender.send(request).is_err() {
                lock(&self.shared.pending).remove(&id);
                return Err(Error::SignalingDisconnected);
            }
        }
        tracing::debug!("-> {} #{}", method, id);

        let timeout = self.shared.config.request_timeout();
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::SignalingDisconnected),
            Err(_) => {
                lock(&self.shared.pending).remove(&id);
                tracing::warn!("{} #{} timed out after {:?}", method, id, timeout);
                Err(Error::SignalingTimeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    pub async fn request<R: Rpc>(&self, request: &R) -> Result<R::Response> {
        let payload = serde_json::to_value(request)?;
        let data = match self.call(R::METHOD, payload).await? {
            Value::Null => Value::Object(serde_json::Map::new()),
            data => data,
        };
        Ok(serde_json::from_value(data)?)
    }

    pub async fn get_contest_info(&self) -> Result<ContestInfo> {
        self.request(&GetContestInfo {}).await
    }

    pub async fn confirm_ready(
        &self,
        shot_name: &str,
        tracks: Vec<TrackDescriptor>,
    ) -> Result<ConfirmReadyResponse> {
        self.request(&ConfirmReady {
            shot_name: shot_name.to_string(),
            tracks,
        })
        .await
    }

    /// Withdraw readiness, then run the local teardown
    pub async fn cancel_ready(&self) -> Result<()> {
        let result = self.request(&CancelReady {}).await.map(|_| ());
        let hook = lock(&self.shared.disconnect_hook).clone();
        if let Some(hook) = hook {
            hook().await;
        }
        result
    }

    pub async fn complete_connect_transport(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        self.request(&CompleteConnectTransport { dtls_parameters })
            .await
            .map(|_| ())
    }

    pub async fn produce(&self, request: Produce) -> Result<ProduceResponse> {
        self.request(&request).await
    }

    /// Close the connection for good; the disconnect hook runs if it was connected
    pub async fn disconnect(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        tracing::info!("Disconnecting signaling channel for {}", self.shared.identity.alias);

        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Signaling task failed: {}", e);
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[async_trait]
impl NegotiationSignal for SignalingChannel {
    async fn connect_transport(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        self.complete_connect_transport(dtls_parameters).await
    }

    async fn produce(&self, request: Produce) -> Result<ProduceResponse> {
        SignalingChannel::produce(self, request).await
    }
}

async fn run_connection(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut backoff = Backoff::new(&shared.config.reconnect);

    loop {
        if *shutdown.borrow() {
            break;
        }

        let opened = tokio::select! {
            opened = websocket::open(&shared.config, &shared.identity, &shared.client_id) => opened,
            _ = shutdown.changed() => break,
        };

        match opened {
            Ok((ws, socket_id)) => {
                backoff.reset();
                let (tx, rx) = mpsc::unbounded_channel();
                shared.attach(socket_id, tx);
                serve(&shared, ws, rx, &mut shutdown).await;
                shared.on_disconnected().await;
            }
            Err(e) => {
                tracing::warn!("Signaling connection failed: {}", e);
                if let Some(callback) = &shared.on_connect_error {
                    callback(&e);
                }
            }
        }

        if *shutdown.borrow() {
            break;
        }
        let Some(delay) = backoff.next_delay() else {
            tracing::error!("Giving up on signaling after {} attempts", backoff.attempt());
            shared.set_state(ConnectionState::Disconnected);
            break;
        };
        shared.set_state(ConnectionState::Reconnecting);
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    tracing::debug!("Signaling connection task stopped");
}

async fn serve(
    shared: &Shared,
    ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let (mut write, mut read) = ws.split();
    let mut ping = tokio::time::interval(shared.config.ping_interval());
    ping.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Some(message) = outgoing.recv() => {
                let json = match serde_json::to_string(&message) {
                    Ok(json) => json,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json.into())).await {
                    tracing::warn!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            _ = ping.tick() => {
                let ping = serde_json::to_string(&ClientMessage::Ping).unwrap_or_default();
                if write.send(Message::Text(ping.into())).await.is_err() {
                    break;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.handle_text(&text),
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("WebSocket closed by server");
                    break;
                }
                Some(Err(e)) => {
                    tracing::warn!("WebSocket error: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

async fn run_dispatcher(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<PushedCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let PushedCommand { epoch, ack, event } = tokio::select! {
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let handler = shared.handler();
        match event {
            ServerEvent::RequestStartBroadcast(tracks) => {
                tracing::info!("Relay requested start of {:?}", tracks.track_ids);
                match handler {
                    Some(handler) => handler.start_broadcast(tracks.track_ids).await,
                    None => tracing::warn!("No command handler, ignoring start request"),
                }
            }
            ServerEvent::RequestStopBroadcast(tracks) => {
                tracing::info!("Relay requested stop of {:?}", tracks.track_ids);
                match handler {
                    Some(handler) => handler.stop_broadcast(tracks.track_ids).await,
                    None => tracing::warn!("No command handler, acknowledging stop request"),
                }
            }
        }

        if let Some(id) = ack {
            let reply = ClientMessage::Ack {
                id,
                data: Value::Object(serde_json::Map::new()),
            };
            if let Err(e) = shared.send_on(epoch, reply) {
                tracing::debug!("Dropping ack #{} for connection {}: {}", id, epoch, e);
            }
        }
    }

    tracing::debug!("Command dispatcher stopped");
}

/// Owns the one live channel per broadcaster identity
pub struct SignalingHub {
    config: SignalingConfig,
    current: tokio::sync::Mutex<Option<Arc<SignalingChannel>>>,
}

impl SignalingHub {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            config,
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// Return the channel for `identity`, replacing a channel held for anyone else
    pub async fn connect(
        &self,
        identity: BroadcasterIdentity,
        on_connect_error: Option<ConnectErrorCallback>,
    ) -> Arc<SignalingChannel> {
        let mut current = self.current.lock().await;

        if let Some(channel) = current.as_ref() {
            if channel.identity() == &identity && !channel.is_closed() {
                return channel.clone();
            }
        }
        if let Some(previous) = current.take() {
            tracing::info!("Replacing signaling channel for {}", previous.identity().alias);
            previous.disconnect().await;
        }

        let channel = SignalingChannel::connect(self.config.clone(), identity, on_connect_error);
        *current = Some(channel.clone());
        channel
    }

    pub async fn current(&self) -> Option<Arc<SignalingChannel>> {
        self.current.lock().await.clone()
    }

    /// Disconnect and forget the shared channel
    pub async fn reset(&self) {
        let previous = self.current.lock().await.take();
        if let Some(channel) = previous {
            channel.disconnect().await;
        }
    }
}
