//! Broadcast session coordinator
//!
//! Sequences startup (devices, capture, signaling, transport), reacts to
//! relay-pushed start/stop commands, keeps producers in step with camera
//! swaps, and suspends/resumes around signaling reconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use shotcast_protocol::ContestInfo;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};

use super::state::SessionState;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::media::{CaptureEvent, CapturePlatform, DeviceRegistry, SfuBackend, SfuClient};
use crate::network::{
    Backoff, BroadcastCommandHandler, BroadcasterIdentity, ConnectErrorCallback, ConnectionState,
    ConnectionStatus, SignalingChannel, SignalingHub,
};

#[derive(Clone)]
struct Link {
    channel: Arc<SignalingChannel>,
    sfu: SfuClient,
}

struct SessionInner {
    config: ClientConfig,
    registry: Arc<DeviceRegistry>,
    sfu_backend: Arc<dyn SfuBackend>,
    hub: Arc<SignalingHub>,
    state: watch::Sender<SessionState>,
    link: Mutex<Option<Link>>,
    contest: Mutex<Option<ContestInfo>>,
    /// Serializes preparation, relay commands and republishing
    ops: tokio::sync::Mutex<()>,
    /// Set by `cancel_ready`; suppresses preparation on reconnect
    withdrawn: AtomicBool,
    prepared_epoch: AtomicU64,
    shutdown: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SessionInner {
    fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn link(&self) -> Result<Link> {
        lock(&self.link).clone().ok_or(Error::SessionStopped)
    }

    /// Apply `next` if the state table allows it; staying put counts as success
    fn transition(&self, next: SessionState) -> bool {
        let mut previous = next;
        let mut allowed = true;
        self.state.send_if_modified(|current| {
            previous = *current;
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                allowed = false;
                return false;
            }
            *current = next;
            true
        });

        if !allowed {
            tracing::debug!("Ignoring session transition {} -> {}", previous, next);
        } else if previous != next {
            tracing::info!("Session {} -> {}", previous, next);
        }
        allowed
    }

    /// Fails unless the channel is still on connection `epoch` and readiness stands
    fn ensure_current(&self, channel: &SignalingChannel, epoch: u64) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::SessionStopped);
        }
        if self.withdrawn.load(Ordering::SeqCst) {
            return Err(Error::Superseded("broadcast preparation"));
        }
        let status = channel.status();
        if status.state != ConnectionState::Connected || status.epoch != epoch {
            return Err(Error::SignalingDisconnected);
        }
        Ok(())
    }

    async fn try_prepare(&self, epoch: u64) -> Result<()> {
        let _ops = self.ops.lock().await;
        let Link { channel, sfu } = self.link()?;
        self.ensure_current(&channel, epoch)?;

        if self.state().has_transport() && self.prepared_epoch.load(Ordering::SeqCst) == epoch {
            return Ok(());
        }

        let contest = channel.get_contest_info().await?;
        self.ensure_current(&channel, epoch)?;
        tracing::info!(
            "Contest info received: {} (server time {})",
            contest.contest.title.resolve("en").unwrap_or_default(),
            contest.server_timestamp
        );
        *lock(&self.contest) = Some(contest);
        self.transition(SessionState::ChannelReady);

        let broadcast = &self.config.broadcast;
        let ready = channel
            .confirm_ready(&broadcast.shot_name, broadcast.tracks.clone())
            .await?;
        self.ensure_current(&channel, epoch)?;

        sfu.load_device(&ready.router_rtp_capabilities).await?;
        sfu.create_send_transport(ready.transport).await?;
        if let Err(e) = self.ensure_current(&channel, epoch) {
            sfu.teardown().await;
            return Err(e);
        }

        self.prepared_epoch.store(epoch, Ordering::SeqCst);
        self.transition(SessionState::TransportReady);
        Ok(())
    }

    /// Prepare for connection `epoch`, retrying with backoff while it stays connected
    async fn prepare(&self, epoch: u64) {
        let mut backoff = Backoff::new(&self.config.signaling.reconnect);

        loop {
            let err = match self.try_prepare(epoch).await {
                Ok(()) => return,
                Err(e) => e,
            };
            match err {
                Error::SignalingDisconnected | Error::SessionStopped | Error::Superseded(_) => {
                    tracing::debug!("Broadcast preparation abandoned: {}", err);
                    return;
                }
                e => tracing::warn!("Broadcast preparation failed: {}", e),
            }

            let Some(delay) = backoff.next_delay() else {
                tracing::error!("Giving up on broadcast preparation");
                return;
            };
            tokio::time::sleep(delay).await;

            match self.link() {
                Ok(link) if self.ensure_current(&link.channel, epoch).is_ok() => {}
                _ => return,
            }
        }
    }

    async fn on_status(&self, status: ConnectionStatus) {
        match status.state {
            ConnectionState::Connected => {
                if self.withdrawn.load(Ordering::SeqCst) {
                    tracing::info!("Connected, waiting for readiness to be confirmed");
                    return;
                }
                if self.prepared_epoch.load(Ordering::SeqCst) != status.epoch {
                    // the drop may have been coalesced into this update
                    self.suspend().await;
                    self.prepare(status.epoch).await;
                }
            }
            ConnectionState::Disconnected | ConnectionState::Reconnecting => self.suspend().await,
            ConnectionState::Connecting => {}
        }
    }

    /// Drop transport state left over from a lost connection
    async fn suspend(&self) {
        let _ops = self.ops.lock().await;
        if !matches!(
            self.state(),
            SessionState::ChannelReady | SessionState::TransportReady | SessionState::Publishing
        ) {
            return;
        }
        if let Ok(link) = self.link() {
            link.sfu.teardown().await;
        }
        self.transition(SessionState::Suspended);
    }

    async fn publish_track(&self, sfu: &SfuClient, track_id: &str) -> Result<()> {
        let track = self.registry.current_track().ok_or(Error::NotCapturing)?;
        let encodings = self.registry.simulcast_plan().to_encodings();
        sfu.publish(track_id, &track, encodings).await?;
        Ok(())
    }

    async fn on_capture_event(&self, event: CaptureEvent) {
        let _ops = self.ops.lock().await;
        let Ok(Link { sfu, .. }) = self.link() else {
            return;
        };

        match event {
            CaptureEvent::TrackReplaced { device_id, track_id } => {
                let published = sfu.published_tracks();
                if published.is_empty() {
                    return;
                }
                tracing::info!(
                    "Camera switched to {} (track {}), republishing {:?}",
                    device_id,
                    track_id,
                    published
                );
                for id in published {
                    sfu.close_producer(&id);
                    if let Err(e) = self.publish_track(&sfu, &id).await {
                        tracing::warn!("Failed to republish {}: {}", id, e);
                    }
                }
            }
            CaptureEvent::CaptureLost => {
                tracing::warn!("Capture lost, closing producers");
                sfu.close_all_producers();
            }
        }

        if sfu.published_tracks().is_empty() && self.state() == SessionState::Publishing {
            self.transition(SessionState::TransportReady);
        }
    }
}

#[async_trait]
impl BroadcastCommandHandler for SessionInner {
    async fn start_broadcast(&self, track_ids: Vec<String>) {
        let _ops = self.ops.lock().await;
        let Ok(Link { sfu, .. }) = self.link() else {
            return;
        };
        let state = self.state();
        if !state.has_transport() {
            tracing::warn!("Start requested while {}, ignoring", state);
            return;
        }

        for track_id in track_ids {
            if !self.config.broadcast.knows_track(&track_id) {
                tracing::warn!("Start requested for unknown track {}, ignoring", track_id);
                continue;
            }
            if let Err(e) = self.publish_track(&sfu, &track_id).await {
                tracing::warn!("Failed to publish {}: {}", track_id, e);
            }
        }

        if !sfu.published_tracks().is_empty() {
            self.transition(SessionState::Publishing);
        }
    }

    async fn stop_broadcast(&self, _track_ids: Vec<String>) {
        let _ops = self.ops.lock().await;
        if let Ok(link) = self.link() {
            link.sfu.close_all_producers();
        }
        if self.state() == SessionState::Publishing {
            self.transition(SessionState::TransportReady);
        }
    }
}

async fn run_events(
    inner: Weak<SessionInner>,
    mut status: watch::Receiver<ConnectionStatus>,
    mut capture: broadcast::Receiver<CaptureEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let initial = *status.borrow_and_update();
    match inner.upgrade() {
        Some(session) => session.on_status(initial).await,
        None => return,
    }

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *status.borrow_and_update();
                let Some(session) = inner.upgrade() else { break };
                session.on_status(current).await;
            }
            event = capture.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} capture events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let Some(session) = inner.upgrade() else { break };
                session.on_capture_event(event).await;
            }
        }
    }

    tracing::debug!("Session event loop stopped");
}

pub struct BroadcastSession {
    inner: Arc<SessionInner>,
}

impl BroadcastSession {
    pub fn new(
        config: ClientConfig,
        platform: Arc<dyn CapturePlatform>,
        sfu_backend: Arc<dyn SfuBackend>,
        hub: Arc<SignalingHub>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new(platform, &config.capture));
        let (state, _) = watch::channel(SessionState::Idle);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(SessionInner {
                config,
                registry,
                sfu_backend,
                hub,
                state,
                link: Mutex::new(None),
                contest: Mutex::new(None),
                ops: tokio::sync::Mutex::new(()),
                withdrawn: AtomicBool::new(false),
                prepared_epoch: AtomicU64::new(0),
                shutdown,
            }),
        }
    }

    /// Bring up capture and signaling; the transport follows once the relay answers
    pub async fn start(&self, identity: BroadcasterIdentity) -> Result<()> {
        let inner = &self.inner;
        match inner.state() {
            SessionState::Idle => {}
            SessionState::Stopped => return Err(Error::SessionStopped),
            state => {
                tracing::debug!("Session already started ({})", state);
                return Ok(());
            }
        }

        if let Err(e) = self.start_capture().await {
            tracing::error!("Failed to start capture: {}", e);
            inner.registry.stop();
            inner.registry.stop_monitoring();
            inner.shutdown.send_replace(true);
            inner.transition(SessionState::Stopped);
            return Err(e);
        }

        let on_connect_error: ConnectErrorCallback =
            Arc::new(|e| tracing::warn!("Signaling connect error: {}", e));
        let channel = inner.hub.connect(identity, Some(on_connect_error)).await;
        let sfu = SfuClient::new(inner.sfu_backend.clone(), channel.clone());

        channel.set_disconnect_hook(sfu.teardown_hook());
        let handler: Arc<dyn BroadcastCommandHandler> = inner.clone();
        channel.set_command_handler(&handler);

        let status = channel.subscribe_status();
        *lock(&inner.link) = Some(Link { channel, sfu });

        tokio::spawn(run_events(
            Arc::downgrade(inner),
            status,
            inner.registry.subscribe(),
            inner.shutdown.subscribe(),
        ));
        Ok(())
    }

    async fn start_capture(&self) -> Result<()> {
        let inner = &self.inner;
        inner.registry.initialize().await?;
        inner.registry.start_monitoring();
        inner.transition(SessionState::DeviceReady);

        inner.registry.start().await?;
        inner.transition(SessionState::Capturing);
        Ok(())
    }

    /// Withdraw readiness: tell the relay, tear down locally, stay capturing
    pub async fn cancel_ready(&self) -> Result<()> {
        let inner = &self.inner;
        let _ops = inner.ops.lock().await;
        let Link { channel, sfu } = inner.link()?;

        inner.withdrawn.store(true, Ordering::SeqCst);
        inner.prepared_epoch.store(0, Ordering::SeqCst);
        let result = channel.cancel_ready().await;
        sfu.teardown().await;
        inner.transition(SessionState::Capturing);
        result
    }

    /// Re-enter readiness after `cancel_ready`
    pub async fn confirm_ready(&self) -> Result<()> {
        let inner = &self.inner;
        let link = inner.link()?;
        inner.withdrawn.store(false, Ordering::SeqCst);

        let status = link.channel.status();
        if status.state != ConnectionState::Connected {
            tracing::info!("Not connected, preparing once the channel is back");
            return Ok(());
        }
        inner.try_prepare(status.epoch).await
    }

    /// Release producers, transport, channel and capture, in that order
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.shutdown.send_replace(true) {
            return;
        }
        tracing::info!("Stopping broadcast session");

        let link = lock(&inner.link).take();
        if let Some(Link { channel, sfu }) = link {
            sfu.close_all_producers();
            sfu.close_send_transport().await;
            channel.clear_disconnect_hook();

            let shared = inner
                .hub
                .current()
                .await
                .is_some_and(|current| Arc::ptr_eq(&current, &channel));
            if shared {
                inner.hub.reset().await;
            } else {
                channel.disconnect().await;
            }
            sfu.teardown().await;
        }

        inner.registry.stop();
        inner.registry.stop_monitoring();
        inner.transition(SessionState::Stopped);
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut state = self.subscribe_state();
        state
            .wait_for(|s| *s == target)
            .await
            .map_err(|_| Error::SessionStopped)?;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn sfu(&self) -> Option<SfuClient> {
        self.inner.link().ok().map(|l| l.sfu)
    }

    pub fn channel(&self) -> Option<Arc<SignalingChannel>> {
        self.inner.link().ok().map(|l| l.channel)
    }

    pub fn contest_info(&self) -> Option<ContestInfo> {
        lock(&self.inner.contest).clone()
    }
}
