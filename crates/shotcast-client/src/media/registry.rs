//! Camera device registry
//!
//! Tracks the available cameras, owns the single live capture and keeps the
//! resolution ladder and simulcast plan in step with the running settings.
//! Every operation that acquires or reconfigures the capture is serialized
//! through one FIFO lock, so an explicit switch and a hot-plug switch never
//! overlap.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::device::{
    CapturePlatform, Constrain, DeviceKind, MediaDeviceInfo, MediaStream, MediaTrack,
    TrackCapabilities, TrackSettings, VideoConstraints,
};
use super::simulcast::{resolution_ladder, Resolution, SimulcastPlan, SimulcastPlanner};
use crate::config::CaptureConfig;
use crate::error::{Error, Result};

/// Capture changes other components react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    /// The stream now carries a new track from `device_id`
    TrackReplaced { device_id: String, track_id: String },
    /// The last camera disappeared and the capture was released
    CaptureLost,
}

struct CaptureSession {
    /// Kept after an unplug so the running camera stays reportable
    device: MediaDeviceInfo,
    stream: Arc<MediaStream>,
    track: Arc<dyn MediaTrack>,
    applied_constraints: VideoConstraints,
    capabilities: TrackCapabilities,
    settings: TrackSettings,
}

impl CaptureSession {
    fn release(self) {
        tracing::info!("Releasing capture on {}", self.device.device_id);
        self.track.stop();
        self.stream.release();
    }
}

struct RegistryState {
    devices: Vec<MediaDeviceInfo>,
    current: Option<String>,
    capture: Option<CaptureSession>,
    /// Held constraint set used for every acquisition
    constraints: VideoConstraints,
    ladder: Vec<Resolution>,
    ladder_aspect: Option<f64>,
    planner: SimulcastPlanner,
    /// Bumped whenever the capture is replaced or released; late acquisitions compare against it
    epoch: u64,
}

impl RegistryState {
    /// Re-read settings from the live track and rebuild what derives from them
    fn refresh_derived(&mut self, preset_heights: &[u32]) {
        let Some(capture) = self.capture.as_mut() else {
            return;
        };
        capture.settings = capture.track.settings();
        capture.capabilities = capture.track.capabilities();

        if let Some(aspect) = capture.settings.effective_aspect_ratio() {
            if self.ladder_aspect != Some(aspect) {
                self.ladder = resolution_ladder(aspect, preset_heights).collect();
                self.ladder_aspect = Some(aspect);
            }
        }

        self.planner.update(&capture.device.device_id, &capture.settings);
        self.prune_plans();
    }

    /// Drop plans of cameras that are neither listed nor capturing
    fn prune_plans(&mut self) {
        let capturing = self.capture.as_ref().map(|c| c.device.device_id.as_str());
        self.planner.retain_devices(
            self.devices
                .iter()
                .map(|d| d.device_id.as_str())
                .chain(capturing),
        );
    }

    /// Listed info for `device_id`, or a bare entry when enumeration has not seen it
    fn device_info(&self, device_id: &str) -> MediaDeviceInfo {
        self.devices
            .iter()
            .find(|d| d.device_id == device_id)
            .cloned()
            .unwrap_or_else(|| MediaDeviceInfo::camera(device_id, device_id))
    }

    /// Swap `track` into the existing stream: remove old, stop old, add new
    fn replace_track(
        &mut self,
        device: MediaDeviceInfo,
        track: Arc<dyn MediaTrack>,
        constraints: VideoConstraints,
    ) -> bool {
        let Some(capture) = self.capture.as_mut() else {
            return false;
        };

        let old = capture.track.clone();
        capture.stream.remove_track(old.id());
        old.stop();
        capture.stream.add_track(track.clone());

        self.current = Some(device.device_id.clone());
        capture.device = device;
        capture.track = track;
        capture.applied_constraints = constraints;
        self.epoch += 1;
        true
    }
}

enum HotPlug {
    Unchanged,
    Switch(String),
    Lost(Option<CaptureSession>),
}

pub struct DeviceRegistry {
    platform: Arc<dyn CapturePlatform>,
    preset_heights: Vec<u32>,
    state: Mutex<RegistryState>,
    switch_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<CaptureEvent>,
    monitor: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl DeviceRegistry {
    pub fn new(platform: Arc<dyn CapturePlatform>, config: &CaptureConfig) -> Self {
        let preset_heights = config.preset_heights.clone();
        let constraints = VideoConstraints {
            height: preset_heights.first().map(|&h| Constrain::Ideal(h)),
            frame_rate: Some(Constrain::Ideal(config.ideal_frame_rate)),
            ..Default::default()
        };
        let (events, _) = broadcast::channel(16);

        Self {
            platform,
            preset_heights,
            state: Mutex::new(RegistryState {
                devices: Vec::new(),
                current: None,
                capture: None,
                constraints,
                ladder: Vec::new(),
                ladder_aspect: None,
                planner: SimulcastPlanner::new(),
                epoch: 0,
            }),
            switch_lock: tokio::sync::Mutex::new(()),
            events,
            monitor: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enumerate cameras and select the first one
    pub async fn initialize(&self) -> Result<()> {
        let _switch = self.switch_lock.lock().await;
        let devices = self.enumerate().await?;

        let mut state = self.state();
        let first = devices
            .first()
            .map(|d| d.device_id.clone())
            .ok_or(Error::NoDeviceFound)?;
        tracing::info!("Found {} camera(s), selecting {}", devices.len(), first);
        state.devices = devices;
        state.current = Some(first);
        Ok(())
    }

    async fn enumerate(&self) -> Result<Vec<MediaDeviceInfo>> {
        let all = self.platform.enumerate_devices().await?;
        tracing::debug!("All media devices: {:?}", all);
        Ok(all
            .into_iter()
            .filter(|d| d.kind == DeviceKind::VideoInput)
            .collect())
    }

    pub fn devices(&self) -> Vec<MediaDeviceInfo> {
        self.state().devices.clone()
    }

    /// The capturing camera when there is one, even if it has since been unplugged
    pub fn current_device(&self) -> Option<MediaDeviceInfo> {
        let state = self.state();
        if let Some(capture) = &state.capture {
            return Some(capture.device.clone());
        }
        let current = state.current.as_deref()?;
        state.devices.iter().find(|d| d.device_id == current).cloned()
    }

    /// Acquire the capture for the current device, or return the running one
    pub async fn start(&self) -> Result<Arc<MediaStream>> {
        let _switch = self.switch_lock.lock().await;

        let (device_id, constraints, epoch) = {
            let state = self.state();
            if let Some(capture) = &state.capture {
                return Ok(capture.stream.clone());
            }
            let device_id = state.current.clone().ok_or(Error::NoDeviceSelected)?;
            (device_id, state.constraints.clone(), state.epoch)
        };

        tracing::info!("Starting capture on {} with {:?}", device_id, constraints);
        let opened = self.platform.open(&device_id, &constraints).await?;
        let Some(track) = opened.video_track() else {
            opened.release();
            return Err(Error::Platform(format!("{} produced no video track", device_id)));
        };
        let stream = Arc::new(opened);

        {
            let mut state = self.state();
            if state.epoch == epoch {
                let device = state.device_info(&device_id);
                state.capture = Some(CaptureSession {
                    device,
                    stream: stream.clone(),
                    track,
                    applied_constraints: constraints,
                    capabilities: TrackCapabilities::default(),
                    settings: TrackSettings::default(),
                });
                state.refresh_derived(&self.preset_heights);
                return Ok(stream);
            }
        }

        tracing::debug!("Capture on {} resolved after stop, releasing it", device_id);
        stream.release();
        Err(Error::Superseded("capture start"))
    }

    /// Move capture to another camera without recreating the stream object
    pub async fn switch_to(&self, device_id: &str) -> Result<()> {
        let _switch = self.switch_lock.lock().await;

        {
            let mut state = self.state();
            if state.current.as_deref() == Some(device_id) {
                tracing::debug!("Camera {} already selected", device_id);
                return Ok(());
            }
            if !state.devices.iter().any(|d| d.device_id == device_id) {
                return Err(Error::switch_failed(
                    device_id,
                    Error::UnknownDevice(device_id.to_string()),
                ));
            }
            if state.capture.is_none() {
                tracing::info!("Selected camera {}", device_id);
                state.current = Some(device_id.to_string());
                return Ok(());
            }
        }

        self.swap_capture(device_id)
            .await
            .map_err(|e| Error::switch_failed(device_id, e))
    }

    /// Caller holds `switch_lock`. The old track keeps running until the new one is acquired.
    async fn swap_capture(&self, device_id: &str) -> Result<()> {
        let (constraints, epoch) = {
            let state = self.state();
            (state.constraints.clone(), state.epoch)
        };

        let opened = self.platform.open(device_id, &constraints).await?;
        let Some(track) = opened.video_track() else {
            opened.release();
            return Err(Error::Platform(format!("{} produced no video track", device_id)));
        };
        let track_id = track.id().to_string();

        let replaced = {
            let mut state = self.state();
            let device = state.device_info(device_id);
            let replaced = state.epoch == epoch && state.replace_track(device, track, constraints);
            if replaced {
                state.refresh_derived(&self.preset_heights);
            }
            replaced
        };

        if !replaced {
            tracing::debug!("Switch to {} resolved after the capture moved on", device_id);
            opened.release();
            return Err(Error::Superseded("device switch"));
        }

        tracing::info!("Switched camera to {} (track {})", device_id, track_id);
        let _ = self.events.send(CaptureEvent::TrackReplaced {
            device_id: device_id.to_string(),
            track_id,
        });
        Ok(())
    }

    /// Merge constraints into the held set and re-apply them to the live track
    pub async fn apply_settings(&self, partial: VideoConstraints) -> Result<()> {
        let _switch = self.switch_lock.lock().await;

        let (track, merged) = {
            let mut state = self.state();
            state.constraints.merge(&partial);
            let track = state.capture.as_ref().map(|c| c.track.clone());
            (track, state.constraints.clone())
        };
        let Some(track) = track else {
            return Ok(());
        };

        track.apply_constraints(&merged).await?;

        let mut state = self.state();
        if let Some(capture) = state.capture.as_mut() {
            capture.applied_constraints = merged;
        }
        state.refresh_derived(&self.preset_heights);
        Ok(())
    }

    pub async fn set_resolution(&self, width: u32, height: u32) -> Result<()> {
        self.apply_exact(VideoConstraints::exact_resolution(width, height))
            .await
    }

    pub async fn set_frame_rate(&self, frame_rate: f64) -> Result<()> {
        self.apply_exact(VideoConstraints::exact_frame_rate(frame_rate))
            .await
    }

    async fn apply_exact(&self, constraints: VideoConstraints) -> Result<()> {
        let _switch = self.switch_lock.lock().await;

        let track = {
            let state = self.state();
            if state.current.is_none() {
                return Err(Error::NoDeviceSelected);
            }
            state
                .capture
                .as_ref()
                .map(|c| c.track.clone())
                .ok_or(Error::NotCapturing)?
        };

        tracing::info!("Applying new constraints: {:?}", constraints);
        track.apply_constraints(&constraints).await?;

        let mut state = self.state();
        if let Some(capture) = state.capture.as_mut() {
            capture.applied_constraints.merge(&constraints);
        }
        state.refresh_derived(&self.preset_heights);
        Ok(())
    }

    /// Stop every track of the live stream and release it
    pub fn stop(&self) {
        let capture = {
            let mut state = self.state();
            state.epoch += 1;
            state.capture.take()
        };
        if let Some(capture) = capture {
            capture.release();
        }
    }

    /// Re-enumerate after a device-list change and recover the capture if its camera left
    pub async fn refresh_devices(&self) -> Result<()> {
        let _switch = self.switch_lock.lock().await;
        let devices = self.enumerate().await?;

        let action = {
            let mut guard = self.state();
            let state = &mut *guard;
            state.devices = devices;
            state.prune_plans();

            let first = state.devices.first().map(|d| d.device_id.clone());
            match state.current.clone() {
                Some(current) if state.devices.iter().any(|d| d.device_id == current) => {
                    HotPlug::Unchanged
                }
                Some(current) => match first {
                    Some(next) if state.capture.is_some() => {
                        tracing::warn!("Camera {} disconnected, switching to {}", current, next);
                        HotPlug::Switch(next)
                    }
                    Some(next) => {
                        tracing::warn!("Camera {} disconnected, selecting {}", current, next);
                        state.current = Some(next);
                        HotPlug::Unchanged
                    }
                    None => {
                        tracing::warn!("Camera {} disconnected, no cameras left", current);
                        state.current = None;
                        state.epoch += 1;
                        HotPlug::Lost(state.capture.take())
                    }
                },
                None => {
                    if let Some(next) = first {
                        tracing::info!("Camera {} connected, selecting it", next);
                        state.current = Some(next);
                    }
                    HotPlug::Unchanged
                }
            }
        };

        match action {
            HotPlug::Unchanged => {}
            HotPlug::Switch(next) => {
                if let Err(e) = self.swap_capture(&next).await {
                    tracing::warn!("Hot-plug switch to {} failed, keeping previous capture: {}", next, e);
                }
            }
            HotPlug::Lost(capture) => {
                if let Some(capture) = capture {
                    capture.release();
                    let _ = self.events.send(CaptureEvent::CaptureLost);
                }
            }
        }
        Ok(())
    }

    /// Follow platform device-list notifications until `stop_monitoring`
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.as_ref().is_some_and(|(_, task)| !task.is_finished()) {
            return;
        }

        let mut changes = self.platform.device_changes();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let registry = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    change = changes.recv() => match change {
                        Ok(()) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }

                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = registry.refresh_devices().await {
                    tracing::warn!("Failed to refresh device list: {}", e);
                }
            }
            tracing::debug!("Device monitor stopped");
        });

        tracing::info!("Started device monitoring");
        *monitor = Some((stop_tx, task));
    }

    pub fn stop_monitoring(&self) {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((stop_tx, _task)) = monitor {
            let _ = stop_tx.send(true);
            tracing::info!("Stopped device monitoring");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CaptureEvent> {
        self.events.subscribe()
    }

    pub fn is_capturing(&self) -> bool {
        self.state().capture.is_some()
    }

    pub fn stream(&self) -> Option<Arc<MediaStream>> {
        self.state().capture.as_ref().map(|c| c.stream.clone())
    }

    pub fn current_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.state().capture.as_ref().map(|c| c.track.clone())
    }

    pub fn settings(&self) -> Option<TrackSettings> {
        self.state().capture.as_ref().map(|c| c.settings.clone())
    }

    pub fn capabilities(&self) -> Option<TrackCapabilities> {
        self.state().capture.as_ref().map(|c| c.capabilities.clone())
    }

    pub fn applied_constraints(&self) -> Option<VideoConstraints> {
        self.state()
            .capture
            .as_ref()
            .map(|c| c.applied_constraints.clone())
    }

    /// Constraint set used for the next acquisition
    pub fn held_constraints(&self) -> VideoConstraints {
        self.state().constraints.clone()
    }

    pub fn resolution_ladder(&self) -> Vec<Resolution> {
        self.state().ladder.clone()
    }

    /// Plan of the current device, empty before the first capture
    pub fn simulcast_plan(&self) -> SimulcastPlan {
        let state = self.state();
        let capturing = state.capture.as_ref().map(|c| c.device.device_id.as_str());
        match capturing.or(state.current.as_deref()) {
            Some(id) => state.planner.plan(id),
            None => SimulcastPlan::default(),
        }
    }

    pub fn plan_for(&self, device_id: &str) -> SimulcastPlan {
        self.state().planner.plan(device_id)
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}
