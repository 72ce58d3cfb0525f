//! Capture platform contract
//!
//! The platform (camera stack of the host OS or a mobile shell) is consumed
//! through [`CapturePlatform`] and [`MediaTrack`]. Everything here is plain
//! data plus the traits the registry drives.

use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use shotcast_protocol::TrackKind;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

/// A media source reported by the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl MediaDeviceInfo {
    pub fn camera(device_id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
            kind: DeviceKind::VideoInput,
        }
    }
}

/// A constraint is either a preference or a hard requirement
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constrain<T> {
    Ideal(T),
    Exact(T),
}

impl<T: Copy> Constrain<T> {
    pub fn value(&self) -> T {
        match self {
            Constrain::Ideal(v) | Constrain::Exact(v) => *v,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoConstraints {
    pub width: Option<Constrain<u32>>,
    pub height: Option<Constrain<u32>>,
    pub frame_rate: Option<Constrain<f64>>,
    pub aspect_ratio: Option<Constrain<f64>>,
}

impl VideoConstraints {
    /// Overlay every constraint set in `other` onto `self`
    pub fn merge(&mut self, other: &VideoConstraints) {
        if other.width.is_some() {
            self.width = other.width;
        }
        if other.height.is_some() {
            self.height = other.height;
        }
        if other.frame_rate.is_some() {
            self.frame_rate = other.frame_rate;
        }
        if other.aspect_ratio.is_some() {
            self.aspect_ratio = other.aspect_ratio;
        }
    }

    pub fn exact_resolution(width: u32, height: u32) -> Self {
        Self {
            width: Some(Constrain::Exact(width)),
            height: Some(Constrain::Exact(height)),
            ..Default::default()
        }
    }

    pub fn exact_frame_rate(frame_rate: f64) -> Self {
        Self {
            frame_rate: Some(Constrain::Exact(frame_rate)),
            ..Default::default()
        }
    }
}

/// Values the track is actually running with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackSettings {
    pub device_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub aspect_ratio: Option<f64>,
}

impl TrackSettings {
    /// Aspect ratio as reported, or derived from the resolution
    pub fn effective_aspect_ratio(&self) -> Option<f64> {
        self.aspect_ratio.or_else(|| match (self.width, self.height) {
            (Some(w), Some(h)) if h > 0 => Some(w as f64 / h as f64),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange<T> {
    pub min: T,
    pub max: T,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackCapabilities {
    pub width: Option<ValueRange<u32>>,
    pub height: Option<ValueRange<u32>>,
    pub frame_rate: Option<ValueRange<f64>>,
    pub aspect_ratio: Option<ValueRange<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// A live media track produced by the platform
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn label(&self) -> &str;
    fn ready_state(&self) -> TrackState;
    fn settings(&self) -> TrackSettings;
    fn capabilities(&self) -> TrackCapabilities;
    async fn apply_constraints(&self, constraints: &VideoConstraints) -> Result<()>;
    fn stop(&self);
    /// Independent track on the same source; stopping one leaves the other live
    fn duplicate(&self) -> Arc<dyn MediaTrack>;
}

impl fmt::Debug for dyn MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("state", &self.ready_state())
            .finish()
    }
}

/// A mutable set of tracks, shared by reference between owner and consumers
pub struct MediaStream {
    id: String,
    tracks: Mutex<Vec<Arc<dyn MediaTrack>>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks: Mutex::new(tracks),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.lock().clone()
    }

    pub fn video_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.lock()
            .iter()
            .find(|t| t.kind() == TrackKind::Video)
            .cloned()
    }

    pub fn add_track(&self, track: Arc<dyn MediaTrack>) {
        let mut tracks = self.lock();
        if !tracks.iter().any(|t| t.id() == track.id()) {
            tracks.push(track);
        }
    }

    pub fn remove_track(&self, track_id: &str) -> Option<Arc<dyn MediaTrack>> {
        let mut tracks = self.lock();
        let pos = tracks.iter().position(|t| t.id() == track_id)?;
        Some(tracks.remove(pos))
    }

    /// Stop and drop every track
    pub fn release(&self) {
        for track in self.lock().drain(..) {
            track.stop();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn MediaTrack>>> {
        self.tracks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.lock().len())
            .finish()
    }
}

/// Host camera stack
///
/// `open` fails with `PermissionDenied` or `ConstraintUnsatisfiable` when the
/// platform refuses the request.
#[async_trait]
pub trait CapturePlatform: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>>;

    /// Acquire a stream for one device (the `exact` device id is implied)
    async fn open(&self, device_id: &str, constraints: &VideoConstraints) -> Result<MediaStream>;

    /// Fires whenever the device list may have changed
    fn device_changes(&self) -> broadcast::Receiver<()>;
}
