//! Client configuration
//!
//! Layered from an optional TOML file and `SHOTCAST__`-prefixed environment
//! variables, e.g. `SHOTCAST__SIGNALING__URL=wss://hub.example/shot`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use shotcast_protocol::TrackDescriptor;

use crate::error::Result;
use crate::media::simulcast::PRESET_HEIGHTS;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub signaling: SignalingConfig,
    pub capture: CaptureConfig,
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Relay hub endpoint, including the broadcaster namespace path
    pub url: String,
    pub request_timeout_ms: u64,
    pub ping_interval_secs: u64,
    pub reconnect: ReconnectConfig,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/shot".to_string(),
            request_timeout_ms: 10_000,
            ping_interval_secs: 25,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SignalingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter applied to each delay, as a fraction of it (0 disables)
    pub randomization_factor: f64,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 5_000,
            randomization_factor: 0.5,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Candidate heights, highest first
    pub preset_heights: Vec<u32>,
    pub ideal_frame_rate: f64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preset_heights: PRESET_HEIGHTS.to_vec(),
            ideal_frame_rate: 60.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Name shown for this broadcaster on the relay
    pub shot_name: String,
    /// Tracks offered in `confirmReady`; only these ids are published
    pub tracks: Vec<TrackDescriptor>,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            shot_name: "shot".to_string(),
            tracks: vec![TrackDescriptor::camera_main()],
        }
    }
}

impl BroadcastConfig {
    pub fn knows_track(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.track_id == track_id)
    }
}

impl ClientConfig {
    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("shotcast").join("config.toml"))
    }

    /// Load from `path` (or the default location) plus environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => {
                tracing::debug!("Reading config from {:?}", path);
                builder = builder.add_source(config::File::from(path).required(false));
            }
            None => tracing::warn!("Could not determine config directory"),
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("SHOTCAST")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}
