use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Media kind of a published track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        }
    }
}

/// A track the broadcaster offers to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackDescriptor {
    pub track_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TrackKind,
}

impl TrackDescriptor {
    /// The main camera track every broadcaster exposes
    pub fn camera_main() -> Self {
        Self {
            track_id: "camera_main".to_string(),
            name: "Main Camera".to_string(),
            kind: TrackKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters exchanged when the send transport connects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DtlsRole>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Router RTP capabilities, opaque to the orchestrator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub Value);

/// RTP parameters of a producer, opaque to the orchestrator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

/// Parameters the relay hands out for creating the local send transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Vec<Value>,
    pub dtls_parameters: DtlsParameters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<Value>,
}

/// Localised text: either a plain string or a language map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Text {
    Plain(String),
    Localized(BTreeMap<String, String>),
}

impl Text {
    /// Resolve the text for a language, falling back to the `fallback` entry
    pub fn resolve(&self, lang: &str) -> Option<&str> {
        match self {
            Text::Plain(s) => Some(s),
            Text::Localized(map) => map
                .get(lang)
                .or_else(|| map.get("fallback"))
                .or_else(|| map.values().next())
                .map(String::as_str),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Ms,
    S,
    Min,
    H,
    D,
}

/// Duration encoded as `[amount, unit]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeDuration(pub f64, pub TimeUnit);

impl TimeDuration {
    pub fn to_duration(&self) -> Duration {
        let millis_per_unit = match self.1 {
            TimeUnit::Ms => 1.0,
            TimeUnit::S => 1_000.0,
            TimeUnit::Min => 60_000.0,
            TimeUnit::H => 3_600_000.0,
            TimeUnit::D => 86_400_000.0,
        };
        Duration::from_millis((self.0.max(0.0) * millis_per_unit).round() as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkWithTitle {
    pub link: String,
    pub title: Text,
}

/// Contest metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contest {
    pub title: Text,
    pub start_at: DateTime<Utc>,
    pub duration: TimeDuration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frozen_duration: Option<TimeDuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_links: Option<Vec<LinkWithTitle>>,
}

impl Contest {
    pub fn end_at(&self) -> DateTime<Utc> {
        let length = chrono::Duration::from_std(self.duration.to_duration())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.start_at + length
    }
}

/// The contestant a broadcaster is filming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestUser {
    pub id: String,
    pub name: Text,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Text>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<Text>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub official: Option<bool>,
}
