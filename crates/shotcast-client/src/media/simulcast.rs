//! Resolution ladder and simulcast bitrate planning
//!
//! Bitrates are estimated from pixel throughput:
//! `round(width * height * frame_rate * BITRATE_FACTOR)` kbps.

use std::collections::HashMap;

use serde::Serialize;

use super::device::TrackSettings;
use super::sfu::RtpEncoding;

/// Candidate heights offered to the user, highest first
pub const PRESET_HEIGHTS: [u32; 8] = [2160, 1800, 1440, 1200, 1080, 900, 768, 720];

/// kbps per pixel per frame (1 / 12800)
pub const BITRATE_FACTOR: f64 = 0.000078125;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Lazily yield one candidate per preset height for the given aspect ratio
pub fn resolution_ladder(
    aspect_ratio: f64,
    heights: &[u32],
) -> impl Iterator<Item = Resolution> + Clone + '_ {
    heights.iter().map(move |&height| Resolution {
        width: (aspect_ratio * height as f64).round() as u32,
        height,
    })
}

pub fn derive_resolution_ladder(aspect_ratio: f64) -> Vec<Resolution> {
    resolution_ladder(aspect_ratio, &PRESET_HEIGHTS).collect()
}

pub fn compute_tier_bitrate(width: u32, height: u32, frame_rate: f64) -> u32 {
    (width as f64 * height as f64 * frame_rate * BITRATE_FACTOR).round() as u32
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulcastTier {
    pub rid: String,
    pub scale_resolution_down_by: f64,
    /// kbps
    pub bitrate: u32,
}

/// Ordered tiers, least downscaled first
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SimulcastPlan {
    tiers: Vec<SimulcastTier>,
}

impl SimulcastPlan {
    pub fn tiers(&self) -> &[SimulcastTier] {
        &self.tiers
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn tier(&self, rid: &str) -> Option<&SimulcastTier> {
        self.tiers.iter().find(|t| t.rid == rid)
    }

    /// Producer encodings; `maxBitrate` is in bits per second
    pub fn to_encodings(&self) -> Vec<RtpEncoding> {
        self.tiers
            .iter()
            .map(|t| RtpEncoding {
                rid: t.rid.clone(),
                scale_resolution_down_by: t.scale_resolution_down_by,
                max_bitrate: t.bitrate.saturating_mul(1000),
            })
            .collect()
    }
}

pub fn build_plan(width: u32, height: u32, frame_rate: f64) -> SimulcastPlan {
    let origin = compute_tier_bitrate(width, height, frame_rate);
    SimulcastPlan {
        tiers: vec![
            SimulcastTier {
                rid: "origin".to_string(),
                scale_resolution_down_by: 1.0,
                bitrate: origin,
            },
            SimulcastTier {
                rid: "low".to_string(),
                scale_resolution_down_by: 4.0,
                bitrate: (origin as f64 / 4.0).round() as u32,
            },
        ],
    }
}

/// Per-device plan cache
#[derive(Debug, Default)]
pub struct SimulcastPlanner {
    plans: HashMap<String, SimulcastPlan>,
}

impl SimulcastPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the plan for `device_id` from fresh settings.
    /// Settings without resolution or frame rate leave the cache untouched.
    pub fn update(&mut self, device_id: &str, settings: &TrackSettings) -> Option<&SimulcastPlan> {
        let (Some(width), Some(height), Some(frame_rate)) =
            (settings.width, settings.height, settings.frame_rate)
        else {
            tracing::debug!("Incomplete settings for {}, keeping previous plan", device_id);
            return self.plans.get(device_id);
        };

        let plan = build_plan(width, height, frame_rate);
        tracing::debug!(
            "Simulcast plan for {} at {}x{}@{}: {:?}",
            device_id,
            width,
            height,
            frame_rate,
            plan.tiers
        );
        self.plans.insert(device_id.to_string(), plan);
        self.plans.get(device_id)
    }

    pub fn plan(&self, device_id: &str) -> SimulcastPlan {
        self.plans.get(device_id).cloned().unwrap_or_default()
    }

    /// Drop plans of devices that are no longer present
    pub fn retain_devices<'a>(&mut self, present: impl IntoIterator<Item = &'a str>) {
        let present: Vec<&str> = present.into_iter().collect();
        self.plans.retain(|id, _| present.contains(&id.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_follows_presets_in_descending_order() {
        for aspect in [16.0 / 9.0, 4.0 / 3.0, 1.0, 9.0 / 16.0] {
            let ladder = derive_resolution_ladder(aspect);
            assert_eq!(ladder.len(), PRESET_HEIGHTS.len());
            for (candidate, &h) in ladder.iter().zip(PRESET_HEIGHTS.iter()) {
                assert_eq!(candidate.height, h);
                assert_eq!(candidate.width, (aspect * h as f64).round() as u32);
            }
            assert!(ladder.windows(2).all(|w| w[0].height > w[1].height));
        }
    }

    #[test]
    fn ladder_iterator_is_restartable() {
        let ladder = resolution_ladder(16.0 / 9.0, &PRESET_HEIGHTS);
        let first: Vec<_> = ladder.clone().collect();
        let second: Vec<_> = ladder.collect();
        assert_eq!(first, second);
        assert_eq!(first[4], Resolution { width: 1920, height: 1080 });
        assert_eq!(first[7], Resolution { width: 1280, height: 720 });
    }

    #[test]
    fn full_hd_bitrates() {
        assert_eq!(compute_tier_bitrate(1920, 1080, 30.0), 4860);
        let plan = build_plan(1920, 1080, 30.0);
        assert_eq!(plan.tiers()[0].rid, "origin");
        assert_eq!(plan.tiers()[0].bitrate, 4860);
        assert_eq!(plan.tier("low").unwrap().bitrate, 1215);
        assert_eq!(plan.tier("low").unwrap().scale_resolution_down_by, 4.0);
    }

    #[test]
    fn low_tier_rounds_half_away_from_zero() {
        // 640x480@25 -> 600 kbps origin; 1280x720@30 -> 2160; 2 kbps origin -> 0.5 -> 1
        assert_eq!(build_plan(640, 480, 25.0).tier("low").unwrap().bitrate, 150);
        assert_eq!(compute_tier_bitrate(1280, 720, 30.0), 2160);
        assert_eq!(compute_tier_bitrate(160, 160, 1.0), 2);
        assert_eq!(build_plan(160, 160, 1.0).tier("low").unwrap().bitrate, 1);
    }

    #[test]
    fn encodings_are_in_bits_per_second() {
        let encodings = build_plan(1920, 1080, 30.0).to_encodings();
        assert_eq!(encodings.len(), 2);
        assert_eq!(encodings[0].max_bitrate, 4_860_000);
        assert_eq!(encodings[1].rid, "low");
        assert_eq!(encodings[1].max_bitrate, 1_215_000);
    }

    #[test]
    fn planner_replaces_and_forgets() {
        let mut planner = SimulcastPlanner::new();
        assert!(planner.plan("cam").is_empty());

        let hd = TrackSettings {
            width: Some(1920),
            height: Some(1080),
            frame_rate: Some(30.0),
            ..Default::default()
        };
        planner.update("cam", &hd);
        assert_eq!(planner.plan("cam"), build_plan(1920, 1080, 30.0));

        let partial = TrackSettings {
            width: Some(1280),
            ..Default::default()
        };
        planner.update("cam", &partial);
        assert_eq!(planner.plan("cam"), build_plan(1920, 1080, 30.0));

        planner.retain_devices(["other"]);
        assert!(planner.plan("cam").is_empty());
    }
}
