//! Occlusion quality tiers.
//!
//! An emitter is configured with an [`OcclusionQuality`]; each tick the
//! engine resolves it to a concrete [`Tier`] carrying the grid resolution
//! and ray concurrency used by the batch scheduler. `Adaptive` picks the
//! tier from the current listener distance.

use crate::config::OcclusionConfig;

/// Configured occlusion quality for an emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OcclusionQuality {
    /// Occlusion disabled; the published value stays at 0.
    #[default]
    None,
    /// Occlusion deliberately ignored for this emitter.
    Ignore,
    Low,
    Medium,
    High,
    /// Resolved to Low/Medium/High from the listener distance each tick.
    Adaptive,
}

impl OcclusionQuality {
    /// True when this quality permits casting rays at all.
    pub fn is_enabled(self) -> bool {
        !matches!(self, Self::None | Self::Ignore)
    }
}

/// A concrete quality tier with its sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Low,
    Medium,
    High,
}

impl Tier {
    /// Samples per grid edge.
    pub const fn resolution(self) -> usize {
        match self {
            Tier::Low => 7,
            Tier::Medium => 9,
            Tier::High => 11,
        }
    }

    /// Total samples in this tier's grid.
    pub const fn sample_count(self) -> usize {
        let n = self.resolution();
        n * n
    }

    /// Rays fired per batch.
    pub const fn concurrent_rays(self) -> usize {
        match self {
            Tier::Low => 1,
            Tier::Medium => 2,
            Tier::High => 4,
        }
    }
}

/// Resolves `Adaptive` to a concrete tier for the given listener distance.
/// The bands are checked High first, so High wins where they overlap.
pub(crate) fn resolve_adaptive(distance: f32, config: &OcclusionConfig) -> Tier {
    if distance < config.high_distance {
        Tier::High
    } else if distance < config.medium_distance {
        Tier::Medium
    } else {
        Tier::Low
    }
}

/// Clamps a quality override into the Ignore..=High range.
pub(crate) fn clamp_override(quality: OcclusionQuality) -> OcclusionQuality {
    match quality {
        OcclusionQuality::None => OcclusionQuality::Ignore,
        OcclusionQuality::Adaptive => OcclusionQuality::High,
        other => other,
    }
}
