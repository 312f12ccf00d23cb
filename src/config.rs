//! Configuration for the occlusion engine

use crate::error::{Result, SonorayError};
use crate::quality::OcclusionQuality;
use bitflags::bitflags;

bitflags! {
    /// Geometry categories that participate in occlusion ray casts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollisionTypes: u32 {
        const STATIC = 1 << 0;
        const RIGID = 1 << 1;
        const WATER = 1 << 2;
        const TERRAIN = 1 << 3;
    }
}

/// Hot-reloadable occlusion settings, applied through
/// [`OcclusionWorld::set_config`](crate::world::OcclusionWorld::set_config).
#[derive(Debug, Clone)]
pub struct OcclusionConfig {
    /// Emitters closer to the listener than this cast no rays.
    pub min_distance: f32,
    /// Emitters farther from the listener than this cast no rays.
    pub max_distance: f32,
    /// At or below this listener distance, casts are issued synchronously.
    pub max_sync_distance: f32,
    /// Adaptive quality resolves to High below this distance.
    pub high_distance: f32,
    /// Adaptive quality resolves to Medium below this distance, Low beyond.
    pub medium_distance: f32,
    /// Geometry categories rays may collide with.
    pub collision_types: CollisionTypes,
    /// Edge length of the sampling plane around the listener's head, in meters.
    pub listener_plane_size: f32,
    /// Sum obstruction coefficients along a ray instead of taking their maximum.
    pub accumulate_occlusion: bool,
    /// Treat a saturated hit buffer as full occlusion.
    pub full_occlusion_on_max_hits: bool,
    /// Forces every emitter to the given quality (diagnostics). Values outside
    /// Ignore..=High are clamped before use.
    pub quality_override: Option<OcclusionQuality>,
}

impl Default for OcclusionConfig {
    fn default() -> Self {
        Self {
            min_distance: 0.1,
            max_distance: 500.0,
            max_sync_distance: 10.0,
            high_distance: 10.0,
            medium_distance: 80.0,
            collision_types: CollisionTypes::all(),
            listener_plane_size: 1.0,
            accumulate_occlusion: false,
            full_occlusion_on_max_hits: false,
            quality_override: None,
        }
    }
}

impl OcclusionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min_distance(mut self, distance: f32) -> Self {
        self.min_distance = distance;
        self
    }

    pub fn max_distance(mut self, distance: f32) -> Self {
        self.max_distance = distance;
        self
    }

    pub fn max_sync_distance(mut self, distance: f32) -> Self {
        self.max_sync_distance = distance;
        self
    }

    pub fn high_distance(mut self, distance: f32) -> Self {
        self.high_distance = distance;
        self
    }

    pub fn medium_distance(mut self, distance: f32) -> Self {
        self.medium_distance = distance;
        self
    }

    pub fn collision_types(mut self, types: CollisionTypes) -> Self {
        self.collision_types = types;
        self
    }

    pub fn listener_plane_size(mut self, size: f32) -> Self {
        self.listener_plane_size = size;
        self
    }

    pub fn accumulate_occlusion(mut self, accumulate: bool) -> Self {
        self.accumulate_occlusion = accumulate;
        self
    }

    pub fn full_occlusion_on_max_hits(mut self, enable: bool) -> Self {
        self.full_occlusion_on_max_hits = enable;
        self
    }

    pub fn quality_override(mut self, quality: Option<OcclusionQuality>) -> Self {
        self.quality_override = quality;
        self
    }

    /// Rejects distance ranges that cannot admit any raycast.
    pub fn validate(&self) -> Result<()> {
        if self.min_distance > self.max_distance {
            return Err(SonorayError::Configuration(format!(
                "occlusion min distance {} exceeds max distance {}",
                self.min_distance, self.max_distance
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(OcclusionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_distance_range_rejected() {
        let config = OcclusionConfig::new().min_distance(100.0).max_distance(10.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_setters() {
        let config = OcclusionConfig::new()
            .max_sync_distance(5.0)
            .accumulate_occlusion(true)
            .collision_types(CollisionTypes::STATIC | CollisionTypes::TERRAIN);

        assert_eq!(config.max_sync_distance, 5.0);
        assert!(config.accumulate_occlusion);
        assert!(config.collision_types.contains(CollisionTypes::STATIC));
        assert!(!config.collision_types.contains(CollisionTypes::WATER));
    }
}
