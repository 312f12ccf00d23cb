//! Listener head sample grids.
//!
//! Ray origins are placed on a square plane around the listener's head, one
//! fixed-resolution grid per quality tier. All three grids are rebuilt
//! together whenever the configured head size changes; they are owned by the
//! world and only ever rebuilt from the tick thread, never mid-read.

use crate::quality::Tier;

/// One ray-origin offset in the listener-local sampling plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleOffset {
    /// Offset along the derived lateral (side) vector.
    pub x: f32,
    /// Offset along the derived head-plane up vector.
    pub z: f32,
}

/// The per-tier offset grids, cached against the configured head size.
#[derive(Debug)]
pub struct SampleGrids {
    head_size: f32,
    version: u64,
    low: Vec<SampleOffset>,
    medium: Vec<SampleOffset>,
    high: Vec<SampleOffset>,
}

impl SampleGrids {
    pub fn new(head_size: f32) -> Self {
        Self {
            head_size,
            version: 0,
            low: build_grid(head_size, Tier::Low.resolution()),
            medium: build_grid(head_size, Tier::Medium.resolution()),
            high: build_grid(head_size, Tier::High.resolution()),
        }
    }

    /// Regenerates all three grids when `head_size` changed; no-op otherwise.
    /// Returns true when a rebuild happened.
    pub fn rebuild(&mut self, head_size: f32) -> bool {
        if head_size == self.head_size {
            return false;
        }

        self.head_size = head_size;
        self.low = build_grid(head_size, Tier::Low.resolution());
        self.medium = build_grid(head_size, Tier::Medium.resolution());
        self.high = build_grid(head_size, Tier::High.resolution());
        self.version = self.version.wrapping_add(1);
        log::debug!("rebuilt sample grids for head size {head_size}");
        true
    }

    /// The ordered sample sequence for a tier. Round-robin consumption
    /// relies on this exact enumeration order.
    pub fn samples(&self, tier: Tier) -> &[SampleOffset] {
        match tier {
            Tier::Low => &self.low,
            Tier::Medium => &self.medium,
            Tier::High => &self.high,
        }
    }

    pub fn head_size(&self) -> f32 {
        self.head_size
    }

    /// Bumped on every rebuild.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Row-major n×n grid spanning [-H/2, +H/2] on both axes: outer loop walks z
/// down from +H/2, inner walks x up from -H/2, step H/(n-1).
fn build_grid(head_size: f32, resolution: usize) -> Vec<SampleOffset> {
    let half = head_size * 0.5;
    let step = head_size / (resolution - 1) as f32;
    let mut samples = Vec::with_capacity(resolution * resolution);

    for i in 0..resolution {
        let z = half - i as f32 * step;

        for j in 0..resolution {
            samples.push(SampleOffset {
                x: -half + j as f32 * step,
                z,
            });
        }
    }

    samples
}
