//! Ray data model and the external ray-intersection boundary.
//!
//! The engine never walks geometry itself; it issues [`RayQuery`] casts
//! through a host-provided [`RayCaster`] and interprets the returned hits.
//! Synchronous casts fill a caller-owned buffer; queued casts deliver a
//! [`RayCompletion`] through the world's serialized completion channel at
//! some later point.

use crate::config::CollisionTypes;
use crate::math::Vec3;
use crate::world::EmitterId;
use crossbeam_channel::Sender;

/// Upper bound on hits recorded along one piercing ray.
pub const MAX_RAY_HITS: usize = 10;

/// One surface struck by a piercing ray.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RayHit {
    /// Distance from the ray origin to the hit point, in meters. Hits at
    /// distance zero are spurious self-intersections and are skipped.
    pub distance: f32,
    /// Index of the struck surface in the host's surface/material table.
    pub surface_index: u32,
}

impl RayHit {
    pub fn new(distance: f32, surface_index: u32) -> Self {
        Self {
            distance,
            surface_index,
        }
    }
}

/// Parameters of one obstruction ray cast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayQuery {
    /// World-space ray origin.
    pub origin: Vec3,
    /// Unnormalized direction; its length is the cast distance.
    pub direction: Vec3,
    /// Geometry categories the ray may collide with.
    pub collision_types: CollisionTypes,
    /// Piercing rays continue past the first surface and report every hit
    /// along the path.
    pub pierce: bool,
    /// Upper bound on hits the caster should report.
    pub max_hits: usize,
}

/// Identifies the in-flight ray a completion belongs to.
///
/// Tickets are value handles, never references: a completion arriving after
/// its emitter was destroyed or reset simply fails to resolve and is
/// dropped by the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTicket {
    pub emitter: EmitterId,
    /// Batch epoch of the owning emitter at cast time.
    pub generation: u64,
    /// Ray slot index within the batch.
    pub slot: usize,
}

/// Completion message for a queued cast.
#[derive(Debug, Clone)]
pub struct RayCompletion {
    pub ticket: RayTicket,
    /// Hits in ray order; entries beyond [`MAX_RAY_HITS`] are discarded.
    pub hits: Vec<RayHit>,
}

/// External ray-intersection service.
///
/// Queued casts may execute on worker threads, but the world consumes
/// completions from a single serialized channel, so implementations never
/// see this crate touch shared emitter state concurrently.
pub trait RayCaster: Send + Sync {
    /// Casts synchronously, filling `hits` and returning the number of hits
    /// found. The returned count may exceed `hits.len()`; the engine caps
    /// what it reads.
    fn cast(&self, query: &RayQuery, hits: &mut [RayHit]) -> usize;

    /// Submits an asynchronous cast. The service must eventually deliver a
    /// [`RayCompletion`] carrying `ticket` through `completions`.
    fn cast_queued(&self, query: &RayQuery, ticket: RayTicket, completions: &Sender<RayCompletion>);
}
