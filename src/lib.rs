//! Ray-based sound occlusion and propagation engine.
//!
//! Sonoray computes, for every registered emitter, how obstructed the sound
//! path to the active listener is: a scalar in [0, 1] derived from piercing
//! rays fired through world geometry and the sound-obstruction coefficients
//! of the surfaces they strike. Ray intersection and material lookup stay
//! with the host through the [`RayCaster`] and [`SurfaceLookup`] traits.

pub mod config;
pub mod error;
pub mod grid;
pub mod math;
pub mod propagation;
pub mod quality;
pub mod ray;
pub mod surface;
pub mod world;

pub use config::{CollisionTypes, OcclusionConfig};
pub use error::SonorayError;
pub use grid::{SampleGrids, SampleOffset};
pub use propagation::{PropagationState, RayInfo, TickContext};
pub use quality::{OcclusionQuality, Tier};
pub use ray::{MAX_RAY_HITS, RayCaster, RayCompletion, RayHit, RayQuery, RayTicket};
pub use surface::{SurfaceLookup, SurfaceTable};
pub use world::{EmitterId, OcclusionWorld};
