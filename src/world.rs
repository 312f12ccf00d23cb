//! Occlusion world: emitters, listener, tick orchestration.
//!
//! `OcclusionWorld` is the central API. The simulation thread owns it and
//! drives [`OcclusionWorld::update`] once per tick; asynchronous ray
//! completions funnel back through a single serialized channel drained at
//! the start of each tick, so per-emitter state is never mutated
//! concurrently and the batch bookkeeping needs no locks.

use crate::config::OcclusionConfig;
use crate::error::{Result, SonorayError};
use crate::grid::SampleGrids;
use crate::math::{Pose, Vec3};
use crate::propagation::{MAX_CONCURRENT_RAYS, PropagationState, TickContext};
use crate::quality::OcclusionQuality;
use crate::ray::{RayCaster, RayCompletion};
use crate::surface::SurfaceLookup;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::collections::HashMap;
use std::sync::Arc;

/// Lightweight, type-safe handle for occlusion emitters.
///
/// Handles are never reused; a completion addressed to a destroyed emitter
/// simply fails to resolve.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct EmitterId(u64);

impl EmitterId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for EmitterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EmitterId({})", self.0)
    }
}

struct Emitter {
    position: Vec3,
    is_virtual: bool,
    propagation: PropagationState,
}

/// Owns every live emitter's propagation state plus the shared resources
/// they sample: the listener pose, the sample grids and the completion
/// queue for asynchronous ray results.
pub struct OcclusionWorld {
    config: OcclusionConfig,
    grids: SampleGrids,
    listener: Pose,
    emitters: HashMap<EmitterId, Emitter>,
    next_emitter_id: u64,
    caster: Arc<dyn RayCaster>,
    surfaces: Arc<dyn SurfaceLookup>,
    completion_sender: Sender<RayCompletion>,
    completion_receiver: Receiver<RayCompletion>,
    rays_enabled: bool,
}

impl OcclusionWorld {
    pub fn new(
        config: OcclusionConfig,
        caster: Arc<dyn RayCaster>,
        surfaces: Arc<dyn SurfaceLookup>,
    ) -> Result<Self> {
        config.validate()?;
        let (completion_sender, completion_receiver) = unbounded();
        let grids = SampleGrids::new(config.listener_plane_size);

        Ok(Self {
            config,
            grids,
            listener: Pose::identity(),
            emitters: HashMap::new(),
            next_emitter_id: 0,
            caster,
            surfaces,
            completion_sender,
            completion_receiver,
            rays_enabled: true,
        })
    }

    /// Registers an emitter and seeds its occlusion with a synchronous
    /// center ray so consumers start from a real value instead of 0.
    pub fn add_emitter(&mut self, position: Vec3, quality: OcclusionQuality) -> EmitterId {
        let id = EmitterId::new(self.next_emitter_id);
        self.next_emitter_id += 1;

        let mut propagation = PropagationState::new(quality);
        propagation.refresh_immediate(position, false, &self.context());

        self.emitters.insert(
            id,
            Emitter {
                position,
                is_virtual: false,
                propagation,
            },
        );
        id
    }

    /// Destroys an emitter. In-flight rays are not cancelled; their
    /// completions fail to resolve the id and are dropped.
    pub fn remove_emitter(&mut self, id: EmitterId) -> Result<()> {
        match self.emitters.remove(&id) {
            Some(_) => Ok(()),
            None => Err(SonorayError::UnknownEmitter(id)),
        }
    }

    pub fn set_emitter_position(&mut self, id: EmitterId, position: Vec3) -> Result<()> {
        self.emitter_mut(id)?.position = position;
        Ok(())
    }

    /// Virtual emitters are culled from playback and cast no rays.
    pub fn set_emitter_virtual(&mut self, id: EmitterId, is_virtual: bool) -> Result<()> {
        self.emitter_mut(id)?.is_virtual = is_virtual;
        Ok(())
    }

    /// Reconfigures an emitter's occlusion quality. Disabling releases any
    /// in-flight batch; the value is then re-seeded with a synchronous
    /// center ray (or forced to 0 while occlusion cannot run).
    pub fn set_occlusion_quality(&mut self, id: EmitterId, quality: OcclusionQuality) -> Result<()> {
        let ctx = TickContext {
            config: &self.config,
            grids: &self.grids,
            listener_position: self.listener.position,
            caster: self.caster.as_ref(),
            surfaces: self.surfaces.as_ref(),
            completions: &self.completion_sender,
            rays_enabled: self.rays_enabled,
        };

        let emitter = self
            .emitters
            .get_mut(&id)
            .ok_or(SonorayError::UnknownEmitter(id))?;

        emitter.propagation.set_quality(quality);

        if !quality.is_enabled() {
            emitter.propagation.release_pending_rays();
        }

        emitter
            .propagation
            .refresh_immediate(emitter.position, emitter.is_virtual, &ctx);
        Ok(())
    }

    /// One simulation tick: drains the completion queue, then runs every
    /// emitter's propagation pass.
    pub fn update(&mut self) {
        self.drain_completions();

        let ctx = TickContext {
            config: &self.config,
            grids: &self.grids,
            listener_position: self.listener.position,
            caster: self.caster.as_ref(),
            surfaces: self.surfaces.as_ref(),
            completions: &self.completion_sender,
            rays_enabled: self.rays_enabled,
        };

        for (id, emitter) in self.emitters.iter_mut() {
            emitter
                .propagation
                .update(*id, emitter.position, emitter.is_virtual, &ctx);
        }
    }

    /// The published occlusion value for an emitter, in [0, 1].
    pub fn occlusion(&self, id: EmitterId) -> Option<f32> {
        self.emitters.get(&id).map(|e| e.propagation.occlusion())
    }

    /// True when the emitter's occlusion moved more than epsilon since the
    /// last query; latches the queried value.
    pub fn has_new_occlusion(&mut self, id: EmitterId) -> bool {
        self.emitters
            .get_mut(&id)
            .is_some_and(|e| e.propagation.has_new_occlusion())
    }

    /// Collects every emitter whose occlusion moved since its last query,
    /// for the downstream attenuation system.
    pub fn drain_changed_occlusion(&mut self) -> Vec<(EmitterId, f32)> {
        let mut changed = Vec::new();

        for (id, emitter) in self.emitters.iter_mut() {
            if emitter.propagation.has_new_occlusion() {
                changed.push((*id, emitter.propagation.occlusion()));
            }
        }

        changed
    }

    pub fn set_listener_pose(&mut self, pose: Pose) {
        self.listener = pose;
    }

    pub fn listener_pose(&self) -> Pose {
        self.listener
    }

    /// Gates all ray casting, e.g. while the physics backend is not ready.
    pub fn set_rays_enabled(&mut self, enabled: bool) {
        self.rays_enabled = enabled;
    }

    /// Applies a new configuration, rebuilding the sample grids on a
    /// head-size change. A rejected configuration leaves the old one
    /// active.
    pub fn set_config(&mut self, config: OcclusionConfig) -> Result<()> {
        if let Err(err) = config.validate() {
            log::error!("rejecting occlusion config update: {err}");
            return Err(err);
        }

        self.grids.rebuild(config.listener_plane_size);
        self.config = config;
        Ok(())
    }

    pub fn config(&self) -> &OcclusionConfig {
        &self.config
    }

    pub fn grids(&self) -> &SampleGrids {
        &self.grids
    }

    /// Sender side of the completion queue, for ray services that deliver
    /// results out of band.
    pub fn completion_sender(&self) -> Sender<RayCompletion> {
        self.completion_sender.clone()
    }

    pub fn emitter_count(&self) -> usize {
        self.emitters.len()
    }

    /// Folds every queued ray completion into its owning emitter's batch.
    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completion_receiver.try_recv() {
            let ticket = completion.ticket;

            if ticket.slot >= MAX_CONCURRENT_RAYS {
                log::error!(
                    "dropping ray completion with invalid slot {} for {}",
                    ticket.slot,
                    ticket.emitter
                );
                continue;
            }

            let Some(emitter) = self.emitters.get_mut(&ticket.emitter) else {
                log::debug!("dropping ray completion for destroyed emitter {}", ticket.emitter);
                continue;
            };

            if emitter.propagation.generation() != ticket.generation {
                log::debug!("dropping stale ray completion for {}", ticket.emitter);
                continue;
            }

            emitter.propagation.complete_ray(
                ticket.slot,
                &completion.hits,
                &self.config,
                self.surfaces.as_ref(),
            );
        }
    }

    fn context(&self) -> TickContext<'_> {
        TickContext {
            config: &self.config,
            grids: &self.grids,
            listener_position: self.listener.position,
            caster: self.caster.as_ref(),
            surfaces: self.surfaces.as_ref(),
            completions: &self.completion_sender,
            rays_enabled: self.rays_enabled,
        }
    }

    fn emitter_mut(&mut self, id: EmitterId) -> Result<&mut Emitter> {
        self.emitters
            .get_mut(&id)
            .ok_or(SonorayError::UnknownEmitter(id))
    }
}
