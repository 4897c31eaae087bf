//! Remote-entity interpolation.
//!
//! Converts sparse, jittery network samples into a continuous pose per
//! entity, sampled once per render frame. Touched only by the consumer
//! thread; the network threads hand samples over through the session's
//! dispatch queue, so nothing in here needs a lock.

mod buffer;

use std::collections::HashMap;

pub use buffer::{EntityPose, EntityStateBuffer, InterpolatedState};

#[derive(Debug, Clone)]
pub struct InterpolatorConfig {
    /// Disable blending entirely; the pose snaps to the newest raw sample.
    pub realtime: bool,
    /// Clamp at the newest sample and ease out instead of extrapolating.
    pub platformer: bool,
    /// Expected interval between server updates, in seconds.
    pub expected_delta: f32,
    /// How far past the newest sample blending may extrapolate, as a
    /// fraction of `expected_delta`, before the pose freezes.
    pub extrapolation_allowance: f32,
}

impl Default for InterpolatorConfig {
    fn default() -> Self {
        Self {
            realtime: false,
            platformer: false,
            expected_delta: 1.0 / 20.0,
            extrapolation_allowance: 0.25,
        }
    }
}

/// Owns one [`EntityStateBuffer`] per tracked remote entity and fans out
/// add/update/remove/tick operations.
#[derive(Debug, Default)]
pub struct InterpolationEngine {
    entities: HashMap<u32, EntityStateBuffer>,
    config: InterpolatorConfig,
}

impl InterpolationEngine {
    pub fn new(config: InterpolatorConfig) -> Self {
        Self {
            entities: HashMap::new(),
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(InterpolatorConfig::default())
    }

    /// Starts tracking an entity. Re-adding an existing id resets its
    /// buffer to a fresh, un-seeded state.
    pub fn add_entity(&mut self, entity_id: u32) {
        self.entities.insert(entity_id, EntityStateBuffer::new());
    }

    pub fn remove_entity(&mut self, entity_id: u32) -> bool {
        self.entities.remove(&entity_id).is_some()
    }

    /// Feeds a fresh network sample. Duplicate or out-of-order samples are
    /// routine jitter and are dropped silently; updates for ids that were
    /// never added (or already removed) are ignored.
    pub fn update_entity(&mut self, entity_id: u32, pose: EntityPose, update_counter: f32) {
        match self.entities.get_mut(&entity_id) {
            Some(buffer) => {
                if !buffer.push_sample(pose, update_counter) {
                    log::trace!("discarding stale update for entity {entity_id}");
                }
            }
            None => log::debug!("update for unregistered entity {entity_id}"),
        }
    }

    /// Advances every buffer by `dt` seconds and recomputes the
    /// interpolated states. `dt` of zero or less is a no-op.
    pub fn tick(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        for buffer in self.entities.values_mut() {
            buffer.advance(dt, &self.config);
        }
    }

    pub fn get_pose(&self, entity_id: u32) -> Option<&InterpolatedState> {
        self.entities.get(&entity_id).map(EntityStateBuffer::state)
    }

    /// True when the entity's most recent accepted update no longer matches
    /// the given server packet time, meaning the server has stopped
    /// reporting it.
    pub fn is_stale(&self, entity_id: u32, last_server_packet: f32) -> bool {
        match self.entities.get(&entity_id) {
            Some(buffer) => buffer.update_counter() != last_server_packet,
            None => true,
        }
    }

    pub fn config(&self) -> &InterpolatorConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Drops every buffer, e.g. on disconnect.
    pub fn clear(&mut self) {
        self.entities.clear();
    }
}
