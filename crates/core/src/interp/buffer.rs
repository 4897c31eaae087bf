use glam::Vec2;

use crate::net::{EntityFlags, RawEntityState};

use super::InterpolatorConfig;

/// Shortest-arc angle interpolation; `t` past 1.0 extrapolates along the
/// same arc.
fn lerp_angle(from: f32, to: f32, t: f32) -> f32 {
    let mut diff = (to - from) % std::f32::consts::TAU;
    if diff > std::f32::consts::PI {
        diff -= std::f32::consts::TAU;
    } else if diff < -std::f32::consts::PI {
        diff += std::f32::consts::TAU;
    }
    from + diff * t
}

/// Visual state of one entity at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntityPose {
    pub position: Vec2,
    pub rotation: f32,
    pub flags: EntityFlags,
}

impl Default for EntityPose {
    fn default() -> Self {
        Self {
            position: Vec2::ZERO,
            rotation: 0.0,
            flags: EntityFlags::empty(),
        }
    }
}

impl EntityPose {
    pub fn from_wire(state: &RawEntityState) -> Self {
        Self {
            position: Vec2::from(state.position),
            rotation: state.rotation,
            flags: state.decode_flags(),
        }
    }

    pub fn to_wire(&self) -> RawEntityState {
        RawEntityState::new(self.position.into(), self.rotation, self.flags)
    }

    /// Position and rotation blend continuously; discrete flags snap to
    /// whichever frame is nearer.
    fn lerp(&self, other: &Self, t: f32) -> Self {
        Self {
            position: self.position.lerp(other.position, t),
            rotation: lerp_angle(self.rotation, other.rotation, t),
            flags: if t < 0.5 { self.flags } else { other.flags },
        }
    }
}

/// Derived per-frame state. Recomputed every tick, read-only to consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct InterpolatedState {
    pub pose: EntityPose,
    pub time_since_update: f32,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy)]
struct LerpFrame {
    timestamp: f32,
    pose: EntityPose,
}

/// Double buffer of the two most recent raw samples for one entity.
/// `newer.timestamp >= older.timestamp` always; samples older than the
/// stored newer frame are dropped, which guards against duplicated and
/// reordered delivery.
#[derive(Debug, Default)]
pub struct EntityStateBuffer {
    update_counter: f32,
    time_counter: f32,
    older: Option<LerpFrame>,
    newer: Option<LerpFrame>,
    interpolated: InterpolatedState,
}

impl EntityStateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts a fresh raw sample; returns false when the sample is a
    /// duplicate or arrived out of order and was discarded.
    pub fn push_sample(&mut self, pose: EntityPose, update_counter: f32) -> bool {
        if let Some(newer) = &self.newer {
            if update_counter <= newer.timestamp {
                return false;
            }
        }

        let first_sample = self.newer.is_none();
        self.older = self.newer;
        self.newer = Some(LerpFrame {
            timestamp: update_counter,
            pose,
        });
        self.update_counter = update_counter;
        self.time_counter = 0.0;

        // The very first sample shows through immediately instead of
        // waiting for the next tick.
        if first_sample {
            self.interpolated.pose = pose;
        }
        true
    }

    /// Advances the elapsed-time counter and recomputes the interpolated
    /// state.
    pub fn advance(&mut self, dt: f32, config: &InterpolatorConfig) {
        self.time_counter += dt;

        let Some(newer) = &self.newer else {
            // Never seeded; nothing to show yet.
            self.interpolated.time_since_update = self.time_counter;
            return;
        };

        let expected = config.expected_delta.max(f32::EPSILON);
        let overshoot_limit = 1.0 + config.extrapolation_allowance;

        let pose = if config.realtime {
            newer.pose
        } else {
            match &self.older {
                // A single sample is held verbatim until a second arrives.
                None => newer.pose,
                Some(older) => {
                    let t = self.time_counter / expected;
                    let t = if config.platformer {
                        // Snappy motion: no extrapolation, quadratic ease-out.
                        let t = t.min(1.0);
                        1.0 - (1.0 - t) * (1.0 - t)
                    } else {
                        // Bounded extrapolation hides a late packet; past the
                        // allowance the pose freezes instead of diverging.
                        t.min(overshoot_limit)
                    };
                    older.pose.lerp(&newer.pose, t)
                }
            }
        };

        self.interpolated = InterpolatedState {
            pose,
            time_since_update: self.time_counter,
            stale: self.time_counter > expected * overshoot_limit,
        };
    }

    pub fn state(&self) -> &InterpolatedState {
        &self.interpolated
    }

    /// Timestamp of the most recently accepted sample.
    pub fn update_counter(&self) -> f32 {
        self.update_counter
    }

    pub fn has_older_frame(&self) -> bool {
        self.older.is_some()
    }

    pub fn is_seeded(&self) -> bool {
        self.newer.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_at(x: f32) -> EntityPose {
        EntityPose {
            position: Vec2::new(x, 0.0),
            rotation: 0.0,
            flags: EntityFlags::empty(),
        }
    }

    fn config() -> InterpolatorConfig {
        InterpolatorConfig {
            expected_delta: 0.1,
            ..Default::default()
        }
    }

    #[test]
    fn test_out_of_order_sample_discarded() {
        let mut buffer = EntityStateBuffer::new();

        assert!(buffer.push_sample(pose_at(10.0), 10.0));
        assert!(!buffer.push_sample(pose_at(5.0), 5.0));
        assert!(!buffer.push_sample(pose_at(7.0), 10.0));

        assert_eq!(buffer.update_counter(), 10.0);
        assert!(!buffer.has_older_frame());
    }

    #[test]
    fn test_single_sample_held_verbatim() {
        let mut buffer = EntityStateBuffer::new();
        assert!(!buffer.is_seeded());
        buffer.push_sample(pose_at(3.0), 1.0);
        assert!(buffer.is_seeded());

        buffer.advance(0.0, &config());
        assert_eq!(buffer.state().pose.position.x, 3.0);
        assert!(!buffer.has_older_frame());

        // Still held after a long drought.
        buffer.advance(10.0, &config());
        assert_eq!(buffer.state().pose.position.x, 3.0);
    }

    #[test]
    fn test_blend_converges_from_older_to_newer() {
        let cfg = config();
        let mut buffer = EntityStateBuffer::new();
        buffer.push_sample(pose_at(0.0), 1.0);
        buffer.push_sample(pose_at(10.0), 2.0);

        buffer.advance(0.0, &cfg);
        assert!(buffer.state().pose.position.x.abs() < 1e-4);

        buffer.advance(cfg.expected_delta / 2.0, &cfg);
        assert!((buffer.state().pose.position.x - 5.0).abs() < 1e-3);

        let mut buffer = EntityStateBuffer::new();
        buffer.push_sample(pose_at(0.0), 1.0);
        buffer.push_sample(pose_at(10.0), 2.0);
        buffer.advance(cfg.expected_delta, &cfg);
        assert!((buffer.state().pose.position.x - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_extrapolation_freezes_after_allowance() {
        let cfg = config();
        let mut buffer = EntityStateBuffer::new();
        buffer.push_sample(pose_at(0.0), 1.0);
        buffer.push_sample(pose_at(10.0), 2.0);

        // Way past the newer frame; pose must stop at the allowance bound.
        buffer.advance(cfg.expected_delta * 50.0, &cfg);
        let frozen = buffer.state().pose.position.x;
        assert!((frozen - 10.0 * (1.0 + cfg.extrapolation_allowance)).abs() < 1e-3);
        assert!(buffer.state().stale);

        // Further ticks do not move it.
        buffer.advance(cfg.expected_delta, &cfg);
        assert_eq!(buffer.state().pose.position.x, frozen);
    }

    #[test]
    fn test_platformer_mode_never_overshoots() {
        let cfg = InterpolatorConfig {
            platformer: true,
            expected_delta: 0.1,
            ..Default::default()
        };
        let mut buffer = EntityStateBuffer::new();
        buffer.push_sample(pose_at(0.0), 1.0);
        buffer.push_sample(pose_at(10.0), 2.0);

        buffer.advance(cfg.expected_delta * 3.0, &cfg);
        assert!((buffer.state().pose.position.x - 10.0).abs() < 1e-3);
    }

    #[test]
    fn test_realtime_snaps_to_newest() {
        let cfg = InterpolatorConfig {
            realtime: true,
            expected_delta: 0.1,
            ..Default::default()
        };
        let mut buffer = EntityStateBuffer::new();
        buffer.push_sample(pose_at(0.0), 1.0);
        buffer.push_sample(pose_at(10.0), 2.0);

        buffer.advance(0.001, &cfg);
        assert_eq!(buffer.state().pose.position.x, 10.0);
    }

    #[test]
    fn test_flags_snap_to_nearer_frame() {
        let cfg = config();
        let mut buffer = EntityStateBuffer::new();
        buffer.push_sample(
            EntityPose {
                flags: EntityFlags::JUMP_HELD,
                ..pose_at(0.0)
            },
            1.0,
        );
        buffer.push_sample(
            EntityPose {
                flags: EntityFlags::DASHING,
                ..pose_at(10.0)
            },
            2.0,
        );

        buffer.advance(cfg.expected_delta * 0.25, &cfg);
        assert_eq!(buffer.state().pose.flags, EntityFlags::JUMP_HELD);

        buffer.advance(cfg.expected_delta * 0.5, &cfg);
        assert_eq!(buffer.state().pose.flags, EntityFlags::DASHING);
    }

    #[test]
    fn test_rotation_takes_shortest_arc() {
        let wrapped = lerp_angle(0.1, std::f32::consts::TAU - 0.1, 0.5);
        assert!(wrapped.abs() < 1e-4);
    }
}
