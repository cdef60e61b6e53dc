// Simulated platform: a virtual step clock plus recorded step pulses

use crate::config::Config;
use toccata_motion::platform::{EndstopHit, MoveRequest, MoveSource, Platform, ReplyChannel};
use toccata_motion::{AXES, DRIVES};

/// A software stand-in for the machine platform. Steps are accumulated into
/// signed per-drive counters and the step clock is advanced by the driver
/// loop rather than by hardware.
pub struct SimPlatform {
    config: Config,
    clock: u32,
    directions: [bool; DRIVES],
    pub step_counts: [i64; DRIVES],
    pub total_pulses: u64,
    pub endstops: [EndstopHit; DRIVES],
    pub homed: [bool; AXES],
    pub idle: [bool; DRIVES],
}

impl SimPlatform {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: 0,
            directions: [true; DRIVES],
            step_counts: [0; DRIVES],
            total_pulses: 0,
            endstops: [EndstopHit::None; DRIVES],
            homed: [false; AXES],
            idle: [false; DRIVES],
        }
    }

    pub fn advance_clock(&mut self, to: u32) {
        self.clock = to;
    }

    /// Per-drive positions in machine units, from the step counters.
    pub fn positions(&self) -> [f32; DRIVES] {
        let mut positions = [0.0f32; DRIVES];
        for drive in 0..DRIVES {
            positions[drive] = self.step_counts[drive] as f32 / self.config.steps_per_unit[drive];
        }
        positions
    }
}

impl Platform for SimPlatform {
    fn drive_steps_per_unit(&self, drive: usize) -> f32 {
        self.config.steps_per_unit[drive]
    }

    fn axis_minimum(&self, axis: usize) -> f32 {
        self.config.axis_minimum[axis]
    }

    fn axis_maximum(&self, axis: usize) -> f32 {
        self.config.axis_maximum[axis]
    }

    fn home_feed_rate(&self, drive: usize) -> f32 {
        self.config.home_feed_rate[drive]
    }

    fn acceleration(&self, drive: usize) -> f32 {
        self.config.acceleration[drive]
    }

    fn max_feed_rate(&self, drive: usize) -> f32 {
        self.config.max_feed_rate[drive]
    }

    fn instant_dv(&self, drive: usize) -> f32 {
        self.config.instant_dv[drive]
    }

    fn z_probe_stop_height(&self) -> f32 {
        0.0
    }

    fn step_clock(&self) -> u32 {
        self.clock
    }

    fn set_direction(&mut self, drive: usize, forward: bool) {
        self.directions[drive] = forward;
    }

    fn step(&mut self, drive: usize) {
        self.step_counts[drive] += if self.directions[drive] { 1 } else { -1 };
        self.total_pulses += 1;
        self.idle[drive] = false;
    }

    fn endstop_hit(&self, drive: usize) -> EndstopHit {
        self.endstops[drive]
    }

    fn set_drive_idle(&mut self, drive: usize) {
        self.idle[drive] = true;
    }

    fn set_axis_homed(&mut self, axis: usize) {
        if axis < AXES {
            self.homed[axis] = true;
        }
    }

    fn disable_interrupts(&mut self) {}

    fn enable_interrupts(&mut self) {}
}

/// Move source backed by a pre-parsed list of requests.
pub struct VecMoveSource {
    moves: std::collections::VecDeque<MoveRequest>,
}

impl VecMoveSource {
    pub fn new(moves: Vec<MoveRequest>) -> Self {
        Self {
            moves: moves.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }
}

impl MoveSource for VecMoveSource {
    fn read_move(&mut self) -> Option<MoveRequest> {
        self.moves.pop_front()
    }
}

/// Reply channel that collects everything the motion core says.
#[derive(Default)]
pub struct CollectedReplies {
    pub messages: Vec<String>,
}

impl ReplyChannel for CollectedReplies {
    fn handle_reply(&mut self, reply: &str) {
        self.messages.push(reply.to_string());
    }
}
