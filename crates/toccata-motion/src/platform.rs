// Seams between the motion core and the rest of the firmware

/// Number of Cartesian axes.
pub const AXES: usize = 3;

/// Number of driven motors: the three axes plus one extruder.
pub const DRIVES: usize = 4;

pub const X_AXIS: usize = 0;
pub const Y_AXIS: usize = 1;
pub const Z_AXIS: usize = 2;

/// Step-clock ticks per second. All move timings are expressed in these
/// ticks; the prepare-ahead horizon is `STEP_CLOCK_RATE / 8`.
pub const STEP_CLOCK_RATE: u32 = 100_000;

/// State of an endstop switch as sampled by the step interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndstopHit {
    None,
    Low,
    High,
}

/// One decoded motion command pulled from the G-code source.
///
/// `values` holds the per-drive target position in machine units (axes) or
/// extrusion delta (extruders), followed by the requested feed rate in
/// units/min. `move_type` selects how much transformation is applied:
/// 0 = bed+axis compensation and motor mapping, 1 = mapped but uncompensated
/// (unmapped on a delta), 2 = raw motor coordinates.
#[derive(Debug, Clone, Copy)]
pub struct MoveRequest {
    pub values: [f32; DRIVES + 1],
    pub endstops: u8,
    pub move_type: u8,
    pub file_position: Option<u64>,
}

/// Pull interface to the G-code source.
pub trait MoveSource {
    fn read_move(&mut self) -> Option<MoveRequest>;
}

/// Push interface to the response channel (acks, warnings, errors).
pub trait ReplyChannel {
    fn handle_reply(&mut self, reply: &str);
}

/// The physical platform abstraction consumed by the motion core.
///
/// The step interrupt calls `set_direction`, `step` and `endstop_hit` only;
/// those implementations must be wait-free. `disable_interrupts` /
/// `enable_interrupts` bracket the short critical sections the ring uses
/// when handing a move to the interrupt or reading the live coordinates.
pub trait Platform {
    fn drive_steps_per_unit(&self, drive: usize) -> f32;
    fn axis_minimum(&self, axis: usize) -> f32;
    fn axis_maximum(&self, axis: usize) -> f32;

    /// Homing feed rate for a drive, in units/s.
    fn home_feed_rate(&self, drive: usize) -> f32;
    /// Acceleration budget for a drive, in units/s².
    fn acceleration(&self, drive: usize) -> f32;
    /// Speed ceiling for a drive, in units/s.
    fn max_feed_rate(&self, drive: usize) -> f32;
    /// Speed change a drive can make instantaneously without losing steps.
    fn instant_dv(&self, drive: usize) -> f32;
    /// Height at which the Z probe stops a diving Z move.
    fn z_probe_stop_height(&self) -> f32;

    /// The drive with the lowest homing feed rate.
    fn slowest_drive(&self) -> usize {
        let mut slowest = 0;
        for drive in 1..DRIVES {
            if self.home_feed_rate(drive) < self.home_feed_rate(slowest) {
                slowest = drive;
            }
        }
        slowest
    }

    /// Free-running 32-bit step-clock counter.
    fn step_clock(&self) -> u32;

    fn set_direction(&mut self, drive: usize, forward: bool);
    fn step(&mut self, drive: usize);
    fn endstop_hit(&self, drive: usize) -> EndstopHit;

    fn set_drive_idle(&mut self, drive: usize);
    fn set_axis_homed(&mut self, axis: usize);

    fn disable_interrupts(&mut self);
    fn enable_interrupts(&mut self);
}
