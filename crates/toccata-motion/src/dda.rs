// One queued move: endpoints, prepared velocity profile, and the per-drive
// step generator state driven by the step interrupt

use crate::kinematics::{motor_end_point, Geometry, GeometryError};
use crate::platform::{MoveRequest, Platform, AXES, DRIVES, STEP_CLOCK_RATE};

/// Permissible position error at a junction between two moves, in mm.
const JUNCTION_DEVIATION: f32 = 0.05;

/// Below this speed a move can always stop without losing steps.
const MINIMUM_SPEED: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdaState {
    Empty,
    Provisional,
    Frozen,
    Executing,
    Completed,
}

/// Step generator state for one drive within a move.
#[derive(Debug, Clone, Copy, Default)]
struct DriveMovement {
    total_steps: u32,
    next_step: u32,
    forward: bool,
    stopped: bool,
    /// Move distance advanced by one step of this drive.
    move_mm_per_step: f32,
    /// Clocks from move start at which `next_step` is due.
    next_step_time: u32,
}

/// What the step interrupt should do next for the executing move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Re-arm the timer for this step-clock time.
    Due(u32),
    /// An armed endstop fired on this drive; the ring must clamp the
    /// endpoint before stepping continues.
    Hit(usize),
    /// All drives have finished stepping.
    Completed,
}

/// A single queued move descriptor.
pub struct Dda {
    state: DdaState,
    /// Machine coordinates per drive at the end of the move (axes hold the
    /// Cartesian position, extruders the accumulated extrusion).
    end_coordinates: [f32; DRIVES],
    /// Motor step positions per drive at the end of the move.
    end_points: [i32; DRIVES],
    /// Whether `end_coordinates` is a faithful Cartesian position (false
    /// after a raw motor move or an endstop clamp).
    end_coords_valid: bool,
    endstops_to_check: u8,
    file_position: Option<u64>,
    can_pause: bool,

    requested_speed: f32,
    start_speed: f32,
    end_speed: f32,
    top_speed: f32,
    acceleration: f32,
    instant_dv: f32,
    total_distance: f32,
    direction_vector: [f32; DRIVES],

    // Prepared profile
    accel_distance: f32,
    decel_distance: f32,
    accel_time: f32,
    cruise_time: f32,
    accel_steps: u32,
    decel_steps: u32,
    clocks_needed: u32,
    start_time: u32,

    drives: [DriveMovement; DRIVES],
}

impl Default for Dda {
    fn default() -> Self {
        Self::new()
    }
}

impl Dda {
    pub fn new() -> Self {
        Self {
            state: DdaState::Empty,
            end_coordinates: [0.0; DRIVES],
            end_points: [0; DRIVES],
            end_coords_valid: true,
            endstops_to_check: 0,
            file_position: None,
            can_pause: true,
            requested_speed: 0.0,
            start_speed: 0.0,
            end_speed: 0.0,
            top_speed: 0.0,
            acceleration: 0.0,
            instant_dv: 0.0,
            total_distance: 0.0,
            direction_vector: [0.0; DRIVES],
            accel_distance: 0.0,
            decel_distance: 0.0,
            accel_time: 0.0,
            cruise_time: 0.0,
            accel_steps: 0,
            decel_steps: 0,
            clocks_needed: 0,
            start_time: 0,
            drives: [DriveMovement::default(); DRIVES],
        }
    }

    pub fn state(&self) -> DdaState {
        self.state
    }

    pub fn release(&mut self) {
        self.state = DdaState::Empty;
    }

    pub fn can_pause(&self) -> bool {
        self.can_pause
    }

    pub fn file_position(&self) -> Option<u64> {
        self.file_position
    }

    pub fn requested_speed(&self) -> f32 {
        self.requested_speed
    }

    pub fn end_coordinate(&self, drive: usize) -> f32 {
        self.end_coordinates[drive]
    }

    pub fn end_coordinates_valid(&self) -> bool {
        self.end_coords_valid
    }

    pub fn end_points(&self) -> &[i32; DRIVES] {
        &self.end_points
    }

    pub fn end_coordinates(&self) -> &[f32; DRIVES] {
        &self.end_coordinates
    }

    pub fn direction_vector(&self) -> &[f32; DRIVES] {
        &self.direction_vector
    }

    /// Overwrite one drive's motor endpoint. Used when seeding the ring and
    /// when an endstop clamps a move.
    pub fn set_drive_coordinate(&mut self, drive: usize, endpoint: i32) {
        self.end_points[drive] = endpoint;
        self.end_coords_valid = false;
    }

    /// Seed the endpoints of an empty slot so the next admitted move chains
    /// from the given position.
    pub fn set_positions(&mut self, coordinates: &[f32; DRIVES], end_points: &[i32; DRIVES]) {
        self.end_coordinates = *coordinates;
        self.end_points = *end_points;
        self.end_coords_valid = true;
    }

    pub fn set_feed_rate(&mut self, feed_rate: f32) {
        self.requested_speed = feed_rate;
    }

    /// Admit a move into this (empty) slot, chaining from the previous
    /// slot's endpoints. `values` carries per-drive targets (axes) or deltas
    /// (extruders) plus the feed rate in units/min; with `do_motor_mapping`
    /// unset the axis values are raw motor coordinates. Returns false when
    /// the request produces no motor movement.
    pub fn admit(
        &mut self,
        platform: &impl Platform,
        geometry: &Geometry,
        prev_coordinates: &[f32; DRIVES],
        prev_end_points: &[i32; DRIVES],
        request: &MoveRequest,
        do_motor_mapping: bool,
    ) -> Result<bool, GeometryError> {
        debug_assert_eq!(self.state, DdaState::Empty);

        let mut steps_per_unit = [0.0f32; DRIVES];
        for (drive, spu) in steps_per_unit.iter_mut().enumerate() {
            *spu = platform.drive_steps_per_unit(drive);
        }

        if do_motor_mapping {
            let mut machine = [0.0f32; AXES];
            machine.copy_from_slice(&request.values[..AXES]);
            let motors = geometry.motor_from_machine(&machine, &steps_per_unit)?;
            self.end_points[..AXES].copy_from_slice(&motors);
            self.end_coordinates[..AXES].copy_from_slice(&machine);
            self.end_coords_valid = true;
        } else {
            for axis in 0..AXES {
                self.end_points[axis] = motor_end_point(request.values[axis], steps_per_unit[axis]);
                self.end_coordinates[axis] = request.values[axis];
            }
            self.end_coords_valid = false;
        }

        // Extruder values are relative.
        for drive in AXES..DRIVES {
            self.end_coordinates[drive] = prev_coordinates[drive] + request.values[drive];
            self.end_points[drive] =
                prev_end_points[drive] + motor_end_point(request.values[drive], steps_per_unit[drive]);
        }

        let mut real_move = false;
        let mut axes_moving = false;
        let mut axis_distance_sq = 0.0f32;
        let mut deltas = [0.0f32; DRIVES];
        for drive in 0..DRIVES {
            let step_delta = self.end_points[drive] - prev_end_points[drive];
            if step_delta != 0 {
                real_move = true;
                if drive < AXES {
                    axes_moving = true;
                }
            }
            deltas[drive] = if drive < AXES {
                let d = self.end_coordinates[drive] - prev_coordinates[drive];
                axis_distance_sq += d * d;
                d
            } else {
                request.values[drive]
            };
            self.drives[drive].forward = step_delta >= 0;
            self.drives[drive].total_steps = step_delta.unsigned_abs();
        }

        if !real_move {
            return Ok(false);
        }

        self.total_distance = if axes_moving {
            axis_distance_sq.sqrt()
        } else {
            deltas[AXES..].iter().map(|d| d * d).sum::<f32>().sqrt()
        };
        for drive in 0..DRIVES {
            self.direction_vector[drive] = deltas[drive] / self.total_distance;
        }

        // Clamp the requested speed and acceleration to every moving
        // drive's limits.
        let mut speed = (request.values[DRIVES] / 60.0).max(MINIMUM_SPEED);
        let mut acceleration = f32::INFINITY;
        let mut instant_dv = f32::INFINITY;
        for drive in 0..DRIVES {
            let fraction = self.direction_vector[drive].abs();
            if fraction > 0.0 {
                speed = speed.min(platform.max_feed_rate(drive) / fraction);
                acceleration = acceleration.min(platform.acceleration(drive) / fraction);
                instant_dv = instant_dv.min(platform.instant_dv(drive) / fraction);
            }
        }
        self.requested_speed = speed;
        self.acceleration = acceleration;
        self.instant_dv = instant_dv;
        self.start_speed = instant_dv.min(speed);
        self.end_speed = instant_dv.min(speed);
        self.can_pause = true;

        self.endstops_to_check = request.endstops;
        self.file_position = request.file_position;
        self.state = DdaState::Provisional;
        Ok(true)
    }

    /// Maximum safe speed at the junction from `self` into `next`, from the
    /// junction-deviation model with a bounded acceleration budget.
    pub fn junction_speed(&self, next: &Dda) -> f32 {
        let mut dot = 0.0f32;
        for drive in 0..DRIVES {
            dot += self.direction_vector[drive] * next.direction_vector[drive];
        }
        let angle = dot.clamp(-1.0, 1.0).acos();
        let limit = if angle < 0.01 {
            f32::INFINITY
        } else {
            let accel = self.acceleration.min(next.acceleration);
            (accel * JUNCTION_DEVIATION * (angle / 2.0).tan()).sqrt()
        };
        limit
            .min(self.requested_speed)
            .min(next.requested_speed)
            .max(self.instant_dv.min(next.instant_dv))
    }

    /// Set the exit speed while still provisional; look-ahead uses this to
    /// smooth junctions.
    pub fn set_end_speed(&mut self, speed: f32) {
        debug_assert_eq!(self.state, DdaState::Provisional);
        self.end_speed = speed;
    }

    pub fn set_start_speed(&mut self, speed: f32) {
        debug_assert_eq!(self.state, DdaState::Provisional);
        self.start_speed = speed;
    }

    /// Compute the velocity profile and per-drive step schedules, then
    /// freeze. Idempotent once frozen.
    pub fn prepare(&mut self) {
        if self.state != DdaState::Provisional {
            return;
        }

        let a = self.acceleration;
        let d = self.total_distance;

        // The exit speed must be reachable from the entry speed.
        let reachable = (self.start_speed * self.start_speed + 2.0 * a * d).sqrt();
        self.end_speed = self.end_speed.min(reachable);

        let mut top = self.requested_speed.max(self.start_speed).max(self.end_speed);
        let mut accel_distance =
            (top * top - self.start_speed * self.start_speed) / (2.0 * a);
        let mut decel_distance = (top * top - self.end_speed * self.end_speed) / (2.0 * a);
        if accel_distance + decel_distance > d {
            // No room to cruise: peak where the accel and decel ramps meet.
            top = ((2.0 * a * d
                + self.start_speed * self.start_speed
                + self.end_speed * self.end_speed)
                / 2.0)
                .sqrt()
                .max(self.start_speed)
                .max(self.end_speed);
            accel_distance = ((top * top - self.start_speed * self.start_speed) / (2.0 * a))
                .clamp(0.0, d);
            decel_distance =
                ((top * top - self.end_speed * self.end_speed) / (2.0 * a)).clamp(0.0, d - accel_distance);
        }
        self.top_speed = top;
        self.accel_distance = accel_distance;
        self.decel_distance = decel_distance;

        self.accel_time = (top - self.start_speed) / a;
        let cruise_distance = (d - accel_distance - decel_distance).max(0.0);
        self.cruise_time = cruise_distance / top;
        let decel_time = (top - self.end_speed) / a;
        self.clocks_needed = ((self.accel_time + self.cruise_time + decel_time)
            * STEP_CLOCK_RATE as f32) as u32;

        // Phase step counts, measured on the drive with the most steps.
        let mut dominant = 0;
        for drive in 1..DRIVES {
            if self.drives[drive].total_steps > self.drives[dominant].total_steps {
                dominant = drive;
            }
        }

        for drive in 0..DRIVES {
            let dm = &mut self.drives[drive];
            dm.next_step = 0;
            dm.stopped = false;
            if dm.total_steps > 0 {
                dm.move_mm_per_step = d / dm.total_steps as f32;
            }
        }
        if self.drives[dominant].total_steps > 0 {
            let mmps = self.drives[dominant].move_mm_per_step;
            self.accel_steps =
                ((accel_distance / mmps) as u32).min(self.drives[dominant].total_steps);
            self.decel_steps = ((decel_distance / mmps) as u32)
                .min(self.drives[dominant].total_steps - self.accel_steps);
        }

        // A move we can pause after is one that ends slowly enough to stop
        // without missing steps.
        self.can_pause = self.end_speed <= self.instant_dv + 0.01;

        for drive in 0..DRIVES {
            if self.drives[drive].total_steps > 0 {
                self.drives[drive].next_step = 1;
                self.drives[drive].next_step_time = self.step_time_clocks(drive, 1);
            }
        }

        self.state = DdaState::Frozen;
    }

    /// Clocks from move start at which step number `step` of `drive` is due.
    fn step_time_clocks(&self, drive: usize, step: u32) -> u32 {
        let x = step as f32 * self.drives[drive].move_mm_per_step;
        let a = self.acceleration;
        let seconds = if x < self.accel_distance {
            ((self.start_speed * self.start_speed + 2.0 * a * x).sqrt() - self.start_speed) / a
        } else if x <= self.total_distance - self.decel_distance {
            self.accel_time + (x - self.accel_distance) / self.top_speed
        } else {
            let into_decel = x - (self.total_distance - self.decel_distance);
            let v_sq = self.top_speed * self.top_speed - 2.0 * a * into_decel;
            self.accel_time + self.cruise_time + (self.top_speed - v_sq.max(0.0).sqrt()) / a
        };
        (seconds * STEP_CLOCK_RATE as f32) as u32
    }

    /// Begin executing, with the move clock starting at `start_time`.
    /// Returns true when a step deadline is pending.
    pub fn start(&mut self, start_time: u32) -> bool {
        debug_assert_eq!(self.state, DdaState::Frozen);
        self.state = DdaState::Executing;
        self.start_time = start_time;
        self.drives.iter().any(|dm| dm.next_step <= dm.total_steps && dm.total_steps > 0)
    }

    pub fn total_clocks(&self) -> u32 {
        self.clocks_needed
    }

    /// Execution time in seconds; used by the admission policy while the
    /// move is still provisional.
    pub fn total_time(&self) -> f32 {
        if self.state == DdaState::Frozen || self.state == DdaState::Executing {
            return self.clocks_needed as f32 / STEP_CLOCK_RATE as f32;
        }
        // Not prepared yet: estimate from distance and requested speed.
        if self.requested_speed > 0.0 {
            self.total_distance / self.requested_speed
        } else {
            0.0
        }
    }

    /// Step clocks still to run at `now`. Zero for completed moves, the full
    /// duration for frozen ones.
    pub fn time_left(&self, now: u32) -> u32 {
        match self.state {
            DdaState::Frozen => self.clocks_needed,
            DdaState::Executing => {
                let elapsed = now.wrapping_sub(self.start_time);
                self.clocks_needed.saturating_sub(elapsed)
            }
            _ => 0,
        }
    }

    /// Advance the step generator. Fires every step whose deadline has
    /// passed at `now`, then reports the next deadline (absolute step-clock
    /// time), an endstop hit, or completion. Called from the step interrupt.
    pub fn step(&mut self, platform: &mut impl Platform, now: u32) -> StepOutcome {
        debug_assert_eq!(self.state, DdaState::Executing);

        // Poll armed endstops before pulsing any further.
        if self.endstops_to_check != 0 {
            for drive in 0..AXES {
                if self.endstops_to_check & (1 << drive) != 0 {
                    let dm = &self.drives[drive];
                    if dm.total_steps > 0
                        && !dm.stopped
                        && platform.endstop_hit(drive) != crate::platform::EndstopHit::None
                    {
                        self.endstops_to_check &= !(1 << drive);
                        return StepOutcome::Hit(drive);
                    }
                }
            }
        }

        let elapsed = now.wrapping_sub(self.start_time);
        for drive in 0..DRIVES {
            loop {
                let dm = self.drives[drive];
                if dm.stopped
                    || dm.total_steps == 0
                    || dm.next_step > dm.total_steps
                    || dm.next_step_time > elapsed
                {
                    break;
                }
                platform.set_direction(drive, dm.forward);
                platform.step(drive);
                let next = dm.next_step + 1;
                self.drives[drive].next_step = next;
                if next <= dm.total_steps {
                    self.drives[drive].next_step_time = self.step_time_clocks(drive, next);
                }
            }
        }

        let mut next_due: Option<u32> = None;
        for dm in &self.drives {
            if !dm.stopped && dm.total_steps > 0 && dm.next_step <= dm.total_steps {
                next_due = Some(match next_due {
                    Some(t) => t.min(dm.next_step_time),
                    None => dm.next_step_time,
                });
            }
        }

        match next_due {
            Some(relative) => StepOutcome::Due(self.start_time.wrapping_add(relative)),
            None => {
                self.state = DdaState::Completed;
                StepOutcome::Completed
            }
        }
    }

    /// Stop generating steps for one drive; the endpoint has been clamped by
    /// the ring after an endstop hit.
    pub fn stop_drive(&mut self, drive: usize) {
        self.drives[drive].stopped = true;
    }

    /// Phase step counts of the prepared profile.
    pub fn profile_steps(&self) -> (u32, u32) {
        (self.accel_steps, self.decel_steps)
    }

    pub fn speeds(&self) -> (f32, f32, f32) {
        (self.start_speed, self.top_speed, self.end_speed)
    }

    /// One-line state summary for diagnostics.
    pub fn describe(&self) -> String {
        format!(
            "state {:?} dist {:.3} speeds {:.1}/{:.1}/{:.1} clocks {}",
            self.state,
            self.total_distance,
            self.start_speed,
            self.top_speed,
            self.end_speed,
            self.clocks_needed,
        )
    }
}
