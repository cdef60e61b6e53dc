// The DDA ring: admission, look-ahead preparation, execution handoff to the
// step interrupt, pause, and the live position shadows

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use thiserror::Error;

use crate::bed::BedCompensation;
use crate::calibration::{self, CalibrationSolution};
use crate::dda::{Dda, DdaState, StepOutcome};
use crate::kinematics::{motor_end_point, Geometry, GeometryError};
use crate::platform::{
    EndstopHit, MoveSource, Platform, ReplyChannel, AXES, DRIVES, STEP_CLOCK_RATE, Z_AXIS,
};

/// Number of pre-allocated move slots in the ring.
pub const RING_LENGTH: usize = 48;

/// Idle spins with no admission before the head move is started; keeps a few
/// moves in the queue so look-ahead has something to work with.
const START_DELAY_SPINS: u32 = 10;

const DEFAULT_IDLE_TIMEOUT: f32 = 30.0;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("attempted to admit a move into a non-empty slot")]
    Overrun,

    #[error("ring is not empty")]
    NotEmpty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdleState {
    Idle,
    Busy,
    Timing,
}

/// Fixed-capacity circular buffer of move descriptors with distinct add and
/// get indices. The main task owns `add_idx` and every provisional or frozen
/// slot; the step interrupt owns `get_idx`, the executing slot, and the live
/// position shadows.
pub struct MoveRing {
    geometry: Geometry,
    bed: BedCompensation,
    ddas: Vec<Dda>,
    add_idx: usize,
    get_idx: usize,
    /// Slot currently being executed by the step interrupt. Copy to a local
    /// before inspecting.
    executing: Option<usize>,

    live_end_points: [AtomicI32; DRIVES],
    live_coordinates: [f32; DRIVES],
    live_coordinates_valid: AtomicBool,

    current_feed_rate: f32,
    idle_count: u32,
    idle_state: IdleState,
    last_move_time: u32,
    idle_timeout: f32,
    add_no_more_moves: bool,
    max_reps: u32,
    /// Step-clock time the compare interrupt is armed for, if any.
    armed: Option<u32>,
}

impl MoveRing {
    pub fn new(geometry: Geometry, platform: &impl Platform) -> Self {
        let mut spu = [0.0f32; DRIVES];
        for (drive, s) in spu.iter_mut().enumerate() {
            *s = platform.drive_steps_per_unit(drive);
        }
        let origin_motors = geometry
            .motor_from_machine(&[0.0; AXES], &spu)
            .unwrap_or([0; AXES]);
        let mut origin_points = [0i32; DRIVES];
        origin_points[..AXES].copy_from_slice(&origin_motors);

        let mut bed = BedCompensation::new();
        bed.seed_default_points(platform.axis_maximum(0), platform.axis_maximum(1));

        let mut ddas: Vec<Dda> = (0..RING_LENGTH).map(|_| Dda::new()).collect();
        // Seed the slot before the first add position so the first admitted
        // move chains from the origin.
        ddas[RING_LENGTH - 1].set_positions(&[0.0; DRIVES], &origin_points);

        Self {
            geometry,
            bed,
            ddas,
            add_idx: 0,
            get_idx: 0,
            executing: None,
            live_end_points: std::array::from_fn(|drive| {
                AtomicI32::new(origin_points[drive])
            }),
            live_coordinates: [0.0; DRIVES],
            live_coordinates_valid: AtomicBool::new(true),
            current_feed_rate: platform.home_feed_rate(platform.slowest_drive()),
            idle_count: 0,
            idle_state: IdleState::Idle,
            last_move_time: 0,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            add_no_more_moves: false,
            max_reps: 0,
            armed: None,
        }
    }

    fn next(&self, idx: usize) -> usize {
        (idx + 1) % RING_LENGTH
    }

    fn prev(&self, idx: usize) -> usize {
        (idx + RING_LENGTH - 1) % RING_LENGTH
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn geometry_mut(&mut self) -> &mut Geometry {
        &mut self.geometry
    }

    pub fn bed(&self) -> &BedCompensation {
        &self.bed
    }

    pub fn bed_mut(&mut self) -> &mut BedCompensation {
        &mut self.bed
    }

    pub fn set_idle_timeout(&mut self, seconds: f32) {
        self.idle_timeout = seconds;
    }

    pub fn set_no_more_moves(&mut self, stop: bool) {
        self.add_no_more_moves = stop;
    }

    /// True when nothing is queued or executing.
    pub fn ring_empty(&self) -> bool {
        self.get_idx == self.add_idx && self.executing.is_none()
    }

    /// Step-clock time the compare interrupt should next fire, if armed.
    pub fn armed_interrupt(&self) -> Option<u32> {
        self.armed
    }

    pub fn max_reps(&self) -> u32 {
        self.max_reps
    }

    /// One main-loop pass: admit a move if the policy allows, then either
    /// kick off the head move or keep the look-ahead horizon prepared.
    pub fn spin(
        &mut self,
        platform: &mut impl Platform,
        source: &mut impl MoveSource,
        reply: &mut impl ReplyChannel,
        now: u32,
    ) {
        if self.idle_count < 1000 {
            self.idle_count += 1;
        }

        // Admission. Only add more moves if the total duration of all
        // un-frozen moves is under 2 seconds, or the total excluding the
        // oldest un-frozen move is under half a second; this keeps the
        // parser from racing ahead while preserving look-ahead fodder.
        if !self.add_no_more_moves && self.ddas[self.add_idx].state() == DdaState::Empty {
            let mut unprepared_time = 0.0f32;
            let mut oldest_time = 0.0f32;
            let mut idx = self.add_idx;
            loop {
                idx = self.prev(idx);
                if self.ddas[idx].state() != DdaState::Provisional {
                    break;
                }
                unprepared_time += oldest_time;
                oldest_time = self.ddas[idx].total_time();
            }

            if unprepared_time < 0.5 || unprepared_time + oldest_time < 2.0 {
                if let Some(request) = source.read_move() {
                    self.admit(platform, reply, request);
                }
            }
        }

        // Copy the executing slot before inspecting it; the interrupt clears
        // it on completion.
        let executing = self.executing;
        match executing {
            None => {
                // Nothing executing: start the head move once a brief quiet
                // period has let look-ahead settle, else run the idle-hold
                // countdown.
                if self.idle_count > START_DELAY_SPINS {
                    let head = self.get_idx;
                    if self.ddas[head].state() == DdaState::Provisional {
                        self.ddas[head].prepare();
                    }
                    if self.ddas[head].state() == DdaState::Frozen {
                        platform.disable_interrupts();
                        if self.start_next_move(now) {
                            self.run_interrupt(platform, now);
                        }
                        platform.enable_interrupts();
                        self.idle_state = IdleState::Busy;
                    } else if self.idle_state == IdleState::Busy && self.idle_timeout > 0.0 {
                        self.last_move_time = now;
                        self.idle_state = IdleState::Timing;
                    } else if self.idle_state == IdleState::Timing
                        && now.wrapping_sub(self.last_move_time)
                            >= (self.idle_timeout * STEP_CLOCK_RATE as f32) as u32
                    {
                        for drive in 0..DRIVES {
                            platform.set_drive_idle(drive);
                        }
                        self.idle_state = IdleState::Idle;
                    }
                }
            }
            Some(current) => {
                // Keep roughly an eighth of a second of motion prepared
                // ahead of the executor.
                let mut prepared_time: u32 = 0;
                let mut idx = current;
                loop {
                    match self.ddas[idx].state() {
                        DdaState::Completed | DdaState::Executing | DdaState::Frozen => {
                            prepared_time += self.ddas[idx].time_left(now);
                            idx = self.next(idx);
                        }
                        _ => break,
                    }
                    if idx == current {
                        return;
                    }
                }
                while self.ddas[idx].state() == DdaState::Provisional
                    && prepared_time < STEP_CLOCK_RATE / 8
                {
                    self.ddas[idx].prepare();
                    prepared_time += self.ddas[idx].time_left(now);
                    idx = self.next(idx);
                    if idx == current {
                        break;
                    }
                }
            }
        }
    }

    fn admit(
        &mut self,
        platform: &mut impl Platform,
        reply: &mut impl ReplyChannel,
        mut request: crate::platform::MoveRequest,
    ) {
        if self.ddas[self.add_idx].state() != DdaState::Empty {
            reply.handle_reply(&format!("Error: {}", RingError::Overrun));
            return;
        }

        // Might be a move with just a new feed rate.
        self.current_feed_rate = request.values[DRIVES] / 60.0;

        let do_motor_mapping =
            request.move_type == 0 || (request.move_type == 1 && !self.geometry.is_delta());
        if request.move_type == 0 {
            let mut axes = [0.0f32; AXES];
            axes.copy_from_slice(&request.values[..AXES]);
            if let Some(report) = self.bed.transform(&mut axes) {
                reply.handle_reply(report);
            }
            request.values[..AXES].copy_from_slice(&axes);
        }

        let prev = self.prev(self.add_idx);
        let prev_coordinates = *self.ddas[prev].end_coordinates();
        let prev_end_points = *self.ddas[prev].end_points();

        let add = self.add_idx;
        match self.ddas[add].admit(
            platform,
            &self.geometry,
            &prev_coordinates,
            &prev_end_points,
            &request,
            do_motor_mapping,
        ) {
            Ok(true) => {
                // Look-ahead join: raise the junction speed between the
                // previous provisional move and this one.
                if self.ddas[prev].state() == DdaState::Provisional {
                    let junction = self.ddas[prev].junction_speed(&self.ddas[add]);
                    self.ddas[prev].set_end_speed(junction);
                    self.ddas[add].set_start_speed(junction);
                }
                self.add_idx = self.next(self.add_idx);
                self.idle_count = 0;
            }
            Ok(false) => {}
            Err(err) => reply.handle_reply(&format!("Error: {err}")),
        }
    }

    /// Hand the head move to the step interrupt. Must be called with
    /// interrupts disabled.
    fn start_next_move(&mut self, start_time: u32) -> bool {
        if self.ddas[self.get_idx].state() == DdaState::Frozen {
            let idx = self.get_idx;
            self.executing = Some(idx);
            self.ddas[idx].start(start_time)
        } else {
            false
        }
    }

    /// The step interrupt body: advance the executing move, fire due steps,
    /// clamp on endstop hits, roll into the next frozen move on completion,
    /// and re-arm the compare for the next deadline.
    pub fn interrupt(&mut self, platform: &mut impl Platform, now: u32) {
        self.run_interrupt(platform, now);
    }

    fn run_interrupt(&mut self, platform: &mut impl Platform, now: u32) {
        let mut reps: u32 = 0;
        loop {
            let Some(current) = self.executing else {
                self.armed = None;
                break;
            };
            match self.ddas[current].step(platform, now) {
                StepOutcome::Due(deadline) => {
                    self.armed = Some(deadline);
                    break;
                }
                StepOutcome::Hit(drive) => {
                    self.handle_endstop(platform, current, drive);
                    reps += 1;
                }
                StepOutcome::Completed => {
                    self.current_move_completed(current);
                    if !self.start_next_move(now) {
                        self.armed = None;
                        break;
                    }
                    reps += 1;
                }
            }
        }
        if reps > self.max_reps {
            self.max_reps = reps;
        }
    }

    /// An armed endstop fired: clamp the drive's endpoint to the known
    /// homed position and record the axis as homed. On a delta the hit is
    /// per tower and always at the top.
    fn handle_endstop(&mut self, platform: &mut impl Platform, current: usize, drive: usize) {
        let hit = platform.endstop_hit(drive);
        if hit == EndstopHit::None {
            return;
        }
        let position = if let Geometry::Delta(params) = &self.geometry {
            params.homed_carriage_height(drive)
        } else {
            match hit {
                EndstopHit::High => platform.axis_maximum(drive),
                EndstopHit::Low if drive == Z_AXIS => platform.z_probe_stop_height(),
                EndstopHit::Low => platform.axis_minimum(drive),
                EndstopHit::None => unreachable!(),
            }
        };
        let endpoint = motor_end_point(position, platform.drive_steps_per_unit(drive));
        self.ddas[current].set_drive_coordinate(drive, endpoint);
        self.ddas[current].stop_drive(drive);
        platform.set_axis_homed(drive);
    }

    /// Called when the executing move has generated its last step. The live
    /// endpoints are updated before the executing slot is cleared so the
    /// main task never observes a stale pair.
    fn current_move_completed(&mut self, current: usize) {
        let valid = self.ddas[current].end_coordinates_valid();
        let end_points = *self.ddas[current].end_points();
        for drive in 0..DRIVES {
            self.live_end_points[drive].store(end_points[drive], Ordering::SeqCst);
        }
        if valid {
            self.live_coordinates = *self.ddas[current].end_coordinates();
        }
        self.live_coordinates_valid.store(valid, Ordering::SeqCst);

        self.ddas[current].release();
        self.executing = None;
        self.get_idx = self.next(self.get_idx);
    }

    /// Reserved hook: called from the step interrupt when the Z probe
    /// triggers during a probing move. Intentionally does nothing yet.
    pub fn z_probe_triggered(&mut self) {}

    /// Pause as soon as safely possible. Releases every queued move after
    /// the first pausable one and returns the file position of the first
    /// skipped move; `positions` receives the coordinates and feed rate to
    /// resume from when moves were skipped.
    pub fn pause(
        &mut self,
        platform: &mut impl Platform,
        positions: &mut [f32; DRIVES + 1],
    ) -> Option<u64> {
        let saved_add = self.add_idx;

        platform.disable_interrupts();
        match self.executing {
            Some(current) => {
                if self.ddas[current].can_pause() {
                    self.add_idx = self.next(current);
                } else {
                    // The current move ends too fast to stop after; search
                    // onward for one we can pause behind.
                    let mut idx = self.get_idx;
                    while idx != self.add_idx {
                        if self.ddas[idx].can_pause() {
                            self.add_idx = self.next(idx);
                            break;
                        }
                        idx = self.next(idx);
                    }
                }
            }
            None => {
                self.add_idx = self.get_idx;
            }
        }
        platform.enable_interrupts();

        if self.add_idx == saved_add {
            self.get_current_user_position(platform, positions, 0);
            return None;
        }

        // The slot before the new add position is the last move that will
        // still be printed. If it has not been frozen yet, its exit speed
        // may have been raised by look-ahead towards a move we are about to
        // release; pull it back down so the move really can end at rest.
        let last = self.prev(self.add_idx);
        if self.ddas[last].state() == DdaState::Provisional {
            self.ddas[last].set_end_speed(0.0);
        }
        for axis in 0..AXES {
            positions[axis] = self.ddas[last].end_coordinate(axis);
        }
        positions[DRIVES] = self.ddas[last].requested_speed() * 60.0;

        let mut file_position = None;
        let mut idx = self.add_idx;
        while idx != saved_add {
            if file_position.is_none() {
                file_position = self.ddas[idx].file_position();
            }
            self.ddas[idx].release();
            idx = self.next(idx);
        }
        file_position
    }

    /// Seed the ring position without transforming; only legal while the
    /// ring is empty.
    pub fn set_positions(
        &mut self,
        platform: &impl Platform,
        coordinates: &[f32; DRIVES],
    ) -> Result<(), RingError> {
        if !self.ring_empty() {
            return Err(RingError::NotEmpty);
        }
        let end_points = self.end_points_from_machine(platform, coordinates);
        let prev = self.prev(self.add_idx);
        self.ddas[prev].set_positions(coordinates, &end_points);
        Ok(())
    }

    pub fn set_feed_rate(&mut self, feed_rate: f32) -> Result<(), RingError> {
        if !self.ring_empty() {
            return Err(RingError::NotEmpty);
        }
        self.current_feed_rate = feed_rate;
        let prev = self.prev(self.add_idx);
        self.ddas[prev].set_feed_rate(feed_rate);
        Ok(())
    }

    fn end_points_from_machine(
        &self,
        platform: &impl Platform,
        coordinates: &[f32; DRIVES],
    ) -> [i32; DRIVES] {
        let mut spu = [0.0f32; DRIVES];
        for (drive, s) in spu.iter_mut().enumerate() {
            *s = platform.drive_steps_per_unit(drive);
        }
        let mut axes = [0.0f32; AXES];
        axes.copy_from_slice(&coordinates[..AXES]);
        let motors = self
            .geometry
            .motor_from_machine(&axes, &spu)
            .unwrap_or([0; AXES]);
        let mut end_points = [0i32; DRIVES];
        end_points[..AXES].copy_from_slice(&motors);
        for drive in AXES..DRIVES {
            end_points[drive] = motor_end_point(coordinates[drive], spu[drive]);
        }
        end_points
    }

    /// Untransformed machine coordinates of the last queued move, plus the
    /// current feed rate in units/min.
    pub fn get_current_machine_position(&self, positions: &mut [f32; DRIVES + 1]) {
        let last = self.prev(self.add_idx);
        for drive in 0..DRIVES {
            positions[drive] = if drive < AXES {
                self.ddas[last].end_coordinate(drive)
            } else {
                0.0
            };
        }
        positions[DRIVES] = self.current_feed_rate * 60.0;
    }

    /// Machine position transformed back to user coordinates for the given
    /// move type.
    pub fn get_current_user_position(
        &self,
        _platform: &impl Platform,
        positions: &mut [f32; DRIVES + 1],
        move_type: u8,
    ) {
        self.get_current_machine_position(positions);
        if move_type == 0 {
            let mut axes = [0.0f32; AXES];
            axes.copy_from_slice(&positions[..AXES]);
            let _ = self.bed.inverse_transform(&mut axes);
            positions[..AXES].copy_from_slice(&axes);
        }
    }

    /// Current live coordinates for every drive, in user coordinates. The
    /// live shadows are written by the step interrupt, so reads happen under
    /// a brief critical section; the expensive motor-to-Cartesian recompute
    /// runs with interrupts enabled and commits its result back only if the
    /// endpoints did not move underneath it.
    pub fn live_coordinates(&mut self, platform: &mut impl Platform) -> [f32; DRIVES] {
        let mut result;

        platform.disable_interrupts();
        if self.live_coordinates_valid.load(Ordering::SeqCst) {
            result = self.live_coordinates;
            platform.enable_interrupts();
        } else {
            // Only the extruder coordinates are valid; rebuild the axis
            // coordinates from the motor endpoints.
            result = self.live_coordinates;
            let mut end_points = [0i32; AXES];
            for (axis, point) in end_points.iter_mut().enumerate() {
                *point = self.live_end_points[axis].load(Ordering::SeqCst);
            }
            platform.enable_interrupts();

            let mut spu = [0.0f32; DRIVES];
            for (drive, s) in spu.iter_mut().enumerate() {
                *s = platform.drive_steps_per_unit(drive);
            }
            let machine = self.geometry.machine_from_motors(&end_points, &spu);
            result[..AXES].copy_from_slice(&machine);

            platform.disable_interrupts();
            let unchanged = (0..AXES)
                .all(|axis| self.live_end_points[axis].load(Ordering::SeqCst) == end_points[axis]);
            if unchanged {
                self.live_coordinates[..AXES].copy_from_slice(&machine);
                self.live_coordinates_valid.store(true, Ordering::SeqCst);
            }
            platform.enable_interrupts();
        }

        let mut axes = [0.0f32; AXES];
        axes.copy_from_slice(&result[..AXES]);
        let _ = self.bed.inverse_transform(&mut axes);
        result[..AXES].copy_from_slice(&axes);
        result
    }

    /// Overwrite the live position; used after homing and when seeding.
    pub fn set_live_coordinates(
        &mut self,
        platform: &mut impl Platform,
        coordinates: &[f32; DRIVES],
    ) {
        platform.disable_interrupts();
        self.live_coordinates = *coordinates;
        let end_points = self.end_points_from_machine(platform, coordinates);
        for drive in 0..DRIVES {
            self.live_end_points[drive].store(end_points[drive], Ordering::SeqCst);
        }
        self.live_coordinates_valid.store(true, Ordering::SeqCst);
        platform.enable_interrupts();
    }

    /// Dispatch after a probing sequence: negative `s_param` just reports
    /// the probe heights, a delta routes to the auto-calibrator, anything
    /// else fits the bed equation.
    pub fn finished_bed_probing(
        &mut self,
        platform: &impl Platform,
        s_param: i32,
        reply: &mut impl ReplyChannel,
    ) {
        let num_points = self.bed.number_of_probe_points();
        if s_param < 0 {
            let mut message = String::from("Bed probe heights:");
            for index in 0..num_points {
                message.push_str(&format!(" {:.2}", self.bed.z_probe_point(index)));
            }
            reply.handle_reply(&message);
        } else if num_points < s_param as usize {
            reply.handle_reply(&format!(
                "Bed calibration error: {s_param} points requested but only {num_points} provided"
            ));
        } else {
            let use_points = if s_param == 0 {
                num_points
            } else {
                s_param as usize
            };
            if self.geometry.is_delta() {
                match self.do_delta_calibration(platform, use_points) {
                    Ok(report) => reply.handle_reply(&report),
                    Err(err) => reply.handle_reply(&format!("Delta calibration error: {err}")),
                }
            } else {
                match self.bed.set_probed_bed_equation(use_points) {
                    Ok(report) => reply.handle_reply(&report),
                    Err(err) => reply.handle_reply(&format!("Bed calibration error: {err}")),
                }
            }
        }
    }

    /// One least-squares calibration pass over the first `num_points` probe
    /// records: solve, apply, shift the queued and live endpoints to match
    /// the new homed carriage heights, and report the new parameters.
    pub fn do_delta_calibration(
        &mut self,
        platform: &impl Platform,
        num_points: usize,
    ) -> Result<String, GeometryError> {
        let params = self.geometry.delta().ok_or(GeometryError::NotDelta)?;

        let mut points = Vec::with_capacity(num_points);
        for index in 0..num_points {
            points.push((
                self.bed.x_probe_point(index),
                self.bed.y_probe_point(index),
                self.bed.z_probe_point(index),
            ));
        }

        let solution = calibration::compute_adjustment(params, &points)?;
        self.adjust_delta_parameters(platform, &solution);

        let params = self.geometry.delta().expect("geometry is delta");
        Ok(format!(
            "Calibrated {} factors using {} points, deviation {:.3} before, {:.3} expected\n{}",
            solution.num_factors,
            num_points,
            solution.initial_deviation,
            solution.expected_deviation,
            params.print_parameters(true),
        ))
    }

    /// Apply a calibration solution, then shift the last queued endpoints
    /// and the live endpoints by the change in homed carriage heights so
    /// the machine does not jump on the next move.
    fn adjust_delta_parameters(
        &mut self,
        platform: &impl Platform,
        solution: &CalibrationSolution,
    ) {
        let params = self.geometry.delta().expect("geometry is delta");
        let old_heights: [f32; AXES] = std::array::from_fn(|axis| params.homed_carriage_height(axis));

        let params = self.geometry.delta_mut().expect("geometry is delta");
        calibration::apply_adjustment(params, solution);

        let params = self.geometry.delta().expect("geometry is delta");
        let mut new_points = [0i32; AXES];
        let last = self.prev(self.add_idx);
        for axis in 0..AXES {
            let height_adjust = params.homed_carriage_height(axis) - old_heights[axis];
            let steps = (height_adjust * platform.drive_steps_per_unit(axis)) as i32;
            new_points[axis] = self.ddas[last].end_points()[axis] + steps;
        }
        for axis in 0..AXES {
            self.ddas[last].set_drive_coordinate(axis, new_points[axis]);
            self.live_end_points[axis].store(new_points[axis], Ordering::SeqCst);
        }
        // Force the live Cartesian position to be recalculated.
        self.live_coordinates_valid.store(false, Ordering::SeqCst);
    }

    /// Report and reset the step-overrun diagnostic.
    pub fn diagnostics(&mut self, reply: &mut impl ReplyChannel) {
        reply.handle_reply(&format!("Move diagnostics: MaxReps: {}", self.max_reps));
        self.max_reps = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MoveRequest;
    use std::collections::VecDeque;

    struct TestPlatform {
        steps: [i64; DRIVES],
        directions: [bool; DRIVES],
        endstops: [EndstopHit; DRIVES],
        homed: [bool; AXES],
        idle: [bool; DRIVES],
        clock: u32,
    }

    impl TestPlatform {
        fn new() -> Self {
            Self {
                steps: [0; DRIVES],
                directions: [true; DRIVES],
                endstops: [EndstopHit::None; DRIVES],
                homed: [false; AXES],
                idle: [false; DRIVES],
                clock: 0,
            }
        }
    }

    impl Platform for TestPlatform {
        fn drive_steps_per_unit(&self, drive: usize) -> f32 {
            [80.0, 80.0, 400.0, 420.0][drive]
        }
        fn axis_minimum(&self, _axis: usize) -> f32 {
            0.0
        }
        fn axis_maximum(&self, _axis: usize) -> f32 {
            200.0
        }
        fn home_feed_rate(&self, _drive: usize) -> f32 {
            20.0
        }
        fn acceleration(&self, _drive: usize) -> f32 {
            1000.0
        }
        fn max_feed_rate(&self, _drive: usize) -> f32 {
            100.0
        }
        fn instant_dv(&self, _drive: usize) -> f32 {
            1.0
        }
        fn z_probe_stop_height(&self) -> f32 {
            0.7
        }
        fn step_clock(&self) -> u32 {
            self.clock
        }
        fn set_direction(&mut self, drive: usize, forward: bool) {
            self.directions[drive] = forward;
        }
        fn step(&mut self, drive: usize) {
            self.steps[drive] += if self.directions[drive] { 1 } else { -1 };
        }
        fn endstop_hit(&self, drive: usize) -> EndstopHit {
            self.endstops[drive]
        }
        fn set_drive_idle(&mut self, drive: usize) {
            self.idle[drive] = true;
        }
        fn set_axis_homed(&mut self, axis: usize) {
            self.homed[axis] = true;
        }
        fn disable_interrupts(&mut self) {}
        fn enable_interrupts(&mut self) {}
    }

    struct QueueSource {
        moves: VecDeque<MoveRequest>,
    }

    impl QueueSource {
        fn new(moves: Vec<MoveRequest>) -> Self {
            Self {
                moves: moves.into(),
            }
        }
        fn is_empty(&self) -> bool {
            self.moves.is_empty()
        }
    }

    impl MoveSource for QueueSource {
        fn read_move(&mut self) -> Option<MoveRequest> {
            self.moves.pop_front()
        }
    }

    #[derive(Default)]
    struct Replies {
        messages: Vec<String>,
    }

    impl ReplyChannel for Replies {
        fn handle_reply(&mut self, reply: &str) {
            self.messages.push(reply.to_string());
        }
    }

    fn request(values: [f32; DRIVES + 1]) -> MoveRequest {
        MoveRequest {
            values,
            endstops: 0,
            move_type: 0,
            file_position: None,
        }
    }

    fn run_to_completion(
        ring: &mut MoveRing,
        platform: &mut TestPlatform,
        source: &mut QueueSource,
        reply: &mut Replies,
    ) {
        let mut now = 0u32;
        for _ in 0..2_000_000 {
            ring.spin(platform, source, reply, now);
            match ring.armed_interrupt() {
                Some(deadline) => {
                    now = deadline;
                    ring.interrupt(platform, now);
                }
                None => now = now.wrapping_add(STEP_CLOCK_RATE / 1000),
            }
            if source.is_empty() && ring.ring_empty() && ring.executing.is_none() {
                return;
            }
        }
        panic!("ring did not drain");
    }

    #[test]
    fn executes_queued_moves_and_updates_live_state() {
        let mut platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Cartesian, &platform);
        let mut source = QueueSource::new(vec![
            request([10.0, 0.0, 0.0, 0.0, 3000.0]),
            request([10.0, 10.0, 0.0, 0.5, 3000.0]),
        ]);
        let mut reply = Replies::default();

        run_to_completion(&mut ring, &mut platform, &mut source, &mut reply);

        assert_eq!(platform.steps[0], 800);
        assert_eq!(platform.steps[1], 800);
        assert_eq!(platform.steps[3], 210);
        let live = ring.live_coordinates(&mut platform);
        assert!((live[0] - 10.0).abs() < 1e-3);
        assert!((live[1] - 10.0).abs() < 1e-3);
        assert!((live[3] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn admitted_moves_chain_motor_endpoints() {
        let mut platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Cartesian, &platform);
        let mut source = QueueSource::new(vec![
            request([1.25, 0.0, 0.0, 0.0, 3000.0]),
            request([2.5, 0.0, 0.0, 0.0, 3000.0]),
        ]);
        let mut reply = Replies::default();

        ring.spin(&mut platform, &mut source, &mut reply, 0);
        ring.spin(&mut platform, &mut source, &mut reply, 0);

        let first = ring.ddas[0].end_points()[0];
        let second = ring.ddas[1].end_points()[0];
        assert_eq!(first, 100);
        assert_eq!(second, first + 100);
        assert_eq!(ring.ddas[1].state(), DdaState::Provisional);
    }

    #[test]
    fn corexy_motor_deltas_match_the_belt_coupling() {
        let mut platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Core(crate::kinematics::CoreMode::XY), &platform);
        let mut source = QueueSource::new(vec![
            request([10.0, 0.0, 0.0, 0.0, 3000.0]),
            request([10.0, 10.0, 0.0, 0.0, 3000.0]),
        ]);
        let mut reply = Replies::default();

        ring.spin(&mut platform, &mut source, &mut reply, 0);
        ring.spin(&mut platform, &mut source, &mut reply, 0);

        let first = *ring.ddas[0].end_points();
        let second = *ring.ddas[1].end_points();
        assert_eq!(second[0] - first[0], 800);
        assert_eq!(second[1] - first[1], 800);
    }

    #[test]
    fn start_waits_for_the_quiet_period() {
        let mut platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Cartesian, &platform);
        let mut source = QueueSource::new(vec![request([5.0, 0.0, 0.0, 0.0, 3000.0])]);
        let mut reply = Replies::default();

        ring.spin(&mut platform, &mut source, &mut reply, 0);
        assert!(ring.executing.is_none());
        for _ in 0..START_DELAY_SPINS {
            ring.spin(&mut platform, &mut source, &mut reply, 0);
            assert!(ring.executing.is_none());
        }
        ring.spin(&mut platform, &mut source, &mut reply, 0);
        assert!(ring.executing.is_some());
        assert!(ring.armed_interrupt().is_some());
    }

    #[test]
    fn pause_skips_queued_moves_after_the_pausable_one() {
        let mut platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Cartesian, &platform);
        let mut source = QueueSource::new(vec![
            MoveRequest {
                file_position: Some(100),
                ..request([10.0, 0.0, 0.0, 0.0, 3000.0])
            },
            MoveRequest {
                file_position: Some(200),
                ..request([20.0, 0.0, 0.0, 0.0, 3000.0])
            },
            MoveRequest {
                file_position: Some(300),
                ..request([30.0, 0.0, 0.0, 0.0, 3000.0])
            },
        ]);
        let mut reply = Replies::default();

        // Admit all three (each admission restarts the quiet period), then
        // let the quiet period elapse so the first move starts.
        for _ in 0..START_DELAY_SPINS + 5 {
            ring.spin(&mut platform, &mut source, &mut reply, 0);
        }
        assert_eq!(ring.executing, Some(0));

        let mut positions = [0.0f32; DRIVES + 1];
        let file_position = ring.pause(&mut platform, &mut positions);

        // The executing move froze with its exit raised to the straight-on
        // junction speed, so it cannot pause; the second move still can.
        // The third is skipped and released.
        assert_eq!(file_position, Some(300));
        assert!((positions[0] - 20.0).abs() < 1e-4);
        assert_eq!(ring.add_idx, 2);
        assert_eq!(ring.ddas[2].state(), DdaState::Empty);
    }

    #[test]
    fn pause_with_nothing_executing_collapses_the_ring() {
        let mut platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Cartesian, &platform);
        let mut source = QueueSource::new(vec![
            request([10.0, 0.0, 0.0, 0.0, 3000.0]),
            request([20.0, 0.0, 0.0, 0.0, 3000.0]),
        ]);
        let mut reply = Replies::default();
        ring.spin(&mut platform, &mut source, &mut reply, 0);
        ring.spin(&mut platform, &mut source, &mut reply, 0);

        let mut positions = [0.0f32; DRIVES + 1];
        ring.pause(&mut platform, &mut positions);
        assert_eq!(ring.add_idx, ring.get_idx);
        assert!(ring.ring_empty());
    }

    #[test]
    fn endstop_hit_clamps_the_endpoint_and_homes_the_axis() {
        let mut platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Cartesian, &platform);
        let mut source = QueueSource::new(vec![MoveRequest {
            values: [-5.0, 0.0, 0.0, 0.0, 1200.0],
            endstops: 1,
            move_type: 1,
            file_position: None,
        }]);
        let mut reply = Replies::default();

        let mut now = 0u32;
        // Let the move start, then trip the X endstop.
        for _ in 0..=START_DELAY_SPINS + 1 {
            ring.spin(&mut platform, &mut source, &mut reply, now);
        }
        assert!(ring.executing.is_some());
        platform.endstops[0] = EndstopHit::Low;
        now = ring.armed_interrupt().unwrap();
        ring.interrupt(&mut platform, now);

        assert!(platform.homed[0]);
        // Clamped to axis minimum 0 => motor endpoint 0.
        assert_eq!(ring.live_end_points[0].load(Ordering::SeqCst), 0);
        assert!(ring.executing.is_none());
    }

    #[test]
    fn idle_timeout_puts_drives_into_idle_hold() {
        let mut platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Cartesian, &platform);
        ring.set_idle_timeout(0.001);
        let mut source = QueueSource::new(vec![request([1.0, 0.0, 0.0, 0.0, 3000.0])]);
        let mut reply = Replies::default();

        run_to_completion(&mut ring, &mut platform, &mut source, &mut reply);

        // Keep spinning with an advancing clock until the timeout elapses.
        let mut now = 10 * STEP_CLOCK_RATE;
        for _ in 0..20 {
            ring.spin(&mut platform, &mut source, &mut reply, now);
            now += STEP_CLOCK_RATE / 100;
        }
        assert!(platform.idle.iter().all(|&idle| idle));
    }

    #[test]
    fn set_positions_requires_an_empty_ring() {
        let mut platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Cartesian, &platform);
        assert!(ring
            .set_positions(&platform, &[5.0, 5.0, 5.0, 0.0])
            .is_ok());

        let mut source = QueueSource::new(vec![request([10.0, 0.0, 0.0, 0.0, 3000.0])]);
        let mut reply = Replies::default();
        ring.spin(&mut platform, &mut source, &mut reply, 0);
        assert!(matches!(
            ring.set_positions(&platform, &[0.0; DRIVES]),
            Err(RingError::NotEmpty)
        ));

        // The queued move chained from the seeded position.
        assert_eq!(ring.ddas[0].end_points()[0], 800);
    }

    #[test]
    fn delta_calibration_shifts_live_endpoints() {
        let mut platform = TestPlatform::new();
        let mut params = crate::kinematics::DeltaParameters::new();
        params.set_diagonal(300.0);
        params.set_homed_height(240.0);
        params.set_radius(105.0);
        let mut ring = MoveRing::new(Geometry::Delta(params), &platform);

        // Seven probe points on an 80 mm circle plus centre, slightly high.
        for (index, angle) in (0..6).map(|i| (i, i as f32 * std::f32::consts::PI / 3.0)) {
            ring.bed_mut().set_x_probe_point(index, 80.0 * angle.cos()).unwrap();
            ring.bed_mut().set_y_probe_point(index, 80.0 * angle.sin()).unwrap();
            ring.bed_mut().set_z_probe_point(index, 0.05).unwrap();
        }
        ring.bed_mut().set_x_probe_point(6, 0.0).unwrap();
        ring.bed_mut().set_y_probe_point(6, 0.0).unwrap();
        ring.bed_mut().set_z_probe_point(6, -0.02).unwrap();

        let before: Vec<i32> = (0..AXES)
            .map(|axis| ring.live_end_points[axis].load(Ordering::SeqCst))
            .collect();
        let report = ring.do_delta_calibration(&platform, 7).unwrap();
        assert!(report.contains("Calibrated 7 factors"), "{report}");
        assert!(report.contains("Endstops"), "{report}");
        assert!(!ring.live_coordinates_valid.load(Ordering::SeqCst));
        let after: Vec<i32> = (0..AXES)
            .map(|axis| ring.live_end_points[axis].load(Ordering::SeqCst))
            .collect();
        assert_ne!(before, after);
    }

    #[test]
    fn finished_bed_probing_reports_heights_for_negative_s() {
        let platform = TestPlatform::new();
        let mut ring = MoveRing::new(Geometry::Cartesian, &platform);
        for index in 0..3 {
            ring.bed_mut().set_x_probe_point(index, index as f32 * 10.0).unwrap();
            ring.bed_mut().set_y_probe_point(index, 0.0).unwrap();
            ring.bed_mut().set_z_probe_point(index, 0.1).unwrap();
        }
        let mut reply = Replies::default();
        ring.finished_bed_probing(&platform, -1, &mut reply);
        assert!(reply.messages[0].starts_with("Bed probe heights:"));

        ring.finished_bed_probing(&platform, 0, &mut reply);
        assert!(reply.messages[1].starts_with("Bed equation fits points"));
    }
}
