// Cartesian kinematics: each axis is driven by its own motor

use crate::kinematics::motor_end_point;
use crate::platform::{AXES, DRIVES};

pub fn motor_from_machine(machine: &[f32; AXES], steps_per_unit: &[f32; DRIVES]) -> [i32; AXES] {
    let mut motors = [0i32; AXES];
    for axis in 0..AXES {
        motors[axis] = motor_end_point(machine[axis], steps_per_unit[axis]);
    }
    motors
}

pub fn machine_from_motors(motors: &[i32; AXES], steps_per_unit: &[f32; DRIVES]) -> [f32; AXES] {
    let mut machine = [0.0f32; AXES];
    for axis in 0..AXES {
        machine[axis] = motors[axis] as f32 / steps_per_unit[axis];
    }
    machine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_within_a_step() {
        let spu = [80.0, 80.0, 400.0, 420.0];
        let machine = [12.3456, -7.89, 0.4321];
        let motors = motor_from_machine(&machine, &spu);
        let back = machine_from_motors(&motors, &spu);
        for axis in 0..AXES {
            assert!((back[axis] - machine[axis]).abs() <= 0.5 / spu[axis]);
        }
    }
}
