// CoreXY/XZ/YZ kinematics: two motors jointly drive two axes through
// coupled belts

use crate::kinematics::motor_end_point;
use crate::platform::{AXES, DRIVES, X_AXIS, Y_AXIS, Z_AXIS};

/// Which pair of axes the coupled motors drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreMode {
    XY,
    XZ,
    YZ,
}

impl CoreMode {
    /// Parse a mode from its configuration name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "corexy" | "coreXY" => Some(CoreMode::XY),
            "corexz" | "coreXZ" => Some(CoreMode::XZ),
            "coreyz" | "coreYZ" => Some(CoreMode::YZ),
            _ => None,
        }
    }

    /// The two coupled axes (a, b); motor a moves `a + b`, motor b moves
    /// `b - a`. The remaining axis maps straight through.
    fn coupled(self) -> (usize, usize, usize) {
        match self {
            CoreMode::XY => (X_AXIS, Y_AXIS, Z_AXIS),
            CoreMode::XZ => (X_AXIS, Z_AXIS, Y_AXIS),
            CoreMode::YZ => (Y_AXIS, Z_AXIS, X_AXIS),
        }
    }

    pub fn motor_from_machine(
        self,
        machine: &[f32; AXES],
        steps_per_unit: &[f32; DRIVES],
    ) -> [i32; AXES] {
        let (a, b, c) = self.coupled();
        let mut motors = [0i32; AXES];
        motors[a] = motor_end_point(machine[a] + machine[b], steps_per_unit[a]);
        motors[b] = motor_end_point(machine[b] - machine[a], steps_per_unit[b]);
        motors[c] = motor_end_point(machine[c], steps_per_unit[c]);
        motors
    }

    pub fn machine_from_motors(
        self,
        motors: &[i32; AXES],
        steps_per_unit: &[f32; DRIVES],
    ) -> [f32; AXES] {
        let (a, b, c) = self.coupled();
        // The division by two happens in the reduced step space, hence the
        // 2·spu_a·spu_b denominator.
        let denom = 2.0 * steps_per_unit[a] * steps_per_unit[b];
        let ma = motors[a] as f32;
        let mb = motors[b] as f32;
        let mut machine = [0.0f32; AXES];
        machine[a] = (ma * steps_per_unit[b] - mb * steps_per_unit[a]) / denom;
        machine[b] = (ma * steps_per_unit[b] + mb * steps_per_unit[a]) / denom;
        machine[c] = motors[c] as f32 / steps_per_unit[c];
        machine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPU: [f32; DRIVES] = [80.0, 80.0, 400.0, 420.0];

    #[test]
    fn corexy_motor_deltas_for_a_pure_y_move() {
        let from = CoreMode::XY.motor_from_machine(&[10.0, 0.0, 0.0], &SPU);
        let to = CoreMode::XY.motor_from_machine(&[10.0, 10.0, 0.0], &SPU);
        assert_eq!(to[X_AXIS] - from[X_AXIS], 800);
        assert_eq!(to[Y_AXIS] - from[Y_AXIS], 800);
        assert_eq!(to[Z_AXIS] - from[Z_AXIS], 0);
    }

    #[test]
    fn corexy_round_trip() {
        let machine = [23.45, -11.2, 7.5];
        let motors = CoreMode::XY.motor_from_machine(&machine, &SPU);
        let back = CoreMode::XY.machine_from_motors(&motors, &SPU);
        for axis in 0..AXES {
            assert!((back[axis] - machine[axis]).abs() < 0.02, "axis {axis}");
        }
    }

    #[test]
    fn corexz_couples_x_and_z() {
        let motors = CoreMode::XZ.motor_from_machine(&[5.0, 3.0, 2.0], &SPU);
        assert_eq!(motors[X_AXIS], motor_end_point(7.0, SPU[X_AXIS]));
        assert_eq!(motors[Y_AXIS], motor_end_point(3.0, SPU[Y_AXIS]));
        assert_eq!(motors[Z_AXIS], motor_end_point(-3.0, SPU[Z_AXIS]));
    }

    #[test]
    fn coreyz_round_trip() {
        let machine = [1.0, 8.25, -2.5];
        let motors = CoreMode::YZ.motor_from_machine(&machine, &SPU);
        let back = CoreMode::YZ.machine_from_motors(&motors, &SPU);
        for axis in 0..AXES {
            assert!((back[axis] - machine[axis]).abs() < 0.02, "axis {axis}");
        }
    }
}
