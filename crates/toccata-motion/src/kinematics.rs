// Kinematics for the supported printer geometries

use crate::platform::{AXES, DRIVES, X_AXIS, Y_AXIS, Z_AXIS};
use thiserror::Error;

pub mod cartesian;
pub mod corexy;
pub mod delta;

pub use corexy::CoreMode;
pub use delta::DeltaParameters;

#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("point ({x:.2}, {y:.2}) is outside the reachable volume")]
    Unreachable { x: f32, y: f32 },

    #[error("bed compensation supports 3, 4 or 5 probe points, got {0}")]
    BadProbePointCount(usize),

    #[error("delta calibration needs between 4 and {max} probe points, got {got}")]
    BadCalibrationPointCount { got: usize, max: usize },

    #[error("delta calibration requested but the geometry is not a delta")]
    NotDelta,
}

/// Machine geometry: how Cartesian tool positions map to motor positions.
pub enum Geometry {
    Cartesian,
    Core(CoreMode),
    Delta(DeltaParameters),
}

/// Convert a machine coordinate to motor steps for one drive.
pub fn motor_end_point(coord: f32, steps_per_unit: f32) -> i32 {
    (coord * steps_per_unit).round() as i32
}

impl Geometry {
    pub fn name(&self) -> &'static str {
        match self {
            Geometry::Cartesian => "cartesian",
            Geometry::Core(CoreMode::XY) => "coreXY",
            Geometry::Core(CoreMode::XZ) => "coreXZ",
            Geometry::Core(CoreMode::YZ) => "coreYZ",
            Geometry::Delta(_) => "delta",
        }
    }

    pub fn is_delta(&self) -> bool {
        matches!(self, Geometry::Delta(_))
    }

    pub fn delta(&self) -> Option<&DeltaParameters> {
        match self {
            Geometry::Delta(params) => Some(params),
            _ => None,
        }
    }

    pub fn delta_mut(&mut self) -> Option<&mut DeltaParameters> {
        match self {
            Geometry::Delta(params) => Some(params),
            _ => None,
        }
    }

    /// Convert Cartesian machine coordinates to motor step positions for the
    /// axis drives. Fails only on a delta, when the point is unreachable.
    pub fn motor_from_machine(
        &self,
        machine: &[f32; AXES],
        steps_per_unit: &[f32; DRIVES],
    ) -> Result<[i32; AXES], GeometryError> {
        match self {
            Geometry::Cartesian => Ok(cartesian::motor_from_machine(machine, steps_per_unit)),
            Geometry::Core(mode) => Ok(mode.motor_from_machine(machine, steps_per_unit)),
            Geometry::Delta(params) => {
                let mut motors = [0i32; AXES];
                for axis in 0..AXES {
                    let height = params.transform(machine, axis)?;
                    motors[axis] = motor_end_point(height, steps_per_unit[axis]);
                }
                Ok(motors)
            }
        }
    }

    /// Convert motor step positions back to Cartesian machine coordinates.
    /// Computationally expensive on a delta; never call it from the step
    /// interrupt.
    pub fn machine_from_motors(
        &self,
        motors: &[i32; AXES],
        steps_per_unit: &[f32; DRIVES],
    ) -> [f32; AXES] {
        match self {
            Geometry::Cartesian => cartesian::machine_from_motors(motors, steps_per_unit),
            Geometry::Core(mode) => mode.machine_from_motors(motors, steps_per_unit),
            Geometry::Delta(params) => params.inverse_transform(
                motors[X_AXIS] as f32 / steps_per_unit[X_AXIS],
                motors[Y_AXIS] as f32 / steps_per_unit[Y_AXIS],
                motors[Z_AXIS] as f32 / steps_per_unit[Z_AXIS],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_names() {
        assert_eq!(Geometry::Cartesian.name(), "cartesian");
        assert_eq!(Geometry::Core(CoreMode::XY).name(), "coreXY");
        assert_eq!(Geometry::Core(CoreMode::XZ).name(), "coreXZ");
        assert_eq!(Geometry::Core(CoreMode::YZ).name(), "coreYZ");
        assert_eq!(Geometry::Delta(DeltaParameters::new()).name(), "delta");
    }

    #[test]
    fn motor_end_point_rounds_to_nearest() {
        assert_eq!(motor_end_point(10.0, 80.0), 800);
        assert_eq!(motor_end_point(10.004, 80.0), 800);
        assert_eq!(motor_end_point(-0.0063, 80.0), -1);
    }
}
