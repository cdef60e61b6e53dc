// Linear delta kinematics: three vertical carriages drive rods that meet at
// a shared effector

use crate::kinematics::GeometryError;
use crate::platform::{AXES, X_AXIS, Y_AXIS, Z_AXIS};

const DEFAULT_PRINT_RADIUS: f32 = 50.0;
const DEFAULT_HOMED_HEIGHT: f32 = 200.0;

/// Perturbation used for the calibration finite differences, in mm.
const DERIVATIVE_PERTURBATION: f32 = 0.2;

/// Delta geometry parameters plus the cached quantities derived from them.
///
/// The cache is recomputed by `recalc` whenever an input changes; all the
/// setters do that, so external code never needs to call it. Delta mode is
/// active iff `radius > 0` and `diagonal > radius`.
#[derive(Debug, Clone)]
pub struct DeltaParameters {
    diagonal: f32,
    radius: f32,
    print_radius: f32,
    homed_height: f32,
    is_equilateral: bool,
    delta_mode: bool,
    endstop_adjustments: [f32; AXES],
    tower_x: [f32; AXES],
    tower_y: [f32; AXES],

    // Cached quantities
    xbc: f32,
    xca: f32,
    xab: f32,
    ybc: f32,
    yca: f32,
    yab: f32,
    core_fa: f32,
    core_fb: f32,
    core_fc: f32,
    q: f32,
    q2: f32,
    d2: f32,
    homed_carriage_height: f32,
}

fn fsquare(x: f32) -> f32 {
    x * x
}

impl Default for DeltaParameters {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaParameters {
    pub fn new() -> Self {
        Self {
            diagonal: 0.0,
            radius: 0.0,
            print_radius: DEFAULT_PRINT_RADIUS,
            homed_height: DEFAULT_HOMED_HEIGHT,
            is_equilateral: true,
            delta_mode: false,
            endstop_adjustments: [0.0; AXES],
            tower_x: [0.0; AXES],
            tower_y: [0.0; AXES],
            xbc: 0.0,
            xca: 0.0,
            xab: 0.0,
            ybc: 0.0,
            yca: 0.0,
            yab: 0.0,
            core_fa: 0.0,
            core_fb: 0.0,
            core_fc: 0.0,
            q: 0.0,
            q2: 0.0,
            d2: 0.0,
            homed_carriage_height: 0.0,
        }
    }

    pub fn diagonal(&self) -> f32 {
        self.diagonal
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn print_radius(&self) -> f32 {
        self.print_radius
    }

    pub fn homed_height(&self) -> f32 {
        self.homed_height
    }

    pub fn is_equilateral(&self) -> bool {
        self.is_equilateral
    }

    pub fn in_delta_mode(&self) -> bool {
        self.delta_mode
    }

    pub fn endstop_adjustment(&self, axis: usize) -> f32 {
        self.endstop_adjustments[axis]
    }

    pub fn tower_position(&self, axis: usize) -> (f32, f32) {
        (self.tower_x[axis], self.tower_y[axis])
    }

    /// Carriage height of one tower when its endstop triggers; the reference
    /// point for all subsequent motion on that tower.
    pub fn homed_carriage_height(&self, axis: usize) -> f32 {
        self.homed_carriage_height + self.endstop_adjustments[axis]
    }

    pub fn set_diagonal(&mut self, diagonal: f32) {
        self.diagonal = diagonal;
        self.recalc();
    }

    /// Set the delta radius, placing the towers in the equilateral layout.
    pub fn set_radius(&mut self, radius: f32) {
        self.radius = radius;
        self.is_equilateral = true;

        let cos30 = 3.0f32.sqrt() / 2.0;
        let sin30 = 0.5;

        self.tower_x[X_AXIS] = -(radius * cos30);
        self.tower_x[Y_AXIS] = radius * cos30;
        self.tower_x[Z_AXIS] = 0.0;

        self.tower_y[X_AXIS] = -(radius * sin30);
        self.tower_y[Y_AXIS] = -(radius * sin30);
        self.tower_y[Z_AXIS] = radius;

        self.recalc();
    }

    pub fn set_homed_height(&mut self, homed_height: f32) {
        self.homed_height = homed_height;
        self.recalc();
    }

    pub fn set_print_radius(&mut self, print_radius: f32) {
        self.print_radius = print_radius;
    }

    pub fn set_endstop_adjustment(&mut self, axis: usize, adjustment: f32) {
        self.endstop_adjustments[axis] = adjustment;
        self.recalc();
    }

    fn recalc(&mut self) {
        self.delta_mode = self.radius > 0.0 && self.diagonal > self.radius;
        if !self.delta_mode {
            return;
        }

        self.xbc = self.tower_x[Z_AXIS] - self.tower_x[Y_AXIS];
        self.xca = self.tower_x[X_AXIS] - self.tower_x[Z_AXIS];
        self.xab = self.tower_x[Y_AXIS] - self.tower_x[X_AXIS];
        self.ybc = self.tower_y[Z_AXIS] - self.tower_y[Y_AXIS];
        self.yca = self.tower_y[X_AXIS] - self.tower_y[Z_AXIS];
        self.yab = self.tower_y[Y_AXIS] - self.tower_y[X_AXIS];
        self.core_fa = fsquare(self.tower_x[X_AXIS]) + fsquare(self.tower_y[X_AXIS]);
        self.core_fb = fsquare(self.tower_x[Y_AXIS]) + fsquare(self.tower_y[Y_AXIS]);
        self.core_fc = fsquare(self.tower_x[Z_AXIS]) + fsquare(self.tower_y[Z_AXIS]);
        self.q = 2.0 * (self.xca * self.yab - self.xab * self.yca);
        self.q2 = fsquare(self.q);
        self.d2 = fsquare(self.diagonal);

        // Base carriage height when the printer is homed. Any sensible
        // trial height works here.
        let height = self.diagonal;
        let pos = self.inverse_transform(
            height + self.endstop_adjustments[X_AXIS],
            height + self.endstop_adjustments[Y_AXIS],
            height + self.endstop_adjustments[Z_AXIS],
        );
        self.homed_carriage_height = self.homed_height + height - pos[Z_AXIS];
    }

    /// Make the average of the endstop adjustments zero without changing the
    /// individual homed carriage heights.
    pub fn normalise_endstop_adjustments(&mut self) {
        let mean = (self.endstop_adjustments[X_AXIS]
            + self.endstop_adjustments[Y_AXIS]
            + self.endstop_adjustments[Z_AXIS])
            / 3.0;
        self.endstop_adjustments[X_AXIS] -= mean;
        self.endstop_adjustments[Y_AXIS] -= mean;
        self.endstop_adjustments[Z_AXIS] -= mean;
        self.homed_height += mean;
        self.homed_carriage_height += mean; // no need for a full recalc
    }

    /// Carriage height of a single tower for a Cartesian position.
    pub fn transform(&self, machine: &[f32; AXES], axis: usize) -> Result<f32, GeometryError> {
        let radicand = self.d2
            - fsquare(machine[X_AXIS] - self.tower_x[axis])
            - fsquare(machine[Y_AXIS] - self.tower_y[axis]);
        if radicand <= 0.0 {
            return Err(GeometryError::Unreachable {
                x: machine[X_AXIS],
                y: machine[Y_AXIS],
            });
        }
        Ok(machine[Z_AXIS] + radicand.sqrt())
    }

    /// Cartesian position from the three carriage heights.
    pub fn inverse_transform(&self, ha: f32, hb: f32, hc: f32) -> [f32; AXES] {
        let fa = self.core_fa + fsquare(ha);
        let fb = self.core_fb + fsquare(hb);
        let fc = self.core_fc + fsquare(hc);

        // Set up PQRSU such that x = -(S - Uz)/Q, y = (P - Rz)/Q
        let p = self.xbc * fa + self.xca * fb + self.xab * fc;
        let s = self.ybc * fa + self.yca * fb + self.yab * fc;
        let r = 2.0 * (self.xbc * ha + self.xca * hb + self.xab * hc);
        let u = 2.0 * (self.ybc * ha + self.yca * hb + self.yab * hc);

        let a = fsquare(u) + fsquare(r) + self.q2;
        let minus_half_b = s * u + p * r + ha * self.q2 + self.tower_x[X_AXIS] * u * self.q
            - self.tower_y[X_AXIS] * r * self.q;
        let c = fsquare(s + self.tower_x[X_AXIS] * self.q)
            + fsquare(p - self.tower_y[X_AXIS] * self.q)
            + (fsquare(ha) - self.d2) * self.q2;

        // The lower root is the physically reachable solution.
        let z = (minus_half_b - (fsquare(minus_half_b) - a * c).sqrt()) / a;
        [(u * z - s) / self.q, (p - r * z) / self.q, z]
    }

    /// Derivative of effector height with respect to one calibration
    /// parameter at the given carriage heights, by central finite
    /// difference. Parameter indices: 0-2 = endstop adjustments, 3-4 =
    /// X positions of the A and B towers, 5 = Y position of the C tower,
    /// 6 = diagonal rod length.
    pub fn compute_derivative(&self, deriv: usize, ha: f32, hb: f32, hc: f32) -> f32 {
        let perturb = DERIVATIVE_PERTURBATION;
        let mut hi = self.clone();
        let mut lo = self.clone();
        match deriv {
            0 | 1 | 2 => {}
            3 | 4 => {
                hi.tower_x[deriv - 3] += perturb;
                lo.tower_x[deriv - 3] -= perturb;
            }
            5 => {
                // Shift the A and B towers by a third the other way so the
                // tower centroid stays fixed.
                let y_adj = perturb * (1.0 / 3.0);
                hi.tower_y[X_AXIS] -= y_adj;
                hi.tower_y[Y_AXIS] -= y_adj;
                hi.tower_y[Z_AXIS] += perturb - y_adj;
                lo.tower_y[X_AXIS] += y_adj;
                lo.tower_y[Y_AXIS] += y_adj;
                lo.tower_y[Z_AXIS] -= perturb - y_adj;
            }
            6 => {
                hi.diagonal += perturb;
                lo.diagonal -= perturb;
            }
            _ => unreachable!("derivative index out of range"),
        }

        hi.recalc();
        lo.recalc();

        let z_hi = hi.inverse_transform(
            if deriv == 0 { ha + perturb } else { ha },
            if deriv == 1 { hb + perturb } else { hb },
            if deriv == 2 { hc + perturb } else { hc },
        )[Z_AXIS];
        let z_lo = lo.inverse_transform(
            if deriv == 0 { ha - perturb } else { ha },
            if deriv == 1 { hb - perturb } else { hb },
            if deriv == 2 { hc - perturb } else { hc },
        )[Z_AXIS];

        (z_hi - z_lo) / (2.0 * perturb)
    }

    /// Apply a 4-factor adjustment: the three endstop corrections and the
    /// delta radius.
    pub fn adjust_four(&mut self, v: &[f32]) {
        self.endstop_adjustments[X_AXIS] += v[0];
        self.endstop_adjustments[Y_AXIS] += v[1];
        self.endstop_adjustments[Z_AXIS] += v[2];
        self.normalise_endstop_adjustments();
        // Re-establishes the equilateral layout and recalculates.
        self.set_radius(self.radius + v[3]);
    }

    /// Apply a 7-factor adjustment: three endstop corrections, the X
    /// positions of the A and B towers, the Y position of the C tower, and
    /// the diagonal rod length. Clears the equilateral flag.
    pub fn adjust_seven(&mut self, v: &[f32]) {
        let old_carriage_height_a = self.homed_carriage_height(X_AXIS);

        self.endstop_adjustments[X_AXIS] += v[0];
        self.endstop_adjustments[Y_AXIS] += v[1];
        self.endstop_adjustments[Z_AXIS] += v[2];
        self.normalise_endstop_adjustments();

        self.tower_x[X_AXIS] += v[3];
        self.tower_x[Y_AXIS] += v[4];

        let y_adj = v[5] * (1.0 / 3.0);
        self.tower_y[X_AXIS] -= y_adj;
        self.tower_y[Y_AXIS] -= y_adj;
        self.tower_y[Z_AXIS] += v[5] - y_adj;
        self.diagonal += v[6];
        self.is_equilateral = false;

        self.recalc();

        // Moving the towers and rod length shifts the homed carriage height;
        // correct the homed height so tower A changes only by the requested
        // endstop delta.
        let height_error = self.homed_carriage_height(X_AXIS) - old_carriage_height_a - v[0];
        self.homed_height -= height_error;
        self.homed_carriage_height -= height_error;
    }

    /// Printable parameter summary, used by calibration replies and by the
    /// surrounding system when saving the geometry.
    pub fn print_parameters(&self, full: bool) -> String {
        let mut out = format!(
            "Endstops X{:.2} Y{:.2} Z{:.2}, height {:.2}, diagonal {:.2}, ",
            self.endstop_adjustments[X_AXIS],
            self.endstop_adjustments[Y_AXIS],
            self.endstop_adjustments[Z_AXIS],
            self.homed_height,
            self.diagonal,
        );
        if self.is_equilateral && !full {
            out.push_str(&format!("radius {:.2}", self.radius));
        } else {
            out.push_str(&format!(
                "towers ({:.2},{:.2}) ({:.2},{:.2}) ({:.2},{:.2})",
                self.tower_x[X_AXIS],
                self.tower_y[X_AXIS],
                self.tower_x[Y_AXIS],
                self.tower_y[Y_AXIS],
                self.tower_x[Z_AXIS],
                self.tower_y[Z_AXIS],
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_delta() -> DeltaParameters {
        let mut params = DeltaParameters::new();
        params.set_diagonal(300.0);
        params.set_homed_height(240.0);
        params.set_radius(105.0);
        params
    }

    #[test]
    fn equilateral_tower_layout() {
        let params = test_delta();
        let cos30 = 3.0f32.sqrt() / 2.0;
        assert!((params.tower_position(X_AXIS).0 + 105.0 * cos30).abs() < 1e-3);
        assert!((params.tower_position(Y_AXIS).0 - 105.0 * cos30).abs() < 1e-3);
        assert_eq!(params.tower_position(Z_AXIS).0, 0.0);
        assert!((params.tower_position(X_AXIS).1 + 52.5).abs() < 1e-3);
        assert!((params.tower_position(Y_AXIS).1 + 52.5).abs() < 1e-3);
        assert!((params.tower_position(Z_AXIS).1 - 105.0).abs() < 1e-3);
        assert!(params.in_delta_mode());
    }

    #[test]
    fn forward_then_inverse_returns_the_point() {
        let params = test_delta();
        let point = [20.0, -10.0, 50.0];
        let ha = params.transform(&point, X_AXIS).unwrap();
        let hb = params.transform(&point, Y_AXIS).unwrap();
        let hc = params.transform(&point, Z_AXIS).unwrap();
        let back = params.inverse_transform(ha, hb, hc);
        for axis in 0..AXES {
            assert!(
                (back[axis] - point[axis]).abs() < 1e-4,
                "axis {axis}: {} vs {}",
                back[axis],
                point[axis]
            );
        }
    }

    #[test]
    fn unreachable_point_is_rejected() {
        let params = test_delta();
        let err = params.transform(&[400.0, 0.0, 0.0], X_AXIS);
        assert!(matches!(err, Err(GeometryError::Unreachable { .. })));
    }

    #[test]
    fn normalisation_zeroes_the_mean_and_keeps_carriage_heights() {
        let mut params = test_delta();
        params.set_endstop_adjustment(X_AXIS, 0.30);
        params.set_endstop_adjustment(Y_AXIS, -0.10);
        params.set_endstop_adjustment(Z_AXIS, 0.20);

        let heights_before: Vec<f32> = (0..AXES).map(|a| params.homed_carriage_height(a)).collect();

        params.normalise_endstop_adjustments();

        let sum: f32 = (0..AXES).map(|a| params.endstop_adjustment(a)).sum();
        assert!(sum.abs() <= 1e-6);
        assert!((params.homed_height() - (240.0 + 0.4 / 3.0)).abs() < 1e-4);
        for axis in 0..AXES {
            assert!((params.homed_carriage_height(axis) - heights_before[axis]).abs() < 1e-4);
        }
    }

    #[test]
    fn homed_carriage_height_tracks_endstop_adjustment() {
        let mut params = test_delta();
        let base = params.homed_carriage_height(Y_AXIS);
        params.set_endstop_adjustment(Y_AXIS, 0.5);
        // Recalc shifts the base height too, but the per-tower height must
        // reflect the new adjustment relative to the others.
        let shifted = params.homed_carriage_height(Y_AXIS) - params.homed_carriage_height(X_AXIS);
        assert!(shifted > 0.4, "expected tower B above tower A, got {shifted}");
        assert!(params.homed_carriage_height(Y_AXIS) > base);
    }

    #[test]
    fn print_parameters_forms() {
        let mut params = test_delta();
        let brief = params.print_parameters(false);
        assert!(brief.contains("radius 105.00"), "{brief}");
        assert!(brief.contains("height 240.00"), "{brief}");

        params.adjust_seven(&[0.0, 0.0, 0.0, 0.1, -0.1, 0.05, 0.2]);
        assert!(!params.is_equilateral());
        let full = params.print_parameters(false);
        assert!(full.contains("towers ("), "{full}");
    }
}
