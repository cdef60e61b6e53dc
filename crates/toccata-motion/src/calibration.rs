// Least-squares delta calibration from probed bed heights

use crate::bed::MAX_PROBE_POINTS;
use crate::kinematics::{DeltaParameters, GeometryError};
use crate::platform::{X_AXIS, Y_AXIS, Z_AXIS};

/// Maximum number of calibration factors: three endstop corrections, two
/// tower X positions, one tower Y position, and the diagonal rod length.
pub const MAX_FACTORS: usize = 7;

/// A stack-allocated row-major matrix sized at compile time.
#[derive(Debug, Clone)]
pub struct FixedMatrix<const R: usize, const C: usize> {
    data: [[f32; C]; R],
}

impl<const R: usize, const C: usize> FixedMatrix<R, C> {
    pub fn zero() -> Self {
        Self {
            data: [[0.0; C]; R],
        }
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row][col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row][col] = value;
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        self.data.swap(a, b);
    }

    /// Solve the first `n` rows as an augmented system `n × (n+1)` in place
    /// by Gauss-Jordan elimination with partial pivoting, writing the
    /// solution into `solution[..n]`.
    pub fn gauss_jordan(&mut self, solution: &mut [f32], n: usize) {
        for col in 0..n {
            // Partial pivot: bring the largest remaining element up.
            let mut pivot_row = col;
            for row in col + 1..n {
                if self.data[row][col].abs() > self.data[pivot_row][col].abs() {
                    pivot_row = row;
                }
            }
            if pivot_row != col {
                self.swap_rows(col, pivot_row);
            }

            let pivot = self.data[col][col];
            for other in 0..n {
                if other != col && self.data[other][col] != 0.0 {
                    let factor = self.data[other][col] / pivot;
                    for k in col..=n {
                        self.data[other][k] -= factor * self.data[col][k];
                    }
                }
            }
        }

        for (row, value) in solution.iter_mut().enumerate().take(n) {
            *value = self.data[row][n] / self.data[row][row];
        }
    }
}

/// Outcome of one calibration solve: the correction vector and the residual
/// norms before and after, for convergence reporting.
#[derive(Debug, Clone)]
pub struct CalibrationSolution {
    pub factors: [f32; MAX_FACTORS],
    pub num_factors: usize,
    pub initial_deviation: f32,
    pub expected_deviation: f32,
}

/// Build the Jacobian of probe-height residuals against the calibration
/// parameters, form the normal equations, and solve them. Uses 4 factors
/// (first four derivative slots, applied as endstops + radius) below 7
/// probe points, 7 factors otherwise.
pub fn compute_adjustment(
    params: &DeltaParameters,
    points: &[(f32, f32, f32)],
) -> Result<CalibrationSolution, GeometryError> {
    let num_points = points.len();
    if !(4..=MAX_PROBE_POINTS).contains(&num_points) {
        return Err(GeometryError::BadCalibrationPointCount {
            got: num_points,
            max: MAX_PROBE_POINTS,
        });
    }

    let num_factors = if num_points >= 7 { 7 } else { 4 };

    // Derivatives of effector height with respect to each factor, one row
    // per probe point.
    let mut derivatives = FixedMatrix::<MAX_PROBE_POINTS, MAX_FACTORS>::zero();
    for (i, &(x, y, _)) in points.iter().enumerate() {
        let machine = [x, y, 0.0]; // the probed height does not matter here
        let ha = params.transform(&machine, X_AXIS)?;
        let hb = params.transform(&machine, Y_AXIS)?;
        let hc = params.transform(&machine, Z_AXIS)?;
        for j in 0..num_factors {
            derivatives.set(i, j, params.compute_derivative(j, ha, hb, hc));
        }
    }

    // Normal equations for least squares: M = JᵀJ, v = −Jᵀz, as one
    // augmented matrix.
    let mut normal = FixedMatrix::<MAX_FACTORS, { MAX_FACTORS + 1 }>::zero();
    for i in 0..num_factors {
        for j in 0..num_factors {
            let mut sum = 0.0;
            for (k, _) in points.iter().enumerate() {
                sum += derivatives.get(k, i) * derivatives.get(k, j);
            }
            normal.set(i, j, sum);
        }
        let mut sum = 0.0;
        for (k, &(_, _, z)) in points.iter().enumerate() {
            sum += derivatives.get(k, i) * -z;
        }
        normal.set(i, num_factors, sum);
    }

    let mut solution = [0.0f32; MAX_FACTORS];
    normal.gauss_jordan(&mut solution[..num_factors], num_factors);

    // Residuals after applying the solution, for the convergence report.
    let mut sum_before = 0.0;
    let mut sum_after = 0.0;
    for (k, &(_, _, z)) in points.iter().enumerate() {
        sum_before += z * z;
        let mut residual = z;
        for j in 0..num_factors {
            residual += solution[j] * derivatives.get(k, j);
        }
        sum_after += residual * residual;
    }

    Ok(CalibrationSolution {
        factors: solution,
        num_factors,
        initial_deviation: (sum_before / num_points as f32).sqrt(),
        expected_deviation: (sum_after / num_points as f32).sqrt(),
    })
}

/// Apply a solve to the parameter block through the 4- or 7-element adjust
/// operation.
pub fn apply_adjustment(params: &mut DeltaParameters, solution: &CalibrationSolution) {
    if solution.num_factors == 7 {
        params.adjust_seven(&solution.factors);
    } else {
        params.adjust_four(&solution.factors[..4]);
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
    fn gauss_jordan_solves_a_small_system() {
        // 2x + y = 5, x - y = 1  =>  x = 2, y = 1
        let mut m = FixedMatrix::<3, 4>::zero();
        m.set(0, 0, 2.0);
        m.set(0, 1, 1.0);
        m.set(0, 2, 5.0);
        m.set(1, 0, 1.0);
        m.set(1, 1, -1.0);
        m.set(1, 2, 1.0);
        let mut solution = [0.0f32; 2];
        m.gauss_jordan(&mut solution, 2);
        assert!((solution[0] - 2.0).abs() < 1e-5);
        assert!((solution[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn gauss_jordan_pivots_on_a_zero_diagonal() {
        // y = 3, x = 2 with a zero in the top-left slot.
        let mut m = FixedMatrix::<2, 3>::zero();
        m.set(0, 0, 0.0);
        m.set(0, 1, 1.0);
        m.set(0, 2, 3.0);
        m.set(1, 0, 1.0);
        m.set(1, 1, 0.0);
        m.set(1, 2, 2.0);
        let mut solution = [0.0f32; 2];
        m.gauss_jordan(&mut solution, 2);
        assert!((solution[0] - 2.0).abs() < 1e-5);
        assert!((solution[1] - 3.0).abs() < 1e-5);
    }

    #[test]
    fn rejects_too_few_points() {
        let params = test_delta();
        let points = vec![(0.0, 50.0, 0.1); 3];
        assert!(matches!(
            compute_adjustment(&params, &points),
            Err(GeometryError::BadCalibrationPointCount { got: 3, .. })
        ));
    }

    #[test]
    fn seven_factor_solve_reduces_synthetic_residuals() {
        let params = test_delta();

        // Six symmetric edge points plus the centre, with injected errors.
        let probe_radius = 80.0;
        let errors = [0.05, -0.05, 0.05, -0.05, 0.0, 0.0, 0.0];
        let mut points = Vec::new();
        for (i, &err) in errors.iter().enumerate().take(6) {
            let angle = (i as f32) * std::f32::consts::PI / 3.0;
            points.push((probe_radius * angle.cos(), probe_radius * angle.sin(), err));
        }
        points.push((0.0, 0.0, errors[6]));

        let solution = compute_adjustment(&params, &points).unwrap();
        assert_eq!(solution.num_factors, 7);
        assert!(
            solution.expected_deviation * 10.0 <= solution.initial_deviation,
            "deviation {} -> {}",
            solution.initial_deviation,
            solution.expected_deviation
        );

        let mut adjusted = params.clone();
        apply_adjustment(&mut adjusted, &solution);
        assert!(!adjusted.is_equilateral());
    }

    #[test]
    fn four_factor_solve_adjusts_endstops_and_radius() {
        let params = test_delta();
        let radius_before = params.radius();

        // A uniformly high centre relative to the edge reads as a radius
        // error; endstop errors show up as per-tower tilt.
        let points = vec![
            (80.0, 0.0, 0.08),
            (-40.0, 69.3, 0.02),
            (-40.0, -69.3, 0.05),
            (0.0, 0.0, -0.06),
        ];
        let solution = compute_adjustment(&params, &points).unwrap();
        assert_eq!(solution.num_factors, 4);

        let mut adjusted = params.clone();
        apply_adjustment(&mut adjusted, &solution);
        assert!(adjusted.is_equilateral());
        assert!((adjusted.radius() - radius_before).abs() > 1e-4);
        let sum: f32 = (0..3).map(|a| adjusted.endstop_adjustment(a)).sum();
        assert!(sum.abs() < 1e-5);
    }
}
