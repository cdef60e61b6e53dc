// Bed and axis compensation: probed-point Z correction plus skew

use crate::kinematics::GeometryError;
use crate::platform::{AXES, X_AXIS, Y_AXIS, Z_AXIS};

/// Maximum number of probe records kept.
pub const MAX_PROBE_POINTS: usize = 10;

/// Barycentric tolerance for the 5-point triangle lookup. Slightly negative
/// so that queries on a shared edge still land in one of the triangles.
const TRIANGLE_TOLERANCE: f32 = -0.01;

const X_SET: u8 = 1;
const Y_SET: u8 = 2;
const Z_SET: u8 = 4;

#[derive(Debug, Clone, Copy, Default)]
struct ProbePoint {
    x: f32,
    y: f32,
    z: f32,
    set: u8,
}

/// Additive Z correction from 3, 4 or 5 probed points, plus axis skew
/// compensation. `transform` applies skew then the Z correction;
/// `inverse_transform` undoes them in the reverse order.
pub struct BedCompensation {
    points: [ProbePoint; MAX_PROBE_POINTS],
    identity: bool,

    // 3-point plane coefficients: z += a_x·x + a_y·y + a_c
    a_x: f32,
    a_y: f32,
    a_c: f32,

    // 4-point scaling onto the unit rectangle
    x_rectangle: f32,
    y_rectangle: f32,

    // 5-point pre-expanded barycentric grid (four satellites + apex)
    bary_x: [f32; 5],
    bary_y: [f32; 5],
    bary_z: [f32; 5],

    // Axis skew tangents
    tan_xy: f32,
    tan_yz: f32,
    tan_xz: f32,
}

impl Default for BedCompensation {
    fn default() -> Self {
        Self::new()
    }
}

impl BedCompensation {
    pub fn new() -> Self {
        Self {
            points: [ProbePoint::default(); MAX_PROBE_POINTS],
            identity: true,
            a_x: 0.0,
            a_y: 0.0,
            a_c: 0.0,
            x_rectangle: 0.0,
            y_rectangle: 0.0,
            bary_x: [0.0; 5],
            bary_y: [0.0; 5],
            bary_z: [0.0; 5],
            tan_xy: 0.0,
            tan_yz: 0.0,
            tan_xz: 0.0,
        }
    }

    /// Seed default probe points from the bed size. Only a guess until the
    /// surrounding system provides real ones.
    pub fn seed_default_points(&mut self, x_max: f32, y_max: f32) {
        for (index, point) in self.points.iter_mut().enumerate() {
            if index < 4 {
                point.x = (0.3 + 0.6 * (index % 2) as f32) * x_max;
                point.y = (0.0 + 0.9 * (index / 2) as f32) * y_max;
            }
            point.z = 0.0;
            point.set = 0;
        }
        self.x_rectangle = 1.0 / (0.8 * x_max);
        self.y_rectangle = self.x_rectangle;
    }

    pub fn set_identity(&mut self) {
        self.identity = true;
    }

    pub fn axis_compensation(&self, axis: usize) -> f32 {
        match axis {
            X_AXIS => self.tan_xy,
            Y_AXIS => self.tan_yz,
            Z_AXIS => self.tan_xz,
            _ => 0.0,
        }
    }

    pub fn set_axis_compensation(&mut self, axis: usize, tangent: f32) {
        match axis {
            X_AXIS => self.tan_xy = tangent,
            Y_AXIS => self.tan_yz = tangent,
            Z_AXIS => self.tan_xz = tangent,
            _ => {}
        }
    }

    pub fn set_x_probe_point(&mut self, index: usize, x: f32) -> Result<(), GeometryError> {
        let point = self
            .points
            .get_mut(index)
            .ok_or(GeometryError::BadProbePointCount(index))?;
        point.x = x;
        point.set |= X_SET;
        Ok(())
    }

    pub fn set_y_probe_point(&mut self, index: usize, y: f32) -> Result<(), GeometryError> {
        let point = self
            .points
            .get_mut(index)
            .ok_or(GeometryError::BadProbePointCount(index))?;
        point.y = y;
        point.set |= Y_SET;
        Ok(())
    }

    pub fn set_z_probe_point(&mut self, index: usize, z: f32) -> Result<(), GeometryError> {
        let point = self
            .points
            .get_mut(index)
            .ok_or(GeometryError::BadProbePointCount(index))?;
        point.z = z;
        point.set |= Z_SET;
        Ok(())
    }

    pub fn x_probe_point(&self, index: usize) -> f32 {
        self.points[index].x
    }

    pub fn y_probe_point(&self, index: usize) -> f32 {
        self.points[index].y
    }

    pub fn z_probe_point(&self, index: usize) -> f32 {
        self.points[index].z
    }

    pub fn all_coordinates_set(&self, index: usize) -> bool {
        self.points[index].set == (X_SET | Y_SET | Z_SET)
    }

    pub fn xy_coordinates_set(&self, index: usize) -> bool {
        self.points[index].set & (X_SET | Y_SET) == (X_SET | Y_SET)
    }

    /// Index of the first record lacking all three coordinates.
    pub fn number_of_probe_points(&self) -> usize {
        for index in 0..MAX_PROBE_POINTS {
            if !self.all_coordinates_set(index) {
                return index;
            }
        }
        MAX_PROBE_POINTS
    }

    pub fn number_of_xy_probe_points(&self) -> usize {
        for index in 0..MAX_PROBE_POINTS {
            if !self.xy_coordinates_set(index) {
                return index;
            }
        }
        MAX_PROBE_POINTS
    }

    /// Apply axis skew then the bed Z correction. Returns an error string to
    /// be sent down the reply channel when a 5-point query falls outside all
    /// four triangles; the correction applied is then zero.
    pub fn transform(&self, point: &mut [f32; AXES]) -> Option<&'static str> {
        self.axis_transform(point);
        self.bed_transform(point)
    }

    /// Undo the bed Z correction, then the axis skew.
    pub fn inverse_transform(&self, point: &mut [f32; AXES]) -> Option<&'static str> {
        let report = self.inverse_bed_transform(point);
        self.inverse_axis_transform(point);
        report
    }

    fn axis_transform(&self, point: &mut [f32; AXES]) {
        point[X_AXIS] += self.tan_xy * point[Y_AXIS] + self.tan_xz * point[Z_AXIS];
        point[Y_AXIS] += self.tan_yz * point[Z_AXIS];
    }

    fn inverse_axis_transform(&self, point: &mut [f32; AXES]) {
        point[Y_AXIS] -= self.tan_yz * point[Z_AXIS];
        point[X_AXIS] -= self.tan_xy * point[Y_AXIS] + self.tan_xz * point[Z_AXIS];
    }

    fn bed_transform(&self, point: &mut [f32; AXES]) -> Option<&'static str> {
        if self.identity {
            return None;
        }
        let (dz, report) = self.z_correction(point[X_AXIS], point[Y_AXIS]);
        point[Z_AXIS] += dz;
        report
    }

    fn inverse_bed_transform(&self, point: &mut [f32; AXES]) -> Option<&'static str> {
        if self.identity {
            return None;
        }
        let (dz, report) = self.z_correction(point[X_AXIS], point[Y_AXIS]);
        point[Z_AXIS] -= dz;
        report
    }

    fn z_correction(&self, x: f32, y: f32) -> (f32, Option<&'static str>) {
        match self.number_of_probe_points() {
            0 => (0.0, None),
            3 => (self.a_x * x + self.a_y * y + self.a_c, None),
            4 => (self.second_degree_z(x, y), None),
            5 => self.triangle_z(x, y),
            _ => (0.0, Some("bed transform: wrong number of sample points")),
        }
    }

    /// Ruled-surface quadratic over the four corner points, with x and y
    /// scaled onto the unit interval. Corner indexing:
    ///
    /// ```text
    ///   ^  [1]      [2]
    ///   Y
    ///   |  [0]      [3]
    ///      -----X---->
    /// ```
    fn second_degree_z(&self, x: f32, y: f32) -> f32 {
        let u = (x - self.points[0].x) * self.x_rectangle;
        let v = (y - self.points[0].y) * self.y_rectangle;
        (1.0 - u) * (1.0 - v) * self.points[0].z
            + u * (1.0 - v) * self.points[3].z
            + (1.0 - u) * v * self.points[1].z
            + u * v * self.points[2].z
    }

    fn barycentric(&self, p1: usize, p2: usize, p3: usize, x: f32, y: f32) -> (f32, f32, f32) {
        let y23 = self.bary_y[p2] - self.bary_y[p3];
        let x3 = x - self.bary_x[p3];
        let x32 = self.bary_x[p3] - self.bary_x[p2];
        let y3 = y - self.bary_y[p3];
        let x13 = self.bary_x[p1] - self.bary_x[p3];
        let y13 = self.bary_y[p1] - self.bary_y[p3];
        let i_det = 1.0 / (y23 * x13 + x32 * y13);
        let l1 = (y23 * x3 + x32 * y3) * i_det;
        let l2 = (-y13 * x3 + x13 * y3) * i_det;
        (l1, l2, 1.0 - l1 - l2)
    }

    /// Interpolate on the triangular grid formed by the four satellites and
    /// the shared apex point 4. A query outside all four triangles is
    /// reported and contributes no correction.
    fn triangle_z(&self, x: f32, y: f32) -> (f32, Option<&'static str>) {
        for i in 0..4 {
            let j = (i + 1) % 4;
            let (l1, l2, l3) = self.barycentric(i, j, 4, x, y);
            if l1 > TRIANGLE_TOLERANCE && l2 > TRIANGLE_TOLERANCE && l3 > TRIANGLE_TOLERANCE {
                return (
                    l1 * self.bary_z[i] + l2 * self.bary_z[j] + l3 * self.bary_z[4],
                    None,
                );
            }
        }
        (0.0, Some("triangle interpolation: point outside all triangles"))
    }

    /// Fit the bed equation to the first `num_points` probe records and
    /// return the reply text. Invalidates any previously cached fit.
    pub fn set_probed_bed_equation(&mut self, num_points: usize) -> Result<String, GeometryError> {
        match num_points {
            3 => {
                // Plane through the three points.
                let x10 = self.points[1].x - self.points[0].x;
                let y10 = self.points[1].y - self.points[0].y;
                let z10 = self.points[1].z - self.points[0].z;
                let x20 = self.points[2].x - self.points[0].x;
                let y20 = self.points[2].y - self.points[0].y;
                let z20 = self.points[2].z - self.points[0].z;
                let a = y10 * z20 - z10 * y20;
                let b = z10 * x20 - x10 * z20;
                let c = x10 * y20 - y10 * x20;
                let d = -(self.points[1].x * a + self.points[1].y * b + self.points[1].z * c);
                self.a_x = -a / c;
                self.a_y = -b / c;
                self.a_c = -d / c;
                self.identity = false;
            }
            4 => {
                self.x_rectangle = 1.0 / (self.points[3].x - self.points[0].x);
                self.y_rectangle = 1.0 / (self.points[1].y - self.points[0].y);
                self.identity = false;
            }
            5 => {
                // Pre-expand the satellites to twice their displacement from
                // the apex to widen the triangulation.
                for i in 0..4 {
                    let x10 = self.points[i].x - self.points[4].x;
                    let y10 = self.points[i].y - self.points[4].y;
                    let z10 = self.points[i].z - self.points[4].z;
                    self.bary_x[i] = self.points[4].x + 2.0 * x10;
                    self.bary_y[i] = self.points[4].y + 2.0 * y10;
                    self.bary_z[i] = self.points[4].z + 2.0 * z10;
                }
                self.bary_x[4] = self.points[4].x;
                self.bary_y[4] = self.points[4].y;
                self.bary_z[4] = self.points[4].z;
                self.identity = false;
            }
            n => return Err(GeometryError::BadProbePointCount(n)),
        }

        let mut reply = String::from("Bed equation fits points");
        for point in self.points.iter().take(self.number_of_probe_points()) {
            reply.push_str(&format!(" [{:.1}, {:.1}, {:.3}]", point.x, point.y, point.z));
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(bed: &mut BedCompensation, index: usize, x: f32, y: f32, z: f32) {
        bed.set_x_probe_point(index, x).unwrap();
        bed.set_y_probe_point(index, y).unwrap();
        bed.set_z_probe_point(index, z).unwrap();
    }

    #[test]
    fn counts_points_up_to_the_first_incomplete_record() {
        let mut bed = BedCompensation::new();
        probe(&mut bed, 0, 0.0, 0.0, 0.1);
        probe(&mut bed, 1, 10.0, 0.0, 0.2);
        bed.set_x_probe_point(2, 20.0).unwrap();
        assert_eq!(bed.number_of_probe_points(), 2);
        assert_eq!(bed.number_of_xy_probe_points(), 2);
    }

    #[test]
    fn three_point_plane_fits_exactly() {
        let mut bed = BedCompensation::new();
        probe(&mut bed, 0, 0.0, 0.0, 0.0);
        probe(&mut bed, 1, 100.0, 0.0, 0.1);
        probe(&mut bed, 2, 0.0, 100.0, 0.2);
        bed.set_probed_bed_equation(3).unwrap();

        let mut point = [100.0, 0.0, 1.0];
        assert!(bed.transform(&mut point).is_none());
        assert!((point[2] - 1.1).abs() < 1e-5);

        let mut back = point;
        assert!(bed.inverse_transform(&mut back).is_none());
        assert!((back[2] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn four_point_bilinear_averages_the_corners_at_the_centre() {
        let mut bed = BedCompensation::new();
        probe(&mut bed, 0, 0.0, 0.0, 0.0);
        probe(&mut bed, 1, 0.0, 200.0, 0.1);
        probe(&mut bed, 2, 200.0, 200.0, 0.2);
        probe(&mut bed, 3, 200.0, 0.0, 0.05);
        bed.set_probed_bed_equation(4).unwrap();

        let mut point = [100.0, 100.0, 0.0];
        assert!(bed.transform(&mut point).is_none());
        assert!((point[2] - 0.0875).abs() < 1e-5, "got {}", point[2]);
    }

    #[test]
    fn five_point_triangle_interpolates_and_rejects_outside_queries() {
        let mut bed = BedCompensation::new();
        probe(&mut bed, 0, 20.0, 20.0, 0.1);
        probe(&mut bed, 1, 20.0, 180.0, 0.1);
        probe(&mut bed, 2, 180.0, 180.0, 0.1);
        probe(&mut bed, 3, 180.0, 20.0, 0.1);
        probe(&mut bed, 4, 100.0, 100.0, 0.1);
        bed.set_probed_bed_equation(5).unwrap();

        // Flat bed: any interior query returns the common offset.
        let mut point = [100.0, 60.0, 0.0];
        let report = bed.transform(&mut point);
        assert!(report.is_none());
        assert!((point[2] - 0.1).abs() < 1e-5);

        // The satellites were expanded x2 about the apex, so the covered
        // square spans roughly [-60, 260]; far outside must report.
        let mut outside = [1000.0, 1000.0, 0.0];
        let report = bed.transform(&mut outside);
        assert!(report.is_some());
        assert_eq!(outside[2], 0.0);
    }

    #[test]
    fn skew_round_trip() {
        let mut bed = BedCompensation::new();
        bed.set_axis_compensation(X_AXIS, 0.01);
        bed.set_axis_compensation(Y_AXIS, -0.005);
        bed.set_axis_compensation(Z_AXIS, 0.002);

        let original = [50.0, 40.0, 10.0];
        let mut point = original;
        assert!(bed.transform(&mut point).is_none());
        assert!((point[0] - (50.0 + 0.01 * 40.0 + 0.002 * 10.0)).abs() < 1e-5);
        assert!(bed.inverse_transform(&mut point).is_none());
        for axis in 0..AXES {
            assert!((point[axis] - original[axis]).abs() < 1e-5);
        }
    }
}
