use crate::GeometryError;
use nalgebra::{DMatrix, Matrix3, Point2, SMatrix, SVector, Vector3};

/// Smallest-to-largest singular value ratio below which H is singular.
pub const SINGULAR_CONDITIONING: f64 = 1e-12;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    pub fn from_array(rows: [[f64; 3]; 3]) -> Self {
        Self::new(Matrix3::from_row_slice(&[
            rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0],
            rows[2][1], rows[2][2],
        ]))
    }

    pub fn to_array(&self) -> [[f64; 3]; 3] {
        [
            [self.h[(0, 0)], self.h[(0, 1)], self.h[(0, 2)]],
            [self.h[(1, 0)], self.h[(1, 1)], self.h[(1, 2)]],
            [self.h[(2, 0)], self.h[(2, 1)], self.h[(2, 2)]],
        ]
    }

    /// Map a point; the result is non-finite when it lands on the line at
    /// infinity.
    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        Point2::new(v[0] / v[2], v[1] / v[2])
    }

    /// Homogeneous image of `p`, without the perspective division.
    #[inline]
    pub fn apply_homogeneous(&self, p: Point2<f64>) -> Vector3<f64> {
        self.h * Vector3::new(p.x, p.y, 1.0)
    }

    /// Map a point, rejecting results on the line at infinity.
    pub fn try_apply(&self, p: Point2<f64>) -> Option<Point2<f64>> {
        let v = self.apply_homogeneous(p);
        let w = v[2];
        if w.abs() < 1e-12 {
            return None;
        }
        let out = Point2::new(v[0] / w, v[1] / w);
        (out.x.is_finite() && out.y.is_finite()).then_some(out)
    }

    /// Sign of the homogeneous coordinate of `p`; points on the same side of
    /// the vanishing line share it.
    #[inline]
    pub fn side_of_horizon(&self, p: Point2<f64>) -> f64 {
        self.apply_homogeneous(p)[2].signum()
    }

    /// Like [`Self::try_apply`], but also rejects points on the other side of
    /// the vanishing line than `side` (see [`Self::side_of_horizon`]).
    pub fn try_apply_facing(&self, p: Point2<f64>, side: f64) -> Option<Point2<f64>> {
        let v = self.apply_homogeneous(p);
        if v[2] * side <= 0.0 {
            return None;
        }
        self.try_apply(p)
    }

    pub fn inverse(&self) -> Option<Self> {
        let inv = self.h.try_inverse()?;
        normalize_homography(inv).map(Self::new)
    }

    /// Ratio of the smallest to the largest singular value.
    pub fn conditioning(&self) -> f64 {
        let sv = self.h.singular_values();
        let max = sv.max();
        if !max.is_finite() || max <= 0.0 {
            return 0.0;
        }
        sv.min() / max
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.h.iter().any(|v| !v.is_finite()) {
            return Err(GeometryError::NonFinite { what: "homography" });
        }
        let conditioning = self.conditioning();
        if conditioning < SINGULAR_CONDITIONING {
            return Err(GeometryError::SingularMatrix {
                what: "homography",
                conditioning,
            });
        }
        Ok(())
    }
}

fn hartley_normalization(cx: f64, cy: f64, mean_dist: f64) -> Matrix3<f64> {
    let s = if mean_dist > 1e-12 {
        (2.0_f64).sqrt() / mean_dist
    } else {
        1.0
    };

    Matrix3::<f64>::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0)
}

/// Hartley normalization: translate to the centroid and scale so the mean
/// distance to it is sqrt(2).
pub fn normalize_points(pts: &[Point2<f64>]) -> (Vec<Point2<f64>>, Matrix3<f64>) {
    let n = pts.len().max(1) as f64;
    let (sx, sy) = pts
        .iter()
        .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    let (cx, cy) = (sx / n, sy / n);

    let mean_dist = pts
        .iter()
        .map(|p| (p.x - cx).hypot(p.y - cy))
        .sum::<f64>()
        / n;

    let t = hartley_normalization(cx, cy, mean_dist);

    let out = pts
        .iter()
        .map(|p| {
            let v = t * Vector3::new(p.x, p.y, 1.0);
            Point2::new(v[0], v[1])
        })
        .collect();
    (out, t)
}

fn normalize_homography(h: Matrix3<f64>) -> Option<Matrix3<f64>> {
    let s = h[(2, 2)];
    if s.abs() < 1e-12 {
        return None;
    }
    Some(h / s)
}

fn denormalize_homography(
    hn: Matrix3<f64>,
    t_src: Matrix3<f64>,
    t_dst: Matrix3<f64>,
) -> Option<Matrix3<f64>> {
    let t_dst_inv = t_dst.try_inverse()?;
    Some(t_dst_inv * hn * t_src)
}

/// Least-squares DLT estimate of H such that `dst ~ H * src`.
///
/// Exactly four pairs are routed to [`homography_from_4pt`].
pub fn estimate_homography(src: &[Point2<f64>], dst: &[Point2<f64>]) -> Option<Homography> {
    if src.len() != dst.len() || src.len() < 4 {
        return None;
    }

    if src.len() == 4 {
        let s: &[Point2<f64>; 4] = src.try_into().ok()?;
        let d: &[Point2<f64>; 4] = dst.try_into().ok()?;
        return homography_from_4pt(s, d);
    }

    let (s, ts) = normalize_points(src);
    let (d, td) = normalize_points(dst);

    // Build A (2N x 9)
    let n = src.len();
    let mut a = DMatrix::<f64>::zeros(2 * n, 9);

    for k in 0..n {
        let x = s[k].x;
        let y = s[k].y;
        let u = d[k].x;
        let v = d[k].y;

        // [ -x -y -1   0  0  0   u*x u*y u ]
        a[(2 * k, 0)] = -x;
        a[(2 * k, 1)] = -y;
        a[(2 * k, 2)] = -1.0;
        a[(2 * k, 6)] = u * x;
        a[(2 * k, 7)] = u * y;
        a[(2 * k, 8)] = u;

        // [ 0  0  0  -x -y -1   v*x v*y v ]
        a[(2 * k + 1, 3)] = -x;
        a[(2 * k + 1, 4)] = -y;
        a[(2 * k + 1, 5)] = -1.0;
        a[(2 * k + 1, 6)] = v * x;
        a[(2 * k + 1, 7)] = v * y;
        a[(2 * k + 1, 8)] = v;
    }

    // h is the right singular vector of the smallest singular value
    let svd = a.svd(false, true);
    let vt = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let h = vt.row(min_idx);

    let hn =
        Matrix3::<f64>::from_row_slice(&[h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]]);

    let h_den = denormalize_homography(hn, ts, td)?;
    let h_den = normalize_homography(h_den)?;

    Some(Homography::new(h_den))
}

/// Exact H such that `dst ~ H * src` from four pairs, with h33 fixed to 1.
///
/// Point order must be consistent between `src` and `dst`.
pub fn homography_from_4pt(src: &[Point2<f64>; 4], dst: &[Point2<f64>; 4]) -> Option<Homography> {
    // Unknowns: [h11 h12 h13 h21 h22 h23 h31 h32]
    // h11 x + h12 y + h13 - u h31 x - u h32 y = u
    // h21 x + h22 y + h23 - v h31 x - v h32 y = v
    let (src_n, t_src) = normalize_points(src);
    let (dst_n, t_dst) = normalize_points(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for k in 0..4 {
        let x = src_n[k].x;
        let y = src_n[k].y;
        let u = dst_n[k].x;
        let v = dst_n[k].y;

        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    let x = a.lu().solve(&b)?;
    if x.iter().any(|v| !v.is_finite()) {
        return None;
    }

    let hn = Matrix3::<f64>::new(
        x[0], x[1], x[2], //
        x[3], x[4], x[5], //
        x[6], x[7], 1.0,
    );

    let h_den = denormalize_homography(hn, t_src, t_dst)?;
    let h_den = normalize_homography(h_den)?;

    Some(Homography::new(h_den))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn perspective() -> Homography {
        Homography::from_array([
            [1.2, 0.1, 30.0],
            [-0.05, 0.9, 12.0],
            [1e-4, 2e-4, 1.0],
        ])
    }

    fn assert_close(a: Point2<f64>, b: Point2<f64>, tol: f64) {
        assert!((a - b).norm() < tol, "{a:?} vs {b:?}");
    }

    #[test]
    fn four_point_solve_recovers_known_h() {
        let h = perspective();
        let src = [
            Point2::new(0.0, 0.0),
            Point2::new(100.0, 0.0),
            Point2::new(100.0, 80.0),
            Point2::new(0.0, 80.0),
        ];
        let dst = src.map(|p| h.apply(p));
        let est = homography_from_4pt(&src, &dst).expect("solvable");
        assert_relative_eq!(est.h, h.h, epsilon = 1e-9);
    }

    #[test]
    fn least_squares_matches_on_exact_data() {
        let h = perspective();
        let src: Vec<_> = (0..12)
            .map(|i| Point2::new((i % 4) as f64 * 37.0, (i / 4) as f64 * 41.0 + 3.0))
            .collect();
        let dst: Vec<_> = src.iter().map(|p| h.apply(*p)).collect();
        let est = estimate_homography(&src, &dst).expect("solvable");
        for p in &src {
            assert_close(est.apply(*p), h.apply(*p), 1e-6);
        }
    }

    #[test]
    fn inverse_round_trip() {
        let h = perspective();
        let inv = h.inverse().expect("invertible");
        for p in [Point2::new(3.0, 4.0), Point2::new(-50.0, 250.0)] {
            assert_close(inv.apply(h.apply(p)), p, 1e-9);
        }
        assert_relative_eq!(inv.h[(2, 2)], 1.0);
    }

    #[test]
    fn singular_matrix_is_rejected() {
        let h = Homography::from_array([[1.0, 2.0, 3.0], [2.0, 4.0, 6.0], [0.0, 0.0, 1.0]]);
        assert!(matches!(
            h.validate(),
            Err(GeometryError::SingularMatrix { .. })
        ));
        perspective().validate().expect("regular");
    }

    #[test]
    fn facing_check_rejects_points_behind_horizon() {
        let h = Homography::from_array([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, -0.01, 1.0]]);
        let side = h.side_of_horizon(Point2::new(0.0, 10.0));
        assert!(h.try_apply_facing(Point2::new(0.0, 50.0), side).is_some());
        assert!(h.try_apply(Point2::new(0.0, 100.0)).is_none());
        assert!(h.try_apply(Point2::new(0.0, 150.0)).is_some());
        assert!(h.try_apply_facing(Point2::new(0.0, 150.0), side).is_none());
    }
}
