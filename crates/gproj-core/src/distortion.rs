//! Brown-Conrady lens distortion (radial k1, k2, k3 and tangential p1, p2).
//!
//! The forward model maps ideal (undistorted) normalized coordinates to
//! distorted ones and has a closed form. The inverse is solved with Newton
//! iterations on the analytic Jacobian.

use crate::{GeometryError, Intrinsics};
use nalgebra::{Matrix2, Point2, Vector2};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Distortion coefficients in OpenCV order `[k1, k2, p1, p2, k3]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DistortionCoefficients {
    pub k1: f64,
    pub k2: f64,
    pub p1: f64,
    pub p2: f64,
    pub k3: f64,
}

/// Plausible magnitude of each coefficient for CCTV lenses.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoefficientLimits {
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
}

impl Default for CoefficientLimits {
    fn default() -> Self {
        Self {
            k1: 1.2,
            k2: 1.0,
            k3: 2.0,
            p1: 0.01,
            p2: 0.01,
        }
    }
}

impl DistortionCoefficients {
    pub fn from_array(d: [f64; 5]) -> Self {
        Self {
            k1: d[0],
            k2: d[1],
            p1: d[2],
            p2: d[3],
            k3: d[4],
        }
    }

    pub fn to_array(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    pub fn is_zero(&self) -> bool {
        self.to_array().iter().all(|v| *v == 0.0)
    }

    /// Check finiteness and the per-coefficient magnitude limits.
    pub fn validate(&self, limits: &CoefficientLimits) -> Result<(), GeometryError> {
        let checks = [
            ("k1", self.k1, limits.k1),
            ("k2", self.k2, limits.k2),
            ("p1", self.p1, limits.p1),
            ("p2", self.p2, limits.p2),
            ("k3", self.k3, limits.k3),
        ];
        for (name, value, limit) in checks {
            if !value.is_finite() {
                return Err(GeometryError::NonFinite { what: name });
            }
            if value.abs() > limit {
                return Err(GeometryError::CoefficientOutOfRange { name, value, limit });
            }
        }
        Ok(())
    }

    /// Apply the forward model in normalized coordinates.
    #[inline]
    pub fn distort_normalized(&self, p: Point2<f64>) -> Point2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        Point2::new(xd, yd)
    }

    /// Jacobian of [`Self::distort_normalized`] with respect to (x, y).
    pub fn jacobian(&self, p: Point2<f64>) -> Matrix2<f64> {
        let (x, y) = (p.x, p.y);
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let d_radial = self.k1 + 2.0 * self.k2 * r2 + 3.0 * self.k3 * r2 * r2;

        let dxx = radial + 2.0 * x * x * d_radial + 2.0 * self.p1 * y + 6.0 * self.p2 * x;
        let dxy = 2.0 * x * y * d_radial + 2.0 * self.p1 * x + 2.0 * self.p2 * y;
        let dyy = radial + 2.0 * y * y * d_radial + 6.0 * self.p1 * y + 2.0 * self.p2 * x;

        Matrix2::new(dxx, dxy, dxy, dyy)
    }
}

/// Iteration budget for [`undistort`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UndistortOptions {
    pub max_iterations: usize,
    /// Convergence threshold on the re-distorted point, in pixels.
    pub tolerance_px: f64,
}

impl Default for UndistortOptions {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tolerance_px: 1e-3,
        }
    }
}

/// Outcome of an inverse-distortion solve.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Undistorted {
    /// Best estimate of the ideal pixel.
    pub point: Point2<f64>,
    pub converged: bool,
    pub iterations: usize,
    /// Pixel distance between the re-distorted estimate and the input.
    pub residual_px: f64,
}

/// Map an ideal (undistorted) pixel to the raw image.
pub fn distort(
    pixel: Point2<f64>,
    k: &Intrinsics,
    coeffs: &DistortionCoefficients,
) -> Point2<f64> {
    k.denormalize(coeffs.distort_normalized(k.normalize(pixel)))
}

/// Map a raw pixel to its ideal (undistorted) location.
///
/// Non-convergence is not an error: the best estimate is returned with
/// `converged == false`.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "trace", skip(k, coeffs, opts), fields(x = pixel.x, y = pixel.y))
)]
pub fn undistort(
    pixel: Point2<f64>,
    k: &Intrinsics,
    coeffs: &DistortionCoefficients,
    opts: &UndistortOptions,
) -> Undistorted {
    let target = k.normalize(pixel);
    let pixel_residual = |est: Point2<f64>| -> f64 {
        let d = coeffs.distort_normalized(est) - target;
        (d.x * k.fx).hypot(d.y * k.fy)
    };

    let mut est = target;
    let mut best = est;
    let mut best_residual = pixel_residual(est);
    let mut iterations = 0;

    while iterations < opts.max_iterations && best_residual >= opts.tolerance_px {
        iterations += 1;
        let f = coeffs.distort_normalized(est) - target;
        let Some(j_inv) = coeffs.jacobian(est).try_inverse() else {
            break;
        };
        let step: Vector2<f64> = j_inv * f;
        est -= step;
        if !est.x.is_finite() || !est.y.is_finite() {
            break;
        }
        let residual = pixel_residual(est);
        if residual < best_residual {
            best = est;
            best_residual = residual;
        }
    }

    let converged = best_residual < opts.tolerance_px;
    if !converged {
        log::debug!(
            "undistort did not converge at ({:.1}, {:.1}): residual {:.3e}px after {} iterations",
            pixel.x,
            pixel.y,
            best_residual,
            iterations
        );
    }

    Undistorted {
        point: k.denormalize(best),
        converged,
        iterations,
        residual_px: best_residual,
    }
}

/// Intrinsics and distortion of one camera.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LensModel {
    pub intrinsics: Intrinsics,
    pub distortion: DistortionCoefficients,
}

impl LensModel {
    pub fn new(intrinsics: Intrinsics, distortion: DistortionCoefficients) -> Self {
        Self {
            intrinsics,
            distortion,
        }
    }

    #[inline]
    pub fn distort(&self, pixel: Point2<f64>) -> Point2<f64> {
        distort(pixel, &self.intrinsics, &self.distortion)
    }

    #[inline]
    pub fn undistort(&self, pixel: Point2<f64>, opts: &UndistortOptions) -> Undistorted {
        undistort(pixel, &self.intrinsics, &self.distortion, opts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> Intrinsics {
        Intrinsics::new(1000.0, 1000.0, 960.0, 540.0).expect("valid")
    }

    fn barrel() -> DistortionCoefficients {
        DistortionCoefficients {
            k1: -0.3,
            k2: 0.1,
            p1: 0.001,
            p2: -0.0005,
            k3: 0.0,
        }
    }

    #[test]
    fn zero_coefficients_are_identity() {
        let k = camera();
        let d = DistortionCoefficients::default();
        let p = Point2::new(12.0, 1010.0);
        let q = distort(p, &k, &d);
        assert_relative_eq!(q.x, p.x, epsilon = 1e-9);
        assert_relative_eq!(q.y, p.y, epsilon = 1e-9);
        let u = undistort(p, &k, &d, &UndistortOptions::default());
        assert!(u.converged);
        assert_eq!(u.iterations, 0);
        assert_relative_eq!(u.point.x, p.x, epsilon = 1e-9);
    }

    #[test]
    fn undistort_then_distort_returns_pixel() {
        let k = camera();
        let d = barrel();
        let opts = UndistortOptions::default();
        for p in [
            Point2::new(100.0, 100.0),
            Point2::new(960.0, 540.0),
            Point2::new(1800.0, 1000.0),
            Point2::new(1500.0, 200.0),
            Point2::new(0.0, 0.0),
        ] {
            let u = undistort(p, &k, &d, &opts);
            assert!(u.converged, "no convergence at {p:?}: {u:?}");
            let back = distort(u.point, &k, &d);
            assert!((back - p).norm() < 1e-2, "{p:?} -> {back:?}");
        }
    }

    #[test]
    fn analytic_jacobian_matches_finite_differences() {
        let d = DistortionCoefficients {
            k1: 0.2,
            k2: -0.05,
            p1: 0.004,
            p2: -0.003,
            k3: 0.01,
        };
        let p = Point2::new(0.3, -0.4);
        let j = d.jacobian(p);
        let h = 1e-7;
        let fx = (d.distort_normalized(Point2::new(p.x + h, p.y))
            - d.distort_normalized(Point2::new(p.x - h, p.y)))
            / (2.0 * h);
        let fy = (d.distort_normalized(Point2::new(p.x, p.y + h))
            - d.distort_normalized(Point2::new(p.x, p.y - h)))
            / (2.0 * h);
        assert_relative_eq!(j[(0, 0)], fx.x, epsilon = 1e-6);
        assert_relative_eq!(j[(1, 0)], fx.y, epsilon = 1e-6);
        assert_relative_eq!(j[(0, 1)], fy.x, epsilon = 1e-6);
        assert_relative_eq!(j[(1, 1)], fy.y, epsilon = 1e-6);
    }

    #[test]
    fn folded_radial_profile_reports_non_convergence() {
        // r * (1 - 1.2 r^2) never exceeds ~0.351, so 0.6 has no preimage.
        let k = camera();
        let d = DistortionCoefficients {
            k1: -1.2,
            ..Default::default()
        };
        let u = undistort(
            Point2::new(960.0 + 600.0, 540.0),
            &k,
            &d,
            &UndistortOptions::default(),
        );
        assert!(!u.converged);
        assert!(u.point.x.is_finite() && u.point.y.is_finite());
        assert!(u.residual_px > 1.0);
    }

    #[test]
    fn limits_reject_out_of_range() {
        let limits = CoefficientLimits::default();
        barrel().validate(&limits).expect("plausible");
        let bad = DistortionCoefficients {
            p1: 0.5,
            ..barrel()
        };
        assert!(matches!(
            bad.validate(&limits),
            Err(GeometryError::CoefficientOutOfRange { name: "p1", .. })
        ));
        let d = DistortionCoefficients::from_array([0.1, 0.2, 0.003, 0.004, 0.5]);
        assert_eq!(d.to_array(), [0.1, 0.2, 0.003, 0.004, 0.5]);
        assert_eq!(d.p2, 0.004);
    }
}
