use crate::GeometryError;
use nalgebra::{Matrix3, Point2};
use serde::{Deserialize, Serialize};

/// Pinhole intrinsics with zero skew.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
}

impl Intrinsics {
    /// Build and validate intrinsics.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Result<Self, GeometryError> {
        let k = Self { fx, fy, cx, cy };
        k.validate()?;
        Ok(k)
    }

    /// Starting guess for an uncalibrated camera of the given resolution:
    /// focal length equal to the image width, principal point at the center.
    pub fn for_resolution(width: u32, height: u32) -> Self {
        let w = f64::from(width);
        let h = f64::from(height);
        Self {
            fx: w,
            fy: w,
            cx: w / 2.0,
            cy: h / 2.0,
        }
    }

    /// Parse a row-major 3x3 K. Skew and the projective row must be trivial.
    pub fn from_array(k: [[f64; 3]; 3]) -> Result<Self, GeometryError> {
        if k.iter().flatten().any(|v| !v.is_finite()) {
            return Err(GeometryError::NonFinite { what: "K" });
        }
        if k[0][1].abs() > 1e-9 || k[1][0].abs() > 1e-9 {
            return Err(GeometryError::InvalidIntrinsics {
                reason: format!("non-zero skew ({}, {})", k[0][1], k[1][0]),
            });
        }
        if k[2][0].abs() > 1e-9 || k[2][1].abs() > 1e-9 || (k[2][2] - 1.0).abs() > 1e-9 {
            return Err(GeometryError::InvalidIntrinsics {
                reason: format!("last row must be [0, 0, 1], got {:?}", k[2]),
            });
        }
        Self::new(k[0][0], k[1][1], k[0][2], k[1][2])
    }

    pub fn to_array(&self) -> [[f64; 3]; 3] {
        [
            [self.fx, 0.0, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }

    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// K⁻¹ in closed form; valid after [`Intrinsics::validate`].
    pub fn inverse_matrix(&self) -> Matrix3<f64> {
        Matrix3::new(
            1.0 / self.fx,
            0.0,
            -self.cx / self.fx,
            0.0,
            1.0 / self.fy,
            -self.cy / self.fy,
            0.0,
            0.0,
            1.0,
        )
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if ![self.fx, self.fy, self.cx, self.cy]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(GeometryError::NonFinite { what: "intrinsics" });
        }
        if self.fx <= 0.0 || self.fy <= 0.0 {
            return Err(GeometryError::InvalidIntrinsics {
                reason: format!("focal lengths must be positive (fx={}, fy={})", self.fx, self.fy),
            });
        }
        Ok(())
    }

    /// Pixel to normalized camera coordinates.
    #[inline]
    pub fn normalize(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::new((p.x - self.cx) / self.fx, (p.y - self.cy) / self.fy)
    }

    /// Normalized camera coordinates to pixel.
    #[inline]
    pub fn denormalize(&self, n: Point2<f64>) -> Point2<f64> {
        Point2::new(n.x * self.fx + self.cx, n.y * self.fy + self.cy)
    }

    /// Intrinsics for the same lens at a resolution scaled by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            fx: self.fx * factor,
            fy: self.fy * factor,
            cx: self.cx * factor,
            cy: self.cy * factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn default_guess_centers_principal_point() {
        let k = Intrinsics::for_resolution(1920, 1080);
        assert_eq!(k.fx, 1920.0);
        assert_eq!(k.fy, 1920.0);
        assert_eq!(k.cx, 960.0);
        assert_eq!(k.cy, 540.0);
        k.validate().expect("valid");
    }

    #[test]
    fn normalize_round_trips() {
        let k = Intrinsics::new(1000.0, 950.0, 640.0, 360.0).expect("valid");
        let p = Point2::new(123.5, 456.25);
        let back = k.denormalize(k.normalize(p));
        assert_relative_eq!(back.x, p.x, epsilon = 1e-12);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-12);
        let identity = k.matrix() * k.inverse_matrix();
        assert_relative_eq!(identity, Matrix3::identity(), epsilon = 1e-12);
    }

    #[test]
    fn rejects_skew_and_negative_focal() {
        let mut arr = Intrinsics::for_resolution(640, 480).to_array();
        arr[0][1] = 0.5;
        assert!(matches!(
            Intrinsics::from_array(arr),
            Err(GeometryError::InvalidIntrinsics { .. })
        ));
        assert!(Intrinsics::new(-1.0, 1.0, 0.0, 0.0).is_err());
        assert!(matches!(
            Intrinsics::new(f64::NAN, 1.0, 0.0, 0.0),
            Err(GeometryError::NonFinite { .. })
        ));
    }
}
