use crate::GeometryError;
use nalgebra::{Matrix2, Matrix2x3, Point2, Vector2};

/// 2x3 affine transform `p' = A[:, :2] * p + A[:, 2]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransform {
    pub a: Matrix2x3<f64>,
}

impl AffineTransform {
    pub fn new(a: Matrix2x3<f64>) -> Self {
        Self { a }
    }

    pub fn identity() -> Self {
        Self::new(Matrix2x3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0))
    }

    pub fn from_array(rows: [[f64; 3]; 2]) -> Self {
        Self::new(Matrix2x3::new(
            rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2],
        ))
    }

    pub fn to_array(&self) -> [[f64; 3]; 2] {
        [
            [self.a[(0, 0)], self.a[(0, 1)], self.a[(0, 2)]],
            [self.a[(1, 0)], self.a[(1, 1)], self.a[(1, 2)]],
        ]
    }

    #[inline]
    pub fn linear(&self) -> Matrix2<f64> {
        self.a.fixed_view::<2, 2>(0, 0).into_owned()
    }

    #[inline]
    pub fn translation(&self) -> Vector2<f64> {
        self.a.column(2).into_owned()
    }

    #[inline]
    pub fn apply(&self, p: Point2<f64>) -> Point2<f64> {
        Point2::from(self.linear() * p.coords + self.translation())
    }

    /// Apply only the linear part, e.g. to direction vectors.
    #[inline]
    pub fn apply_vector(&self, v: Vector2<f64>) -> Vector2<f64> {
        self.linear() * v
    }

    pub fn inverse(&self) -> Option<Self> {
        let l_inv = self.linear().try_inverse()?;
        let t = -(l_inv * self.translation());
        Some(Self::new(Matrix2x3::new(
            l_inv[(0, 0)],
            l_inv[(0, 1)],
            t.x,
            l_inv[(1, 0)],
            l_inv[(1, 1)],
            t.y,
        )))
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.a.iter().any(|v| !v.is_finite()) {
            return Err(GeometryError::NonFinite {
                what: "affine transform",
            });
        }
        let l = self.linear();
        let det = l.determinant().abs();
        let scale = l.norm_squared().max(f64::MIN_POSITIVE);
        if det / scale < 1e-12 {
            return Err(GeometryError::SingularMatrix {
                what: "affine transform",
                conditioning: det / scale,
            });
        }
        Ok(())
    }
}
