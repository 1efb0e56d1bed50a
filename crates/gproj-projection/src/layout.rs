use gproj_core::geometry::closest_point_on_segment;
use gproj_core::{AffineTransform, Point2};
use serde::{Deserialize, Serialize};

/// Names of an SVG anchor and the SAT anchor it was matched with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssociationPair {
    pub svg_id: String,
    pub sat_id: String,
}

/// Site layout drawing registered onto the SAT image.
#[derive(Clone, Debug, PartialEq)]
pub struct LayoutAlignment {
    /// SVG -> SAT.
    pub affine: AffineTransform,
    pub pairs: Vec<AssociationPair>,
    /// Lane guide polylines in SVG coordinates, in driving direction.
    pub guidelines: Vec<Vec<Point2<f64>>>,
}

impl LayoutAlignment {
    pub fn new(affine: AffineTransform) -> Self {
        Self {
            affine,
            pairs: Vec::new(),
            guidelines: Vec::new(),
        }
    }

    pub fn with_pairs(mut self, pairs: Vec<AssociationPair>) -> Self {
        self.pairs = pairs;
        self
    }

    pub fn with_guidelines(mut self, guidelines: Vec<Vec<Point2<f64>>>) -> Self {
        self.guidelines = guidelines;
        self
    }

    #[inline]
    pub fn svg_to_sat(&self, p: Point2<f64>) -> Point2<f64> {
        self.affine.apply(p)
    }

    /// Heading in degrees `[0, 360)` of the guide segment closest to `sat`,
    /// measured with `atan2` in SAT pixel axes.
    pub fn nearest_heading(&self, sat: Point2<f64>) -> Option<f64> {
        let mut best: Option<(f64, f64)> = None;
        for line in &self.guidelines {
            for seg in line.windows(2) {
                let a = self.svg_to_sat(seg[0]);
                let b = self.svg_to_sat(seg[1]);
                let dir = b - a;
                if dir.norm_squared() <= f64::MIN_POSITIVE {
                    continue;
                }
                let dist = (closest_point_on_segment(a, b, sat) - sat).norm();
                if best.is_none_or(|(d, _)| dist < d) {
                    best = Some((dist, normalize_degrees(dir.y.atan2(dir.x).to_degrees())));
                }
            }
        }
        best.map(|(_, heading)| heading)
    }
}

/// Wrap an angle in degrees into `[0, 360)`.
pub fn normalize_degrees(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn layout() -> LayoutAlignment {
        // SVG units are half a SAT pixel, shifted by (10, 20).
        let affine = AffineTransform::from_array([[2.0, 0.0, 10.0], [0.0, 2.0, 20.0]]);
        LayoutAlignment::new(affine).with_guidelines(vec![
            // eastbound lane
            vec![Point2::new(0.0, 0.0), Point2::new(100.0, 0.0)],
            // northbound lane (SAT y grows downward)
            vec![Point2::new(0.0, 50.0), Point2::new(0.0, 10.0)],
        ])
    }

    #[test]
    fn heading_follows_the_closest_guide() {
        let l = layout();
        let east = l.nearest_heading(Point2::new(100.0, 25.0)).expect("guides");
        assert_relative_eq!(east, 0.0, epsilon = 1e-9);
        let north = l.nearest_heading(Point2::new(12.0, 90.0)).expect("guides");
        assert_relative_eq!(north, 270.0, epsilon = 1e-9);
    }

    #[test]
    fn no_guides_no_heading() {
        let l = LayoutAlignment::new(AffineTransform::identity());
        assert!(l.nearest_heading(Point2::new(0.0, 0.0)).is_none());
    }

    #[test]
    fn degrees_wrap_into_range() {
        assert_relative_eq!(normalize_degrees(-90.0), 270.0);
        assert_relative_eq!(normalize_degrees(720.5), 0.5, epsilon = 1e-9);
        assert_eq!(normalize_degrees(-0.0), 0.0);
    }
}
