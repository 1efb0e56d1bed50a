//! Planar helpers: polygons, segments, line intersection, collinearity.

use crate::GeometryError;
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Twice the signed area of triangle (a, b, c).
#[inline]
pub fn triangle_area2(a: Point2<f64>, b: Point2<f64>, c: Point2<f64>) -> f64 {
    (b - a).perp(&(c - a))
}

/// Intersection of the lines `p1 + s * d1` and `p2 + t * d2`.
///
/// Returns `None` when the lines are parallel within `sin_tol`, measured as
/// the sine of the angle between the directions.
pub fn line_intersection(
    p1: Point2<f64>,
    d1: Vector2<f64>,
    p2: Point2<f64>,
    d2: Vector2<f64>,
    sin_tol: f64,
) -> Option<Point2<f64>> {
    let norms = d1.norm() * d2.norm();
    if norms <= f64::MIN_POSITIVE {
        return None;
    }
    let cross = d1.perp(&d2);
    if (cross / norms).abs() < sin_tol {
        return None;
    }
    let s = (p2 - p1).perp(&d2) / cross;
    Some(p1 + d1 * s)
}

/// Closest point to `p` on segment `[a, b]`.
pub fn closest_point_on_segment(a: Point2<f64>, b: Point2<f64>, p: Point2<f64>) -> Point2<f64> {
    let ab = b - a;
    let len2 = ab.norm_squared();
    if len2 <= f64::MIN_POSITIVE {
        return a;
    }
    let t = ((p - a).dot(&ab) / len2).clamp(0.0, 1.0);
    a + ab * t
}

fn segments_intersect(a: Point2<f64>, b: Point2<f64>, c: Point2<f64>, d: Point2<f64>) -> bool {
    let d1 = triangle_area2(c, d, a);
    let d2 = triangle_area2(c, d, b);
    let d3 = triangle_area2(a, b, c);
    let d4 = triangle_area2(a, b, d);
    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }
    let on = |p: Point2<f64>, q: Point2<f64>, r: Point2<f64>| {
        triangle_area2(p, q, r) == 0.0
            && r.x >= p.x.min(q.x)
            && r.x <= p.x.max(q.x)
            && r.y >= p.y.min(q.y)
            && r.y <= p.y.max(q.y)
    };
    on(c, d, a) || on(c, d, b) || on(a, b, c) || on(a, b, d)
}

/// Ratio of the smaller to the larger principal variance of a point set.
///
/// Zero for perfectly collinear points, one for isotropic spread.
pub fn spread_ratio(points: &[Point2<f64>]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let n = points.len() as f64;
    let c = points.iter().fold(Vector2::<f64>::zeros(), |acc, p| acc + p.coords) / n;
    let (mut sxx, mut sxy, mut syy) = (0.0, 0.0, 0.0);
    for p in points {
        let d = p.coords - c;
        sxx += d.x * d.x;
        sxy += d.x * d.y;
        syy += d.y * d.y;
    }
    let half_trace = 0.5 * (sxx + syy);
    let det = sxx * syy - sxy * sxy;
    let disc = (half_trace * half_trace - det).max(0.0).sqrt();
    let max = half_trace + disc;
    if max <= f64::MIN_POSITIVE {
        return 0.0;
    }
    ((half_trace - disc).max(0.0)) / max
}

/// Simple polygon in pixel coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Polygon {
    vertices: Vec<Point2<f64>>,
}

impl Polygon {
    pub fn new(vertices: Vec<Point2<f64>>) -> Result<Self, GeometryError> {
        let polygon = Self { vertices };
        polygon.validate()?;
        Ok(polygon)
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        if self.vertices.len() < 3 {
            return Err(GeometryError::InvalidPolygon {
                vertices: self.vertices.len(),
            });
        }
        if self
            .vertices
            .iter()
            .any(|v| !v.x.is_finite() || !v.y.is_finite())
        {
            return Err(GeometryError::NonFinite { what: "polygon" });
        }
        Ok(())
    }

    pub fn vertices(&self) -> &[Point2<f64>] {
        &self.vertices
    }

    fn edges(&self) -> impl Iterator<Item = (Point2<f64>, Point2<f64>)> + '_ {
        let n = self.vertices.len();
        (0..n).map(move |i| (self.vertices[i], self.vertices[(i + 1) % n]))
    }

    /// Even-odd containment; points on an edge count as inside.
    pub fn contains(&self, p: Point2<f64>) -> bool {
        let mut inside = false;
        for (a, b) in self.edges() {
            if (closest_point_on_segment(a, b, p) - p).norm() < 1e-9 {
                return true;
            }
            if (a.y > p.y) != (b.y > p.y) {
                let x = a.x + (p.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if p.x < x {
                    inside = !inside;
                }
            }
        }
        inside
    }

    /// Whether the polygon and the closed quadrilateral `quad` share any
    /// point.
    pub fn overlaps(&self, quad: &[Point2<f64>; 4]) -> bool {
        if quad.iter().any(|c| self.contains(*c)) {
            return true;
        }
        let quad_poly = Self {
            vertices: quad.to_vec(),
        };
        if self.vertices.iter().any(|v| quad_poly.contains(*v)) {
            return true;
        }
        self.edges()
            .any(|(a, b)| quad_poly.edges().any(|(c, d)| segments_intersect(a, b, c, d)))
    }

    pub fn map_points(&self, f: impl Fn(Point2<f64>) -> Point2<f64>) -> Self {
        Self {
            vertices: self.vertices.iter().map(|p| f(*p)).collect(),
        }
    }
}
