use gproj_core::{GeometryError, Point2, Polygon};
use serde::{Deserialize, Serialize};

/// Which pixel of a detection box stands for the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferencePoint {
    /// Middle of the bottom edge, `(cx, y2)`.
    #[serde(rename = "center_bottom_side")]
    BottomCenter,
    /// Box center, `(cx, cy)`.
    #[serde(rename = "center_box")]
    BoxCenter,
}

/// Height at which the reference point is assumed to sit above the ground.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroundLift {
    /// Full object height.
    #[serde(rename = "down_h")]
    FullHeight,
    /// Half the object height.
    #[serde(rename = "down_h_2")]
    HalfHeight,
    /// Reference point lies on the ground.
    #[serde(rename = "match")]
    None,
}

impl GroundLift {
    pub fn effective_height(self, object_height_m: f64) -> f64 {
        match self {
            Self::FullHeight => object_height_m,
            Self::HalfHeight => 0.5 * object_height_m,
            Self::None => 0.0,
        }
    }
}

/// How a detection box is placed on the ground plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementPolicy {
    pub reference: ReferencePoint,
    pub lift: GroundLift,
}

impl PlacementPolicy {
    /// Placement assumed by artifacts written before it was recorded.
    pub const LEGACY: Self = Self {
        reference: ReferencePoint::BottomCenter,
        lift: GroundLift::FullHeight,
    };
}

impl Default for PlacementPolicy {
    fn default() -> Self {
        Self {
            reference: ReferencePoint::BoxCenter,
            lift: GroundLift::HalfHeight,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardStrategy {
    /// Keep every detection.
    None,
    /// Drop detections inside the polygon.
    Inside,
    /// Drop detections outside the polygon.
    Outside,
}

impl std::fmt::Display for DiscardStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Inside => "inside",
            Self::Outside => "outside",
        })
    }
}

/// When a box counts as inside the ROI polygon.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoiMatch {
    /// Any overlap.
    Partial,
    /// All four corners inside.
    Full,
}

/// Region-of-interest filter applied to detections in raw CCTV pixels.
#[derive(Clone, Debug, PartialEq)]
pub struct RoiPolicy {
    pub discard: DiscardStrategy,
    pub matching: RoiMatch,
    pub polygon: Option<Polygon>,
}

impl RoiPolicy {
    pub fn new(discard: DiscardStrategy, matching: RoiMatch, polygon: Option<Polygon>) -> Self {
        Self {
            discard,
            matching,
            polygon,
        }
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        match (&self.discard, &self.polygon) {
            (_, Some(polygon)) => polygon.validate(),
            (DiscardStrategy::None, None) => Ok(()),
            (_, None) => Err(GeometryError::InvalidPolygon { vertices: 0 }),
        }
    }

    /// Whether a box with the given corners is inside the region.
    pub fn matches(&self, corners: &[Point2<f64>; 4]) -> bool {
        let Some(polygon) = &self.polygon else {
            return false;
        };
        match self.matching {
            RoiMatch::Partial => polygon.overlaps(corners),
            RoiMatch::Full => corners.iter().all(|c| polygon.contains(*c)),
        }
    }

    /// Whether a box with the given corners is dropped.
    pub fn excludes(&self, corners: &[Point2<f64>; 4]) -> bool {
        match self.discard {
            DiscardStrategy::None => false,
            DiscardStrategy::Inside => self.matches(corners),
            DiscardStrategy::Outside => !self.matches(corners),
        }
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            polygon: self
                .polygon
                .as_ref()
                .map(|p| p.map_points(|v| Point2::from(v.coords * factor))),
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone() -> Polygon {
        Polygon::new(vec![
            Point2::new(0.0, 0.0),
            Point2::new(100.0, 0.0),
            Point2::new(100.0, 100.0),
            Point2::new(0.0, 100.0),
        ])
        .expect("valid")
    }

    fn quad(x1: f64, y1: f64, x2: f64, y2: f64) -> [Point2<f64>; 4] {
        [
            Point2::new(x1, y1),
            Point2::new(x2, y1),
            Point2::new(x2, y2),
            Point2::new(x1, y2),
        ]
    }

    #[test]
    fn outside_strategy_keeps_only_boxes_in_zone() {
        let roi = RoiPolicy::new(DiscardStrategy::Outside, RoiMatch::Partial, Some(zone()));
        assert!(!roi.excludes(&quad(10.0, 10.0, 20.0, 20.0)));
        assert!(!roi.excludes(&quad(90.0, 90.0, 120.0, 120.0)));
        assert!(roi.excludes(&quad(150.0, 150.0, 160.0, 160.0)));
    }

    #[test]
    fn full_match_requires_every_corner() {
        let roi = RoiPolicy::new(DiscardStrategy::Inside, RoiMatch::Full, Some(zone()));
        assert!(roi.excludes(&quad(10.0, 10.0, 20.0, 20.0)));
        assert!(!roi.excludes(&quad(90.0, 90.0, 120.0, 120.0)));
    }

    #[test]
    fn discard_none_needs_no_polygon() {
        let roi = RoiPolicy::new(DiscardStrategy::None, RoiMatch::Partial, None);
        roi.validate().expect("valid");
        assert!(!roi.excludes(&quad(0.0, 0.0, 1.0, 1.0)));
        let broken = RoiPolicy::new(DiscardStrategy::Outside, RoiMatch::Partial, None);
        assert!(broken.validate().is_err());
    }

    #[test]
    fn lift_scales_object_height() {
        assert_eq!(GroundLift::FullHeight.effective_height(1.6), 1.6);
        assert_eq!(GroundLift::HalfHeight.effective_height(1.6), 0.8);
        assert_eq!(GroundLift::None.effective_height(1.6), 0.0);
        assert_eq!(
            serde_json::to_string(&PlacementPolicy::LEGACY).expect("json"),
            r#"{"reference":"center_bottom_side","lift":"down_h"}"#
        );
    }
}
