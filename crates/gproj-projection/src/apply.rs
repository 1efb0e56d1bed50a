//! Forward (CCTV box -> 3D box + floor box) and inverse (SAT -> CCTV)
//! mapping through a frozen [`GProjection`].

use crate::artifact::GProjection;
use crate::layout::normalize_degrees;
use crate::policy::ReferencePoint;
use gproj_core::{ErrorClass, Point2, UndistortOptions, Vector2};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ApplyError {
    #[error("invalid bounding box [{x1}, {y1}, {x2}, {y2}]")]
    InvalidBox { x1: f64, y1: f64, x2: f64, y2: f64 },
    #[error("invalid object prior: {reason}")]
    InvalidPrior { reason: String },
    #[error("{domain} point ({x:.1}, {y:.1}) lies beyond the horizon")]
    BeyondHorizon {
        domain: &'static str,
        x: f64,
        y: f64,
    },
    #[error("object height {height_m} m reaches the camera at {camera_height_m} m")]
    AboveCamera { height_m: f64, camera_height_m: f64 },
}

impl ApplyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidBox { .. } | Self::InvalidPrior { .. } => ErrorClass::InputValidation,
            Self::BeyondHorizon { .. } | Self::AboveCamera { .. } => ErrorClass::NumericDegeneracy,
        }
    }
}

/// Axis-aligned detection box in raw CCTV pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox2D {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl BBox2D {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn validate(&self) -> Result<(), ApplyError> {
        let finite = [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite());
        if !finite || self.x2 < self.x1 || self.y2 < self.y1 {
            return Err(ApplyError::InvalidBox {
                x1: self.x1,
                y1: self.y1,
                x2: self.x2,
                y2: self.y2,
            });
        }
        Ok(())
    }

    /// Corners clockwise from the top-left.
    pub fn corners(&self) -> [Point2<f64>; 4] {
        [
            Point2::new(self.x1, self.y1),
            Point2::new(self.x2, self.y1),
            Point2::new(self.x2, self.y2),
            Point2::new(self.x1, self.y2),
        ]
    }

    pub fn reference_point(&self, reference: ReferencePoint) -> Point2<f64> {
        let cx = 0.5 * (self.x1 + self.x2);
        match reference {
            ReferencePoint::BottomCenter => Point2::new(cx, self.y2),
            ReferencePoint::BoxCenter => Point2::new(cx, 0.5 * (self.y1 + self.y2)),
        }
    }
}

/// Assumed physical size of a detected object, meters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectPrior {
    pub length_m: f64,
    pub width_m: f64,
    pub height_m: f64,
}

impl Default for ObjectPrior {
    /// A passenger car.
    fn default() -> Self {
        Self {
            length_m: 4.5,
            width_m: 1.8,
            height_m: 1.5,
        }
    }
}

impl ObjectPrior {
    pub fn validate(&self) -> Result<(), ApplyError> {
        for (name, v) in [
            ("length", self.length_m),
            ("width", self.width_m),
            ("height", self.height_m),
        ] {
            if !v.is_finite() || v < 0.0 {
                return Err(ApplyError::InvalidPrior {
                    reason: format!("{name} must be finite and non-negative, got {v}"),
                });
            }
        }
        Ok(())
    }
}

/// One detection from the inference stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox2D,
    #[serde(default)]
    pub track_id: Option<u64>,
    #[serde(default)]
    pub prior: ObjectPrior,
    /// Heading in SAT degrees, e.g. from a tracker.
    #[serde(default)]
    pub heading_deg: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingSource {
    Given,
    Layout,
    Default,
}

/// Footprint of an object on the SAT image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FloorBox {
    /// Ground position of the object in SAT pixels.
    pub center: Point2<f64>,
    /// Rotated rectangle, front-right first.
    pub corners: [Point2<f64>; 4],
    pub heading_deg: f64,
    pub heading_source: HeadingSource,
    pub length_px: f64,
    pub width_px: f64,
}

/// Wireframe of an object in raw CCTV pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Box3D {
    pub floor: [Point2<f64>; 4],
    pub ceiling: [Point2<f64>; 4],
}

impl Box3D {
    /// Bottom four vertices then top four.
    pub fn vertices(&self) -> [Point2<f64>; 8] {
        let mut out = [Point2::origin(); 8];
        out[..4].copy_from_slice(&self.floor);
        out[4..].copy_from_slice(&self.ceiling);
        out
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectedBox {
    pub track_id: Option<u64>,
    /// Raw CCTV pixel the placement policy picked from the box.
    pub reference_cctv: Point2<f64>,
    /// Ground contact in raw CCTV pixels.
    pub ground_cctv: Point2<f64>,
    pub floor: FloorBox,
    pub box3d: Box3D,
    /// False when undistorting the reference point hit the iteration budget.
    pub undistort_converged: bool,
}

/// Result of mapping a raw CCTV pixel to the ground.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroundPoint {
    pub sat: Point2<f64>,
    pub converged: bool,
}

impl GProjection {
    /// Map a raw CCTV pixel seen at `height_m` above the ground to the SAT
    /// position of the ground point below it.
    pub fn cctv_to_sat(&self, raw: Point2<f64>, height_m: f64) -> Result<GroundPoint, ApplyError> {
        let undistorted = self.lens.undistort(raw, &UndistortOptions::default());
        if !undistorted.converged {
            log::warn!(
                "undistort of ({:.1}, {:.1}) did not converge ({:.2e} px)",
                raw.x,
                raw.y,
                undistorted.residual_px
            );
        }
        let apparent = self
            .homography
            .try_apply_facing(undistorted.point, self.cctv_side)
            .ok_or(ApplyError::BeyondHorizon {
                domain: "cctv",
                x: raw.x,
                y: raw.y,
            })?;
        let sat = self
            .pose
            .ground_from_apparent(apparent, height_m)
            .ok_or(ApplyError::AboveCamera {
                height_m,
                camera_height_m: self.pose.height_m,
            })?;
        Ok(GroundPoint {
            sat,
            converged: undistorted.converged,
        })
    }

    /// Raw CCTV pixel of the point `height_m` above the SAT ground point.
    pub fn sat_to_cctv(&self, sat: Point2<f64>, height_m: f64) -> Result<Point2<f64>, ApplyError> {
        let apparent = if height_m == 0.0 {
            sat
        } else {
            self.pose
                .apparent_from_ground(sat, height_m)
                .ok_or(ApplyError::AboveCamera {
                    height_m,
                    camera_height_m: self.pose.height_m,
                })?
        };
        let undistorted = self
            .homography_inv
            .try_apply_facing(apparent, self.sat_side)
            .ok_or(ApplyError::BeyondHorizon {
                domain: "sat",
                x: sat.x,
                y: sat.y,
            })?;
        Ok(self.lens.distort(undistorted))
    }

    /// SAT ground point to raw CCTV pixel.
    pub fn inverse(&self, sat: Point2<f64>) -> Result<Point2<f64>, ApplyError> {
        self.sat_to_cctv(sat, 0.0)
    }

    /// Whether the ROI policy drops this box.
    pub fn roi_excludes(&self, bbox: &BBox2D) -> bool {
        self.roi
            .as_ref()
            .is_some_and(|roi| roi.excludes(&bbox.corners()))
    }

    /// Project a detection box. `Ok(None)` means the ROI policy dropped it.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, prior), fields(location = %self.location_code))
    )]
    pub fn forward(
        &self,
        bbox: &BBox2D,
        prior: &ObjectPrior,
        heading_deg: Option<f64>,
    ) -> Result<Option<ProjectedBox>, ApplyError> {
        bbox.validate()?;
        prior.validate()?;
        if self.roi_excludes(bbox) {
            return Ok(None);
        }

        let reference_cctv = bbox.reference_point(self.placement.reference);
        let lift = self.placement.lift.effective_height(prior.height_m);
        let ground = self.cctv_to_sat(reference_cctv, lift)?;

        let (heading, heading_source) = match heading_deg.filter(|h| h.is_finite()) {
            Some(h) => (normalize_degrees(h), HeadingSource::Given),
            None => match self
                .layout
                .as_ref()
                .and_then(|l| l.nearest_heading(ground.sat))
            {
                Some(h) => (h, HeadingSource::Layout),
                None => (0.0, HeadingSource::Default),
            },
        };

        let length_px = self.pose.meters_to_px(prior.length_m);
        let width_px = self.pose.meters_to_px(prior.width_m);
        let corners = footprint(ground.sat, length_px, width_px, heading);

        let floor_cctv = corners.try_map_points(|c| self.sat_to_cctv(c, 0.0))?;
        let ceiling_cctv = corners.try_map_points(|c| self.sat_to_cctv(c, prior.height_m))?;
        let ground_cctv = self.sat_to_cctv(ground.sat, 0.0)?;

        Ok(Some(ProjectedBox {
            track_id: None,
            reference_cctv,
            ground_cctv,
            floor: FloorBox {
                center: ground.sat,
                corners,
                heading_deg: heading,
                heading_source,
                length_px,
                width_px,
            },
            box3d: Box3D {
                floor: floor_cctv,
                ceiling: ceiling_cctv,
            },
            undistort_converged: ground.converged,
        }))
    }

    pub fn forward_detection(
        &self,
        detection: &Detection,
    ) -> Result<Option<ProjectedBox>, ApplyError> {
        let projected = self.forward(&detection.bbox, &detection.prior, detection.heading_deg)?;
        Ok(projected.map(|mut p| {
            p.track_id = detection.track_id;
            p
        }))
    }

    /// Project independent detections; order of the output matches the input.
    #[cfg(feature = "parallel")]
    pub fn forward_batch(
        &self,
        detections: &[Detection],
    ) -> Vec<Result<Option<ProjectedBox>, ApplyError>> {
        use rayon::prelude::*;
        detections
            .par_iter()
            .map(|d| self.forward_detection(d))
            .collect()
    }

    /// Project independent detections; order of the output matches the input.
    #[cfg(not(feature = "parallel"))]
    pub fn forward_batch(
        &self,
        detections: &[Detection],
    ) -> Vec<Result<Option<ProjectedBox>, ApplyError>> {
        detections
            .iter()
            .map(|d| self.forward_detection(d))
            .collect()
    }
}

/// Rectangle of `length x width` centered on `center`, long side along
/// `heading_deg`.
fn footprint(
    center: Point2<f64>,
    length_px: f64,
    width_px: f64,
    heading_deg: f64,
) -> [Point2<f64>; 4] {
    let (s, c) = heading_deg.to_radians().sin_cos();
    let dx = 0.5 * length_px;
    let dy = 0.5 * width_px;
    [(dx, dy), (dx, -dy), (-dx, -dy), (-dx, dy)]
        .map(|(x, y)| center + Vector2::new(c * x - s * y, s * x + c * y))
}

trait TryMapPoints {
    fn try_map_points<E>(
        &self,
        f: impl Fn(Point2<f64>) -> Result<Point2<f64>, E>,
    ) -> Result<[Point2<f64>; 4], E>;
}

impl TryMapPoints for [Point2<f64>; 4] {
    fn try_map_points<E>(
        &self,
        f: impl Fn(Point2<f64>) -> Result<Point2<f64>, E>,
    ) -> Result<[Point2<f64>; 4], E> {
        Ok([f(self[0])?, f(self[1])?, f(self[2])?, f(self[3])?])
    }
}

/// Forward mapping of a box with the default object prior and no heading.
pub fn forward(bbox: &BBox2D, g: &GProjection) -> Result<Option<ProjectedBox>, ApplyError> {
    g.forward(bbox, &ObjectPrior::default(), None)
}

/// SAT ground point to raw CCTV pixel.
pub fn inverse(point_sat: Point2<f64>, g: &GProjection) -> Result<Point2<f64>, ApplyError> {
    g.inverse(point_sat)
}
