use crate::GeometryError;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// Below this clearance (meters) between an object top and the camera the
/// apparent-lift factor is not computed.
pub const MIN_CAMERA_CLEARANCE_M: f64 = 0.01;

/// Camera position over the ground plane, in SAT pixels and meters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CameraPose {
    /// Nadir of the camera in SAT pixels.
    pub position_sat: Point2<f64>,
    /// Height of the optical center above ground, in meters.
    pub height_m: f64,
    pub px_per_meter: f64,
}

/// Scale evidence kept next to the chosen pixel-per-meter value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleRecord {
    /// SAT pixel distance between the reference points.
    pub measured_px: f64,
    /// Real distance between the reference points, meters.
    pub real_m: f64,
    pub reference_anchors: Vec<String>,
    /// Independent estimate from the parallax solve, when available.
    pub parallax_px_per_meter: Option<f64>,
}

impl ScaleRecord {
    pub fn reference_px_per_meter(&self) -> f64 {
        self.measured_px / self.real_m
    }
}

impl CameraPose {
    pub fn validate(&self) -> Result<(), GeometryError> {
        if !self.position_sat.x.is_finite()
            || !self.position_sat.y.is_finite()
            || !self.height_m.is_finite()
            || !self.px_per_meter.is_finite()
        {
            return Err(GeometryError::NonFinite {
                what: "camera pose",
            });
        }
        if self.height_m <= 0.0 {
            return Err(GeometryError::DegeneratePose {
                reason: format!("camera height must be positive, got {} m", self.height_m),
            });
        }
        if self.px_per_meter <= 0.0 {
            return Err(GeometryError::DegeneratePose {
                reason: format!("scale must be positive, got {} px/m", self.px_per_meter),
            });
        }
        Ok(())
    }

    /// Ground point below a point seen at `height_m` whose ray hits the
    /// ground at `apparent`.
    ///
    /// Returns `None` when the height is not below the camera.
    pub fn ground_from_apparent(&self, apparent: Point2<f64>, height_m: f64) -> Option<Point2<f64>> {
        let factor = (self.height_m - height_m) / self.height_m;
        if factor <= 0.0 {
            return None;
        }
        Some(self.position_sat + (apparent - self.position_sat) * factor)
    }

    /// Where the ray through a point `height_m` above `ground` meets the
    /// ground plane.
    pub fn apparent_from_ground(&self, ground: Point2<f64>, height_m: f64) -> Option<Point2<f64>> {
        let clearance = self.height_m - height_m;
        if clearance < MIN_CAMERA_CLEARANCE_M {
            return None;
        }
        Some(self.position_sat + (ground - self.position_sat) * (self.height_m / clearance))
    }

    #[inline]
    pub fn meters_to_px(&self, meters: f64) -> f64 {
        meters * self.px_per_meter
    }

    #[inline]
    pub fn px_to_meters(&self, px: f64) -> f64 {
        px / self.px_per_meter
    }
}
