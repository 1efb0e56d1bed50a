use crate::layout::LayoutAlignment;
use crate::policy::{PlacementPolicy, RoiPolicy};
use gproj_core::{
    CameraPose, CoefficientLimits, DistortionCoefficients, Homography, Intrinsics, LensModel,
    Point2, ScaleRecord,
};
use serde::{Deserialize, Serialize};

/// Current artifact schema version.
pub const SCHEMA_VERSION: u32 = 3;

/// A named correspondence picked during calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub id: usize,
    pub name: String,
    /// Undistorted CCTV pixel.
    pub cctv: Point2<f64>,
    pub sat: Point2<f64>,
}

/// Frozen CCTV <-> SAT calibration of one location.
///
/// Built by [`crate::assemble`] or loaded with [`crate::from_json`]; there is
/// no way to mutate it afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct GProjection {
    pub(crate) location_code: String,
    pub(crate) created_unix_s: Option<u64>,
    pub(crate) resolution: Option<[u32; 2]>,
    pub(crate) lens: LensModel,
    pub(crate) homography: Homography,
    pub(crate) anchors: Vec<Anchor>,
    pub(crate) fov_polygon: Vec<Point2<f64>>,
    pub(crate) pose: CameraPose,
    pub(crate) scale: Option<ScaleRecord>,
    pub(crate) layout: Option<LayoutAlignment>,
    pub(crate) roi: Option<RoiPolicy>,
    pub(crate) placement: PlacementPolicy,
    pub(crate) coefficient_limits: CoefficientLimits,
    // derived at assembly
    pub(crate) homography_inv: Homography,
    pub(crate) cctv_side: f64,
    pub(crate) sat_side: f64,
}

impl GProjection {
    /// Schema of the in-memory artifact, which is always the current one.
    ///
    /// Older files are upgraded while decoding; use [`crate::peek_version`] on
    /// the encoded bytes to learn the version a file was written with.
    pub fn schema_version(&self) -> u32 {
        SCHEMA_VERSION
    }

    pub fn location_code(&self) -> &str {
        &self.location_code
    }

    pub fn created_unix_s(&self) -> Option<u64> {
        self.created_unix_s
    }

    /// CCTV stream resolution `[width, height]`, when known.
    pub fn resolution(&self) -> Option<[u32; 2]> {
        self.resolution
    }

    pub fn lens(&self) -> &LensModel {
        &self.lens
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.lens.intrinsics
    }

    pub fn distortion(&self) -> &DistortionCoefficients {
        &self.lens.distortion
    }

    /// Undistorted CCTV -> SAT.
    pub fn homography(&self) -> &Homography {
        &self.homography
    }

    /// SAT -> undistorted CCTV.
    pub fn homography_inv(&self) -> &Homography {
        &self.homography_inv
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    /// Ground footprint of the camera view in SAT pixels.
    pub fn fov_polygon(&self) -> &[Point2<f64>] {
        &self.fov_polygon
    }

    pub fn pose(&self) -> &CameraPose {
        &self.pose
    }

    pub fn px_per_meter(&self) -> f64 {
        self.pose.px_per_meter
    }

    pub fn scale(&self) -> Option<&ScaleRecord> {
        self.scale.as_ref()
    }

    pub fn layout(&self) -> Option<&LayoutAlignment> {
        self.layout.as_ref()
    }

    pub fn roi(&self) -> Option<&RoiPolicy> {
        self.roi.as_ref()
    }

    pub fn placement(&self) -> PlacementPolicy {
        self.placement
    }

    /// Distortion limits the artifact was validated against; reloading and
    /// rescaling check against the same limits.
    pub fn coefficient_limits(&self) -> &CoefficientLimits {
        &self.coefficient_limits
    }
}
