//! Validation and freezing of calibration results into a [`GProjection`].

use crate::artifact::{Anchor, GProjection};
use crate::layout::LayoutAlignment;
use crate::policy::{PlacementPolicy, RoiPolicy};
use gproj_core::{
    CameraPose, CoefficientLimits, DistortionCoefficients, ErrorClass, GeometryError, Homography,
    Intrinsics, LensModel, Point2, ScaleRecord, UndistortOptions,
};
use nalgebra::Matrix3;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Samples per image edge when tracing the ground footprint.
const FOV_SAMPLES_PER_EDGE: usize = 16;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AssembleError {
    #[error("location code {code:?} must be non-empty and use only [A-Za-z0-9_-]")]
    InvalidLocationCode { code: String },
    #[error("resolution must be non-zero, got {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },
    #[error("{part} failed validation: {source}")]
    Invalid {
        part: &'static str,
        #[source]
        source: GeometryError,
    },
    #[error("homography has no usable inverse")]
    NonInvertibleHomography,
    #[error("no ground reference point maps through the homography")]
    NoGroundReference,
    #[error("scale record is degenerate (measured {measured_px} px over {real_m} m)")]
    InvalidScale { measured_px: f64, real_m: f64 },
    #[error("rescale factor must be positive and finite, got {factor}")]
    InvalidRescaleFactor { factor: f64 },
}

impl AssembleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Invalid { source, .. } => source.class(),
            Self::NonInvertibleHomography | Self::NoGroundReference => {
                ErrorClass::NumericDegeneracy
            }
            _ => ErrorClass::InputValidation,
        }
    }
}

/// Everything a [`GProjection`] is assembled from.
#[derive(Clone, Debug, PartialEq)]
pub struct AssembleInput {
    pub location_code: String,
    pub created_unix_s: Option<u64>,
    pub resolution: Option<[u32; 2]>,
    pub intrinsics: Intrinsics,
    pub distortion: DistortionCoefficients,
    pub homography: Homography,
    pub anchors: Vec<Anchor>,
    /// Precomputed footprint; traced from `resolution` when `None`.
    pub fov_polygon: Option<Vec<Point2<f64>>>,
    pub pose: CameraPose,
    pub scale: Option<ScaleRecord>,
    pub layout: Option<LayoutAlignment>,
    pub roi: Option<RoiPolicy>,
    pub placement: PlacementPolicy,
}

impl AssembleInput {
    /// Minimal input: no anchors, scale record, layout or ROI.
    pub fn new(
        location_code: impl Into<String>,
        intrinsics: Intrinsics,
        distortion: DistortionCoefficients,
        homography: Homography,
        pose: CameraPose,
    ) -> Self {
        Self {
            location_code: location_code.into(),
            created_unix_s: None,
            resolution: None,
            intrinsics,
            distortion,
            homography,
            anchors: Vec::new(),
            fov_polygon: None,
            pose,
            scale: None,
            layout: None,
            roi: None,
            placement: PlacementPolicy::default(),
        }
    }
}

/// Location codes name files, so they are restricted to a safe alphabet.
pub fn is_valid_location_code(code: &str) -> bool {
    !code.is_empty()
        && code
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_finite_point(p: Point2<f64>) -> bool {
    p.x.is_finite() && p.y.is_finite()
}

fn check(part: &'static str, result: Result<(), GeometryError>) -> Result<(), AssembleError> {
    result.map_err(|source| AssembleError::Invalid { part, source })
}

/// Validate every component and freeze them into an artifact.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip(input, limits), fields(location = %input.location_code))
)]
pub fn assemble(
    input: AssembleInput,
    limits: &CoefficientLimits,
) -> Result<GProjection, AssembleError> {
    if !is_valid_location_code(&input.location_code) {
        return Err(AssembleError::InvalidLocationCode {
            code: input.location_code,
        });
    }
    if let Some([width, height]) = input.resolution {
        if width == 0 || height == 0 {
            return Err(AssembleError::InvalidResolution { width, height });
        }
    }
    check("intrinsics", input.intrinsics.validate())?;
    check("distortion", input.distortion.validate(limits))?;
    check("homography", input.homography.validate())?;
    check("camera pose", input.pose.validate())?;
    if let Some(layout) = &input.layout {
        check("layout affine", layout.affine.validate())?;
    }
    if let Some(roi) = &input.roi {
        check("roi", roi.validate())?;
    }
    if let Some(scale) = &input.scale {
        let ok = scale.measured_px.is_finite()
            && scale.real_m.is_finite()
            && scale.measured_px > 0.0
            && scale.real_m > 0.0
            && scale
                .parallax_px_per_meter
                .is_none_or(|s| s.is_finite() && s > 0.0);
        if !ok {
            return Err(AssembleError::InvalidScale {
                measured_px: scale.measured_px,
                real_m: scale.real_m,
            });
        }
    }
    if input
        .anchors
        .iter()
        .any(|a| !is_finite_point(a.cctv) || !is_finite_point(a.sat))
    {
        return Err(AssembleError::Invalid {
            part: "anchors",
            source: GeometryError::NonFinite { what: "anchor" },
        });
    }

    let homography_inv = input
        .homography
        .inverse()
        .ok_or(AssembleError::NonInvertibleHomography)?;
    check("inverse homography", homography_inv.validate())?;

    let (cctv_side, sat_side) = horizon_sides(&input, &homography_inv)?;
    let lens = LensModel::new(input.intrinsics, input.distortion);

    let fov_polygon = match input.fov_polygon {
        Some(polygon) => polygon,
        None => input
            .resolution
            .map(|res| trace_fov_polygon(&lens, &input.homography, cctv_side, res))
            .unwrap_or_default(),
    };

    log::info!(
        "assembled G projection for {}: camera at ({:.1}, {:.1}) px, z={:.2} m, {:.3} px/m",
        input.location_code,
        input.pose.position_sat.x,
        input.pose.position_sat.y,
        input.pose.height_m,
        input.pose.px_per_meter
    );

    Ok(GProjection {
        location_code: input.location_code,
        created_unix_s: input.created_unix_s,
        resolution: input.resolution,
        lens,
        homography: input.homography,
        anchors: input.anchors,
        fov_polygon,
        pose: input.pose,
        scale: input.scale,
        layout: input.layout,
        roi: input.roi,
        placement: input.placement,
        coefficient_limits: *limits,
        homography_inv,
        cctv_side,
        sat_side,
    })
}

/// Which side of each vanishing line the visible ground lies on.
///
/// Anchors are ground points by construction; without them the principal
/// point is assumed to look at the ground.
fn horizon_sides(
    input: &AssembleInput,
    homography_inv: &Homography,
) -> Result<(f64, f64), AssembleError> {
    let mut candidates = Vec::with_capacity(2);
    if !input.anchors.is_empty() {
        let n = input.anchors.len() as f64;
        let sum = input
            .anchors
            .iter()
            .fold(nalgebra::Vector2::<f64>::zeros(), |acc, a| acc + a.cctv.coords);
        candidates.push(Point2::from(sum / n));
    }
    candidates.push(Point2::new(input.intrinsics.cx, input.intrinsics.cy));

    for cctv in candidates {
        if let Some(sat) = input.homography.try_apply(cctv) {
            let cctv_side = input.homography.side_of_horizon(cctv);
            let sat_side = homography_inv.side_of_horizon(sat);
            if cctv_side != 0.0 && sat_side != 0.0 {
                return Ok((cctv_side, sat_side));
            }
        }
    }
    Err(AssembleError::NoGroundReference)
}

/// Ground footprint of the raw image border, in SAT pixels.
fn trace_fov_polygon(
    lens: &LensModel,
    homography: &Homography,
    cctv_side: f64,
    [width, height]: [u32; 2],
) -> Vec<Point2<f64>> {
    let (w, h) = (f64::from(width), f64::from(height));
    let corners = [
        Point2::new(0.0, 0.0),
        Point2::new(w, 0.0),
        Point2::new(w, h),
        Point2::new(0.0, h),
    ];
    let opts = UndistortOptions::default();
    let mut polygon = Vec::with_capacity(4 * FOV_SAMPLES_PER_EDGE);
    for i in 0..4 {
        let a = corners[i];
        let b = corners[(i + 1) % 4];
        for s in 0..FOV_SAMPLES_PER_EDGE {
            let t = s as f64 / FOV_SAMPLES_PER_EDGE as f64;
            let raw = a + (b - a) * t;
            let ideal = lens.undistort(raw, &opts).point;
            if let Some(sat) = homography.try_apply_facing(ideal, cctv_side) {
                polygon.push(sat);
            }
        }
    }
    if polygon.len() < 3 {
        log::debug!("camera footprint has {} valid samples; dropped", polygon.len());
        polygon.clear();
    }
    polygon
}

impl GProjection {
    /// Inputs that reproduce this artifact through [`assemble`].
    pub fn to_input(&self) -> AssembleInput {
        AssembleInput {
            location_code: self.location_code.clone(),
            created_unix_s: self.created_unix_s,
            resolution: self.resolution,
            intrinsics: self.lens.intrinsics,
            distortion: self.lens.distortion,
            homography: self.homography,
            anchors: self.anchors.clone(),
            fov_polygon: Some(self.fov_polygon.clone()),
            pose: self.pose,
            scale: self.scale.clone(),
            layout: self.layout.clone(),
            roi: self.roi.clone(),
            placement: self.placement,
        }
    }

    /// The same calibration for a CCTV stream whose resolution changed by
    /// `factor`. SAT-side data is untouched.
    pub fn rescaled(&self, factor: f64) -> Result<GProjection, AssembleError> {
        if !factor.is_finite() || factor <= 0.0 {
            return Err(AssembleError::InvalidRescaleFactor { factor });
        }
        let s_inv = Matrix3::new(
            1.0 / factor,
            0.0,
            0.0,
            0.0,
            1.0 / factor,
            0.0,
            0.0,
            0.0,
            1.0,
        );
        let mut input = self.to_input();
        input.intrinsics = self.lens.intrinsics.scaled(factor);
        input.homography = Homography::new(self.homography.h * s_inv);
        input.resolution = self.resolution.map(|[w, h]| {
            [
                (f64::from(w) * factor).round() as u32,
                (f64::from(h) * factor).round() as u32,
            ]
        });
        for anchor in &mut input.anchors {
            anchor.cctv = Point2::from(anchor.cctv.coords * factor);
        }
        input.roi = self.roi.as_ref().map(|roi| roi.scaled(factor));
        assemble(input, &self.coefficient_limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{DiscardStrategy, RoiMatch};
    use approx::assert_relative_eq;

    pub(crate) fn sample_input() -> AssembleInput {
        let h = Homography::from_array([
            [0.5, -0.1, 40.0],
            [0.05, 1.4, -300.0],
            [0.0, 0.0012, 1.0],
        ]);
        let pose = CameraPose {
            position_sat: Point2::new(250.0, -80.0),
            height_m: 9.0,
            px_per_meter: 12.5,
        };
        let mut input = AssembleInput::new(
            "SHARK-01",
            Intrinsics::for_resolution(1280, 720),
            DistortionCoefficients::from_array([-0.2, 0.05, 0.0005, -0.0004, 0.0]),
            h,
            pose,
        );
        input.resolution = Some([1280, 720]);
        input
    }

    #[test]
    fn assembles_and_traces_footprint() {
        let g = assemble(sample_input(), &CoefficientLimits::default()).expect("valid");
        assert_eq!(g.location_code(), "SHARK-01");
        assert!(g.fov_polygon().len() >= 3);
        let p = Point2::new(600.0, 500.0);
        let back = g.homography_inv().apply(g.homography().apply(p));
        assert_relative_eq!(back.x, p.x, epsilon = 1e-8);
        assert_relative_eq!(back.y, p.y, epsilon = 1e-8);
    }

    #[test]
    fn rejects_bad_code_coefficients_and_pose() {
        let limits = CoefficientLimits::default();
        let mut input = sample_input();
        input.location_code = "../etc".into();
        assert!(matches!(
            assemble(input, &limits),
            Err(AssembleError::InvalidLocationCode { .. })
        ));

        let mut input = sample_input();
        input.distortion.k1 = 5.0;
        let err = assemble(input, &limits).expect_err("out of range");
        assert_eq!(err.class(), ErrorClass::InputValidation);

        let mut input = sample_input();
        input.pose.height_m = -1.0;
        let err = assemble(input, &limits).expect_err("degenerate pose");
        assert_eq!(err.class(), ErrorClass::NumericDegeneracy);

        let mut input = sample_input();
        input.homography = Homography::from_array([[1.0, 2.0, 0.0], [2.0, 4.0, 0.0], [0.0, 0.0, 1.0]]);
        assert!(assemble(input, &limits).is_err());
    }

    #[test]
    fn roi_with_strategy_needs_polygon() {
        let mut input = sample_input();
        input.roi = Some(RoiPolicy::new(DiscardStrategy::Outside, RoiMatch::Full, None));
        assert!(matches!(
            assemble(input, &CoefficientLimits::default()),
            Err(AssembleError::Invalid { part: "roi", .. })
        ));
    }

    #[test]
    fn rescale_keeps_sat_mapping() {
        let limits = CoefficientLimits::default();
        let g = assemble(sample_input(), &limits).expect("valid");
        let big = g.rescaled(1.5).expect("rescaled");
        assert_eq!(big.resolution(), Some([1920, 1080]));
        assert_relative_eq!(big.intrinsics().fx, 1920.0);
        let p = Point2::new(600.0, 500.0);
        let a = g.homography().apply(p);
        let b = big.homography().apply(Point2::from(p.coords * 1.5));
        assert_relative_eq!(a.x, b.x, epsilon = 1e-9);
        assert_relative_eq!(a.y, b.y, epsilon = 1e-9);
        assert_eq!(big.fov_polygon(), g.fov_polygon());
        assert!(g.rescaled(0.0).is_err());
    }

    #[test]
    fn rescale_keeps_the_assembly_limits() {
        let loose = CoefficientLimits {
            k1: 2.0,
            ..CoefficientLimits::default()
        };
        let mut input = sample_input();
        input.distortion.k1 = -1.5;
        let g = assemble(input, &loose).expect("within loosened limits");
        let half = g.rescaled(0.5).expect("rescaled");
        assert_eq!(half.coefficient_limits(), &loose);
        assert_eq!(half.distortion().k1, -1.5);
    }
}
