//! Camera nadir, height and ground scale from two standing subjects.
//!
//! Under a planar ground, the ray through a subject's head meets the ground
//! farther from the camera nadir than the subject's feet. Mapped to SAT with
//! the ground homography, the apparent head point, the foot point and the
//! nadir are collinear, so two subjects locate the nadir and the similar
//! triangles give the camera height.

use crate::params::{ParallaxOptions, ScaleSource};
use gproj_core::geometry::line_intersection;
use gproj_core::{
    CameraPose, ErrorClass, GeometryError, Homography, Intrinsics, Point2, ScaleRecord,
};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// A subject of known height; both pixels are undistorted CCTV pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParallaxObservation {
    pub head: Point2<f64>,
    /// Ground contact point (between the feet).
    pub ground: Point2<f64>,
    pub height_m: f64,
}

/// Two SAT points a known real distance apart.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DistanceReference {
    pub a: Point2<f64>,
    pub b: Point2<f64>,
    pub distance_m: f64,
    /// Names of the anchors `a` and `b` were taken from, if any.
    #[serde(default)]
    pub anchors: Vec<String>,
}

impl DistanceReference {
    pub fn new(a: Point2<f64>, b: Point2<f64>, distance_m: f64) -> Self {
        Self {
            a,
            b,
            distance_m,
            anchors: Vec::new(),
        }
    }

    pub fn measured_px(&self) -> f64 {
        (self.a - self.b).norm()
    }

    pub fn px_per_meter(&self) -> f64 {
        self.measured_px() / self.distance_m
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParallaxError {
    #[error("subject {index}: {reason}")]
    InvalidObservation { index: usize, reason: String },
    #[error("invalid distance reference: {reason}")]
    InvalidReference { reason: String },
    #[error("invalid intrinsics: {0}")]
    Intrinsics(#[source] GeometryError),
    #[error("homography has no usable inverse")]
    SingularHomography,
    #[error("subject {index} maps beyond the horizon")]
    BeyondHorizon { index: usize },
    #[error("ground contacts coincide in SAT ({distance_px:.2e} px apart)")]
    CoincidentGround { distance_px: f64 },
    #[error("head-to-ground lines are parallel; subjects are collinear with the camera")]
    ParallelLines,
    #[error("subject {index} shows no usable parallax (ratio {ratio:.6})")]
    NoDisparity { index: usize, ratio: f64 },
    #[error("subject {index} is inconsistent with a camera above the ground (ratio {ratio:.6})")]
    InvalidRatio { index: usize, ratio: f64 },
    #[error("recovered camera height {height_m} m is not positive")]
    NonPositiveHeight { height_m: f64 },
}

impl ParallaxError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidObservation { .. } | Self::InvalidReference { .. } => {
                ErrorClass::InputValidation
            }
            Self::Intrinsics(e) => e.class(),
            _ => ErrorClass::NumericDegeneracy,
        }
    }
}

/// Not an error: the two scale estimates disagree beyond the tolerance.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyWarning {
    pub reference_px_per_meter: f64,
    pub parallax_px_per_meter: f64,
    pub relative_difference: f64,
    pub tolerance: f64,
}

impl std::fmt::Display for ConsistencyWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reference scale {:.3} px/m and parallax scale {:.3} px/m differ by {:.1}% (tolerance {:.1}%)",
            self.reference_px_per_meter,
            self.parallax_px_per_meter,
            100.0 * self.relative_difference,
            100.0 * self.tolerance
        )
    }
}

/// Both scale estimates side by side.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScaleCheck {
    pub reference_px_per_meter: f64,
    pub parallax_px_per_meter: f64,
    /// `|parallax - reference| / reference`.
    pub relative_difference: f64,
    pub tolerance: f64,
}

impl ScaleCheck {
    pub fn new(reference: f64, parallax: f64, tolerance: f64) -> Self {
        Self {
            reference_px_per_meter: reference,
            parallax_px_per_meter: parallax,
            relative_difference: (parallax - reference).abs() / reference,
            tolerance,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.relative_difference <= self.tolerance
    }

    pub fn warning(&self) -> Option<ConsistencyWarning> {
        (!self.is_consistent()).then_some(ConsistencyWarning {
            reference_px_per_meter: self.reference_px_per_meter,
            parallax_px_per_meter: self.parallax_px_per_meter,
            relative_difference: self.relative_difference,
            tolerance: self.tolerance,
        })
    }

    pub fn select(&self, source: ScaleSource) -> f64 {
        match source {
            ScaleSource::Reference => self.reference_px_per_meter,
            ScaleSource::Parallax => self.parallax_px_per_meter,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParallaxSolution {
    /// Nadir, mean height and the selected scale.
    pub pose: CameraPose,
    /// Height estimate of each subject before averaging.
    pub subject_heights_m: [f64; 2],
    pub scale_check: ScaleCheck,
    pub scale_source: ScaleSource,
    pub scale: ScaleRecord,
    pub warning: Option<ConsistencyWarning>,
}

/// Pixel-per-meter scale implied by H for a camera `height_m` above the
/// ground.
///
/// `K^-1 H^-1 = mu [r1 / s, r2 / s, t]` with `r3 . t = -height`.
pub fn parallax_scale(intrinsics: &Intrinsics, homography: &Homography, height_m: f64) -> Option<f64> {
    let h_inv = homography.h.try_inverse()?;
    let g = intrinsics.inverse_matrix() * h_inv;
    let g1 = g.column(0);
    let g2 = g.column(1);
    let g3 = g.column(2);
    let r3 = g1.cross(&g2).try_normalize(f64::MIN_POSITIVE)?;
    let mu = r3.dot(&g3).abs() / height_m;
    let mean_norm = 0.5 * (g1.norm() + g2.norm());
    let s = mu / mean_norm;
    (s.is_finite() && s > 0.0).then_some(s)
}

#[derive(Clone, Debug)]
pub struct ParallaxSolver {
    intrinsics: Intrinsics,
    homography: Homography,
    opts: ParallaxOptions,
}

impl ParallaxSolver {
    pub fn new(intrinsics: Intrinsics, homography: Homography) -> Self {
        Self {
            intrinsics,
            homography,
            opts: ParallaxOptions::default(),
        }
    }

    pub fn with_options(mut self, opts: ParallaxOptions) -> Self {
        self.opts = opts;
        self
    }

    fn validate(
        &self,
        observations: &[ParallaxObservation; 2],
        reference: &DistanceReference,
    ) -> Result<(), ParallaxError> {
        self.intrinsics.validate().map_err(ParallaxError::Intrinsics)?;
        for (index, o) in observations.iter().enumerate() {
            let finite = [o.head.x, o.head.y, o.ground.x, o.ground.y, o.height_m]
                .iter()
                .all(|v| v.is_finite());
            if !finite {
                return Err(ParallaxError::InvalidObservation {
                    index,
                    reason: "non-finite value".into(),
                });
            }
            if o.height_m <= 0.0 {
                return Err(ParallaxError::InvalidObservation {
                    index,
                    reason: format!("height must be positive, got {} m", o.height_m),
                });
            }
        }
        let finite = [reference.a.x, reference.a.y, reference.b.x, reference.b.y]
            .iter()
            .all(|v| v.is_finite());
        if !finite || !reference.distance_m.is_finite() || reference.distance_m <= 0.0 {
            return Err(ParallaxError::InvalidReference {
                reason: format!(
                    "points must be finite and distance positive, got {} m",
                    reference.distance_m
                ),
            });
        }
        if reference.measured_px() <= f64::EPSILON {
            return Err(ParallaxError::InvalidReference {
                reason: "reference points coincide".into(),
            });
        }
        Ok(())
    }

    #[cfg_attr(feature = "tracing", instrument(level = "debug", skip_all))]
    pub fn solve(
        &self,
        observations: &[ParallaxObservation; 2],
        reference: &DistanceReference,
    ) -> Result<ParallaxSolution, ParallaxError> {
        self.validate(observations, reference)?;
        if self.homography.validate().is_err() {
            return Err(ParallaxError::SingularHomography);
        }

        let mut heads = [Point2::origin(); 2];
        let mut grounds = [Point2::origin(); 2];
        for (index, o) in observations.iter().enumerate() {
            let side = self.homography.side_of_horizon(o.ground);
            grounds[index] = self
                .homography
                .try_apply(o.ground)
                .ok_or(ParallaxError::BeyondHorizon { index })?;
            heads[index] = self
                .homography
                .try_apply_facing(o.head, side)
                .ok_or(ParallaxError::BeyondHorizon { index })?;
        }

        let distance_px = (grounds[0] - grounds[1]).norm();
        if distance_px <= self.opts.coincidence_tolerance_px {
            return Err(ParallaxError::CoincidentGround { distance_px });
        }

        let nadir = line_intersection(
            grounds[0],
            heads[0] - grounds[0],
            grounds[1],
            heads[1] - grounds[1],
            self.opts.min_line_angle_sin,
        )
        .ok_or(ParallaxError::ParallelLines)?;

        let mut subject_heights_m = [0.0; 2];
        for (index, o) in observations.iter().enumerate() {
            let to_head = heads[index] - nadir;
            let to_ground = grounds[index] - nadir;
            let head_dist2 = to_head.norm_squared();
            if head_dist2 <= f64::MIN_POSITIVE {
                return Err(ParallaxError::NoDisparity { index, ratio: 1.0 });
            }
            // signed, so a ground point on the far side of the nadir fails
            let ratio = to_ground.dot(&to_head) / head_dist2;
            if !ratio.is_finite() || ratio < 0.0 || ratio > 1.0 {
                return Err(ParallaxError::InvalidRatio { index, ratio });
            }
            if 1.0 - ratio < self.opts.min_disparity {
                return Err(ParallaxError::NoDisparity { index, ratio });
            }
            subject_heights_m[index] = o.height_m / (1.0 - ratio);
            log::debug!(
                "subject {index}: ratio {ratio:.5}, camera height {:.3} m",
                subject_heights_m[index]
            );
        }
        let height_m = 0.5 * (subject_heights_m[0] + subject_heights_m[1]);
        if !height_m.is_finite() || height_m <= 0.0 {
            return Err(ParallaxError::NonPositiveHeight { height_m });
        }

        let reference_scale = reference.px_per_meter();
        let parallax_scale = parallax_scale(&self.intrinsics, &self.homography, height_m)
            .ok_or(ParallaxError::SingularHomography)?;
        let scale_check = ScaleCheck::new(reference_scale, parallax_scale, self.opts.scale_tolerance);
        let warning = scale_check.warning();
        if let Some(w) = &warning {
            log::warn!("{w}");
        }

        let pose = CameraPose {
            position_sat: nadir,
            height_m,
            px_per_meter: scale_check.select(self.opts.scale_source),
        };
        log::info!(
            "parallax: nadir ({:.1}, {:.1}) px, height {:.2} m, {:.3} px/m ({:?})",
            nadir.x,
            nadir.y,
            height_m,
            pose.px_per_meter,
            self.opts.scale_source
        );

        Ok(ParallaxSolution {
            pose,
            subject_heights_m,
            scale_check,
            scale_source: self.opts.scale_source,
            scale: ScaleRecord {
                measured_px: reference.measured_px(),
                real_m: reference.distance_m,
                reference_anchors: reference.anchors.clone(),
                parallax_px_per_meter: Some(parallax_scale),
            },
            warning,
        })
    }
}
