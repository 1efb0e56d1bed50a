//! Stage driver for one location's calibration.
//!
//! Stages run in order (lens, undistort, homography, parallax, optional
//! layout and ROI, assemble). Each stage method validates its input and
//! only mutates the session when it succeeds. Re-running a stage drops the
//! results that depended on it, along with their warnings.

use crate::error::{SessionError, Stage};
use crate::homography_fit::{fit, Correspondence, HomographyFit};
use crate::layout_fit::{fit_layout, LayoutAnchorPair, LayoutFit};
use crate::params::SolverParams;
use crate::parallax::{
    ConsistencyWarning, DistanceReference, ParallaxObservation, ParallaxSolution, ParallaxSolver,
};
use gproj_core::{DistortionCoefficients, Intrinsics, Point2, Undistorted};
use gproj_projection::{
    assemble, Anchor, AssembleInput, GProjection, PlacementPolicy, ProjectionStore, RoiPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Something the operator should look at; never stops the session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionWarning {
    /// RANSAC left these anchors out of the homography.
    OutliersRejected { indices: Vec<usize> },
    /// Reference and parallax scales disagree.
    ScaleConsistency(ConsistencyWarning),
    /// A raw pixel could not be undistorted to tolerance.
    UndistortNotConverged {
        stage: Stage,
        x: f64,
        y: f64,
        residual_px: f64,
    },
}

impl SessionWarning {
    pub fn stage(&self) -> Stage {
        match self {
            Self::OutliersRejected { .. } => Stage::Homography,
            Self::ScaleConsistency(_) => Stage::Parallax,
            Self::UndistortNotConverged { stage, .. } => *stage,
        }
    }
}

impl std::fmt::Display for SessionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutliersRejected { indices } => {
                write!(f, "anchors {indices:?} rejected as outliers")
            }
            Self::ScaleConsistency(w) => write!(f, "{w}"),
            Self::UndistortNotConverged {
                stage,
                x,
                y,
                residual_px,
            } => write!(
                f,
                "{stage}: undistortion of ({x:.1}, {y:.1}) stopped {residual_px:.2e} px short"
            ),
        }
    }
}

#[derive(Clone, Debug, Default)]
struct LensState {
    intrinsics: Option<Intrinsics>,
    resolution: Option<[u32; 2]>,
    distortion: Option<DistortionCoefficients>,
}

/// Mutable calibration state for one location.
#[derive(Clone, Debug)]
pub struct CalibrationSession {
    location_code: String,
    params: SolverParams,
    created_unix_s: Option<u64>,
    lens: LensState,
    anchors: Vec<Anchor>,
    homography: Option<HomographyFit>,
    parallax: Option<ParallaxSolution>,
    layout: Option<LayoutFit>,
    roi: Option<RoiPolicy>,
    placement: PlacementPolicy,
    artifact: Option<GProjection>,
    warnings: Vec<SessionWarning>,
}

impl CalibrationSession {
    pub fn new(location_code: impl Into<String>) -> Self {
        Self::with_params(location_code, SolverParams::default())
    }

    pub fn with_params(location_code: impl Into<String>, params: SolverParams) -> Self {
        Self {
            location_code: location_code.into(),
            params,
            created_unix_s: None,
            lens: LensState::default(),
            anchors: Vec::new(),
            homography: None,
            parallax: None,
            layout: None,
            roi: None,
            placement: PlacementPolicy::default(),
            artifact: None,
            warnings: Vec::new(),
        }
    }

    pub fn location_code(&self) -> &str {
        &self.location_code
    }

    pub fn params(&self) -> &SolverParams {
        &self.params
    }

    /// Fix the artifact creation time instead of reading the clock.
    pub fn set_created_unix_s(&mut self, created_unix_s: Option<u64>) {
        self.created_unix_s = created_unix_s;
        self.artifact = None;
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        match stage {
            Stage::Lens => self.lens.intrinsics.is_some(),
            Stage::Undistort => self.lens.distortion.is_some(),
            Stage::Homography => self.homography.is_some(),
            Stage::Parallax => self.parallax.is_some(),
            Stage::Layout => self.layout.is_some(),
            Stage::Roi => self.roi.is_some(),
            Stage::Assemble => self.artifact.is_some(),
        }
    }

    /// Completed stages, in order.
    pub fn completed(&self) -> Vec<Stage> {
        Stage::ALL
            .into_iter()
            .filter(|s| self.is_complete(*s))
            .collect()
    }

    pub fn warnings(&self) -> &[SessionWarning] {
        &self.warnings
    }

    pub fn intrinsics(&self) -> Option<&Intrinsics> {
        self.lens.intrinsics.as_ref()
    }

    pub fn distortion(&self) -> Option<&DistortionCoefficients> {
        self.lens.distortion.as_ref()
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn homography_fit(&self) -> Option<&HomographyFit> {
        self.homography.as_ref()
    }

    pub fn parallax(&self) -> Option<&ParallaxSolution> {
        self.parallax.as_ref()
    }

    pub fn layout(&self) -> Option<&LayoutFit> {
        self.layout.as_ref()
    }

    pub fn roi(&self) -> Option<&RoiPolicy> {
        self.roi.as_ref()
    }

    pub fn placement(&self) -> PlacementPolicy {
        self.placement
    }

    pub fn artifact(&self) -> Option<&GProjection> {
        self.artifact.as_ref()
    }

    fn require(&self, stage: Stage) -> Result<(), SessionError> {
        match stage.prerequisite() {
            Some(missing) if !self.is_complete(missing) => {
                Err(SessionError::StageOrder { stage, missing })
            }
            _ => Ok(()),
        }
    }

    /// Drop every result `stage` feeds, and their warnings.
    fn invalidate_after(&mut self, stage: Stage) {
        for later in Stage::ALL {
            if !stage.invalidates(later) {
                continue;
            }
            match later {
                Stage::Lens => {}
                Stage::Undistort => self.lens.distortion = None,
                Stage::Homography => {
                    self.homography = None;
                    self.anchors.clear();
                }
                Stage::Parallax => self.parallax = None,
                Stage::Layout => self.layout = None,
                Stage::Roi => self.roi = None,
                Stage::Assemble => self.artifact = None,
            }
        }
        self.warnings
            .retain(|w| w.stage() != stage && !stage.invalidates(w.stage()));
    }

    /// Lens stage: camera intrinsics and, when known, the stream resolution.
    pub fn set_lens(
        &mut self,
        intrinsics: Intrinsics,
        resolution: Option<[u32; 2]>,
    ) -> Result<(), SessionError> {
        intrinsics
            .validate()
            .map_err(|source| SessionError::Geometry {
                stage: Stage::Lens,
                source,
            })?;
        if let Some([w, h]) = resolution {
            if w == 0 || h == 0 {
                return Err(SessionError::Geometry {
                    stage: Stage::Lens,
                    source: gproj_core::GeometryError::InvalidIntrinsics {
                        reason: format!("resolution {w}x{h} is empty"),
                    },
                });
            }
        }
        self.invalidate_after(Stage::Lens);
        self.lens.intrinsics = Some(intrinsics);
        self.lens.resolution = resolution;
        log::info!(
            "{}: lens fx={:.1} fy={:.1} c=({:.1}, {:.1})",
            self.location_code,
            intrinsics.fx,
            intrinsics.fy,
            intrinsics.cx,
            intrinsics.cy
        );
        Ok(())
    }

    /// Lens stage with the uncalibrated default for the resolution.
    pub fn set_default_lens(&mut self, width: u32, height: u32) -> Result<(), SessionError> {
        self.set_lens(Intrinsics::for_resolution(width, height), Some([width, height]))
    }

    /// Undistort stage: accept distortion coefficients within the limits.
    pub fn set_distortion(&mut self, coeffs: DistortionCoefficients) -> Result<(), SessionError> {
        self.require(Stage::Undistort)?;
        coeffs
            .validate(&self.params.coefficient_limits)
            .map_err(|source| SessionError::Geometry {
                stage: Stage::Undistort,
                source,
            })?;
        self.invalidate_after(Stage::Undistort);
        self.lens.distortion = Some(coeffs);
        Ok(())
    }

    /// Ideal pixel of a raw CCTV pixel under the current lens.
    pub fn undistort_point(&self, raw: Point2<f64>) -> Result<Undistorted, SessionError> {
        match (&self.lens.intrinsics, &self.lens.distortion) {
            (Some(k), Some(d)) => Ok(gproj_core::undistort(raw, k, d, &self.params.undistort)),
            (None, _) => Err(SessionError::StageOrder {
                stage: Stage::Undistort,
                missing: Stage::Lens,
            }),
            (Some(_), None) => Err(SessionError::StageOrder {
                stage: Stage::Homography,
                missing: Stage::Undistort,
            }),
        }
    }

    /// Undistort a raw pixel for use by `stage`, recording a warning when the
    /// solve does not converge.
    pub(crate) fn undistort_for(
        &self,
        stage: Stage,
        raw: Point2<f64>,
        warnings: &mut Vec<SessionWarning>,
    ) -> Result<Point2<f64>, SessionError> {
        let u = self.undistort_point(raw)?;
        if !u.converged {
            warnings.push(SessionWarning::UndistortNotConverged {
                stage,
                x: raw.x,
                y: raw.y,
                residual_px: u.residual_px,
            });
        }
        Ok(u.point)
    }

    /// Homography stage. Anchor CCTV coordinates are undistorted pixels.
    pub fn fit_homography(&mut self, anchors: Vec<Anchor>) -> Result<&HomographyFit, SessionError> {
        self.fit_homography_with_warnings(anchors, Vec::new())
    }

    pub(crate) fn fit_homography_with_warnings(
        &mut self,
        anchors: Vec<Anchor>,
        mut pending: Vec<SessionWarning>,
    ) -> Result<&HomographyFit, SessionError> {
        self.require(Stage::Homography)?;
        let data: Vec<_> = anchors
            .iter()
            .map(|a| Correspondence::new(a.cctv, a.sat))
            .collect();
        let result = fit(&data, &self.params.homography)?;

        self.invalidate_after(Stage::Homography);
        let outliers = result.outliers();
        if !outliers.is_empty() {
            log::warn!("{}: anchors {outliers:?} rejected", self.location_code);
            pending.push(SessionWarning::OutliersRejected { indices: outliers });
        }
        self.warnings.extend(pending);
        self.anchors = anchors;
        Ok(self.homography.insert(result))
    }

    /// Parallax stage: two subjects (undistorted pixels) and a reference
    /// distance on the SAT image.
    pub fn solve_parallax(
        &mut self,
        observations: [ParallaxObservation; 2],
        reference: DistanceReference,
    ) -> Result<&ParallaxSolution, SessionError> {
        self.solve_parallax_with_warnings(observations, reference, Vec::new())
    }

    pub(crate) fn solve_parallax_with_warnings(
        &mut self,
        observations: [ParallaxObservation; 2],
        reference: DistanceReference,
        mut pending: Vec<SessionWarning>,
    ) -> Result<&ParallaxSolution, SessionError> {
        self.require(Stage::Parallax)?;
        let (Some(k), Some(fit)) = (self.lens.intrinsics, self.homography.as_ref()) else {
            return Err(SessionError::StageOrder {
                stage: Stage::Parallax,
                missing: Stage::Homography,
            });
        };
        let solution = ParallaxSolver::new(k, fit.homography)
            .with_options(self.params.parallax.clone())
            .solve(&observations, &reference)?;

        self.invalidate_after(Stage::Parallax);
        if let Some(w) = solution.warning {
            pending.push(SessionWarning::ScaleConsistency(w));
        }
        self.warnings.extend(pending);
        Ok(self.parallax.insert(solution))
    }

    /// Optional layout stage.
    pub fn fit_layout(
        &mut self,
        pairs: &[LayoutAnchorPair],
        guidelines: Vec<Vec<Point2<f64>>>,
    ) -> Result<&LayoutFit, SessionError> {
        self.require(Stage::Layout)?;
        let result = fit_layout(pairs, guidelines)?;
        self.invalidate_after(Stage::Layout);
        Ok(self.layout.insert(result))
    }

    /// Optional ROI stage. The polygon is in raw CCTV pixels.
    pub fn set_roi(&mut self, roi: RoiPolicy) -> Result<(), SessionError> {
        self.require(Stage::Roi)?;
        roi.validate().map_err(|source| SessionError::Geometry {
            stage: Stage::Roi,
            source,
        })?;
        self.invalidate_after(Stage::Roi);
        self.roi = Some(roi);
        Ok(())
    }

    /// Placement used by the artifact; may be set at any time.
    pub fn set_placement(&mut self, placement: PlacementPolicy) {
        if placement != self.placement {
            self.placement = placement;
            self.artifact = None;
        }
    }

    /// Freeze the session into an artifact.
    pub fn assemble(&mut self) -> Result<&GProjection, SessionError> {
        self.require(Stage::Assemble)?;
        let (Some(k), Some(d), Some(fit), Some(parallax)) = (
            self.lens.intrinsics,
            self.lens.distortion,
            self.homography.as_ref(),
            self.parallax.as_ref(),
        ) else {
            return Err(SessionError::StageOrder {
                stage: Stage::Assemble,
                missing: Stage::Parallax,
            });
        };
        let created_unix_s = self.created_unix_s.or_else(|| {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| d.as_secs())
        });
        let input = AssembleInput {
            location_code: self.location_code.clone(),
            created_unix_s,
            resolution: self.lens.resolution,
            intrinsics: k,
            distortion: d,
            homography: fit.homography,
            anchors: self.anchors.clone(),
            fov_polygon: None,
            pose: parallax.pose,
            scale: Some(parallax.scale.clone()),
            layout: self.layout.as_ref().map(|l| l.alignment.clone()),
            roi: self.roi.clone(),
            placement: self.placement,
        };
        let g = assemble(input, &self.params.coefficient_limits)?;
        Ok(self.artifact.insert(g))
    }

    /// Persist the assembled artifact, replacing the location's previous one.
    pub fn save(&self, store: &ProjectionStore) -> Result<PathBuf, SessionError> {
        let g = self.artifact.as_ref().ok_or(SessionError::StageOrder {
            stage: Stage::Assemble,
            missing: Stage::Assemble,
        })?;
        Ok(store.save(g)?)
    }
}
