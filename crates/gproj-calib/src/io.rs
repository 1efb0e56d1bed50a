//! JSON calibration batch and report used by the `gproj calibrate` driver.

use crate::error::{SessionError, Stage};
use crate::layout_fit::LayoutAnchorPair;
use crate::params::{ScaleSource, SolverParams};
use crate::parallax::{DistanceReference, ParallaxObservation, ScaleCheck};
use crate::session::{CalibrationSession, SessionWarning};
use gproj_core::{CameraPose, DistortionCoefficients, ErrorClass, Intrinsics, Point2, Polygon};
use gproj_projection::{
    Anchor, DiscardStrategy, PlacementPolicy, ProjectionStore, RoiMatch, RoiPolicy,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

#[cfg(feature = "tracing")]
use tracing::instrument;

#[derive(thiserror::Error, Debug)]
pub enum CalibIoError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Coordinate space of the CCTV pixels in a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelSpace {
    /// Picked on the undistorted frame.
    #[default]
    Undistorted,
    /// Picked on the raw frame; undistorted by the session.
    Raw,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnchorInput {
    #[serde(default)]
    pub name: String,
    pub cctv: Point2<f64>,
    pub sat: Point2<f64>,
}

/// Either two SAT points or the names of two anchors, plus the distance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReferenceInput {
    #[serde(default)]
    pub a: Option<Point2<f64>>,
    #[serde(default)]
    pub b: Option<Point2<f64>>,
    #[serde(default)]
    pub anchors: Vec<String>,
    pub distance_m: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutInput {
    pub pairs: Vec<LayoutAnchorPair>,
    #[serde(default)]
    pub guidelines: Vec<Vec<Point2<f64>>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoiInput {
    pub discard: DiscardStrategy,
    #[serde(rename = "match", default = "partial")]
    pub matching: RoiMatch,
    #[serde(default)]
    pub polygon: Option<Vec<Point2<f64>>>,
}

fn partial() -> RoiMatch {
    RoiMatch::Partial
}

/// Everything one calibration run needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationInput {
    pub location_code: String,
    #[serde(default)]
    pub resolution: Option<[u32; 2]>,
    /// Defaults to [`Intrinsics::for_resolution`] when absent.
    #[serde(default)]
    pub intrinsics: Option<Intrinsics>,
    #[serde(default)]
    pub distortion: DistortionCoefficients,
    #[serde(default)]
    pub pixel_space: PixelSpace,
    pub anchors: Vec<AnchorInput>,
    pub subjects: [ParallaxObservation; 2],
    pub reference: ReferenceInput,
    #[serde(default)]
    pub layout: Option<LayoutInput>,
    #[serde(default)]
    pub roi: Option<RoiInput>,
    #[serde(default)]
    pub placement: PlacementPolicy,
    #[serde(default)]
    pub params: SolverParams,
    #[serde(default)]
    pub created_unix_s: Option<u64>,
}

impl CalibrationInput {
    /// Load a JSON batch from disk.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CalibIoError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this batch to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), CalibIoError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Ok,
    Failed,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HomographySummary {
    pub inliers: Vec<usize>,
    pub outliers: Vec<usize>,
    pub inlier_rms: f64,
}

/// Outcome of [`run_batch`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub location_code: String,
    pub stages: Vec<StageReport>,
    pub warnings: Vec<SessionWarning>,
    #[serde(default)]
    pub homography: Option<HomographySummary>,
    #[serde(default)]
    pub pose: Option<CameraPose>,
    #[serde(default)]
    pub scale_check: Option<ScaleCheck>,
    #[serde(default)]
    pub scale_source: Option<ScaleSource>,
    #[serde(default)]
    pub artifact_path: Option<PathBuf>,
}

impl CalibrationReport {
    pub fn succeeded(&self) -> bool {
        self.stages.iter().all(|s| s.status != StageStatus::Failed)
            && self
                .stages
                .iter()
                .any(|s| s.stage == Stage::Assemble && s.status == StageStatus::Ok)
    }

    /// The first failure, if any.
    pub fn failure(&self) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.status == StageStatus::Failed)
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, CalibIoError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), CalibIoError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

fn resolve_reference(
    reference: &ReferenceInput,
    anchors: &[Anchor],
) -> Result<DistanceReference, SessionError> {
    let invalid = |reason: String| {
        SessionError::Parallax(crate::parallax::ParallaxError::InvalidReference { reason })
    };
    let (a, b) = match (reference.a, reference.b) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            let [name_a, name_b] = reference.anchors.as_slice() else {
                return Err(invalid(format!(
                    "give points a and b or exactly two anchor names, got {} names",
                    reference.anchors.len()
                )));
            };
            let find = |name: &str| {
                anchors
                    .iter()
                    .find(|x| x.name == name)
                    .map(|x| x.sat)
                    .ok_or_else(|| invalid(format!("unknown anchor {name:?}")))
            };
            (find(name_a.as_str())?, find(name_b.as_str())?)
        }
    };
    Ok(DistanceReference {
        a,
        b,
        distance_m: reference.distance_m,
        anchors: reference.anchors.clone(),
    })
}

struct Runner {
    session: CalibrationSession,
    stages: Vec<StageReport>,
}

impl Runner {
    fn record<T>(&mut self, stage: Stage, result: Result<T, SessionError>) -> Option<T> {
        match result {
            Ok(v) => {
                self.stages.push(StageReport {
                    stage,
                    status: StageStatus::Ok,
                    error: None,
                    error_class: None,
                });
                Some(v)
            }
            Err(e) => {
                log::error!("{}: {e}", self.session.location_code());
                self.stages.push(StageReport {
                    stage: e.stage(),
                    status: StageStatus::Failed,
                    error: Some(e.to_string()),
                    error_class: Some(e.class()),
                });
                None
            }
        }
    }

    fn skip(&mut self, stage: Stage) {
        self.stages.push(StageReport {
            stage,
            status: StageStatus::Skipped,
            error: None,
            error_class: None,
        });
    }

    fn run(&mut self, input: &CalibrationInput, store: Option<&ProjectionStore>) -> Option<PathBuf> {
        let intrinsics = match (input.intrinsics, input.resolution) {
            (Some(k), _) => Ok(k),
            (None, Some([w, h])) => Ok(Intrinsics::for_resolution(w, h)),
            (None, None) => Err(SessionError::Geometry {
                stage: Stage::Lens,
                source: gproj_core::GeometryError::InvalidIntrinsics {
                    reason: "neither intrinsics nor resolution given".into(),
                },
            }),
        };
        let lens = intrinsics.and_then(|k| self.session.set_lens(k, input.resolution));
        self.record(Stage::Lens, lens)?;
        let undistort = self.session.set_distortion(input.distortion);
        self.record(Stage::Undistort, undistort)?;

        let raw = input.pixel_space == PixelSpace::Raw;
        let mut pending = Vec::new();
        let anchors: Result<Vec<Anchor>, SessionError> = input
            .anchors
            .iter()
            .enumerate()
            .map(|(id, a)| -> Result<Anchor, SessionError> {
                let cctv = if raw {
                    self.session.undistort_for(Stage::Homography, a.cctv, &mut pending)?
                } else {
                    a.cctv
                };
                Ok(Anchor {
                    id,
                    name: a.name.clone(),
                    cctv,
                    sat: a.sat,
                })
            })
            .collect();
        let homography = anchors.and_then(|anchors| {
            self.session
                .fit_homography_with_warnings(anchors, pending)
                .map(|_| ())
        });
        self.record(Stage::Homography, homography)?;

        let mut pending = Vec::new();
        let subjects: Result<Vec<ParallaxObservation>, SessionError> = input
            .subjects
            .iter()
            .map(|o| -> Result<ParallaxObservation, SessionError> {
                if !raw {
                    return Ok(*o);
                }
                Ok(ParallaxObservation {
                    head: self.session.undistort_for(Stage::Parallax, o.head, &mut pending)?,
                    ground: self.session.undistort_for(Stage::Parallax, o.ground, &mut pending)?,
                    height_m: o.height_m,
                })
            })
            .collect();
        let parallax = subjects.and_then(|subjects| {
            let reference = resolve_reference(&input.reference, self.session.anchors())?;
            let observations = [subjects[0], subjects[1]];
            self.session
                .solve_parallax_with_warnings(observations, reference, pending)
                .map(|_| ())
        });
        self.record(Stage::Parallax, parallax)?;

        match &input.layout {
            Some(layout) => {
                let fitted = self
                    .session
                    .fit_layout(&layout.pairs, layout.guidelines.clone())
                    .map(|_| ());
                self.record(Stage::Layout, fitted)?;
            }
            None => self.skip(Stage::Layout),
        }

        match &input.roi {
            Some(roi) => {
                let policy = match &roi.polygon {
                    Some(vertices) => Polygon::new(vertices.clone())
                        .map(|p| RoiPolicy::new(roi.discard, roi.matching, Some(p)))
                        .map_err(|source| SessionError::Geometry {
                            stage: Stage::Roi,
                            source,
                        }),
                    None => Ok(RoiPolicy::new(roi.discard, roi.matching, None)),
                };
                let set = policy.and_then(|p| self.session.set_roi(p));
                self.record(Stage::Roi, set)?;
            }
            None => self.skip(Stage::Roi),
        }

        self.session.set_placement(input.placement);
        let assembled = self.session.assemble().map(|_| ());
        let path = match store {
            Some(store) => assembled.and_then(|_| self.session.save(store).map(Some)),
            None => assembled.map(|_| None),
        };
        self.record(Stage::Assemble, path)?
    }
}

/// Run every stage of `input` in order and report what happened.
///
/// Stops at the first failing stage; the report records the failure and its
/// class. When `store` is given the artifact is saved there.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "info", skip_all, fields(location = %input.location_code))
)]
pub fn run_batch(input: &CalibrationInput, store: Option<&ProjectionStore>) -> CalibrationReport {
    let mut session = CalibrationSession::with_params(&input.location_code, input.params.clone());
    session.set_created_unix_s(input.created_unix_s);
    let mut runner = Runner {
        session,
        stages: Vec::new(),
    };
    let artifact_path = runner.run(input, store);
    let session = &runner.session;
    CalibrationReport {
        location_code: input.location_code.clone(),
        stages: runner.stages.clone(),
        warnings: session.warnings().to_vec(),
        homography: session.homography_fit().map(|f| HomographySummary {
            inliers: f.inliers.clone(),
            outliers: f.outliers(),
            inlier_rms: f.inlier_rms,
        }),
        pose: session.parallax().map(|p| p.pose),
        scale_check: session.parallax().map(|p| p.scale_check),
        scale_source: session.parallax().map(|p| p.scale_source),
        artifact_path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_batch_fills_defaults() {
        let raw = r#"{
            "location_code": "A1",
            "resolution": [1280, 720],
            "anchors": [{"cctv": [1, 2], "sat": [3, 4]}],
            "subjects": [
                {"head": [0, 0], "ground": [0, 1], "height_m": 1.7},
                {"head": [5, 0], "ground": [5, 1], "height_m": 1.8}
            ],
            "reference": {"anchors": ["x", "y"], "distance_m": 10.0},
            "roi": {"discard": "outside"}
        }"#;
        let input: CalibrationInput = serde_json::from_str(raw).expect("parses");
        assert_eq!(input.pixel_space, PixelSpace::Undistorted);
        assert!(input.intrinsics.is_none());
        assert!(input.distortion.is_zero());
        assert_eq!(input.placement, PlacementPolicy::default());
        assert_eq!(input.anchors[0].name, "");
        assert_eq!(input.roi.expect("roi").matching, RoiMatch::Partial);
    }

    #[test]
    fn reference_resolves_anchor_names() {
        let anchors = vec![
            Anchor {
                id: 0,
                name: "gate".into(),
                cctv: Point2::new(0.0, 0.0),
                sat: Point2::new(10.0, 10.0),
            },
            Anchor {
                id: 1,
                name: "pole".into(),
                cctv: Point2::new(1.0, 0.0),
                sat: Point2::new(40.0, 50.0),
            },
        ];
        let mut input = ReferenceInput {
            a: None,
            b: None,
            anchors: vec!["gate".into(), "pole".into()],
            distance_m: 2.5,
        };
        let r = resolve_reference(&input, &anchors).expect("resolves");
        assert_eq!(r.measured_px(), 50.0);
        assert_eq!(r.anchors, input.anchors);

        input.anchors.pop();
        let err = resolve_reference(&input, &anchors).expect_err("one name");
        assert_eq!(err.class(), ErrorClass::InputValidation);

        input.a = Some(Point2::new(0.0, 0.0));
        input.b = Some(Point2::new(3.0, 4.0));
        let r = resolve_reference(&input, &anchors).expect("explicit points win");
        assert_eq!(r.measured_px(), 5.0);
    }
}
