use approx::assert_relative_eq;
use gproj_calib::{
    fit_homography, run_batch, AnchorInput, CalibrationInput, CalibrationSession, Correspondence,
    DistanceReference, HomographyError, HomographyOptions, LayoutAnchorPair, ParallaxObservation,
    PixelSpace, ReferenceInput, SessionError, SessionWarning, SolverParams, Stage, StageStatus,
};
use gproj_core::synthetic::SyntheticCamera;
use gproj_core::{
    AffineTransform, CoefficientLimits, DistortionCoefficients, ErrorClass, Intrinsics, Point2,
    Vector3,
};
use gproj_projection::{Anchor, PlacementPolicy, ProjectionStore};

const GROUND: [(f64, f64); 7] = [
    (-4.0, 2.0),
    (5.0, 3.0),
    (6.0, 12.0),
    (-5.0, 14.0),
    (0.0, 8.0),
    (2.0, 5.0),
    (-2.0, 10.0),
];

fn scene() -> SyntheticCamera {
    SyntheticCamera::looking_down(
        Intrinsics::new(1000.0, 1000.0, 960.0, 540.0).expect("valid intrinsics"),
        DistortionCoefficients::from_array([-0.1, 0.02, 0.0, 0.0, 0.0]),
        Vector3::new(0.0, -10.0, 8.0),
        90.0,
        30.0,
        20.0,
    )
}

fn ground(x: f64, y: f64) -> Vector3<f64> {
    Vector3::new(x, y, 0.0)
}

fn anchors(cam: &SyntheticCamera) -> Vec<Anchor> {
    GROUND
        .iter()
        .enumerate()
        .map(|(id, &(x, y))| Anchor {
            id,
            name: format!("A{id}"),
            cctv: cam.project_ideal(ground(x, y)).expect("visible"),
            sat: cam.sat(ground(x, y)),
        })
        .collect()
}

fn subjects(cam: &SyntheticCamera) -> [ParallaxObservation; 2] {
    [(-3.0, 6.0), (4.0, 10.0)].map(|(x, y)| ParallaxObservation {
        head: cam.project_ideal(Vector3::new(x, y, 1.7)).expect("visible"),
        ground: cam.project_ideal(ground(x, y)).expect("visible"),
        height_m: 1.7,
    })
}

fn reference(cam: &SyntheticCamera) -> DistanceReference {
    let (a, b) = (ground(-4.0, 2.0), ground(5.0, 3.0));
    DistanceReference::new(cam.sat(a), cam.sat(b), (a - b).norm())
}

fn calibrated_session(cam: &SyntheticCamera) -> CalibrationSession {
    let mut session = CalibrationSession::new("SYN-01");
    session.set_created_unix_s(Some(1_700_000_000));
    session
        .set_lens(cam.intrinsics, Some([1920, 1080]))
        .expect("lens");
    session.set_distortion(cam.distortion).expect("distortion");
    session.fit_homography(anchors(cam)).expect("homography");
    session
        .solve_parallax(subjects(cam), reference(cam))
        .expect("parallax");
    session
}

#[test]
fn synthetic_session_recovers_camera_and_assembles() {
    let cam = scene();
    let mut session = calibrated_session(&cam);

    let fit = session.homography_fit().expect("fitted");
    assert_eq!(fit.inliers, (0..GROUND.len()).collect::<Vec<_>>());
    assert!(fit.inlier_rms < 1e-6);

    let parallax = session.parallax().expect("solved");
    assert_relative_eq!(parallax.pose.height_m, 8.0, epsilon = 1e-6);
    assert_relative_eq!(parallax.pose.position_sat.x, 0.0, epsilon = 1e-4);
    assert_relative_eq!(parallax.pose.position_sat.y, -200.0, epsilon = 1e-4);
    assert_relative_eq!(parallax.pose.px_per_meter, 20.0, epsilon = 1e-9);
    assert!(parallax.scale_check.is_consistent());
    assert!(session.warnings().is_empty());

    let g = session.assemble().expect("assembles");
    assert_eq!(g.location_code(), "SYN-01");
    assert_eq!(g.created_unix_s(), Some(1_700_000_000));
    assert_eq!(g.anchors().len(), GROUND.len());
    let pixel = cam.project_ideal(ground(1.0, 7.0)).expect("visible");
    let sat = g.homography().apply(pixel);
    assert_relative_eq!(sat.x, 20.0, epsilon = 1e-4);
    assert_relative_eq!(sat.y, 140.0, epsilon = 1e-4);
    assert_eq!(session.completed().last(), Some(&Stage::Assemble));
}

#[test]
fn square_maps_to_rotated_square_without_outliers() {
    let (s, c) = 30f64.to_radians().sin_cos();
    let data: Vec<_> = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
        .iter()
        .map(|&(x, y)| {
            Correspondence::new(
                Point2::new(x, y),
                Point2::new(100.0 + 50.0 * (c * x - s * y), 40.0 + 50.0 * (s * x + c * y)),
            )
        })
        .collect();
    let fit = fit_homography(&data, &HomographyOptions::default()).expect("fits");
    assert_eq!(fit.inliers, vec![0, 1, 2, 3]);
    assert!(fit.outliers().is_empty());
    assert_eq!(fit.hypotheses, 1);
    let mid = fit.homography.apply(Point2::new(0.5, 0.5));
    assert_relative_eq!(mid.x, 100.0 + 25.0 * (c - s), epsilon = 1e-9);
    assert_relative_eq!(mid.y, 40.0 + 25.0 * (s + c), epsilon = 1e-9);
}

#[test]
fn three_correspondences_are_too_few() {
    let data: Vec<_> = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]
        .iter()
        .map(|&(x, y)| Correspondence::new(Point2::new(x, y), Point2::new(x, y)))
        .collect();
    let err = fit_homography(&data, &HomographyOptions::default()).expect_err("too few");
    assert_eq!(err, HomographyError::TooFew { got: 3 });
    assert_eq!(err.class(), ErrorClass::InputValidation);
}

#[test]
fn misplaced_anchor_is_rejected_with_a_warning() {
    let cam = scene();
    let mut session = CalibrationSession::new("SYN-01");
    session.set_lens(cam.intrinsics, None).expect("lens");
    session.set_distortion(cam.distortion).expect("distortion");
    let mut picked = anchors(&cam);
    picked[4].sat.x += 80.0;
    let fit = session.fit_homography(picked).expect("robust fit");
    assert_eq!(fit.outliers(), vec![4]);
    assert!(fit.residuals[4] > 70.0);
    assert_eq!(
        session.warnings(),
        &[SessionWarning::OutliersRejected { indices: vec![4] }]
    );
}

#[test]
fn fixed_seed_makes_sampled_fits_repeatable() {
    let cam = scene();
    let data: Vec<_> = anchors(&cam)
        .iter()
        .map(|a| Correspondence::new(a.cctv, a.sat))
        .collect();
    let opts = HomographyOptions {
        max_iterations: 10,
        ..HomographyOptions::default()
    };
    let first = fit_homography(&data, &opts).expect("fits");
    let second = fit_homography(&data, &opts).expect("fits");
    assert_eq!(first, second);
    assert!(first.hypotheses <= 10);
}

#[test]
fn stages_refuse_to_run_out_of_order() {
    let cam = scene();
    let mut session = CalibrationSession::new("SYN-01");
    assert!(matches!(
        session.set_distortion(cam.distortion),
        Err(SessionError::StageOrder {
            stage: Stage::Undistort,
            missing: Stage::Lens
        })
    ));
    session.set_lens(cam.intrinsics, None).expect("lens");
    assert!(matches!(
        session.fit_homography(anchors(&cam)),
        Err(SessionError::StageOrder {
            stage: Stage::Homography,
            missing: Stage::Undistort
        })
    ));
    session.set_distortion(cam.distortion).expect("distortion");
    let err = session
        .solve_parallax(subjects(&cam), reference(&cam))
        .expect_err("no homography yet");
    assert_eq!(err.stage(), Stage::Parallax);
    assert_eq!(err.class(), ErrorClass::InputValidation);
    assert!(session.assemble().is_err());
    assert_eq!(session.completed(), vec![Stage::Lens, Stage::Undistort]);
}

#[test]
fn failed_stage_leaves_the_session_untouched() {
    let cam = scene();
    let mut session = calibrated_session(&cam);
    let three = anchors(&cam).into_iter().take(3).collect();
    let err = session.fit_homography(three).expect_err("too few");
    assert_eq!(err.stage(), Stage::Homography);
    assert!(session.parallax().is_some());
    assert_eq!(session.anchors().len(), GROUND.len());
}

#[test]
fn rerunning_a_stage_invalidates_what_depends_on_it() {
    let cam = scene();
    let mut session = calibrated_session(&cam);
    let truth = AffineTransform::from_array([[2.0, 0.0, 10.0], [0.0, 2.0, -5.0]]);
    let pairs: Vec<_> = [(0.0, 0.0), (50.0, 0.0), (0.0, 40.0)]
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| {
            let svg = Point2::new(x, y);
            LayoutAnchorPair {
                svg_id: format!("s{i}"),
                sat_id: format!("A{i}"),
                svg,
                sat: truth.apply(svg),
            }
        })
        .collect();
    session.fit_layout(&pairs, Vec::new()).expect("layout");
    session.assemble().expect("assembles");

    // layout only feeds the artifact
    session.fit_layout(&pairs, Vec::new()).expect("layout again");
    assert!(session.parallax().is_some());
    assert!(session.artifact().is_none());

    session.set_placement(PlacementPolicy::LEGACY);
    session.assemble().expect("assembles");
    session.set_placement(PlacementPolicy::LEGACY);
    assert!(session.artifact().is_some());

    session.fit_homography(anchors(&cam)).expect("homography again");
    assert_eq!(
        session.completed(),
        vec![Stage::Lens, Stage::Undistort, Stage::Homography]
    );
    assert!(session.layout().is_none());
}

#[test]
fn artifact_under_loosened_limits_reloads_from_the_store() {
    let cam = scene();
    let params = SolverParams {
        coefficient_limits: CoefficientLimits {
            k1: 2.0,
            ..CoefficientLimits::default()
        },
        ..SolverParams::default()
    };
    let mut session = CalibrationSession::with_params("SYN-01", params);
    session
        .set_lens(cam.intrinsics, Some([1920, 1080]))
        .expect("lens");
    session
        .set_distortion(DistortionCoefficients::from_array([-1.5, 0.02, 0.0, 0.0, 0.0]))
        .expect("k1 within loosened limits");
    session.fit_homography(anchors(&cam)).expect("homography");
    session
        .solve_parallax(subjects(&cam), reference(&cam))
        .expect("parallax");
    let g = session.assemble().expect("assembles").clone();

    let dir = tempfile::tempdir().expect("tempdir");
    let store = ProjectionStore::new(dir.path());
    session.save(&store).expect("saved");
    let loaded = store.load("SYN-01").expect("readable").expect("present");
    assert_eq!(loaded, g);
    assert_eq!(loaded.coefficient_limits().k1, 2.0);
    let half = loaded.rescaled(0.5).expect("rescales under the same limits");
    assert_eq!(half.distortion().k1, -1.5);
}

fn batch(cam: &SyntheticCamera, pixel_space: PixelSpace) -> CalibrationInput {
    let pixel = |w: Vector3<f64>| match pixel_space {
        PixelSpace::Raw => cam.project(w),
        PixelSpace::Undistorted => cam.project_ideal(w),
    };
    let anchors = GROUND
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| AnchorInput {
            name: format!("A{i}"),
            cctv: pixel(ground(x, y)).expect("visible"),
            sat: cam.sat(ground(x, y)),
        })
        .collect();
    let subjects = [(-3.0, 6.0), (4.0, 10.0)].map(|(x, y)| ParallaxObservation {
        head: pixel(Vector3::new(x, y, 1.7)).expect("visible"),
        ground: pixel(ground(x, y)).expect("visible"),
        height_m: 1.7,
    });
    CalibrationInput {
        location_code: "SYN-01".into(),
        resolution: Some([1920, 1080]),
        intrinsics: Some(cam.intrinsics),
        distortion: cam.distortion,
        pixel_space,
        anchors,
        subjects,
        reference: ReferenceInput {
            a: None,
            b: None,
            anchors: vec!["A0".into(), "A1".into()],
            distance_m: (ground(-4.0, 2.0) - ground(5.0, 3.0)).norm(),
        },
        layout: None,
        roi: None,
        placement: PlacementPolicy::default(),
        params: SolverParams::default(),
        created_unix_s: Some(1_700_000_000),
    }
}

#[test]
fn batch_from_json_saves_the_artifact() {
    let cam = scene();
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("batch.json");
    batch(&cam, PixelSpace::Raw).write_json(&path).expect("write batch");

    let input = CalibrationInput::load_json(&path).expect("read batch");
    let store = ProjectionStore::new(dir.path().join("location"));
    let report = run_batch(&input, Some(&store));
    assert!(report.succeeded(), "{:?}", report.failure());
    assert!(report.artifact_path.as_ref().is_some_and(|p| p.exists()));
    let skipped: Vec<_> = report
        .stages
        .iter()
        .filter(|s| s.status == StageStatus::Skipped)
        .map(|s| s.stage)
        .collect();
    assert_eq!(skipped, vec![Stage::Layout, Stage::Roi]);

    let pose = report.pose.expect("pose");
    assert_relative_eq!(pose.height_m, 8.0, epsilon = 1e-3);
    let g = store.load("SYN-01").expect("readable").expect("saved");
    assert_eq!(g.pose(), &pose);
}

#[test]
fn batch_reports_the_failing_stage() {
    let cam = scene();
    let mut input = batch(&cam, PixelSpace::Undistorted);
    input.anchors.truncate(3);
    let report = run_batch(&input, None);
    assert!(!report.succeeded());
    let failure = report.failure().expect("failed");
    assert_eq!(failure.stage, Stage::Homography);
    assert_eq!(failure.error_class, Some(ErrorClass::InputValidation));
    assert!(report.pose.is_none());

    let mut input = batch(&cam, PixelSpace::Undistorted);
    input.reference.anchors = vec!["A0".into(), "nope".into()];
    let report = run_batch(&input, None);
    let failure = report.failure().expect("failed");
    assert_eq!(failure.stage, Stage::Parallax);
    assert!(failure.error.as_deref().is_some_and(|e| e.contains("nope")));
}

#[test]
fn consistent_extra_anchor_never_lowers_the_inlier_count() {
    let cam = scene();
    let mut data: Vec<_> = anchors(&cam)
        .iter()
        .map(|a| Correspondence::new(a.cctv, a.sat))
        .collect();
    data[2].sat.y -= 60.0;
    let opts = HomographyOptions::default();
    let before = fit_homography(&data, &opts).expect("fits");
    assert_eq!(before.inliers.len(), GROUND.len() - 1);

    let extra = ground(3.0, 15.0);
    data.push(Correspondence::new(
        cam.project_ideal(extra).expect("visible"),
        cam.sat(extra),
    ));
    let after = fit_homography(&data, &opts).expect("fits");
    assert!(after.inliers.len() > before.inliers.len());
    assert_eq!(after.outliers(), vec![2]);
}
