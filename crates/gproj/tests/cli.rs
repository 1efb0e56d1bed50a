use assert_cmd::Command;
use gproj::calib::{AnchorInput, CalibrationInput, ParallaxObservation, PixelSpace, ReferenceInput};
use gproj::core::synthetic::SyntheticCamera;
use gproj::core::{DistortionCoefficients, Intrinsics, Vector3};
use gproj::projection::{BBox2D, Detection, ObjectPrior, PlacementPolicy};
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;

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

fn batch(cam: &SyntheticCamera) -> CalibrationInput {
    let ground = |x: f64, y: f64| Vector3::new(x, y, 0.0);
    let anchors = [(-4.0, 2.0), (5.0, 3.0), (6.0, 12.0), (-5.0, 14.0), (0.0, 8.0)]
        .iter()
        .enumerate()
        .map(|(i, &(x, y))| AnchorInput {
            name: format!("A{i}"),
            cctv: cam.project(ground(x, y)).expect("visible"),
            sat: cam.sat(ground(x, y)),
        })
        .collect();
    let subjects = [(-3.0, 6.0), (4.0, 10.0)].map(|(x, y)| ParallaxObservation {
        head: cam.project(Vector3::new(x, y, 1.7)).expect("visible"),
        ground: cam.project(ground(x, y)).expect("visible"),
        height_m: 1.7,
    });
    CalibrationInput {
        location_code: "SYN-01".into(),
        resolution: Some([1920, 1080]),
        intrinsics: Some(cam.intrinsics),
        distortion: cam.distortion,
        pixel_space: PixelSpace::Raw,
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
        params: Default::default(),
        created_unix_s: Some(1_700_000_000),
    }
}

fn gproj() -> Command {
    Command::cargo_bin("gproj").expect("binary built")
}

fn calibrate_into(dir: &Path) -> Value {
    let input = dir.join("batch.json");
    batch(&scene()).write_json(&input).expect("write batch");
    let output = gproj()
        .args(["calibrate", "--input"])
        .arg(&input)
        .arg("--store")
        .arg(dir.join("location"))
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("report json")
}

fn store_args(dir: &Path) -> Vec<String> {
    vec![
        "--store".into(),
        dir.join("location").display().to_string(),
        "--location".into(),
        "SYN-01".into(),
    ]
}

#[test]
fn calibrate_saves_the_artifact_and_prints_a_report() {
    let dir = tempfile::tempdir().expect("tempdir");
    let report = calibrate_into(dir.path());
    assert_eq!(report["location_code"], "SYN-01");
    let height = report["pose"]["height_m"].as_f64().expect("height");
    assert!((height - 8.0).abs() < 1e-2, "height {height}");
    assert!(dir
        .path()
        .join("location/SYN-01/G_projection_SYN-01.json")
        .exists());
}

#[test]
fn calibrate_fails_with_the_stage_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut input = batch(&scene());
    input.anchors.truncate(3);
    let path = dir.path().join("batch.json");
    input.write_json(&path).expect("write batch");
    gproj()
        .args(["calibrate", "--input"])
        .arg(&path)
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"failed\""))
        .stderr(predicate::str::contains("homography stage failed (input validation)"));
}

#[test]
fn project_and_inverse_use_the_stored_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    calibrate_into(dir.path());
    let cam = scene();

    let foot = cam.project(Vector3::new(1.0, 9.0, 0.75)).expect("visible");
    let detections = vec![
        Detection {
            bbox: BBox2D::new(foot.x - 40.0, foot.y - 60.0, foot.x + 40.0, foot.y + 60.0),
            track_id: Some(7),
            prior: ObjectPrior::default(),
            heading_deg: Some(90.0),
        },
        Detection {
            bbox: BBox2D::new(10.0, 10.0, 5.0, 20.0),
            track_id: Some(8),
            prior: ObjectPrior::default(),
            heading_deg: None,
        },
    ];
    let det_path = dir.path().join("detections.json");
    std::fs::write(&det_path, serde_json::to_string(&detections).expect("json")).expect("write");

    let output = gproj()
        .arg("project")
        .args(store_args(dir.path()))
        .arg("--detections")
        .arg(&det_path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let out: Value = serde_json::from_slice(&output).expect("projections json");
    assert_eq!(out[0]["status"], "projected");
    assert_eq!(out[0]["box"]["track_id"], 7);
    assert_eq!(out[1]["status"], "failed");
    assert_eq!(out[1]["track_id"], 8);

    gproj()
        .arg("inverse")
        .args(store_args(dir.path()))
        .args(["--x", "20", "--y", "180"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cctv\""));
}

#[test]
fn inspect_upgrades_a_version_one_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cam = scene();
    let pose = cam.pose();
    let doc = serde_json::json!({
        "meta": {"location_code": "SYN-OLD"},
        "undistort": {"K": cam.intrinsics.to_array(), "D": cam.distortion.to_array()},
        "homography": {"H": cam.homography().expect("regular").to_array()},
        "parallax": {
            "x_cam_coords_sat": pose.position_sat.x,
            "y_cam_coords_sat": pose.position_sat.y,
            "z_cam_meters": pose.height_m,
            "px_per_meter": pose.px_per_meter,
        },
    });
    let path = dir.path().join("G_projection_SYN-OLD.json");
    std::fs::write(&path, doc.to_string()).expect("write v1");

    gproj()
        .args(["inspect", "--artifact"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"stored_schema_version\": 1"))
        .stdout(predicate::str::contains("\"upgraded\": false"));

    gproj()
        .args(["inspect", "--upgrade", "--artifact"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"upgraded\": true"));

    let rewritten: Value =
        serde_json::from_slice(&std::fs::read(&path).expect("read")).expect("json");
    assert_eq!(rewritten["schema_version"], 3);
}

#[test]
fn rescale_writes_a_loadable_artifact() {
    let dir = tempfile::tempdir().expect("tempdir");
    calibrate_into(dir.path());
    let out = dir.path().join("half.json");
    gproj()
        .arg("rescale")
        .args(store_args(dir.path()))
        .args(["--factor", "0.5", "--out"])
        .arg(&out)
        .assert()
        .success();
    let g = gproj::projection::load_path(&out).expect("loads");
    assert_eq!(g.resolution(), Some([960, 540]));

    gproj()
        .arg("rescale")
        .args(store_args(dir.path()))
        .args(["--factor", "0", "--out"])
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("rescale factor"));
}

#[test]
fn artifact_source_is_required() {
    gproj()
        .args(["inverse", "--x", "1", "--y", "2"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--artifact"));
}

#[cfg(feature = "tracing")]
#[test]
fn trace_json_routes_log_records_through_tracing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("batch.json");
    batch(&scene()).write_json(&input).expect("write batch");
    gproj()
        .env("RUST_LOG", "info")
        .args(["--trace-json", "calibrate", "--input"])
        .arg(&input)
        .arg("--store")
        .arg(dir.path().join("location"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"level\":\"INFO\""))
        .stdout(predicate::str::contains("saved G projection for SYN-01"));
}
