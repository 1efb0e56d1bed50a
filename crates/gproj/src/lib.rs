//! Facade crate for the `gproj-*` workspace.
//!
//! A G Projection maps a fixed CCTV camera onto the satellite (SAT) image of
//! its location. This crate re-exports:
//! - `gproj::core`: intrinsics, lens distortion, homography, affine, pose.
//! - `gproj::calib`: the calibration solvers and [`CalibrationSession`].
//! - `gproj::projection`: the [`GProjection`] artifact, its JSON schema and
//!   store, and the forward/inverse mapping of detections.
//!
//! With the default `cli` feature it also builds the `gproj` binary.
//!
//! ## Quickstart
//!
//! ```no_run
//! use gproj::{run_batch, CalibrationInput, ProjectionStore};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let input = CalibrationInput::load_json("calibration.json")?;
//! let store = ProjectionStore::new("location");
//! let report = run_batch(&input, Some(&store));
//! println!("calibrated: {}", report.succeeded());
//! # Ok(())
//! # }
//! ```

pub use gproj_calib as calib;
pub use gproj_core as core;
pub use gproj_projection as projection;

pub use gproj_calib::{run_batch, CalibrationInput, CalibrationReport, CalibrationSession, Stage};
pub use gproj_core::ErrorClass;
pub use gproj_projection::{BBox2D, Detection, GProjection, ObjectPrior, ProjectionStore};
