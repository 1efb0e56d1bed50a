//! Geometric primitives for mapping a fixed CCTV view onto a top-down map.
//!
//! This crate holds the camera model (intrinsics and Brown-Conrady
//! distortion), planar transforms (homography, affine) and the recovered
//! camera pose. It performs no I/O and knows nothing about calibration
//! stages or artifacts.

mod affine;
mod distortion;
mod error;
pub mod geometry;
mod homography;
mod intrinsics;
mod logger;
mod pose;
pub mod synthetic;

pub use affine::AffineTransform;
pub use distortion::{
    distort, undistort, CoefficientLimits, DistortionCoefficients, LensModel, UndistortOptions,
    Undistorted,
};
pub use error::{ErrorClass, GeometryError};
pub use geometry::Polygon;
pub use homography::{
    estimate_homography, homography_from_4pt, normalize_points, Homography,
    SINGULAR_CONDITIONING,
};
pub use intrinsics::Intrinsics;
pub use pose::{CameraPose, ScaleRecord, MIN_CAMERA_CLEARANCE_M};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::{init_with_level, level_from_verbosity};

pub use nalgebra::{Point2, Vector2, Vector3};
