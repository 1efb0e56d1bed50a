//! Calibration of one CCTV location against its satellite image.
//!
//! Current focus:
//! - robust CCTV -> SAT ground homography from operator anchors (RANSAC),
//! - camera height and pixel-per-meter scale from two subjects of known height,
//! - optional SVG site-layout alignment,
//! - a [`CalibrationSession`] that runs the stages in order and assembles a
//!   [`gproj_projection::GProjection`].
//!
//! [`run_batch`] drives a whole session from a JSON [`CalibrationInput`].

mod error;
mod homography_fit;
mod io;
mod layout_fit;
mod parallax;
mod params;
mod session;

pub use error::{SessionError, Stage};
pub use homography_fit::{
    fit as fit_homography, validate_correspondences, Correspondence, HomographyError,
    HomographyFit,
};
pub use io::{
    run_batch, AnchorInput, CalibIoError, CalibrationInput, CalibrationReport,
    HomographySummary, LayoutInput, PixelSpace, ReferenceInput, RoiInput, StageReport,
    StageStatus,
};
pub use layout_fit::{fit_layout, LayoutAnchorPair, LayoutFit, LayoutFitError};
pub use parallax::{
    parallax_scale, ConsistencyWarning, DistanceReference, ParallaxError, ParallaxObservation,
    ParallaxSolution, ParallaxSolver, ScaleCheck,
};
pub use params::{HomographyOptions, ParallaxOptions, ScaleSource, SolverParams};
pub use session::{CalibrationSession, SessionWarning};
