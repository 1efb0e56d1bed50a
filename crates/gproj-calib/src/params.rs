//! Solver configuration. Every field has a default, so a partial JSON file
//! only overrides what it names.

use gproj_core::{CoefficientLimits, UndistortOptions};
use serde::{Deserialize, Serialize};

/// RANSAC options of the homography solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomographyOptions {
    /// Hypothesis budget. When the number of 4-point subsets does not exceed
    /// it, every subset is tried instead of sampling.
    pub max_iterations: usize,
    /// SAT-domain reprojection error below which a correspondence is an
    /// inlier, in pixels.
    pub ransac_threshold: f64,
    /// Minimum consensus size; values below 4 are raised to 4.
    pub min_inliers: usize,
    pub seed: u64,
    /// Correspondences closer than this on either side are duplicates.
    pub duplicate_tolerance_px: f64,
    /// Point sets whose principal-variance ratio falls below this count as
    /// collinear.
    pub collinearity_tolerance: f64,
    /// Least-squares refits on the growing inlier set.
    pub refit_rounds: usize,
}

impl Default for HomographyOptions {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            ransac_threshold: 5.0,
            min_inliers: 4,
            seed: 0x6770_726f_6a,
            duplicate_tolerance_px: 0.01,
            collinearity_tolerance: 1e-4,
            refit_rounds: 3,
        }
    }
}

/// Which estimate becomes the pose scale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleSource {
    /// Measured SAT distance over the real distance.
    #[default]
    Reference,
    /// Recovered from the homography and the camera height.
    Parallax,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallaxOptions {
    /// Head->ground lines closer to parallel than this sine are rejected.
    pub min_line_angle_sin: f64,
    /// Ground contacts (SAT px) closer than this coincide.
    pub coincidence_tolerance_px: f64,
    /// Ratios above `1 - min_disparity` carry no usable parallax.
    pub min_disparity: f64,
    /// Relative difference between the two scales that triggers a
    /// consistency warning.
    pub scale_tolerance: f64,
    pub scale_source: ScaleSource,
}

impl Default for ParallaxOptions {
    fn default() -> Self {
        Self {
            min_line_angle_sin: 1e-3,
            coincidence_tolerance_px: 1e-6,
            min_disparity: 1e-6,
            scale_tolerance: 0.05,
            scale_source: ScaleSource::Reference,
        }
    }
}

/// Everything the calibration stages can be tuned with.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverParams {
    pub homography: HomographyOptions,
    pub undistort: UndistortOptions,
    pub coefficient_limits: CoefficientLimits,
    pub parallax: ParallaxOptions,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_keeps_defaults() {
        let params: SolverParams = serde_json::from_str(
            r#"{"homography": {"ransac_threshold": 2.5}, "parallax": {"scale_source": "parallax"}}"#,
        )
        .expect("partial config parses");
        assert_eq!(params.homography.ransac_threshold, 2.5);
        assert_eq!(params.homography.min_inliers, 4);
        assert_eq!(params.parallax.scale_source, ScaleSource::Parallax);
        assert_eq!(params.parallax.scale_tolerance, 0.05);
        assert_eq!(params.undistort, UndistortOptions::default());
    }
}
