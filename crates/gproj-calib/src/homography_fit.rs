//! Robust CCTV -> SAT homography from hand-picked correspondences.
//!
//! Hypotheses come from minimal 4-point subsets (exhaustive when the subset
//! count fits the iteration budget, seeded random sampling otherwise). The
//! best consensus is refined by least-squares DLT on its inliers while the
//! inlier set keeps growing.

use crate::params::HomographyOptions;
use gproj_core::geometry::{spread_ratio, triangle_area2};
use gproj_core::{
    estimate_homography, homography_from_4pt, normalize_points, ErrorClass, Homography, Point2,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Twice the triangle area, in Hartley-normalized units, under which three
/// sample points count as collinear.
const SAMPLE_COLLINEARITY: f64 = 1e-6;

/// One manual correspondence: undistorted CCTV pixel and SAT pixel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Correspondence {
    pub cctv: Point2<f64>,
    pub sat: Point2<f64>,
}

impl Correspondence {
    pub fn new(cctv: Point2<f64>, sat: Point2<f64>) -> Self {
        Self { cctv, sat }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum HomographyError {
    #[error("need at least 4 correspondences, got {got}")]
    TooFew { got: usize },
    #[error("correspondence {index} has a non-finite coordinate")]
    NonFinite { index: usize },
    #[error("correspondences {first} and {second} coincide in {side} ({distance_px:.4} px apart)")]
    Duplicate {
        first: usize,
        second: usize,
        side: &'static str,
        distance_px: f64,
    },
    #[error("{side} points are collinear")]
    Collinear { side: &'static str },
    #[error("best consensus has {found} inliers, {required} required")]
    NotEnoughInliers { found: usize, required: usize },
    #[error("fitted homography is singular (conditioning {conditioning:.3e})")]
    Singular { conditioning: f64 },
}

impl HomographyError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TooFew { .. } | Self::NonFinite { .. } | Self::Duplicate { .. } => {
                ErrorClass::InputValidation
            }
            Self::Collinear { .. } | Self::NotEnoughInliers { .. } | Self::Singular { .. } => {
                ErrorClass::NumericDegeneracy
            }
        }
    }
}

/// Accepted homography with its consensus.
#[derive(Clone, Debug, PartialEq)]
pub struct HomographyFit {
    pub homography: Homography,
    /// Ascending indices of the inlier correspondences.
    pub inliers: Vec<usize>,
    /// SAT-domain reprojection error of every correspondence, in pixels.
    pub residuals: Vec<f64>,
    /// RMS of the inlier residuals.
    pub inlier_rms: f64,
    /// Number of minimal hypotheses evaluated.
    pub hypotheses: usize,
}

impl HomographyFit {
    pub fn outliers(&self) -> Vec<usize> {
        (0..self.residuals.len())
            .filter(|i| self.inliers.binary_search(i).is_err())
            .collect()
    }
}

#[derive(Clone, Debug)]
struct Consensus {
    homography: Homography,
    inliers: Vec<usize>,
    residuals: Vec<f64>,
    inlier_error: f64,
}

impl Consensus {
    fn score(h: Homography, data: &[Correspondence], threshold: f64) -> Self {
        let residuals: Vec<f64> = data
            .iter()
            .map(|c| {
                h.try_apply(c.cctv)
                    .map_or(f64::INFINITY, |p| (p - c.sat).norm())
            })
            .collect();
        let inliers: Vec<usize> = (0..data.len())
            .filter(|&i| residuals[i] < threshold)
            .collect();
        let inlier_error = inliers.iter().map(|&i| residuals[i]).sum();
        Self {
            homography: h,
            inliers,
            residuals,
            inlier_error,
        }
    }

    fn beats(&self, other: &Self) -> bool {
        self.inliers.len() > other.inliers.len()
            || (self.inliers.len() == other.inliers.len() && self.inlier_error < other.inlier_error)
    }

    fn rms(&self) -> f64 {
        if self.inliers.is_empty() {
            return f64::INFINITY;
        }
        let ss: f64 = self.inliers.iter().map(|&i| self.residuals[i].powi(2)).sum();
        (ss / self.inliers.len() as f64).sqrt()
    }
}

/// Reject inputs no homography can be fitted to.
pub fn validate_correspondences(
    data: &[Correspondence],
    opts: &HomographyOptions,
) -> Result<(), HomographyError> {
    if data.len() < 4 {
        return Err(HomographyError::TooFew { got: data.len() });
    }
    if let Some(index) = data.iter().position(|c| {
        !(c.cctv.x.is_finite() && c.cctv.y.is_finite() && c.sat.x.is_finite() && c.sat.y.is_finite())
    }) {
        return Err(HomographyError::NonFinite { index });
    }
    for i in 0..data.len() {
        for j in i + 1..data.len() {
            for (side, a, b) in [
                ("cctv", data[i].cctv, data[j].cctv),
                ("sat", data[i].sat, data[j].sat),
            ] {
                let distance_px = (a - b).norm();
                if distance_px < opts.duplicate_tolerance_px {
                    return Err(HomographyError::Duplicate {
                        first: i,
                        second: j,
                        side,
                        distance_px,
                    });
                }
            }
        }
    }
    let cctv: Vec<_> = data.iter().map(|c| c.cctv).collect();
    let sat: Vec<_> = data.iter().map(|c| c.sat).collect();
    for (side, pts) in [("cctv", &cctv), ("sat", &sat)] {
        if spread_ratio(pts) < opts.collinearity_tolerance {
            return Err(HomographyError::Collinear { side });
        }
    }
    Ok(())
}

/// Number of 4-subsets of `n` items, saturating.
fn subset_count(n: usize) -> u128 {
    let n = n as u128;
    if n < 4 {
        return 0;
    }
    n.saturating_mul(n - 1)
        .saturating_mul(n - 2)
        .saturating_mul(n - 3)
        / 24
}

/// Lexicographic successor of a sorted 4-subset of `0..n`.
fn next_subset(idx: &mut [usize; 4], n: usize) -> bool {
    let k = idx.len();
    for i in (0..k).rev() {
        if idx[i] < n - k + i {
            idx[i] += 1;
            for j in i + 1..k {
                idx[j] = idx[j - 1] + 1;
            }
            return true;
        }
    }
    false
}

fn has_collinear_triple(pts: &[Point2<f64>], idx: &[usize; 4]) -> bool {
    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    TRIPLES.iter().any(|t| {
        triangle_area2(pts[idx[t[0]]], pts[idx[t[1]]], pts[idx[t[2]]]).abs() < SAMPLE_COLLINEARITY
    })
}

/// Fit H (undistorted CCTV -> SAT) robustly.
#[cfg_attr(
    feature = "tracing",
    instrument(level = "debug", skip(data, opts), fields(n = data.len()))
)]
pub fn fit(
    data: &[Correspondence],
    opts: &HomographyOptions,
) -> Result<HomographyFit, HomographyError> {
    validate_correspondences(data, opts)?;
    let n = data.len();
    let required = opts.min_inliers.max(4);

    let cctv: Vec<_> = data.iter().map(|c| c.cctv).collect();
    let sat: Vec<_> = data.iter().map(|c| c.sat).collect();
    let (cctv_n, _) = normalize_points(&cctv);
    let (sat_n, _) = normalize_points(&sat);

    let mut best: Option<Consensus> = None;
    let mut hypotheses = 0usize;
    let mut try_sample = |idx: [usize; 4]| {
        if has_collinear_triple(&cctv_n, &idx) || has_collinear_triple(&sat_n, &idx) {
            return;
        }
        let src = idx.map(|i| cctv[i]);
        let dst = idx.map(|i| sat[i]);
        let Some(h) = homography_from_4pt(&src, &dst) else {
            return;
        };
        hypotheses += 1;
        let candidate = Consensus::score(h, data, opts.ransac_threshold);
        if best.as_ref().is_none_or(|b| candidate.beats(b)) {
            best = Some(candidate);
        }
    };

    if subset_count(n) <= opts.max_iterations as u128 {
        let mut idx = [0, 1, 2, 3];
        loop {
            try_sample(idx);
            if !next_subset(&mut idx, n) {
                break;
            }
        }
    } else {
        let mut rng = StdRng::seed_from_u64(opts.seed);
        for _ in 0..opts.max_iterations {
            let drawn = rand::seq::index::sample(&mut rng, n, 4).into_vec();
            let mut idx = [drawn[0], drawn[1], drawn[2], drawn[3]];
            idx.sort_unstable();
            try_sample(idx);
        }
    }

    let Some(mut best) = best else {
        return Err(HomographyError::NotEnoughInliers { found: 0, required });
    };
    log::debug!(
        "ransac: {hypotheses} hypotheses, best consensus {}/{n}",
        best.inliers.len()
    );
    if best.inliers.len() < required {
        return Err(HomographyError::NotEnoughInliers {
            found: best.inliers.len(),
            required,
        });
    }

    for round in 0..opts.refit_rounds {
        let src: Vec<_> = best.inliers.iter().map(|&i| cctv[i]).collect();
        let dst: Vec<_> = best.inliers.iter().map(|&i| sat[i]).collect();
        let Some(h) = estimate_homography(&src, &dst) else {
            break;
        };
        let refit = Consensus::score(h, data, opts.ransac_threshold);
        if refit.inliers.len() < best.inliers.len() {
            break;
        }
        let grew = refit.inliers.len() > best.inliers.len();
        log::debug!("refit round {round}: {} inliers", refit.inliers.len());
        best = refit;
        if !grew {
            break;
        }
    }

    let conditioning = best.homography.conditioning();
    if best.homography.validate().is_err() {
        return Err(HomographyError::Singular { conditioning });
    }

    let inlier_rms = best.rms();
    log::info!(
        "homography: {}/{n} inliers, rms {inlier_rms:.3} px",
        best.inliers.len()
    );
    Ok(HomographyFit {
        homography: best.homography,
        inliers: best.inliers,
        residuals: best.residuals,
        inlier_rms,
        hypotheses,
    })
}
