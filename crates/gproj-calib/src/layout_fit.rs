//! Least-squares SVG -> SAT affine from matched layout anchors.

use gproj_core::geometry::spread_ratio;
use gproj_core::{AffineTransform, ErrorClass, Point2};
use gproj_projection::{AssociationPair, LayoutAlignment};
use nalgebra::{Matrix3, Vector2, Vector3};
use serde::{Deserialize, Serialize};

const COLLINEARITY_TOLERANCE: f64 = 1e-6;

/// An SVG layout anchor matched with a SAT anchor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayoutAnchorPair {
    pub svg_id: String,
    pub sat_id: String,
    pub svg: Point2<f64>,
    pub sat: Point2<f64>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum LayoutFitError {
    #[error("need at least 3 anchor pairs, got {got}")]
    TooFew { got: usize },
    #[error("anchor pair {index} has a non-finite coordinate")]
    NonFinite { index: usize },
    #[error("{side} anchors are collinear")]
    Collinear { side: &'static str },
    #[error("affine normal equations are singular")]
    Singular,
}

impl LayoutFitError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::TooFew { .. } | Self::NonFinite { .. } => ErrorClass::InputValidation,
            Self::Collinear { .. } | Self::Singular => ErrorClass::NumericDegeneracy,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LayoutFit {
    pub alignment: LayoutAlignment,
    /// SAT-pixel error of each pair.
    pub residuals: Vec<f64>,
    pub rms: f64,
}

/// Fit `sat ~ A * [svg, 1]`. Only the anchor ids are kept in the
/// alignment; `guidelines` are stored as given, in SVG coordinates.
pub fn fit_layout(
    pairs: &[LayoutAnchorPair],
    guidelines: Vec<Vec<Point2<f64>>>,
) -> Result<LayoutFit, LayoutFitError> {
    if pairs.len() < 3 {
        return Err(LayoutFitError::TooFew { got: pairs.len() });
    }
    if let Some(index) = pairs.iter().position(|p| {
        !(p.svg.x.is_finite() && p.svg.y.is_finite() && p.sat.x.is_finite() && p.sat.y.is_finite())
    }) {
        return Err(LayoutFitError::NonFinite { index });
    }
    let svg: Vec<_> = pairs.iter().map(|p| p.svg).collect();
    let sat: Vec<_> = pairs.iter().map(|p| p.sat).collect();
    for (side, pts) in [("svg", &svg), ("sat", &sat)] {
        if spread_ratio(pts) < COLLINEARITY_TOLERANCE {
            return Err(LayoutFitError::Collinear { side });
        }
    }

    // centre the SVG side so the normal equations stay well conditioned
    let n = pairs.len() as f64;
    let c = svg.iter().fold(Vector2::<f64>::zeros(), |acc, p| acc + p.coords) / n;
    let mut xtx = Matrix3::<f64>::zeros();
    let mut xtu = Vector3::<f64>::zeros();
    let mut xtv = Vector3::<f64>::zeros();
    for (s, t) in svg.iter().zip(&sat) {
        let row = Vector3::new(s.x - c.x, s.y - c.y, 1.0);
        xtx += row * row.transpose();
        xtu += row * t.x;
        xtv += row * t.y;
    }
    let lu = xtx.lu();
    let row_u = lu.solve(&xtu).ok_or(LayoutFitError::Singular)?;
    let row_v = lu.solve(&xtv).ok_or(LayoutFitError::Singular)?;

    // undo the centring: t = L (s - c) + b  =>  translation b - L c
    let affine = AffineTransform::from_array([
        [row_u[0], row_u[1], row_u[2] - row_u[0] * c.x - row_u[1] * c.y],
        [row_v[0], row_v[1], row_v[2] - row_v[0] * c.x - row_v[1] * c.y],
    ]);
    if affine.validate().is_err() {
        return Err(LayoutFitError::Singular);
    }

    let residuals: Vec<f64> = svg
        .iter()
        .zip(&sat)
        .map(|(s, t)| (affine.apply(*s) - *t).norm())
        .collect();
    let rms = (residuals.iter().map(|r| r * r).sum::<f64>() / n).sqrt();
    log::info!("layout affine: {} pairs, rms {rms:.3} px", pairs.len());

    let ids = pairs
        .iter()
        .map(|p| AssociationPair {
            svg_id: p.svg_id.clone(),
            sat_id: p.sat_id.clone(),
        })
        .collect();
    Ok(LayoutFit {
        alignment: LayoutAlignment::new(affine)
            .with_pairs(ids)
            .with_guidelines(guidelines),
        residuals,
        rms,
    })
}
