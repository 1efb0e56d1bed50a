use crate::homography_fit::HomographyError;
use crate::layout_fit::LayoutFitError;
use crate::parallax::ParallaxError;
use gproj_core::{ErrorClass, GeometryError};
use gproj_projection::{AssembleError, StoreError};
use serde::{Deserialize, Serialize};

/// Calibration stages in execution order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Lens,
    Undistort,
    Homography,
    Parallax,
    Layout,
    Roi,
    Assemble,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::Lens,
        Stage::Undistort,
        Stage::Homography,
        Stage::Parallax,
        Stage::Layout,
        Stage::Roi,
        Stage::Assemble,
    ];

    /// The stage whose output this one consumes.
    pub fn prerequisite(self) -> Option<Stage> {
        match self {
            Stage::Lens => None,
            Stage::Undistort => Some(Stage::Lens),
            Stage::Homography => Some(Stage::Undistort),
            Stage::Parallax => Some(Stage::Homography),
            Stage::Layout | Stage::Roi | Stage::Assemble => Some(Stage::Parallax),
        }
    }

    /// Whether re-running `self` invalidates `other`.
    pub fn invalidates(self, other: Stage) -> bool {
        match self {
            // optional stages only feed the artifact
            Stage::Layout | Stage::Roi => other == Stage::Assemble,
            _ => other > self,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Lens => "lens",
            Stage::Undistort => "undistort",
            Stage::Homography => "homography",
            Stage::Parallax => "parallax",
            Stage::Layout => "layout",
            Stage::Roi => "roi",
            Stage::Assemble => "assemble",
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("{stage} stage needs the {missing} stage first")]
    StageOrder { stage: Stage, missing: Stage },
    #[error("{stage} stage: {source}")]
    Geometry {
        stage: Stage,
        #[source]
        source: GeometryError,
    },
    #[error("homography stage: {0}")]
    Homography(#[from] HomographyError),
    #[error("parallax stage: {0}")]
    Parallax(#[from] ParallaxError),
    #[error("layout stage: {0}")]
    Layout(#[from] LayoutFitError),
    #[error("assemble stage: {0}")]
    Assemble(#[from] AssembleError),
    #[error("saving artifact: {0}")]
    Store(#[from] StoreError),
}

impl SessionError {
    /// The stage that failed or was refused.
    pub fn stage(&self) -> Stage {
        match self {
            Self::StageOrder { stage, .. } | Self::Geometry { stage, .. } => *stage,
            Self::Homography(_) => Stage::Homography,
            Self::Parallax(_) => Stage::Parallax,
            Self::Layout(_) => Stage::Layout,
            Self::Assemble(_) | Self::Store(_) => Stage::Assemble,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::StageOrder { .. } => ErrorClass::InputValidation,
            Self::Geometry { source, .. } => source.class(),
            Self::Homography(e) => e.class(),
            Self::Parallax(e) => e.class(),
            Self::Layout(e) => e.class(),
            Self::Assemble(e) => e.class(),
            Self::Store(e) => e.class(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_stages_only_invalidate_the_artifact() {
        assert!(Stage::Homography.invalidates(Stage::Roi));
        assert!(!Stage::Homography.invalidates(Stage::Undistort));
        assert!(!Stage::Layout.invalidates(Stage::Roi));
        assert!(Stage::Roi.invalidates(Stage::Assemble));
        assert_eq!(Stage::Roi.prerequisite(), Some(Stage::Parallax));
    }
}
