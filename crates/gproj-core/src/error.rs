use serde::{Deserialize, Serialize};

/// Coarse classification shared by every error in the workspace.
///
/// Callers use it to decide between "ask the user for new input" and
/// "the inputs describe a degenerate geometry".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Malformed, insufficient or out-of-range input.
    InputValidation,
    /// Singular matrices, collinear or coincident points, non-finite results.
    NumericDegeneracy,
    /// Unreadable artifact or unsupported schema version.
    SchemaCompatibility,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InputValidation => "input validation",
            Self::NumericDegeneracy => "numeric degeneracy",
            Self::SchemaCompatibility => "schema compatibility",
        };
        f.write_str(name)
    }
}

/// Validation failures of the geometric primitives in this crate.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("invalid intrinsics: {reason}")]
    InvalidIntrinsics { reason: String },
    #[error("distortion coefficient {name}={value} outside plausible range ±{limit}")]
    CoefficientOutOfRange {
        name: &'static str,
        value: f64,
        limit: f64,
    },
    #[error("{what} is not finite")]
    NonFinite { what: &'static str },
    #[error("{what} is singular (conditioning {conditioning:.3e})")]
    SingularMatrix {
        what: &'static str,
        conditioning: f64,
    },
    #[error("polygon needs at least 3 vertices, got {vertices}")]
    InvalidPolygon { vertices: usize },
    #[error("degenerate camera pose: {reason}")]
    DegeneratePose { reason: String },
}

impl GeometryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidIntrinsics { .. }
            | Self::CoefficientOutOfRange { .. }
            | Self::InvalidPolygon { .. } => ErrorClass::InputValidation,
            Self::NonFinite { .. } | Self::SingularMatrix { .. } | Self::DegeneratePose { .. } => {
                ErrorClass::NumericDegeneracy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failed_check() {
        let err = GeometryError::CoefficientOutOfRange {
            name: "k1",
            value: 3.0,
            limit: 1.2,
        };
        let msg = err.to_string();
        assert!(msg.contains("k1"));
        assert!(msg.contains("1.2"));
        assert_eq!(err.class(), ErrorClass::InputValidation);
    }

    #[test]
    fn singular_matrix_is_a_degeneracy() {
        let err = GeometryError::SingularMatrix {
            what: "homography",
            conditioning: 0.0,
        };
        assert_eq!(err.class(), ErrorClass::NumericDegeneracy);
        assert_eq!(ErrorClass::NumericDegeneracy.to_string(), "numeric degeneracy");
    }
}
