//! Versioned JSON layout of the G Projection artifact.
//!
//! Every past layout has its own record type and an explicit upgrade to the
//! next one, so defaults for missing data are decided per version rather than
//! per field. Writing always produces the current version.
//!
//! | version | adds |
//! |---|---|
//! | 1 (no `schema_version`) | `meta`, `undistort`, `homography`, `parallax` |
//! | 2 | optional `layout_svg {A, association_pairs}`, `ref_method`, `proj_method` |
//! | 3 | optional `roi`, `layout_svg.guidelines` |

use crate::artifact::{Anchor, GProjection, SCHEMA_VERSION};
use crate::assemble::{assemble, AssembleError, AssembleInput};
use crate::layout::{AssociationPair, LayoutAlignment};
use crate::policy::{
    DiscardStrategy, GroundLift, PlacementPolicy, ReferencePoint, RoiMatch, RoiPolicy,
};
use gproj_core::{
    AffineTransform, CameraPose, CoefficientLimits, DistortionCoefficients, ErrorClass,
    GeometryError, Homography, Intrinsics, Point2, Polygon, ScaleRecord,
};
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    #[error("artifact is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),
    #[error("artifact schema_version {found} is not supported (expected 1..={max})", max = SCHEMA_VERSION)]
    UnsupportedVersion { found: u64 },
    #[error("artifact schema_version is not an unsigned integer")]
    BadVersionField,
    #[error("artifact v{version} record is malformed: {source}")]
    Malformed {
        version: u32,
        #[source]
        source: serde_json::Error,
    },
    #[error("artifact intrinsics are invalid: {0}")]
    Intrinsics(#[source] GeometryError),
    #[error("artifact failed validation: {0}")]
    Invalid(#[from] AssembleError),
    #[error("failed to encode artifact: {0}")]
    Encode(#[source] serde_json::Error),
}

impl SchemaError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::SchemaCompatibility
    }
}

fn pt(p: [f64; 2]) -> Point2<f64> {
    Point2::new(p[0], p[1])
}

fn arr(p: Point2<f64>) -> [f64; 2] {
    [p.x, p.y]
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MetaRecord {
    location_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_unix_s: Option<u64>,
}

fn radial_tangential() -> String {
    "radial_tangential".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct UndistortRecord {
    #[serde(default)]
    resolution: Option<[u32; 2]>,
    #[serde(rename = "K")]
    k: [[f64; 3]; 3],
    #[serde(rename = "D")]
    d: [f64; 5],
    #[serde(default = "radial_tangential")]
    model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    coefficient_limits: Option<CoefficientLimits>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct AnchorRecord {
    id: usize,
    #[serde(default)]
    name: String,
    coords_cctv: [f64; 2],
    coords_sat: [f64; 2],
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct HomographyRecord {
    #[serde(rename = "H")]
    h: [[f64; 3]; 3],
    #[serde(default)]
    fov_polygon: Vec<[f64; 2]>,
    #[serde(default)]
    anchors_list: Vec<AnchorRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ScaleJson {
    measured_px: f64,
    real_m: f64,
    #[serde(default)]
    reference_anchors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallax_px_per_meter: Option<f64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ParallaxRecord {
    x_cam_coords_sat: f64,
    y_cam_coords_sat: f64,
    z_cam_meters: f64,
    px_per_meter: f64,
    #[serde(default)]
    scale: Option<ScaleJson>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LayoutRecordV2 {
    #[serde(rename = "A")]
    a: [[f64; 3]; 2],
    #[serde(default)]
    association_pairs: Vec<AssociationPair>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct LayoutRecordV3 {
    #[serde(rename = "A")]
    a: [[f64; 3]; 2],
    association_pairs: Vec<AssociationPair>,
    guidelines: Vec<Vec<[f64; 2]>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RoiRecord {
    discard: DiscardStrategy,
    #[serde(rename = "match")]
    matching: RoiMatch,
    #[serde(default)]
    polygon: Option<Vec<[f64; 2]>>,
}

#[derive(Clone, Debug, Deserialize)]
struct ArtifactV1 {
    meta: MetaRecord,
    undistort: UndistortRecord,
    homography: HomographyRecord,
    parallax: ParallaxRecord,
}

#[derive(Clone, Debug, Deserialize)]
struct ArtifactV2 {
    meta: MetaRecord,
    undistort: UndistortRecord,
    homography: HomographyRecord,
    parallax: ParallaxRecord,
    #[serde(default)]
    layout_svg: Option<LayoutRecordV2>,
    ref_method: ReferencePoint,
    proj_method: GroundLift,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ArtifactV3 {
    schema_version: u32,
    meta: MetaRecord,
    undistort: UndistortRecord,
    homography: HomographyRecord,
    parallax: ParallaxRecord,
    #[serde(default)]
    layout_svg: Option<LayoutRecordV3>,
    #[serde(default)]
    roi: Option<RoiRecord>,
    ref_method: ReferencePoint,
    proj_method: GroundLift,
}

impl From<ArtifactV1> for ArtifactV2 {
    fn from(v1: ArtifactV1) -> Self {
        Self {
            meta: v1.meta,
            undistort: v1.undistort,
            homography: v1.homography,
            parallax: v1.parallax,
            layout_svg: None,
            ref_method: PlacementPolicy::LEGACY.reference,
            proj_method: PlacementPolicy::LEGACY.lift,
        }
    }
}

impl From<ArtifactV2> for ArtifactV3 {
    fn from(v2: ArtifactV2) -> Self {
        Self {
            schema_version: 3,
            meta: v2.meta,
            undistort: v2.undistort,
            homography: v2.homography,
            parallax: v2.parallax,
            layout_svg: v2.layout_svg.map(|l| LayoutRecordV3 {
                a: l.a,
                association_pairs: l.association_pairs,
                guidelines: Vec::new(),
            }),
            roi: None,
            ref_method: v2.ref_method,
            proj_method: v2.proj_method,
        }
    }
}

impl From<&GProjection> for ArtifactV3 {
    fn from(g: &GProjection) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            meta: MetaRecord {
                location_code: g.location_code.clone(),
                created_unix_s: g.created_unix_s,
            },
            undistort: UndistortRecord {
                resolution: g.resolution,
                k: g.lens.intrinsics.to_array(),
                d: g.lens.distortion.to_array(),
                model: radial_tangential(),
                coefficient_limits: Some(g.coefficient_limits),
            },
            homography: HomographyRecord {
                h: g.homography.to_array(),
                fov_polygon: g.fov_polygon.iter().copied().map(arr).collect(),
                anchors_list: g
                    .anchors
                    .iter()
                    .map(|a| AnchorRecord {
                        id: a.id,
                        name: a.name.clone(),
                        coords_cctv: arr(a.cctv),
                        coords_sat: arr(a.sat),
                    })
                    .collect(),
            },
            parallax: ParallaxRecord {
                x_cam_coords_sat: g.pose.position_sat.x,
                y_cam_coords_sat: g.pose.position_sat.y,
                z_cam_meters: g.pose.height_m,
                px_per_meter: g.pose.px_per_meter,
                scale: g.scale.as_ref().map(|s| ScaleJson {
                    measured_px: s.measured_px,
                    real_m: s.real_m,
                    reference_anchors: s.reference_anchors.clone(),
                    parallax_px_per_meter: s.parallax_px_per_meter,
                }),
            },
            layout_svg: g.layout.as_ref().map(|l| LayoutRecordV3 {
                a: l.affine.to_array(),
                association_pairs: l.pairs.clone(),
                guidelines: l
                    .guidelines
                    .iter()
                    .map(|line| line.iter().copied().map(arr).collect())
                    .collect(),
            }),
            roi: g.roi.as_ref().map(|r| RoiRecord {
                discard: r.discard,
                matching: r.matching,
                polygon: r
                    .polygon
                    .as_ref()
                    .map(|p| p.vertices().iter().copied().map(arr).collect()),
            }),
            ref_method: g.placement.reference,
            proj_method: g.placement.lift,
        }
    }
}

impl ArtifactV3 {
    fn into_projection(self, fallback: &CoefficientLimits) -> Result<GProjection, SchemaError> {
        let limits = self.undistort.coefficient_limits.unwrap_or(*fallback);
        let intrinsics = Intrinsics::from_array(self.undistort.k).map_err(SchemaError::Intrinsics)?;
        let pose = CameraPose {
            position_sat: Point2::new(
                self.parallax.x_cam_coords_sat,
                self.parallax.y_cam_coords_sat,
            ),
            height_m: self.parallax.z_cam_meters,
            px_per_meter: self.parallax.px_per_meter,
        };
        let roi = match self.roi {
            Some(r) => {
                let polygon = r
                    .polygon
                    .map(|vs| Polygon::new(vs.into_iter().map(pt).collect()))
                    .transpose()
                    .map_err(|source| AssembleError::Invalid {
                        part: "roi",
                        source,
                    })?;
                Some(RoiPolicy::new(r.discard, r.matching, polygon))
            }
            None => None,
        };
        let input = AssembleInput {
            location_code: self.meta.location_code,
            created_unix_s: self.meta.created_unix_s,
            resolution: self.undistort.resolution,
            intrinsics,
            distortion: DistortionCoefficients::from_array(self.undistort.d),
            homography: Homography::from_array(self.homography.h),
            anchors: self
                .homography
                .anchors_list
                .into_iter()
                .map(|a| Anchor {
                    id: a.id,
                    name: a.name,
                    cctv: pt(a.coords_cctv),
                    sat: pt(a.coords_sat),
                })
                .collect(),
            fov_polygon: Some(self.homography.fov_polygon.into_iter().map(pt).collect()),
            pose,
            scale: self.parallax.scale.map(|s| ScaleRecord {
                measured_px: s.measured_px,
                real_m: s.real_m,
                reference_anchors: s.reference_anchors,
                parallax_px_per_meter: s.parallax_px_per_meter,
            }),
            layout: self.layout_svg.map(|l| {
                LayoutAlignment::new(AffineTransform::from_array(l.a))
                    .with_pairs(l.association_pairs)
                    .with_guidelines(
                        l.guidelines
                            .into_iter()
                            .map(|line| line.into_iter().map(pt).collect())
                            .collect(),
                    )
            }),
            roi,
            placement: PlacementPolicy {
                reference: self.ref_method,
                lift: self.proj_method,
            },
        };
        Ok(assemble(input, &limits)?)
    }
}

fn read_version(value: &serde_json::Value) -> Result<u32, SchemaError> {
    match value.get("schema_version") {
        None | Some(serde_json::Value::Null) => Ok(1),
        Some(v) => {
            let found = v.as_u64().ok_or(SchemaError::BadVersionField)?;
            match u32::try_from(found) {
                Ok(version) if (1..=SCHEMA_VERSION).contains(&version) => Ok(version),
                _ => Err(SchemaError::UnsupportedVersion { found }),
            }
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    value: serde_json::Value,
    version: u32,
) -> Result<T, SchemaError> {
    serde_json::from_value(value).map_err(|source| SchemaError::Malformed { version, source })
}

/// Encode as pretty JSON in the current schema version.
pub fn to_json(g: &GProjection) -> Result<String, SchemaError> {
    serde_json::to_string_pretty(&ArtifactV3::from(g)).map_err(SchemaError::Encode)
}

/// Decode any supported schema version.
///
/// Distortion is validated against the limits recorded in the artifact, or
/// the default limits when it records none.
pub fn from_json(bytes: &[u8]) -> Result<GProjection, SchemaError> {
    from_json_with_limits(bytes, &CoefficientLimits::default())
}

/// Like [`from_json`], with `limits` used for artifacts that record none.
pub fn from_json_with_limits(
    bytes: &[u8],
    limits: &CoefficientLimits,
) -> Result<GProjection, SchemaError> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(SchemaError::Json)?;
    let version = read_version(&value)?;
    let current: ArtifactV3 = match version {
        1 => ArtifactV2::from(parse::<ArtifactV1>(value, 1)?).into(),
        2 => parse::<ArtifactV2>(value, 2)?.into(),
        _ => parse::<ArtifactV3>(value, version)?,
    };
    log::debug!(
        "decoded G projection {} from schema v{}",
        current.meta.location_code,
        version
    );
    current.into_projection(limits)
}

/// Schema version recorded in an encoded artifact, without decoding it.
pub fn peek_version(bytes: &[u8]) -> Result<u32, SchemaError> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(SchemaError::Json)?;
    read_version(&value)
}

impl GProjection {
    pub fn to_json(&self) -> Result<String, SchemaError> {
        to_json(self)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, SchemaError> {
        from_json(bytes)
    }
}
