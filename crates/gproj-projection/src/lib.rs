//! The G Projection artifact and everything that consumes it.
//!
//! A [`GProjection`] freezes one location's CCTV <-> SAT calibration: lens
//! model, ground-plane homography, camera pose and scale, plus optional
//! site-layout alignment and ROI filter. It is produced by [`assemble`],
//! persisted as versioned JSON ([`to_json`] / [`from_json`], [`ProjectionStore`])
//! and applied to detections with [`GProjection::forward`] and
//! [`GProjection::inverse`].
//!
//! ```no_run
//! use gproj_projection::{BBox2D, ObjectPrior, ProjectionStore};
//!
//! let store = ProjectionStore::new("location");
//! if let Some(g) = store.load("SHARK").expect("readable artifact") {
//!     let bbox = BBox2D::new(600.0, 300.0, 720.0, 380.0);
//!     if let Some(projected) = g.forward(&bbox, &ObjectPrior::default(), None).expect("forward") {
//!         println!("floor center {:?}", projected.floor.center);
//!     }
//! }
//! ```

mod apply;
mod artifact;
mod assemble;
mod layout;
mod policy;
mod schema;
mod store;

pub use apply::{
    forward, inverse, ApplyError, BBox2D, Box3D, Detection, FloorBox, GroundPoint, HeadingSource,
    ObjectPrior, ProjectedBox,
};
pub use artifact::{Anchor, GProjection, SCHEMA_VERSION};
pub use gproj_core::ScaleRecord;
pub use assemble::{assemble, is_valid_location_code, AssembleError, AssembleInput};
pub use layout::{normalize_degrees, AssociationPair, LayoutAlignment};
pub use policy::{
    DiscardStrategy, GroundLift, PlacementPolicy, ReferencePoint, RoiMatch, RoiPolicy,
};
pub use schema::{from_json, from_json_with_limits, peek_version, to_json, SchemaError};
pub use store::{load_path, write_atomic, ProjectionStore, StoreError};
