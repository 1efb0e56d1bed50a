//! One artifact file per location, replaced atomically on save.

use crate::artifact::GProjection;
use crate::assemble::is_valid_location_code;
use crate::schema::{from_json, to_json, SchemaError};
use gproj_core::ErrorClass;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("location code {code:?} cannot name an artifact file")]
    InvalidLocationCode { code: String },
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("artifact {} is unusable: {source}", path.display())]
    Schema {
        path: PathBuf,
        #[source]
        source: SchemaError,
    },
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidLocationCode { .. } | Self::Io { .. } => ErrorClass::InputValidation,
            Self::Schema { .. } => ErrorClass::SchemaCompatibility,
        }
    }
}

/// Directory of per-location artifacts:
/// `<root>/<code>/G_projection_<code>.json`.
#[derive(Clone, Debug)]
pub struct ProjectionStore {
    root: PathBuf,
}

impl ProjectionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, location_code: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_location_code(location_code) {
            return Err(StoreError::InvalidLocationCode {
                code: location_code.to_string(),
            });
        }
        Ok(self
            .root
            .join(location_code)
            .join(format!("G_projection_{location_code}.json")))
    }

    /// Write the artifact, replacing any previous one for the location.
    ///
    /// The file is written to a temporary sibling and renamed into place, so
    /// readers see either the old or the new artifact.
    pub fn save(&self, g: &GProjection) -> Result<PathBuf, StoreError> {
        let path = self.artifact_path(g.location_code())?;
        let json = to_json(g).map_err(|source| StoreError::Schema {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, json.as_bytes())?;
        log::info!("saved G projection for {} to {}", g.location_code(), path.display());
        Ok(path)
    }

    /// Load the artifact of a location; `Ok(None)` when none was saved.
    pub fn load(&self, location_code: &str) -> Result<Option<GProjection>, StoreError> {
        let path = self.artifact_path(location_code)?;
        if !path.exists() {
            log::debug!("no G projection at {}", path.display());
            return Ok(None);
        }
        load_path(&path).map(Some)
    }
}

/// Read and decode an artifact file from any location.
pub fn load_path(path: &Path) -> Result<GProjection, StoreError> {
    let bytes = fs::read(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    from_json(&bytes).map_err(|source| StoreError::Schema {
        path: path.to_path_buf(),
        source,
    })
}

/// Replace `path` with `bytes` through a temporary file in the same
/// directory.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
    let dir = dir.unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(io_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
