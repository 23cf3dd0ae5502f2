//! # Artifact Model
//!
//! Files produced or consumed by pipeline stages.
//!
//! An artifact is created once by the step that produced it (the configuration artifact is
//! created when the simulation is set up) and never changes afterwards. Downstream stages
//! reference artifacts by id; the files themselves are never copied.
//!
//! ## Database Schema
//!
//! Maps to `artifacts` table:
//! ```sql
//! CREATE TABLE artifacts (
//!   artifact_id BIGSERIAL PRIMARY KEY,
//!   simulation_id BIGINT NOT NULL REFERENCES simulations ON DELETE CASCADE,
//!   step_id BIGINT NOT NULL REFERENCES steps ON DELETE CASCADE,
//!   created_at TIMESTAMPTZ NOT NULL,
//!   size_bytes BIGINT NOT NULL,
//!   path TEXT NOT NULL,
//!   name TEXT NOT NULL,
//!   file_type TEXT NOT NULL
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// File category of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    Json,
    Csv,
    Parquet,
    Png,
    Pdf,
    Log,
    /// Directory of files, e.g. a parquet dataset
    Directory,
    Unknown,
}

impl FileType {
    /// Infer the category from a path's extension
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if path.is_dir() {
            return Self::Directory;
        }

        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => Self::Json,
            Some("csv") => Self::Csv,
            Some("parquet") => Self::Parquet,
            Some("png") => Self::Png,
            Some("pdf") => Self::Pdf,
            Some("log") => Self::Log,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "JSON",
            Self::Csv => "CSV",
            Self::Parquet => "PARQUET",
            Self::Png => "PNG",
            Self::Pdf => "PDF",
            Self::Log => "LOG",
            Self::Directory => "DIRECTORY",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "JSON" => Ok(Self::Json),
            "CSV" => Ok(Self::Csv),
            "PARQUET" => Ok(Self::Parquet),
            "PNG" => Ok(Self::Png),
            "PDF" => Ok(Self::Pdf),
            "LOG" => Ok(Self::Log),
            "DIRECTORY" => Ok(Self::Directory),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Invalid file type: {s}")),
        }
    }
}

/// A persisted artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: i64,
    pub simulation_id: i64,
    pub step_id: i64,
    pub created_at: DateTime<Utc>,
    pub size_bytes: i64,
    pub path: String,
    pub name: String,
    pub file_type: FileType,
}

impl Artifact {
    /// Directory containing the artifact, i.e. the simulation workdir for top-level files
    pub fn workdir(&self) -> Option<PathBuf> {
        Path::new(&self.path).parent().map(Path::to_path_buf)
    }
}

/// An artifact that has been produced but not persisted yet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArtifact {
    pub simulation_id: i64,
    pub step_id: i64,
    pub created_at: DateTime<Utc>,
    pub size_bytes: i64,
    pub path: String,
    pub name: String,
    pub file_type: FileType,
}

impl NewArtifact {
    /// Describe a file on disk, reading its size from the filesystem.
    ///
    /// Missing files are recorded with size 0 so a remote backend's artifact list can be
    /// persisted even when the paths are not visible locally.
    pub fn from_file(
        simulation_id: i64,
        step_id: i64,
        path: impl AsRef<Path>,
        file_type: Option<FileType>,
    ) -> Self {
        let path = path.as_ref();
        let size_bytes = std::fs::metadata(path)
            .map(|meta| meta.len() as i64)
            .unwrap_or(0);
        let name = path
            .file_stem()
            .or_else(|| path.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            simulation_id,
            step_id,
            created_at: Utc::now(),
            size_bytes,
            path: path.to_string_lossy().into_owned(),
            name,
            file_type: file_type.unwrap_or_else(|| FileType::from_path(path)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Re-home the artifact onto another step of the same simulation
    pub fn for_step(mut self, simulation_id: i64, step_id: i64) -> Self {
        self.simulation_id = simulation_id;
        self.step_id = step_id;
        self
    }

    pub fn into_artifact(self, artifact_id: i64) -> Artifact {
        Artifact {
            artifact_id,
            simulation_id: self.simulation_id,
            step_id: self.step_id,
            created_at: self.created_at,
            size_bytes: self.size_bytes,
            path: self.path,
            name: self.name,
            file_type: self.file_type,
        }
    }
}
