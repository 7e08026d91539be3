//! Committed stage outputs.
//!
//! An artifact is the all-or-nothing product of one stage: a location on
//! disk plus the size and unit count the next stage (and metering) need.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// What an artifact contains. Each stage consumes exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Raw stereo-camera capture file.
    Capture,
    /// Extracted stereo frame pairs.
    Frames,
    /// Per-frame segmentation masks.
    Masks,
    /// Reconstructed 3D geometry.
    Reconstruction,
    /// Tracked object trajectories.
    Tracks,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ArtifactKind::Capture => "capture",
            ArtifactKind::Frames => "frames",
            ArtifactKind::Masks => "masks",
            ArtifactKind::Reconstruction => "reconstruction",
            ArtifactKind::Tracks => "tracks",
        };
        f.write_str(label)
    }
}

/// A committed artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Content kind.
    pub kind: ArtifactKind,
    /// File or directory holding the artifact.
    pub location: PathBuf,
    /// Bytes on disk.
    pub size_bytes: u64,
    /// Units of work contained (frames, usually), when known.
    #[serde(default)]
    pub units: Option<u64>,
}

impl Artifact {
    /// Creates an artifact with unknown size and unit count.
    pub fn new(kind: ArtifactKind, location: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            location: location.into(),
            size_bytes: 0,
            units: None,
        }
    }

    /// Creates an artifact whose size is measured from disk.
    pub fn from_path(kind: ArtifactKind, location: impl Into<PathBuf>) -> std::io::Result<Self> {
        let location = location.into();
        let size_bytes = directory_size(&location)?;
        Ok(Self {
            kind,
            location,
            size_bytes,
            units: None,
        })
    }

    /// Sets the size in bytes.
    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Sets the number of work units (frames) the artifact holds.
    pub fn with_units(mut self, units: u64) -> Self {
        self.units = Some(units);
        self
    }
}

/// Total size of every regular file under `path`.
///
/// A plain file yields its own length. Symlinks are not followed.
pub fn directory_size(path: &Path) -> std::io::Result<u64> {
    let mut total: u64 = 0;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_file() {
            total = total.saturating_add(entry.metadata().map_err(std::io::Error::other)?.len());
        }
    }
    Ok(total)
}
