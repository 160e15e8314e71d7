// crates/workshop-rescue/src/path.rs
// ============================================================================
// Module: Volume Paths
// Description: Structural validation of remote snapshot paths.
// Purpose: Reject malformed snapshot locations before any network call.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! A remote snapshot lives at `/Volumes/<catalog>/<schema>/<volume>/<file>`.
//! [`VolumePath::parse`] enforces that shape: the root marker, at least five
//! segments, and no empty or relative segments. Validation is purely
//! structural and never touches the network.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// First segment of every volume path.
pub const VOLUME_ROOT: &str = "Volumes";
/// Minimum segments: root, catalog, schema, volume, file.
pub const MIN_SEGMENTS: usize = 5;
/// File name appended to a base volume directory.
pub const DEFAULT_SNAPSHOT_FILE: &str = "workshop.db";
/// Suffix of the write-ahead-log sidecar.
pub const WAL_SUFFIX: &str = "-wal";
/// Maximum total path length in bytes.
pub const MAX_PATH_LENGTH: usize = 4_096;
/// Maximum segment length in bytes.
pub const MAX_SEGMENT_LENGTH: usize = 255;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Structural path failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Path is empty or whitespace.
    #[error("remote snapshot path is empty")]
    Empty,
    /// Path does not start with `/Volumes/`.
    #[error("remote snapshot path must start with /{VOLUME_ROOT}/: {0}")]
    MissingRoot(String),
    /// Too few segments.
    #[error("remote snapshot path needs at least {required} segments, found {found}")]
    TooFewSegments {
        /// Segments present.
        found: usize,
        /// Segments required.
        required: usize,
    },
    /// A segment is empty, relative, or contains a control character.
    #[error("remote snapshot path has an invalid segment: '{0}'")]
    InvalidSegment(String),
    /// Path or segment exceeds its length limit.
    #[error("remote snapshot path exceeds length limit ({actual} > {max})")]
    TooLong {
        /// Limit in bytes.
        max: usize,
        /// Observed length in bytes.
        actual: usize,
    },
}

// ============================================================================
// SECTION: Volume Path
// ============================================================================

/// A validated remote snapshot path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumePath {
    /// Normalized path text, always starting with `/Volumes/`.
    raw: String,
}

impl VolumePath {
    /// Parses and validates a remote path.
    ///
    /// # Errors
    ///
    /// Returns [`PathError`] describing the first structural violation.
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(PathError::Empty);
        }
        if trimmed.len() > MAX_PATH_LENGTH {
            return Err(PathError::TooLong {
                max: MAX_PATH_LENGTH,
                actual: trimmed.len(),
            });
        }
        let Some(rest) = trimmed.strip_prefix('/') else {
            return Err(PathError::MissingRoot(trimmed.to_string()));
        };
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.first().copied() != Some(VOLUME_ROOT) {
            return Err(PathError::MissingRoot(trimmed.to_string()));
        }
        for segment in &segments {
            if segment.len() > MAX_SEGMENT_LENGTH {
                return Err(PathError::TooLong {
                    max: MAX_SEGMENT_LENGTH,
                    actual: segment.len(),
                });
            }
            if segment.is_empty()
                || *segment == "."
                || *segment == ".."
                || segment.chars().any(char::is_control)
            {
                return Err(PathError::InvalidSegment((*segment).to_string()));
            }
        }
        if segments.len() < MIN_SEGMENTS {
            return Err(PathError::TooFewSegments {
                found: segments.len(),
                required: MIN_SEGMENTS,
            });
        }
        Ok(Self {
            raw: trimmed.to_string(),
        })
    }

    /// Returns the path text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Returns the segments, root marker first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.raw.trim_start_matches('/').split('/')
    }

    /// Returns the final segment.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.raw.rsplit('/').next().unwrap_or(&self.raw)
    }

    /// Returns the path of the write-ahead-log sidecar.
    #[must_use]
    pub fn wal_path(&self) -> Self {
        Self {
            raw: format!("{}{WAL_SUFFIX}", self.raw),
        }
    }
}

impl fmt::Display for VolumePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Describes why `path` is not a valid remote snapshot path.
///
/// Returns `None` for valid paths and a non-empty description otherwise.
#[must_use]
pub fn validate_path(path: &str) -> Option<String> {
    VolumePath::parse(path).err().map(|err| err.to_string())
}

/// Resolves the remote snapshot path from its direct and base forms.
///
/// A non-blank `direct` path wins. Otherwise a non-blank `base` directory
/// gets [`DEFAULT_SNAPSHOT_FILE`] appended. The result is not validated.
#[must_use]
pub fn resolve_remote_path(direct: Option<&str>, base: Option<&str>) -> Option<String> {
    if let Some(direct) = direct.map(str::trim).filter(|value| !value.is_empty()) {
        return Some(direct.to_string());
    }
    base.map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|base| format!("{}/{DEFAULT_SNAPSHOT_FILE}", base.trim_end_matches('/')))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
