//! Sealed output of a merge
//!
//! A [`RenderedConfig`] is the final file set of an item plus the trigger
//! marker it was rendered for. Its [`Revision`] is computed on construction
//! and can be re-verified at any time.

use std::collections::{BTreeMap, BTreeSet};

use crate::constraint::ConstraintError;
use crate::document::{ConfigDocument, DocumentError, FileFormat};
use crate::name::NameError;
use crate::params::ParamError;
use crate::revision::{Revision, RevisionError, RevisionHasher};

/// One rendered file
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RenderedFile {
    /// Syntax the file was merged as
    pub format: FileFormat,
    /// Final text
    pub content: String,
}

impl RenderedFile {
    /// Create a rendered file
    #[must_use]
    pub fn new(format: FileFormat, content: impl Into<String>) -> Self {
        Self {
            format,
            content: content.into(),
        }
    }
}

/// Difference of one file between two rendered sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// Keys added, edited or removed
    Keys {
        /// File name
        file: String,
        /// Changed keys, sorted
        keys: Vec<String>,
    },
    /// File added, removed, reformatted or without addressable keys
    Whole {
        /// File name
        file: String,
    },
}

impl FileChange {
    /// Name of the changed file
    #[must_use]
    pub fn file(&self) -> &str {
        match self {
            Self::Keys { file, .. } | Self::Whole { file } => file,
        }
    }
}

/// Merged file set with its content-derived revision
///
/// # Invariants
/// - `revision` is the digest of `files` (in name order) and `marker`
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RenderedConfig {
    files: BTreeMap<String, RenderedFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    marker: Option<String>,
    revision: Revision,
}

impl RenderedConfig {
    /// Seal a file set, computing its revision
    #[must_use]
    pub fn seal(files: BTreeMap<String, RenderedFile>, marker: Option<String>) -> Self {
        let revision = Self::digest(&files, marker.as_deref());
        Self {
            files,
            marker,
            revision,
        }
    }

    fn digest(files: &BTreeMap<String, RenderedFile>, marker: Option<&str>) -> Revision {
        let mut hasher = RevisionHasher::new();
        for (name, file) in files {
            hasher.file(name, &file.content);
        }
        hasher.marker(marker).finish()
    }

    /// Revision of this file set
    #[inline]
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Trigger marker the set was rendered for
    #[inline]
    #[must_use]
    pub fn marker(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    /// All files, by name
    #[inline]
    #[must_use]
    pub fn files(&self) -> &BTreeMap<String, RenderedFile> {
        &self.files
    }

    /// Content of one file
    #[must_use]
    pub fn content(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(|f| f.content.as_str())
    }

    /// Number of files
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True if there are no files
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files that differ from `previous`, in name order
    ///
    /// Edits that touch no key (comments, spacing) are not reported.
    #[must_use]
    pub fn diff(&self, previous: &Self) -> Vec<FileChange> {
        let names: BTreeSet<&String> = self.files.keys().chain(previous.files.keys()).collect();
        names
            .into_iter()
            .filter_map(|name| {
                let whole = || Some(FileChange::Whole { file: name.clone() });
                match (previous.files.get(name), self.files.get(name)) {
                    (Some(old), Some(new)) if old == new => None,
                    (Some(old), Some(new)) if old.format == new.format => {
                        match changed_keys(new.format, &old.content, &new.content) {
                            Some(keys) if keys.is_empty() => None,
                            Some(keys) => Some(FileChange::Keys {
                                file: name.clone(),
                                keys,
                            }),
                            None => whole(),
                        }
                    }
                    _ => whole(),
                }
            })
            .collect()
    }

    /// Recompute and compare the revision
    #[must_use]
    pub fn verify(&self) -> bool {
        Self::digest(&self.files, self.marker.as_deref()) == self.revision
    }

    /// Like [`verify`](Self::verify) but returns the mismatch
    ///
    /// # Errors
    /// Returns [`ArtifactError::RevisionMismatch`] if the content was
    /// altered after sealing (e.g. a tampered deserialized payload)
    pub fn ensure_intact(&self) -> Result<(), ArtifactError> {
        let actual = Self::digest(&self.files, self.marker.as_deref());
        if actual == self.revision {
            Ok(())
        } else {
            Err(ArtifactError::RevisionMismatch {
                expected: self.revision,
                actual,
            })
        }
    }
}

/// Keys whose value differs; `None` when either side has no keys to compare
fn changed_keys(format: FileFormat, old: &str, new: &str) -> Option<Vec<String>> {
    if format == FileFormat::Raw {
        return None;
    }
    let old = ConfigDocument::parse(format, old).ok()?;
    let new = ConfigDocument::parse(format, new).ok()?;
    let keys: BTreeSet<String> = old.keys().into_iter().chain(new.keys()).collect();
    Some(keys.into_iter().filter(|k| old.get(k) != new.get(k)).collect())
}

/// Errors of this crate, unified
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    /// Sealed revision does not match content
    #[error("revision mismatch: expected {expected}, got {actual}")]
    RevisionMismatch { expected: Revision, actual: Revision },

    /// Revision error
    #[error(transparent)]
    Revision(#[from] RevisionError),

    /// Name error
    #[error(transparent)]
    Name(#[from] NameError),

    /// Parameter error
    #[error(transparent)]
    Param(#[from] ParamError),

    /// Document error
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Constraint error
    #[error(transparent)]
    Constraint(#[from] ConstraintError),
}
