//! Reconf Artifact System
//!
//! Content-addressed configuration artifacts: the values that flow through
//! a merge and rollout cycle.
//!
//! # Core Concepts
//!
//! - [`Revision`]: 32-byte Blake3 digest naming one merged state of an item
//! - [`ItemName`]: validated key of a configuration item
//! - [`ConfigParams`]: user overrides for one file (content and/or key edits)
//! - [`ConfigDocument`]: format-aware file model that key edits apply to
//! - [`ConstraintSet`]: template-declared rules checked after merge
//! - [`RenderedConfig`]: sealed file set carrying its revision
//!
//! # Example
//!
//! ```rust,ignore
//! use reconf_artifact::{ConfigDocument, ConfigParams, FileFormat};
//!
//! let mut doc = ConfigDocument::parse(FileFormat::Properties, "max_connections=50\n")?;
//! for op in ConfigParams::new().set("max_connections", "100").ops() {
//!     doc.apply(op)?;
//! }
//! assert_eq!(doc.render()?, "max_connections=100\n");
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod constraint;
mod document;
mod name;
mod params;
mod rendered;
mod revision;

pub use constraint::{
    ConstraintError, ConstraintSet, ParamConstraint, ParamReload, ParamType, Violation,
};
pub use document::{ConfigDocument, DocumentError, FileFormat, PropertiesDoc};
pub use name::{ItemName, NameError, MAX_NAME_LEN};
pub use params::{ConfigParams, ParamError, ParamOp};
pub use rendered::{ArtifactError, FileChange, RenderedConfig, RenderedFile};
pub use revision::{Revision, RevisionError, RevisionHasher};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
