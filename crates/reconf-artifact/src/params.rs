//! User-supplied parameter overrides for one configuration file
//!
//! A [`ConfigParams`] either replaces a file wholesale (`content`), edits
//! individual keys (`parameters`), or both. Key edits are exposed as an
//! ordered stream of [`ParamOp`]s so that application order is the same
//! everywhere: content first, then parameters in lexical key order.

use std::collections::BTreeMap;

/// Overrides for one config file
///
/// # Invariants
/// - Parameter keys are non-empty (checked by [`ConfigParams::validate`])
/// - A `None` value means "delete this key"
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConfigParams {
    /// Replacement for the whole file, applied before any parameter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Key edits; `BTreeMap` keeps lexical order
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Option<String>>,
}

impl ConfigParams {
    /// Empty override set
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the file with `content`
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Set `key` to `value`
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), Some(value.into()));
        self
    }

    /// Delete `key`
    #[must_use]
    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), None);
        self
    }

    /// True when nothing would change
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.parameters.is_empty()
    }

    /// Key edits in application order
    pub fn ops(&self) -> impl Iterator<Item = ParamOp<'_>> {
        self.parameters.iter().map(|(key, value)| match value {
            Some(value) => ParamOp::Set { key, value },
            None => ParamOp::Remove { key },
        })
    }

    /// Drop every parameter for which `keep` returns false, returning the
    /// dropped keys
    pub fn retain_keys<F>(&mut self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&str) -> bool,
    {
        let mut dropped = Vec::new();
        self.parameters.retain(|key, _| {
            let keep = keep(key);
            if !keep {
                dropped.push(key.clone());
            }
            keep
        });
        dropped
    }

    /// Check structural validity
    ///
    /// # Errors
    /// Returns [`ParamError::EmptyKey`] if any parameter key is blank
    pub fn validate(&self) -> Result<(), ParamError> {
        if self.parameters.keys().any(|k| k.trim().is_empty()) {
            return Err(ParamError::EmptyKey);
        }
        Ok(())
    }
}

/// One key edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamOp<'a> {
    /// Set or insert
    Set {
        /// Dotted key
        key: &'a str,
        /// New value
        value: &'a str,
    },
    /// Remove; no-op when the key is absent
    Remove {
        /// Dotted key
        key: &'a str,
    },
}

impl ParamOp<'_> {
    /// Key this edit targets
    #[inline]
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } | Self::Remove { key } => key,
        }
    }
}

/// Errors in parameter overrides
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    /// Blank parameter key
    #[error("parameter key must not be empty")]
    EmptyKey,

    /// Override names a file the template does not have
    #[error("file '{0}' is not part of the template")]
    UnknownFile(String),
}
