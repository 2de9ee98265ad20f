//! Format-aware configuration file model
//!
//! A [`ConfigDocument`] is a parsed config file that supports key edits
//! addressed by dotted keys:
//!
//! - `properties`: `key=value` lines; a `[section]` header prefixes the
//!   keys below it (`section.key`). Untouched lines render byte-for-byte.
//! - `json` / `yaml`: dotted keys walk nested objects, creating them on set.
//! - `raw`: opaque text, replaced only as a whole.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde_json::{Map, Value as JsonValue};

use crate::params::ParamOp;

/// Syntax of a config file
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// `key=value` lines with optional `[section]` headers
    Properties,
    /// JSON document
    Json,
    /// YAML document
    Yaml,
    /// Opaque text
    #[default]
    Raw,
}

impl FileFormat {
    /// Guess the format from a file name's extension
    #[must_use]
    pub fn from_file_name(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "properties" | "cnf" | "ini" | "conf" | "cfg" => Self::Properties,
            "json" => Self::Json,
            "yaml" | "yml" => Self::Yaml,
            _ => Self::Raw,
        }
    }

    /// Whether individual keys can be edited
    #[inline]
    #[must_use]
    pub const fn is_parameterizable(self) -> bool {
        !matches!(self, Self::Raw)
    }

    /// Lowercase name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Properties => "properties",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Raw => "raw",
        }
    }
}

impl Display for FileFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileFormat {
    type Err = DocumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "properties" | "ini" => Ok(Self::Properties),
            "json" => Ok(Self::Json),
            "yaml" | "yml" => Ok(Self::Yaml),
            "raw" | "text" => Ok(Self::Raw),
            other => Err(DocumentError::UnknownFormat(other.to_string())),
        }
    }
}

/// A parsed config file
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigDocument {
    /// Line-preserving properties file
    Properties(PropertiesDoc),
    /// JSON object tree
    Json(JsonValue),
    /// YAML tree, held as JSON values
    Yaml(JsonValue),
    /// Opaque text
    Raw(String),
}

impl ConfigDocument {
    /// Parse `text` as `format`
    ///
    /// Blank JSON/YAML input parses as an empty object.
    ///
    /// # Errors
    /// Returns error if the text is not valid for the format
    pub fn parse(format: FileFormat, text: &str) -> Result<Self, DocumentError> {
        match format {
            FileFormat::Properties => Ok(Self::Properties(PropertiesDoc::parse(text)?)),
            FileFormat::Json => {
                if text.trim().is_empty() {
                    return Ok(Self::Json(JsonValue::Object(Map::new())));
                }
                Ok(Self::Json(serde_json::from_str(text)?))
            }
            FileFormat::Yaml => {
                let value: JsonValue = serde_yaml::from_str(text)?;
                Ok(Self::Yaml(if value.is_null() {
                    JsonValue::Object(Map::new())
                } else {
                    value
                }))
            }
            FileFormat::Raw => Ok(Self::Raw(text.to_string())),
        }
    }

    /// Format of this document
    #[must_use]
    pub const fn format(&self) -> FileFormat {
        match self {
            Self::Properties(_) => FileFormat::Properties,
            Self::Json(_) => FileFormat::Json,
            Self::Yaml(_) => FileFormat::Yaml,
            Self::Raw(_) => FileFormat::Raw,
        }
    }

    /// Apply one key edit
    ///
    /// # Errors
    /// - [`DocumentError::NotParameterizable`] for raw files
    /// - [`DocumentError::PathConflict`] if a dotted key crosses a non-object
    pub fn apply(&mut self, op: ParamOp<'_>) -> Result<(), DocumentError> {
        match self {
            Self::Properties(doc) => {
                match op {
                    ParamOp::Set { key, value } => doc.set(key, value),
                    ParamOp::Remove { key } => doc.remove(key),
                }
                Ok(())
            }
            Self::Json(value) | Self::Yaml(value) => match op {
                ParamOp::Set { key, value: raw } => tree_set(value, key, parse_scalar(raw)),
                ParamOp::Remove { key } => {
                    tree_remove(value, key);
                    Ok(())
                }
            },
            Self::Raw(_) => Err(DocumentError::NotParameterizable {
                key: op.key().to_string(),
            }),
        }
    }

    /// Look up a key; non-string values render as compact JSON
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            Self::Properties(doc) => doc.get(key).map(str::to_string),
            Self::Json(value) | Self::Yaml(value) => tree_get(value, key).map(scalar_text),
            Self::Raw(_) => None,
        }
    }

    /// Every addressable key, in document order for properties and
    /// lexical order for trees
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::Properties(doc) => doc.keys(),
            Self::Json(value) | Self::Yaml(value) => {
                let mut out = Vec::new();
                collect_leaves(value, String::new(), &mut out);
                out
            }
            Self::Raw(_) => Vec::new(),
        }
    }

    /// Render back to text
    ///
    /// # Errors
    /// Returns error if the tree cannot be serialized
    pub fn render(&self) -> Result<String, DocumentError> {
        match self {
            Self::Properties(doc) => Ok(doc.render()),
            Self::Json(value) => {
                let mut out = serde_json::to_string_pretty(value)?;
                out.push('\n');
                Ok(out)
            }
            Self::Yaml(value) => Ok(serde_yaml::to_string(value)?),
            Self::Raw(text) => Ok(text.clone()),
        }
    }
}

/// Parse an override value as a JSON scalar if it is one, else keep it as
/// a string (`"100"` becomes `100`, `"on"` stays `"on"`)
fn parse_scalar(raw: &str) -> JsonValue {
    serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()))
}

fn scalar_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn tree_get<'a>(root: &'a JsonValue, key: &str) -> Option<&'a JsonValue> {
    key.split('.')
        .try_fold(root, |node, seg| node.as_object()?.get(seg))
}

fn tree_set(root: &mut JsonValue, key: &str, new_value: JsonValue) -> Result<(), DocumentError> {
    let mut segments: Vec<&str> = key.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return Ok(());
    };
    let mut node = root;
    for seg in segments {
        let map = node
            .as_object_mut()
            .ok_or_else(|| DocumentError::PathConflict {
                key: key.to_string(),
                segment: seg.to_string(),
            })?;
        node = map
            .entry(seg.to_string())
            .or_insert_with(|| JsonValue::Object(Map::new()));
    }
    let map = node
        .as_object_mut()
        .ok_or_else(|| DocumentError::PathConflict {
            key: key.to_string(),
            segment: leaf.to_string(),
        })?;
    map.insert(leaf.to_string(), new_value);
    Ok(())
}

fn tree_remove(root: &mut JsonValue, key: &str) {
    let (parent, leaf) = match key.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, key),
    };
    let node = match parent {
        Some(parent) => parent
            .split('.')
            .try_fold(root, |node, seg| node.as_object_mut()?.get_mut(seg)),
        None => Some(root),
    };
    if let Some(map) = node.and_then(JsonValue::as_object_mut) {
        map.remove(leaf);
    }
}

fn collect_leaves(value: &JsonValue, prefix: String, out: &mut Vec<String>) {
    match value {
        JsonValue::Object(map) if !map.is_empty() => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{prefix}.{k}")
                };
                collect_leaves(v, path, out);
            }
        }
        _ if !prefix.is_empty() => out.push(prefix),
        _ => {}
    }
}

/// Line-preserving properties file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PropertiesDoc {
    lines: Vec<PropLine>,
    trailing_newline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PropLine {
    /// `key=value`; `raw` holds the source text until the entry is edited
    Entry {
        section: Option<String>,
        key: String,
        value: String,
        raw: Option<String>,
    },
    Section(String),
    /// Comment, blank or unrecognized line
    Verbatim(String),
}

impl PropLine {
    fn full_key(&self) -> Option<String> {
        match self {
            Self::Entry {
                section: Some(s),
                key,
                ..
            } => Some(format!("{s}.{key}")),
            Self::Entry { key, .. } => Some(key.clone()),
            _ => None,
        }
    }
}

impl PropertiesDoc {
    /// Parse properties text
    ///
    /// # Errors
    /// Returns [`DocumentError::MalformedLine`] for an unterminated section header
    pub fn parse(text: &str) -> Result<Self, DocumentError> {
        let mut lines = Vec::new();
        let mut section: Option<String> = None;
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                lines.push(PropLine::Verbatim(line.to_string()));
            } else if let Some(rest) = trimmed.strip_prefix('[') {
                let name = rest
                    .strip_suffix(']')
                    .ok_or_else(|| DocumentError::MalformedLine {
                        line: idx + 1,
                        text: line.to_string(),
                    })?
                    .trim()
                    .to_string();
                section = Some(name.clone());
                lines.push(PropLine::Section(name));
            } else if let Some((key, value)) = trimmed.split_once('=') {
                lines.push(PropLine::Entry {
                    section: section.clone(),
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                    raw: Some(line.to_string()),
                });
            } else {
                lines.push(PropLine::Verbatim(line.to_string()));
            }
        }
        Ok(Self {
            lines,
            trailing_newline: text.ends_with('\n') || text.is_empty(),
        })
    }

    /// Value of a dotted key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = self.resolve(key)?;
        self.lines.iter().rev().find_map(|line| match line {
            PropLine::Entry { value, .. } if line.full_key().as_deref() == Some(key.as_str()) => {
                Some(value.as_str())
            }
            _ => None,
        })
    }

    /// Full key of an existing entry addressed by `key`
    ///
    /// A bare key that only exists inside sections resolves to its first
    /// sectioned occurrence.
    fn resolve(&self, key: &str) -> Option<String> {
        if self.lines.iter().any(|l| l.full_key().as_deref() == Some(key)) {
            return Some(key.to_string());
        }
        self.lines.iter().find_map(|line| match line {
            PropLine::Entry {
                section: Some(s),
                key: local,
                ..
            } if local == key => Some(format!("{s}.{key}")),
            _ => None,
        })
    }

    fn has_top_level_entries(&self) -> bool {
        self.lines
            .iter()
            .any(|l| matches!(l, PropLine::Entry { section: None, .. }))
    }

    fn first_section(&self) -> Option<String> {
        self.lines.iter().find_map(|line| match line {
            PropLine::Section(s) => Some(s.clone()),
            _ => None,
        })
    }

    /// All keys in document order
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.lines.iter().filter_map(PropLine::full_key).collect()
    }

    /// Replace in place, or insert into the matching section
    ///
    /// A key without a section prefix updates the section that already
    /// holds it. A new bare key joins the top-level block, or the first
    /// section when the file has no top-level entries.
    pub fn set(&mut self, key: &str, value: &str) {
        if let Some(full) = self.resolve(key) {
            for line in &mut self.lines {
                if line.full_key().as_deref() == Some(full.as_str()) {
                    if let PropLine::Entry { value: v, raw, .. } = line {
                        value.clone_into(v);
                        *raw = None;
                    }
                }
            }
            return;
        }

        let section = self
            .lines
            .iter()
            .filter_map(|line| match line {
                PropLine::Section(s) if key.starts_with(&format!("{s}.")) => Some(s.clone()),
                _ => None,
            })
            .max_by_key(String::len);
        let (section, local) = match section {
            Some(s) => {
                let local = key[s.len() + 1..].to_string();
                (Some(s), local)
            }
            None if !self.has_top_level_entries() => (self.first_section(), key.to_string()),
            None => (None, key.to_string()),
        };
        let at = self.section_end(section.as_ref());
        self.lines.insert(
            at,
            PropLine::Entry {
                section,
                key: local,
                value: value.to_string(),
                raw: None,
            },
        );
    }

    /// Remove every occurrence of a key
    pub fn remove(&mut self, key: &str) {
        let Some(full) = self.resolve(key) else {
            return;
        };
        self.lines
            .retain(|line| line.full_key().as_deref() != Some(full.as_str()));
    }

    /// Index just past the last entry of `section` (header line if empty)
    fn section_end(&self, section: Option<&String>) -> usize {
        let mut in_section = section.is_none();
        let mut end = None;
        for (idx, line) in self.lines.iter().enumerate() {
            match line {
                PropLine::Section(s) => {
                    if in_section && end.is_none() && section.is_none() {
                        return idx;
                    }
                    in_section = Some(s) == section;
                    if in_section {
                        end = Some(idx + 1);
                    } else if section.is_none() {
                        break;
                    }
                }
                PropLine::Entry { .. } if in_section => end = Some(idx + 1),
                _ => {}
            }
        }
        end.unwrap_or(self.lines.len())
    }

    /// Render to text
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (idx, line) in self.lines.iter().enumerate() {
            if idx > 0 {
                out.push('\n');
            }
            match line {
                PropLine::Entry {
                    raw: Some(raw), ..
                }
                | PropLine::Verbatim(raw) => out.push_str(raw),
                PropLine::Entry { key, value, .. } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(value);
                }
                PropLine::Section(s) => {
                    out.push('[');
                    out.push_str(s);
                    out.push(']');
                }
            }
        }
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }
}

/// Errors in config documents
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// Invalid JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// Invalid YAML
    #[error("invalid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    /// Bad properties line
    #[error("malformed line {line}: {text}")]
    MalformedLine { line: usize, text: String },

    /// Key edit on a raw file
    #[error("cannot set parameter '{key}' on a raw file (use content replacement)")]
    NotParameterizable { key: String },

    /// Dotted key crosses a non-object value
    #[error("key '{key}' conflicts with non-object value at '{segment}'")]
    PathConflict { key: String, segment: String },

    /// Unknown format name
    #[error("unknown file format '{0}'")]
    UnknownFormat(String),
}
