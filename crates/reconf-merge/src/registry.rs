//! File format registry
//!
//! Provides [`FormatRegistry`], which decides how each template file is
//! parsed when the template does not say so explicitly.

use std::collections::HashMap;

use reconf_artifact::FileFormat;

/// Maps file extensions to formats
#[derive(Debug, Default, Clone)]
pub struct FormatRegistry {
    extensions: HashMap<String, FileFormat>,
}

impl FormatRegistry {
    /// Create new empty registry (everything resolves to raw)
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            extensions: HashMap::new(),
        }
    }

    /// Create registry with built-in extensions
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for ext in ["properties", "cnf", "ini", "conf", "cfg"] {
            registry.register(ext, FileFormat::Properties);
        }
        registry.register("json", FileFormat::Json);
        registry.register("yaml", FileFormat::Yaml);
        registry.register("yml", FileFormat::Yaml);
        registry
    }

    /// Register an extension (without the dot, case-insensitive)
    pub fn register(&mut self, extension: &str, format: FileFormat) {
        self.extensions
            .insert(extension.to_ascii_lowercase(), format);
    }

    /// Check if extension is known
    #[inline]
    #[must_use]
    pub fn contains(&self, extension: &str) -> bool {
        self.extensions.contains_key(&extension.to_ascii_lowercase())
    }

    /// Number of registered extensions
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Check if registry is empty
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Format of `file_name`
    ///
    /// # Selection Logic
    /// - explicit `declared` format wins
    /// - otherwise the registered format of the extension
    /// - otherwise raw
    #[must_use]
    pub fn resolve(&self, file_name: &str, declared: Option<FileFormat>) -> FileFormat {
        declared.unwrap_or_else(|| {
            file_name
                .rsplit_once('.')
                .and_then(|(_, ext)| self.extensions.get(&ext.to_ascii_lowercase()))
                .copied()
                .unwrap_or(FileFormat::Raw)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_common_extensions() {
        let registry = FormatRegistry::with_defaults();
        assert_eq!(registry.resolve("my.cnf", None), FileFormat::Properties);
        assert_eq!(registry.resolve("app.YAML", None), FileFormat::Yaml);
        assert_eq!(registry.resolve("start.sh", None), FileFormat::Raw);
        assert_eq!(registry.resolve("noext", None), FileFormat::Raw);
    }

    #[test]
    fn declared_format_wins() {
        let registry = FormatRegistry::with_defaults();
        assert_eq!(
            registry.resolve("my.cnf", Some(FileFormat::Raw)),
            FileFormat::Raw
        );
    }

    #[test]
    fn custom_extension() {
        let mut registry = FormatRegistry::new();
        assert!(registry.is_empty());
        registry.register("TOML", FileFormat::Properties);
        assert!(registry.contains("toml"));
        assert_eq!(registry.resolve("a.toml", None), FileFormat::Properties);
    }
}
