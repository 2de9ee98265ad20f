//! Item registry
//!
//! Owns the configuration items of one component, keyed by name. The map is
//! sharded ([`DashMap`]) so lookups for different items never contend; a
//! monotonic sequence number keeps [`ItemRegistry::list`] insertion-ordered.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use reconf_artifact::ItemName;
use reconf_merge::TemplateRef;

use crate::error::ReconfError;
use crate::types::ConfigurationItem;

/// Result of an upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New item
    Inserted,
    /// Mutable fields changed
    Updated,
    /// Nothing changed
    Unchanged,
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    item: ConfigurationItem,
}

/// Named configuration items of one component
#[derive(Debug, Default)]
pub struct ItemRegistry {
    items: DashMap<ItemName, Slot>,
    next_seq: AtomicU64,
}

impl ItemRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new item or update the mutable fields of an existing one
    ///
    /// Mutable fields are the override template, parameter overrides,
    /// trigger marker and failure policy. A differing `template_ref` on an
    /// existing item is ignored. Returns the stored item.
    pub fn upsert(&self, item: ConfigurationItem) -> (UpsertOutcome, ConfigurationItem) {
        match self.items.entry(item.name.clone()) {
            Entry::Vacant(vacant) => {
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                vacant.insert(Slot {
                    seq,
                    item: item.clone(),
                });
                (UpsertOutcome::Inserted, item)
            }
            Entry::Occupied(mut occupied) => {
                let stored = &mut occupied.get_mut().item;
                if stored.template_ref != item.template_ref {
                    tracing::warn!(
                        item = %item.name,
                        current = %stored.template_ref,
                        requested = %item.template_ref,
                        "ignoring change of immutable templateRef"
                    );
                }
                let mut merged = stored.clone();
                merged.override_template_ref = item.override_template_ref;
                merged.file_parameter_overrides = item.file_parameter_overrides;
                merged.trigger_marker = item.trigger_marker;
                merged.failure_policy = item.failure_policy;
                if merged == *stored {
                    (UpsertOutcome::Unchanged, merged)
                } else {
                    stored.clone_from(&merged);
                    (UpsertOutcome::Updated, merged)
                }
            }
        }
    }

    /// Update an existing item by name
    ///
    /// # Errors
    /// - [`ReconfError::ImmutableField`] if `item.name != name`
    /// - [`ReconfError::NotFound`] if no item is called `name`
    pub fn update(
        &self,
        name: &str,
        item: ConfigurationItem,
    ) -> Result<(UpsertOutcome, ConfigurationItem), ReconfError> {
        if item.name.as_str() != name {
            return Err(ReconfError::ImmutableField {
                field: "name",
                current: name.to_string(),
                requested: item.name.to_string(),
            });
        }
        if !self.items.contains_key(name) {
            return Err(ReconfError::NotFound(name.to_string()));
        }
        Ok(self.upsert(item))
    }

    /// Remove an item
    ///
    /// # Errors
    /// Returns [`ReconfError::NotFound`] if absent
    pub fn remove(&self, name: &str) -> Result<ConfigurationItem, ReconfError> {
        self.items
            .remove(name)
            .map(|(_, slot)| slot.item)
            .ok_or_else(|| ReconfError::NotFound(name.to_string()))
    }

    /// Look up an item
    ///
    /// # Errors
    /// Returns [`ReconfError::NotFound`] if absent
    pub fn get(&self, name: &str) -> Result<ConfigurationItem, ReconfError> {
        self.items
            .get(name)
            .map(|slot| slot.item.clone())
            .ok_or_else(|| ReconfError::NotFound(name.to_string()))
    }

    /// Check if an item exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    /// All items in insertion order
    #[must_use]
    pub fn list(&self) -> Vec<ConfigurationItem> {
        let mut slots: Vec<(u64, ConfigurationItem)> = self
            .items
            .iter()
            .map(|entry| (entry.seq, entry.item.clone()))
            .collect();
        slots.sort_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, item)| item).collect()
    }

    /// Names of items whose effective template is `template`
    #[must_use]
    pub fn referencing(&self, template: &TemplateRef) -> Vec<ItemName> {
        self.list()
            .into_iter()
            .filter(|item| item.effective_template() == template)
            .map(|item| item.name)
            .collect()
    }

    /// Number of items
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if there are no items
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use reconf_artifact::ConfigParams;

    fn item(name: &str) -> ConfigurationItem {
        ConfigurationItem::new(name, "base").unwrap()
    }

    #[test]
    fn upsert_then_get() {
        let registry = ItemRegistry::new();
        let (outcome, _) = registry.upsert(item("a"));
        assert_eq!(outcome, UpsertOutcome::Inserted);
        assert_eq!(registry.get("a").unwrap(), item("a"));
    }

    #[test]
    fn upsert_updates_only_mutable_fields() {
        let registry = ItemRegistry::new();
        registry.upsert(item("a"));

        let mut changed = item("a").with_marker("2");
        changed.template_ref = TemplateRef::new("other");
        let (outcome, stored) = registry.upsert(changed);
        assert_eq!(outcome, UpsertOutcome::Updated);
        assert_eq!(stored.template_ref.as_str(), "base");
        assert_eq!(stored.trigger_marker.as_deref(), Some("2"));

        let (outcome, _) = registry.upsert(item("a").with_marker("2"));
        assert_eq!(outcome, UpsertOutcome::Unchanged);
    }

    #[test]
    fn update_rejects_rename() {
        let registry = ItemRegistry::new();
        registry.upsert(item("a"));
        let err = registry.update("a", item("b")).unwrap_err();
        assert!(matches!(err, ReconfError::ImmutableField { field: "name", .. }));
    }

    #[test]
    fn update_and_remove_missing() {
        let registry = ItemRegistry::new();
        assert!(matches!(
            registry.update("x", item("x")),
            Err(ReconfError::NotFound(_))
        ));
        assert!(matches!(registry.remove("x"), Err(ReconfError::NotFound(_))));
        assert!(matches!(registry.get("x"), Err(ReconfError::NotFound(_))));
    }

    #[test]
    fn list_is_insertion_ordered() {
        let registry = ItemRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.upsert(item(name));
        }
        registry.upsert(item("alpha").with_marker("x"));
        let names: Vec<_> = registry.list().into_iter().map(|i| i.name.into_inner()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn referencing_uses_effective_template() {
        let registry = ItemRegistry::new();
        registry.upsert(item("a"));
        registry.upsert(item("b").with_override_template("custom"));
        assert_eq!(registry.referencing(&TemplateRef::new("base")).len(), 1);
        assert_eq!(
            registry.referencing(&TemplateRef::new("custom"))[0].as_str(),
            "b"
        );
    }

    proptest! {
        #[test]
        fn upsert_get_roundtrip(
            name in "[a-z0-9]([a-z0-9.-]{0,20}[a-z0-9])?",
            value in "[a-z0-9]{1,8}",
        ) {
            let registry = ItemRegistry::new();
            let item = ConfigurationItem::new(&name, "t")
                .unwrap()
                .with_params("f.conf", ConfigParams::new().set("k", value));
            registry.upsert(item.clone());
            prop_assert_eq!(registry.get(&name).unwrap(), item.clone());

            let renamed = ConfigurationItem::new(&format!("{name}-x"), "t").unwrap();
            let is_immutable = matches!(
                registry.update(&name, renamed),
                Err(ReconfError::ImmutableField { .. })
            );
            prop_assert!(is_immutable);
        }
    }
}
