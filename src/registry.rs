//! Process-wide plugin unit registry.
//!
//! Units are keyed by normalized (lowercased) name and live for the process
//! lifetime. The registry is an explicit owned object handed to every
//! pipeline component; there is no ambient static state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::unit::{LoadState, PluginUnit};

/// Shared handle to one mutable plugin unit.
///
/// Lock discipline: hold the mutex only for short synchronous sections and
/// never across an await point.
pub type UnitHandle = Arc<Mutex<PluginUnit>>;

/// Registry of every plugin unit the pipeline has seen.
pub struct UnitRegistry {
    units: RwLock<HashMap<String, UnitHandle>>,
}

impl UnitRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { units: RwLock::new(HashMap::new()) }
    }

    fn normalize(name: &str) -> String {
        name.to_ascii_lowercase()
    }

    /// Look up a unit by name.
    pub fn get(&self, name: &str) -> Option<UnitHandle> {
        self.units.read().get(&Self::normalize(name)).cloned()
    }

    /// Look up a unit, creating it on first reference.
    pub fn get_or_create(&self, name: &str, source_path: PathBuf) -> UnitHandle {
        let key = Self::normalize(name);
        if let Some(existing) = self.units.read().get(&key) {
            return existing.clone();
        }

        let mut units = self.units.write();
        units
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(PluginUnit::new(name, source_path))))
            .clone()
    }

    /// Names of all known units, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.units.read().values().map(|u| u.lock().name.clone()).collect();
        names.sort();
        names
    }

    /// All unit handles.
    pub fn handles(&self) -> Vec<UnitHandle> {
        self.units.read().values().cloned().collect()
    }

    /// Units whose declared requirements include `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<UnitHandle> {
        self.units
            .read()
            .values()
            .filter(|u| {
                let unit = u.lock();
                unit.requires.iter().any(|r| r.eq_ignore_ascii_case(name))
            })
            .cloned()
            .collect()
    }

    /// Point-in-time status rows for listing commands.
    pub fn status(&self) -> Vec<UnitStatus> {
        let mut rows: Vec<UnitStatus> = self
            .units
            .read()
            .values()
            .map(|u| {
                let unit = u.lock();
                UnitStatus {
                    name: unit.name.clone(),
                    state: unit.state,
                    digest: unit.binary.as_ref().map(|b| b.digest.clone()),
                    last_error: unit.last_error.clone(),
                    last_compiled: unit.last_compiled,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Number of known units.
    pub fn len(&self) -> usize {
        self.units.read().len()
    }

    /// Whether the registry holds no units.
    pub fn is_empty(&self) -> bool {
        self.units.read().is_empty()
    }
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of one unit's externally visible status.
#[derive(Debug, Clone)]
pub struct UnitStatus {
    /// Plugin name
    pub name: String,
    /// Load state at snapshot time
    pub state: LoadState,
    /// Digest of the active binary, if any
    pub digest: Option<String>,
    /// Last failure diagnostic, if any
    pub last_error: Option<String>,
    /// When the unit last compiled successfully
    pub last_compiled: Option<std::time::SystemTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_normalizes_names() {
        let registry = UnitRegistry::new();
        let a = registry.get_or_create("Shop", PathBuf::from("plugins/Shop.plg"));
        let b = registry.get_or_create("shop", PathBuf::from("plugins/shop.plg"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        // Original casing is preserved on the unit itself
        assert_eq!(a.lock().name, "Shop");
    }

    #[test]
    fn test_dependents_of() {
        let registry = UnitRegistry::new();
        let shop = registry.get_or_create("Shop", PathBuf::from("plugins/Shop.plg"));
        shop.lock().requires.insert("Core".to_string());
        registry.get_or_create("Core", PathBuf::from("plugins/Core.plg"));

        let dependents = registry.dependents_of("core");
        assert_eq!(dependents.len(), 1);
        assert_eq!(dependents[0].lock().name, "Shop");
    }

    #[test]
    fn test_status_sorted() {
        let registry = UnitRegistry::new();
        registry.get_or_create("Zeta", PathBuf::from("plugins/Zeta.plg"));
        registry.get_or_create("Alpha", PathBuf::from("plugins/Alpha.plg"));

        let rows = registry.status();
        assert_eq!(rows[0].name, "Alpha");
        assert_eq!(rows[1].name, "Zeta");
    }
}
