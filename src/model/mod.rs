//! Model resolution
//!
//! Remote aircraft name their visual model by a short id plus the 16-bit
//! hash of the model's package name. The receiving side maps that pair back
//! to a locally available model. Lookup never mutates the registry.

use std::collections::HashMap;

use crate::protocol::{package_hash, FixedStr};

/// Width of the short id field on the wire
pub const SHORT_ID_LEN: usize = 20;

/// Identifies a model across instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub pkg_hash: u16,
    pub short_id: FixedStr<SHORT_ID_LEN>,
}

impl ModelKey {
    /// Build a key from the full package name
    pub fn new(package: &str, short_id: &str) -> Self {
        Self {
            pkg_hash: package_hash(package),
            short_id: FixedStr::new(short_id),
        }
    }

    pub fn from_hash(pkg_hash: u16, short_id: &str) -> Self {
        Self {
            pkg_hash,
            short_id: FixedStr::new(short_id),
        }
    }
}

/// How a model was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    /// Package hash and short id matched
    Exact,
    /// Only the short id matched
    ShortIdOnly,
}

/// Lookup from a remote model reference to a local model handle
pub trait ModelResolver {
    type Handle: Clone;

    /// Find a model, trying the exact pair first and the short id alone second
    fn resolve_match(&self, pkg_hash: u16, short_id: &str) -> Option<(Self::Handle, MatchKind)>;

    fn resolve(&self, pkg_hash: u16, short_id: &str) -> Option<Self::Handle> {
        self.resolve_match(pkg_hash, short_id).map(|(handle, _)| handle)
    }

    fn resolve_key(&self, key: &ModelKey) -> Option<Self::Handle> {
        self.resolve(key.pkg_hash, &key.short_id.as_str())
    }
}

#[derive(Debug, Clone)]
struct ShortIdEntry<H> {
    by_hash: HashMap<u16, H>,
    /// Fallback when no package hash matches
    first: H,
}

/// In-memory model registry
#[derive(Debug, Clone)]
pub struct ModelRegistry<H> {
    models: HashMap<String, ShortIdEntry<H>>,
    count: usize,
}

impl<H> Default for ModelRegistry<H> {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            count: 0,
        }
    }
}

impl<H: Clone> ModelRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model by its package name and short id
    pub fn register(&mut self, package: &str, short_id: &str, handle: H) {
        self.register_key(ModelKey::new(package, short_id), handle);
    }

    /// Register a model; the first model of a short id serves as fallback
    pub fn register_key(&mut self, key: ModelKey, handle: H) {
        let short_id = key.short_id.as_str().into_owned();
        match self.models.get_mut(&short_id) {
            Some(entry) => {
                if entry.by_hash.insert(key.pkg_hash, handle).is_none() {
                    self.count += 1;
                }
            }
            None => {
                let mut by_hash = HashMap::new();
                by_hash.insert(key.pkg_hash, handle.clone());
                self.models.insert(
                    short_id,
                    ShortIdEntry {
                        by_hash,
                        first: handle,
                    },
                );
                self.count += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl<H: Clone> ModelResolver for ModelRegistry<H> {
    type Handle = H;

    fn resolve_match(&self, pkg_hash: u16, short_id: &str) -> Option<(H, MatchKind)> {
        // registered short ids are cut to the wire width
        let key: FixedStr<SHORT_ID_LEN> = FixedStr::new(short_id);
        let short_id = key.as_str();
        let entry = self.models.get(&*short_id)?;
        match entry.by_hash.get(&pkg_hash) {
            Some(handle) => Some((handle.clone(), MatchKind::Exact)),
            None => Some((entry.first.clone(), MatchKind::ShortIdOnly)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match_preferred() {
        let mut registry = ModelRegistry::new();
        registry.register("Bluebell", "B738_DLH", "bluebell");
        registry.register("XCSL", "B738_DLH", "xcsl");
        assert_eq!(registry.len(), 2);

        let xcsl = package_hash("XCSL");
        assert_eq!(
            registry.resolve_match(xcsl, "B738_DLH"),
            Some(("xcsl", MatchKind::Exact))
        );
        assert_eq!(registry.resolve(package_hash("Bluebell"), "B738_DLH"), Some("bluebell"));
    }

    #[test]
    fn test_fallback_to_short_id() {
        let mut registry = ModelRegistry::new();
        registry.register("Bluebell", "B738_DLH", 7u32);

        assert_eq!(
            registry.resolve_match(0x1234, "B738_DLH"),
            Some((7, MatchKind::ShortIdOnly))
        );
        assert_eq!(registry.resolve(0x1234, "A320_DLH"), None);
    }

    #[test]
    fn test_first_registration_is_fallback() {
        let mut registry = ModelRegistry::new();
        registry.register("A", "C172", 1u32);
        registry.register("B", "C172", 2u32);
        // re-registering the same pair replaces without growing
        registry.register("B", "C172", 3u32);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve(0x1234, "C172"), Some(1));
        assert_eq!(registry.resolve(package_hash("B"), "C172"), Some(3));
    }

    #[test]
    fn test_long_short_id_matches_wire_width() {
        let mut registry = ModelRegistry::new();
        let long = "A_VERY_LONG_SHORT_ID_EXCEEDING_20";
        registry.register("Pkg", long, 1u8);

        // the receiver only ever sees the first 20 bytes
        let on_wire: FixedStr<SHORT_ID_LEN> = FixedStr::new(long);
        let key = ModelKey::from_hash(package_hash("Pkg"), &on_wire.as_str());
        assert_eq!(registry.resolve_key(&key), Some(1));
    }

    #[test]
    fn test_empty_registry() {
        let registry: ModelRegistry<u8> = ModelRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.resolve(0, ""), None);
    }
}
