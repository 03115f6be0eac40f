//! Runtime options carried on a creation request
//!
//! Keys are matched case-insensitively. The table is normalized once when it is
//! built so lookups never depend on map iteration order.

use std::collections::HashMap;

/// Force calls into a particular schema. `{"Major":2,"Minor":1}` or `2.1`.
pub const HCS_SCHEMA_VERSION: &str = "hcs.schema.version";
/// Additional JSON merged into v1 create documents
pub const HCS_ADDITIONAL_JSON_V1: &str = "hcs.additional.v1.json";
/// Additional JSON merged into v2 create documents
pub const HCS_ADDITIONAL_JSON_V2: &str = "hcs.additional.v2.json";
/// Presence marks the request as creating a utility VM rather than a container
pub const HCS_SPEC_DEFINES_UTILITY_VM: &str = "hcs.spec.defines.utility.vm";
/// MiB added to a WCOW utility VM when sizing it. Defaults to 256.
pub const HCS_WCOW_V2_UVM_MEMORY_OVERHEAD: &str = "hcs.wcow.v2.uvm.additional.memory";

/// Folder holding the LCOW kernel and initrd
pub const LCOW_KIRD_PATH: &str = "lcow.kirdpath";
/// Kernel file name under the kird path
pub const LCOW_KERNEL_FILE: &str = "lcow.kernel";
/// Initrd file name under the kird path
pub const LCOW_INITRD_FILE: &str = "lcow.initrd";
/// Extra kernel boot parameters
pub const LCOW_BOOT_PARAMETERS: &str = "lcow.bootparameters";
/// Presence selects a shared, global utility VM
pub const LCOW_GLOBAL_MODE: &str = "lcow.globalmode";
/// Sandbox size for LCOW containers
pub const LCOW_SANDBOX_SIZE: &str = "lcow.sandboxsize";
/// Seconds to wait for utility VM operations
pub const LCOW_TIMEOUT: &str = "lcow.timeout";

/// Case-insensitive key/value table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    values: HashMap<String, String>,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, replacing any entry whose key differs only in case
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl Into<String>) {
        self.values
            .insert(key.as_ref().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(&key.to_ascii_lowercase())
    }

    /// Parse a numeric option, reporting the key on failure
    pub fn get_u64(&self, key: &str) -> crate::Result<Option<u64>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
                crate::Error::InvalidOption {
                    key: key.to_string(),
                    reason: format!("'{}' is not an unsigned integer", raw),
                }
            }),
        }
    }

    /// Fill in any keys not already present from `defaults`
    pub fn with_defaults(mut self, defaults: &RuntimeOptions) -> Self {
        for (k, v) in &defaults.values {
            self.values.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for RuntimeOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut options = RuntimeOptions::new();
        for (k, v) in iter {
            options.insert(k, v);
        }
        options
    }
}

/// Keys differing only in case resolve the same way on every run: entries
/// are applied in sorted key order, so the last in that order wins.
impl From<HashMap<String, String>> for RuntimeOptions {
    fn from(map: HashMap<String, String>) -> Self {
        let mut entries: Vec<_> = map.into_iter().collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().collect()
    }
}
