//! Configuration for hvport driver instances

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::lifecycle::ModuleKind;
use crate::{Error, Result};

/// Largest resource table a descriptor can index (16 index bits).
pub const MAX_RESOURCE_SLOTS_LIMIT: usize = 1 << 16;

/// Configuration applied to every session opened on a driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Resource slots per kind (VM and VCPU tables are sized separately)
    pub max_resource_slots: usize,
    /// Number of memory-map slots (`MAX_MEMMAP_SLOT`)
    pub max_memmap_slots: u32,
    /// Largest page count a single memory-map slot may pin
    pub max_map_pages: u32,
    /// Largest single `ReadGuest` / `WriteGuest` transfer in bytes
    pub max_transfer_size: u32,
    /// Lifecycle modules, initialised and released in this order
    pub modules: Vec<ModuleKind>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_resource_slots: 64,
            max_memmap_slots: 32,
            max_map_pages: 262_144,
            max_transfer_size: 1024 * 1024,
            modules: vec![ModuleKind::Smp, ModuleKind::Allocator, ModuleKind::File],
        }
    }
}

impl DriverConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of resource slots per kind
    pub fn max_resource_slots(mut self, slots: usize) -> Self {
        self.max_resource_slots = slots;
        self
    }

    /// Set the number of memory-map slots
    pub fn max_memmap_slots(mut self, slots: u32) -> Self {
        self.max_memmap_slots = slots;
        self
    }

    /// Set the per-slot page limit
    pub fn max_map_pages(mut self, pages: u32) -> Self {
        self.max_map_pages = pages;
        self
    }

    /// Set the guest transfer size limit
    pub fn max_transfer_size(mut self, bytes: u32) -> Self {
        self.max_transfer_size = bytes;
        self
    }

    /// Replace the lifecycle module order
    pub fn modules(mut self, modules: Vec<ModuleKind>) -> Self {
        self.modules = modules;
        self
    }

    /// Load a configuration from a YAML (`.yaml`/`.yml`) or JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        let config: DriverConfig = if is_yaml {
            serde_yaml::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid YAML config {}: {}", path.display(), e))
            })?
        } else {
            serde_json::from_str(&raw).map_err(|e| {
                Error::Config(format!("invalid JSON config {}: {}", path.display(), e))
            })?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_resource_slots == 0 {
            return Err(Error::Config("Must have at least 1 resource slot".into()));
        }
        if self.max_resource_slots > MAX_RESOURCE_SLOTS_LIMIT {
            return Err(Error::Config(format!(
                "At most {} resource slots supported",
                MAX_RESOURCE_SLOTS_LIMIT
            )));
        }

        if self.max_memmap_slots == 0 {
            return Err(Error::Config("Must have at least 1 memory-map slot".into()));
        }
        if self.max_map_pages == 0 {
            return Err(Error::Config("max_map_pages must be at least 1".into()));
        }
        if self.max_transfer_size == 0 {
            return Err(Error::Config("max_transfer_size must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for module in &self.modules {
            if !seen.insert(module) {
                return Err(Error::Config(format!("module {:?} listed twice", module)));
            }
        }

        Ok(())
    }
}
