//! Agent configuration with builder pattern

use std::collections::HashMap;
use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::flush::FlushWindow;
use crate::options::RuntimeOptions;
use crate::resources::DEFAULT_UVM_MEMORY_OVERHEAD_MB;
use crate::schema::SchemaVersion;

pub const DEFAULT_OWNER: &str = "hcs-runtime";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Owner recorded on compute systems when a request names none
    pub owner: String,
    /// Schema version for requests that carry none. Host default when unset.
    pub schema_version: Option<SchemaVersion>,
    /// Builds on which the boot flush optimization is applied
    pub flush_window: FlushWindow,
    pub uvm_memory_overhead_mb: u64,
    /// Runtime options applied under every request's own options
    pub default_options: HashMap<String, String>,
    pub max_containers: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            owner: DEFAULT_OWNER.to_string(),
            schema_version: None,
            flush_window: FlushWindow::default(),
            uvm_memory_overhead_mb: DEFAULT_UVM_MEMORY_OVERHEAD_MB,
            default_options: HashMap::new(),
            max_containers: 64,
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let config: AgentConfig = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.owner.is_empty() {
            return Err(crate::Error::Config("owner cannot be empty".into()));
        }
        if self.flush_window.min_build >= self.flush_window.max_build {
            return Err(crate::Error::Config(format!(
                "flush window [{}, {}) is empty",
                self.flush_window.min_build, self.flush_window.max_build
            )));
        }
        if self.max_containers < 1 {
            return Err(crate::Error::Config("max_containers must be at least 1".into()));
        }
        if let Some(version) = self.schema_version {
            version
                .check_supported()
                .map_err(|e| crate::Error::Config(e.to_string()))?;
        }
        Ok(())
    }

    pub fn default_options(&self) -> RuntimeOptions {
        RuntimeOptions::from(self.default_options.clone())
    }
}

#[derive(Default)]
pub struct AgentConfigBuilder {
    config: AgentConfig,
}

impl AgentConfigBuilder {
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.config.owner = owner.into();
        self
    }

    pub fn schema_version(mut self, version: SchemaVersion) -> Self {
        self.config.schema_version = Some(version);
        self
    }

    pub fn flush_window(mut self, min_build: u32, max_build: u32) -> Self {
        self.config.flush_window = FlushWindow { min_build, max_build };
        self
    }

    pub fn uvm_memory_overhead_mb(mut self, mb: u64) -> Self {
        self.config.uvm_memory_overhead_mb = mb;
        self
    }

    pub fn default_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_options.insert(key.into(), value.into());
        self
    }

    pub fn max_containers(mut self, max: usize) -> Self {
        self.config.max_containers = max;
        self
    }

    pub fn build(self) -> AgentConfig {
        self.config
    }

    pub fn build_validated(self) -> crate::Result<AgentConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
