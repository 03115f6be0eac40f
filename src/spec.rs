//! The subset of the OCI runtime specification consulted during creation
//!
//! Only the fields that drive routing, sizing and the boot flush optimization
//! are modeled. Everything else in `config.json` is ignored on load.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::resources::ResourceSpec;
use crate::Result;

/// File name of the writable sandbox disk inside the scratch layer folder
pub const SANDBOX_VHDX: &str = "sandbox.vhdx";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default)]
    pub oci_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub windows: Option<WindowsSpec>,
    /// Presence marks a Linux (LCOW) workload; the contents are opaque here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsSpec {
    /// Ordered `layerN, ..., layer1, scratch`. The last entry is writable.
    #[serde(default)]
    pub layer_folders: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<WindowsResources>,
    /// Presence selects Hyper-V isolation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hyperv: Option<HyperV>,
    #[serde(default)]
    pub ignore_flushes_during_boot: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuResources>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryResources {
    /// Bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuResources {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HyperV {
    #[serde(rename = "utilityVMPath", default, skip_serializing_if = "String::is_empty")]
    pub utility_vm_path: String,
}

impl Spec {
    /// Load a spec from an OCI bundle `config.json`
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Linux workload running under a foreign kernel
    pub fn is_lcow(&self) -> bool {
        self.linux.is_some()
    }

    pub fn is_hyperv(&self) -> bool {
        self.windows.as_ref().is_some_and(|w| w.hyperv.is_some())
    }

    pub fn ignore_flushes_during_boot(&self) -> bool {
        self.windows
            .as_ref()
            .is_some_and(|w| w.ignore_flushes_during_boot)
    }

    pub fn layer_folders(&self) -> &[String] {
        self.windows
            .as_ref()
            .map(|w| w.layer_folders.as_slice())
            .unwrap_or(&[])
    }

    /// The writable layer folder (last entry of the layer list)
    pub fn scratch_folder(&self) -> Option<&str> {
        self.layer_folders().last().map(String::as_str)
    }

    /// Read-only layers, top-most first
    pub fn read_only_layers(&self) -> &[String] {
        let layers = self.layer_folders();
        &layers[..layers.len().saturating_sub(1)]
    }

    /// Path of the sandbox disk in the scratch folder
    pub fn sandbox_vhdx(&self) -> Option<PathBuf> {
        self.scratch_folder()
            .map(|folder| Path::new(folder).join(SANDBOX_VHDX))
    }

    pub fn resource_spec(&self) -> ResourceSpec {
        let resources = self.windows.as_ref().and_then(|w| w.resources.as_ref());
        ResourceSpec {
            cpu_count: resources
                .and_then(|r| r.cpu.as_ref())
                .and_then(|c| c.count),
            memory_limit_bytes: resources
                .and_then(|r| r.memory.as_ref())
                .and_then(|m| m.limit),
        }
    }
}
