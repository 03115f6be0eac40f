//! HCS compute system wrapper

use std::ffi::c_void;
use serde_json::Value;
use tracing::debug;
use windows::{
    core::{HSTRING, PCWSTR},
    Win32::System::HostComputeSystem::*,
};
use crate::transport::ComputeTransport;
use crate::{Error, Result};
use super::operation::Operation;

/// Wrapper around HCS_SYSTEM handle
pub struct ComputeSystem {
    handle: HCS_SYSTEM,
    id: String,
}

// HCS system handles may be used from any thread
unsafe impl Send for ComputeSystem {}
unsafe impl Sync for ComputeSystem {}

impl ComputeSystem {
    /// Create a compute system from a create document
    pub fn create(id: &str, document: &str) -> Result<Self> {
        unsafe {
            let id_hstring = HSTRING::from(id);
            let doc_hstring = HSTRING::from(document);
            let operation = Operation::new();

            let handle = HcsCreateComputeSystem(
                PCWSTR(id_hstring.as_ptr()),
                PCWSTR(doc_hstring.as_ptr()),
                operation.handle(),
                None,
            )?;

            // Dropping the new handle closes it if the operation failed
            let system = Self {
                handle,
                id: id.to_string(),
            };
            let result = operation.wait()?;
            if !result.is_empty() {
                debug!(id, result = %result, "create result");
            }
            Ok(system)
        }
    }

    /// Open an existing compute system by ID
    pub fn open(id: &str) -> Result<Self> {
        unsafe {
            let id_hstring = HSTRING::from(id);

            let handle = HcsOpenComputeSystem(
                PCWSTR(id_hstring.as_ptr()),
                0x10000000, // GENERIC_ALL
            )?;

            Ok(Self {
                handle,
                id: id.to_string(),
            })
        }
    }

    pub fn start(&self) -> Result<()> {
        unsafe {
            let operation = Operation::new();
            HcsStartComputeSystem(self.handle, operation.handle(), PCWSTR::null())?;
            operation.wait().map(|_| ())
        }
    }

    pub fn terminate(&self) -> Result<()> {
        unsafe {
            let operation = Operation::new();
            HcsTerminateComputeSystem(self.handle, operation.handle(), PCWSTR::null())?;
            operation.wait().map(|_| ())
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for ComputeSystem {
    fn drop(&mut self) {
        unsafe {
            HcsCloseComputeSystem(self.handle);
        }
    }
}

/// [`ComputeTransport`] issuing calls straight to HCS
#[derive(Debug, Default, Clone, Copy)]
pub struct HcsTransport;

impl ComputeTransport for HcsTransport {
    type System = ComputeSystem;

    fn create(&self, id: &str, document: &Value) -> Result<ComputeSystem> {
        ComputeSystem::create(id, &document.to_string())
    }

    fn start(&self, system: &ComputeSystem) -> Result<()> {
        system.start()
    }

    fn terminate(&self, system: &ComputeSystem) -> Result<()> {
        system.terminate()
    }
}

/// Enumerate all compute systems
pub fn enumerate_compute_systems(query: Option<&str>) -> Result<Vec<ComputeSystemInfo>> {
    unsafe {
        let query_str = query.unwrap_or(r#"{"Owners": null}"#);
        let query_hstring = HSTRING::from(query_str);
        let operation = Operation::new();

        HcsEnumerateComputeSystems(PCWSTR(query_hstring.as_ptr()), operation.handle())?;

        let result = operation.wait()?;
        if result.is_empty() || result == "[]" {
            return Ok(Vec::new());
        }

        serde_json::from_str(&result)
            .map_err(|e| Error::Hcs(format!("Failed to parse enumerate result: {}", e)))
    }
}

/// Get HCS service properties
pub fn get_service_properties() -> Result<ServiceProperties> {
    unsafe {
        let result = HcsGetServiceProperties(PCWSTR::null())?;
        let result_str = result.to_string().unwrap_or_default();
        windows::Win32::System::Com::CoTaskMemFree(Some(result.as_ptr() as *const c_void));

        serde_json::from_str(&result_str)
            .map_err(|e| Error::Hcs(format!("Failed to parse service properties: {}", e)))
    }
}

/// Information about a compute system from enumeration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ComputeSystemInfo {
    pub id: String,
    pub owner: Option<String>,
    pub state: Option<String>,
    pub system_type: Option<String>,
}

/// HCS Service properties
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceProperties {
    pub supported_schema_versions: Option<Vec<crate::schema::SchemaVersion>>,
}
