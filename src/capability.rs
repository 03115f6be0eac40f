//! Host capability queries
//!
//! Routing and the boot flush optimization depend on what the host can do.
//! These answers come from a read-only provider handed to the router rather than
//! from process globals, so they are safe to share across concurrent requests.

use serde::{Deserialize, Serialize};
use crate::schema::SchemaVersion;

#[cfg_attr(test, mockall::automock)]
pub trait CapabilityProvider: Send + Sync {
    /// Whether the host compute service accepts v2 schema documents
    fn supports_v2_schema(&self) -> bool;

    /// Host OS build number
    fn os_build(&self) -> u32;

    /// Logical processors available to the host
    fn logical_cpu_count(&self) -> usize;
}

/// A fixed snapshot of host capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub supports_v2_schema: bool,
    pub os_build: u32,
    pub logical_cpus: usize,
}

impl HostCapabilities {
    pub fn new(supports_v2_schema: bool, os_build: u32, logical_cpus: usize) -> Self {
        Self {
            supports_v2_schema,
            os_build,
            logical_cpus,
        }
    }

    /// Schema version a request defaults to on this host
    pub fn default_schema_version(&self) -> SchemaVersion {
        if self.supports_v2_schema {
            SchemaVersion::default_for_build(self.os_build)
        } else {
            SchemaVersion::V10
        }
    }

    /// Query the running host
    #[cfg(windows)]
    pub fn detect() -> crate::Result<Self> {
        let os_build = detect_os_build()?;
        let properties = crate::hcs::compute::get_service_properties()?;
        let supports_v2_schema = properties
            .supported_schema_versions
            .unwrap_or_default()
            .iter()
            .any(|v| v.major >= 2);

        tracing::debug!(os_build, supports_v2_schema, "detected host capabilities");

        Ok(Self {
            supports_v2_schema,
            os_build,
            logical_cpus: logical_cpus(),
        })
    }

    /// Query the running host. Non-Windows hosts have no compute service.
    #[cfg(not(windows))]
    pub fn detect() -> crate::Result<Self> {
        Ok(Self {
            supports_v2_schema: false,
            os_build: 0,
            logical_cpus: logical_cpus(),
        })
    }
}

impl CapabilityProvider for HostCapabilities {
    fn supports_v2_schema(&self) -> bool {
        self.supports_v2_schema
    }

    fn os_build(&self) -> u32 {
        self.os_build
    }

    fn logical_cpu_count(&self) -> usize {
        self.logical_cpus
    }
}

impl<T: CapabilityProvider + ?Sized> CapabilityProvider for std::sync::Arc<T> {
    fn supports_v2_schema(&self) -> bool {
        (**self).supports_v2_schema()
    }

    fn os_build(&self) -> u32 {
        (**self).os_build()
    }

    fn logical_cpu_count(&self) -> usize {
        (**self).logical_cpu_count()
    }
}

fn logical_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// `GetVersionEx` lies to unmanifested processes, so ask ntdll directly
#[cfg(windows)]
fn detect_os_build() -> crate::Result<u32> {
    use windows::Wdk::System::SystemServices::RtlGetVersion;
    use windows::Win32::System::SystemInformation::OSVERSIONINFOW;

    let mut info = OSVERSIONINFOW {
        dwOSVersionInfoSize: std::mem::size_of::<OSVERSIONINFOW>() as u32,
        ..Default::default()
    };
    let status = unsafe { RtlGetVersion(&mut info) };
    if status.is_err() {
        return Err(crate::Error::Hcs(format!(
            "RtlGetVersion failed: NTSTATUS 0x{:08X}",
            status.0
        )));
    }
    Ok(info.dwBuildNumber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schema_version() {
        assert_eq!(
            HostCapabilities::new(true, 17763, 4).default_schema_version(),
            SchemaVersion::V21
        );
        assert_eq!(
            HostCapabilities::new(true, 17134, 4).default_schema_version(),
            SchemaVersion::V10
        );
        assert_eq!(
            HostCapabilities::new(false, 19041, 4).default_schema_version(),
            SchemaVersion::V10
        );
    }

    #[cfg(not(windows))]
    #[test]
    fn test_detect_reports_processors() {
        let caps = HostCapabilities::detect().unwrap();
        assert!(caps.logical_cpu_count() >= 1);
    }

    #[test]
    fn test_provider_through_arc() {
        let caps = std::sync::Arc::new(HostCapabilities::new(true, 18362, 8));
        assert!(caps.supports_v2_schema());
        assert_eq!(CapabilityProvider::os_build(&caps), 18362);
        assert_eq!(caps.logical_cpu_count(), 8);
    }
}
