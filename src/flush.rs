//! Boot-time flush suppression on a container's sandbox disk
//!
//! While a process-isolated container boots for the first time, flushing on
//! its `sandbox.vhdx` is disabled. Once the container is running the disk goes
//! back to metadata caching. The two halves run at different lifecycle points:
//!
//! 1. [`BootFlushOptimizer::pre_start`] after the compute system is created,
//!    returning a [`CacheHandle`] that owns the open disk.
//! 2. [`BootFlushOptimizer::post_start`] after the compute system has started,
//!    consuming that handle.
//!
//! The disk closes when the handle is dropped, so every path (including the
//! caller abandoning the container between the two calls) closes it once.

use std::io;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use crate::capability::CapabilityProvider;
use crate::error::DiskStep;
use crate::spec::Spec;
use crate::{Error, Result};

/// `IOCTL_STORAGE_SET_SURFACE_CACHE_POLICY`
pub const IOCTL_SET_SURFACE_CACHE_POLICY: u32 = 0x002d_1a10;

/// Write cache policy of a virtual disk surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum WriteCacheMode {
    CacheMetadata = 0,
    WriteInternalMetadata = 1,
    WriteMetadata = 2,
    CommitAll = 3,
    DisableFlushing = 4,
}

/// Input buffer for [`IOCTL_SET_SURFACE_CACHE_POLICY`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SurfaceCachePolicyRequest {
    pub request_level: u32,
    pub cache_mode: u16,
    pad: u16,
}

const _: () = assert!(std::mem::size_of::<SurfaceCachePolicyRequest>() == 8);

impl SurfaceCachePolicyRequest {
    pub const SIZE: usize = std::mem::size_of::<SurfaceCachePolicyRequest>();

    pub fn new(mode: WriteCacheMode) -> Self {
        Self {
            request_level: 1,
            cache_mode: mode as u16,
            pad: 0,
        }
    }

    /// The request as the driver reads it
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&self.request_level.to_le_bytes());
        buf[4..6].copy_from_slice(&self.cache_mode.to_le_bytes());
        buf[6..].copy_from_slice(&self.pad.to_le_bytes());
        buf
    }
}

/// Access to the virtual disk driver
///
/// `Disk` is an open disk object. Dropping it must close the underlying handle.
pub trait VirtualDiskDriver: Send + Sync {
    type Disk: Send;

    /// Open with no access rights, caching parent-chain I/O and ignoring the
    /// relative parent locator
    fn open(&self, path: &Path) -> io::Result<Self::Disk>;

    /// Send the set-surface-cache-policy request
    fn set_write_cache_mode(&self, disk: &Self::Disk, mode: WriteCacheMode) -> io::Result<()>;
}

/// Build window in which the platform needs this optimization applied by the
/// caller. Older builds cannot use it; newer builds do it internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushWindow {
    /// Inclusive
    pub min_build: u32,
    /// Exclusive
    pub max_build: u32,
}

impl Default for FlushWindow {
    fn default() -> Self {
        Self {
            min_build: 17763,
            max_build: 18855,
        }
    }
}

impl FlushWindow {
    pub fn contains(&self, build: u32) -> bool {
        build >= self.min_build && build < self.max_build
    }
}

/// Ownership of the sandbox disk between `pre_start` and `post_start`
///
/// Not `Clone`: exactly one owner closes the disk, by dropping it.
#[derive(Debug)]
pub struct CacheHandle<T> {
    disk: Option<(T, PathBuf)>,
}

impl<T> CacheHandle<T> {
    /// No optimization in effect
    pub fn none() -> Self {
        Self { disk: None }
    }

    fn open(disk: T, path: PathBuf) -> Self {
        Self {
            disk: Some((disk, path)),
        }
    }

    pub fn is_none(&self) -> bool {
        self.disk.is_none()
    }

    /// Sandbox disk held open by this handle
    pub fn path(&self) -> Option<&Path> {
        self.disk.as_ref().map(|(_, p)| p.as_path())
    }
}

impl<T> Default for CacheHandle<T> {
    fn default() -> Self {
        Self::none()
    }
}

pub struct BootFlushOptimizer<D, C> {
    driver: D,
    capabilities: C,
    window: FlushWindow,
}

impl<D: VirtualDiskDriver, C: CapabilityProvider> BootFlushOptimizer<D, C> {
    pub fn new(driver: D, capabilities: C) -> Self {
        Self::with_window(driver, capabilities, FlushWindow::default())
    }

    pub fn with_window(driver: D, capabilities: C, window: FlushWindow) -> Self {
        Self {
            driver,
            capabilities,
            window,
        }
    }

    pub fn window(&self) -> FlushWindow {
        self.window
    }

    /// Whether either phase has anything to do for this spec
    pub fn is_applicable(&self, spec: &Spec) -> bool {
        if !self.capabilities.supports_v2_schema() {
            return false;
        }
        if !self.window.contains(self.capabilities.os_build()) {
            return false;
        }
        spec.ignore_flushes_during_boot() && !spec.is_lcow()
    }

    /// Disable flushing on the sandbox disk ahead of first boot
    ///
    /// Hyper-V isolated containers are skipped. On failure the disk is closed
    /// before the error is returned.
    pub fn pre_start(&self, spec: &Spec) -> Result<CacheHandle<D::Disk>> {
        if !self.is_applicable(spec) {
            debug!("boot flush optimization not applicable");
            return Ok(CacheHandle::none());
        }
        // The sandbox disk of a Hyper-V container is attached to its utility VM
        if spec.is_hyperv() {
            debug!("hyper-v isolated, leaving sandbox disk to the utility VM");
            return Ok(CacheHandle::none());
        }

        let path = spec.sandbox_vhdx().ok_or_else(|| Error::Disk {
            step: DiskStep::Open,
            path: PathBuf::from(crate::spec::SANDBOX_VHDX),
            source: io::Error::new(io::ErrorKind::InvalidInput, "spec has no layer folders"),
        })?;

        let disk = self.driver.open(&path).map_err(|source| Error::Disk {
            step: DiskStep::Open,
            path: path.clone(),
            source,
        })?;

        if let Err(source) = self
            .driver
            .set_write_cache_mode(&disk, WriteCacheMode::DisableFlushing)
        {
            drop(disk);
            return Err(Error::Disk {
                step: DiskStep::DisableFlushing,
                path,
                source,
            });
        }

        info!(path = %path.display(), "disabled flushing for boot");
        Ok(CacheHandle::open(disk, path))
    }

    /// Restore metadata caching and close the disk
    ///
    /// The disk is closed even when the driver rejects the request.
    pub fn post_start(&self, spec: &Spec, handle: CacheHandle<D::Disk>) -> Result<()> {
        let Some((disk, path)) = handle.disk else {
            return Ok(());
        };
        if !self.is_applicable(spec) {
            return Ok(());
        }

        let result = self
            .driver
            .set_write_cache_mode(&disk, WriteCacheMode::CacheMetadata);
        drop(disk);

        match result {
            Ok(()) => {
                info!(path = %path.display(), "restored metadata caching");
                Ok(())
            }
            Err(source) => {
                warn!(path = %path.display(), error = %source, "failed to restore metadata caching");
                Err(Error::Disk {
                    step: DiskStep::RestoreCaching,
                    path,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::MockCapabilityProvider;
    use crate::spec::WindowsSpec;

    /// Disk driver that only records requests
    struct RecordingDriver {
        modes: parking_lot::Mutex<Vec<WriteCacheMode>>,
    }

    impl VirtualDiskDriver for RecordingDriver {
        type Disk = PathBuf;

        fn open(&self, path: &Path) -> io::Result<PathBuf> {
            Ok(path.to_path_buf())
        }

        fn set_write_cache_mode(&self, _disk: &PathBuf, mode: WriteCacheMode) -> io::Result<()> {
            self.modes.lock().push(mode);
            Ok(())
        }
    }

    fn caps(v2: bool, build: u32) -> MockCapabilityProvider {
        let mut caps = MockCapabilityProvider::new();
        caps.expect_supports_v2_schema().return_const(v2);
        caps.expect_os_build().return_const(build);
        caps.expect_logical_cpu_count().return_const(4usize);
        caps
    }

    fn optimizer(v2: bool, build: u32) -> BootFlushOptimizer<RecordingDriver, MockCapabilityProvider> {
        BootFlushOptimizer::new(
            RecordingDriver { modes: parking_lot::Mutex::new(Vec::new()) },
            caps(v2, build),
        )
    }

    fn wcow_spec(ignore_flushes: bool) -> Spec {
        Spec {
            windows: Some(WindowsSpec {
                layer_folders: vec!["base".into(), "scratch".into()],
                ignore_flushes_during_boot: ignore_flushes,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_layout() {
        assert_eq!(SurfaceCachePolicyRequest::SIZE, 8);
        let bytes = SurfaceCachePolicyRequest::new(WriteCacheMode::DisableFlushing).to_bytes();
        assert_eq!(bytes, [1, 0, 0, 0, 4, 0, 0, 0]);
        let bytes = SurfaceCachePolicyRequest::new(WriteCacheMode::CacheMetadata).to_bytes();
        assert_eq!(bytes, [1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_window_bounds() {
        let window = FlushWindow::default();
        assert!(!window.contains(17762));
        assert!(window.contains(17763));
        assert!(window.contains(18854));
        assert!(!window.contains(18855));
    }

    #[test]
    fn test_applicable_only_when_all_conditions_hold() {
        assert!(optimizer(true, 17763).is_applicable(&wcow_spec(true)));
        assert!(!optimizer(false, 17763).is_applicable(&wcow_spec(true)));
        assert!(!optimizer(true, 17134).is_applicable(&wcow_spec(true)));
        assert!(!optimizer(true, 19041).is_applicable(&wcow_spec(true)));
        assert!(!optimizer(true, 17763).is_applicable(&wcow_spec(false)));

        let mut lcow = wcow_spec(true);
        lcow.linux = Some(serde_json::json!({}));
        assert!(!optimizer(true, 17763).is_applicable(&lcow));
        assert!(!optimizer(true, 17763).is_applicable(&Spec::default()));
    }

    #[test]
    fn test_configured_window() {
        let opt = BootFlushOptimizer::with_window(
            RecordingDriver { modes: parking_lot::Mutex::new(Vec::new()) },
            caps(true, 19041),
            FlushWindow { min_build: 17763, max_build: 20000 },
        );
        assert!(opt.is_applicable(&wcow_spec(true)));
    }

    #[test]
    fn test_phases_send_modes_in_order() {
        let opt = optimizer(true, 18362);
        let spec = wcow_spec(true);
        let handle = opt.pre_start(&spec).unwrap();
        assert_eq!(handle.path(), Some(Path::new("scratch").join("sandbox.vhdx").as_path()));
        opt.post_start(&spec, handle).unwrap();
        assert_eq!(
            *opt.driver.modes.lock(),
            vec![WriteCacheMode::DisableFlushing, WriteCacheMode::CacheMetadata]
        );
    }

    #[test]
    fn test_not_applicable_is_noop() {
        let opt = optimizer(true, 19041);
        let spec = wcow_spec(true);
        let handle = opt.pre_start(&spec).unwrap();
        assert!(handle.is_none());
        opt.post_start(&spec, handle).unwrap();
        assert!(opt.driver.modes.lock().is_empty());
    }

    #[test]
    fn test_hyperv_container_not_opened() {
        let opt = optimizer(true, 18362);
        let mut spec = wcow_spec(true);
        spec.windows.as_mut().unwrap().hyperv = Some(crate::spec::HyperV::default());
        assert!(opt.is_applicable(&spec));

        let handle = opt.pre_start(&spec).unwrap();
        assert!(handle.is_none());
        opt.post_start(&spec, handle).unwrap();
        assert!(opt.driver.modes.lock().is_empty());
    }

    #[test]
    fn test_post_start_with_none_handle() {
        let opt = optimizer(true, 18362);
        opt.post_start(&wcow_spec(true), CacheHandle::none()).unwrap();
        assert!(opt.driver.modes.lock().is_empty());
    }

    #[test]
    fn test_missing_layer_folders() {
        let opt = optimizer(true, 18362);
        let mut spec = wcow_spec(true);
        spec.windows.as_mut().unwrap().layer_folders.clear();
        let err = opt.pre_start(&spec).unwrap_err();
        assert!(matches!(err, Error::Disk { step: DiskStep::Open, .. }));
    }
}
