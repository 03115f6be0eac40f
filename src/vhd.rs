//! Virtual disk driver access through the Windows VHD API

use std::ffi::c_void;
use std::io;
use std::path::Path;
use windows::{
    core::HSTRING,
    Win32::{
        Foundation::{CloseHandle, HANDLE},
        Storage::Vhd::*,
        System::IO::DeviceIoControl,
    },
};
use crate::flush::{
    SurfaceCachePolicyRequest, VirtualDiskDriver, WriteCacheMode, IOCTL_SET_SURFACE_CACHE_POLICY,
};

/// An open virtual disk, closed on drop
#[derive(Debug)]
pub struct VhdHandle {
    handle: HANDLE,
}

// A VHD handle is a kernel handle, usable from any thread
unsafe impl Send for VhdHandle {}

impl Drop for VhdHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct VhdDriver;

impl VirtualDiskDriver for VhdDriver {
    type Disk = VhdHandle;

    fn open(&self, path: &Path) -> io::Result<VhdHandle> {
        let storage_type = VIRTUAL_STORAGE_TYPE {
            DeviceId: VIRTUAL_STORAGE_TYPE_DEVICE_VHDX,
            VendorId: VIRTUAL_STORAGE_TYPE_VENDOR_MICROSOFT,
        };
        // Version 2 is required for VIRTUAL_DISK_ACCESS_NONE
        let mut parameters = OPEN_VIRTUAL_DISK_PARAMETERS::default();
        parameters.Version = OPEN_VIRTUAL_DISK_VERSION_2;

        let path = HSTRING::from(path.as_os_str());
        let mut handle = HANDLE::default();
        let status = unsafe {
            OpenVirtualDisk(
                &storage_type,
                &path,
                VIRTUAL_DISK_ACCESS_NONE,
                OPEN_VIRTUAL_DISK_FLAG_PARENT_CACHED_IO
                    | OPEN_VIRTUAL_DISK_FLAG_IGNORE_RELATIVE_PARENT_LOCATOR,
                Some(&parameters),
                &mut handle,
            )
        };
        if status.is_err() {
            if !handle.is_invalid() {
                unsafe {
                    let _ = CloseHandle(handle);
                }
            }
            return Err(io::Error::from_raw_os_error(status.0 as i32));
        }
        Ok(VhdHandle { handle })
    }

    fn set_write_cache_mode(&self, disk: &VhdHandle, mode: WriteCacheMode) -> io::Result<()> {
        let request = SurfaceCachePolicyRequest::new(mode);
        let mut bytes_returned = 0u32;
        unsafe {
            DeviceIoControl(
                disk.handle,
                IOCTL_SET_SURFACE_CACHE_POLICY,
                Some(&request as *const SurfaceCachePolicyRequest as *const c_void),
                SurfaceCachePolicyRequest::SIZE as u32,
                None,
                0,
                Some(&mut bytes_returned),
                None,
            )
        }
        .map_err(io::Error::other)
    }
}
