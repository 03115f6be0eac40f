//! HCS operation wrapper

use std::ffi::c_void;
use windows::{
    core::PWSTR,
    Win32::System::HostComputeSystem::*,
};
use crate::Result;

/// Synchronous HCS_OPERATION, closed on drop
pub struct Operation {
    handle: HCS_OPERATION,
}

impl Operation {
    pub fn new() -> Self {
        unsafe {
            let handle = HcsCreateOperation(None, None);
            Self { handle }
        }
    }

    pub fn handle(&self) -> HCS_OPERATION {
        self.handle
    }

    /// Result document of a completed operation
    pub fn get_result(&self) -> Result<String> {
        unsafe {
            let mut result_doc: PWSTR = PWSTR::null();
            let status = HcsGetOperationResult(self.handle, Some(&mut result_doc));
            let result = take_document(result_doc);
            status.map_err(|e| operation_error(e, &result))?;
            Ok(result)
        }
    }

    /// Block until the operation completes and return its result document
    pub fn wait(&self) -> Result<String> {
        unsafe {
            let mut result_doc: PWSTR = PWSTR::null();
            let status = HcsWaitForOperationResult(self.handle, u32::MAX, Some(&mut result_doc));
            let result = take_document(result_doc);
            status.map_err(|e| operation_error(e, &result))?;
            Ok(result)
        }
    }
}

impl Default for Operation {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        unsafe {
            HcsCloseOperation(self.handle);
        }
    }
}

/// Copy out and free an HCS-allocated document
unsafe fn take_document(doc: PWSTR) -> String {
    if doc.is_null() {
        return String::new();
    }
    let s = doc.to_string().unwrap_or_default();
    windows::Win32::System::Com::CoTaskMemFree(Some(doc.as_ptr() as *const c_void));
    s
}

/// HCS puts the useful part of a failure in the result document
fn operation_error(e: windows::core::Error, result: &str) -> crate::Error {
    let err = crate::Error::from_hresult(e.code().0, "HCS operation");
    match err {
        crate::Error::Hcs(msg) if !result.is_empty() => {
            crate::Error::Hcs(format!("{}: {}", msg, result))
        }
        other => other,
    }
}
