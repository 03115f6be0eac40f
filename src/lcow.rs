//! LCOW (Linux containers on Windows) utility VM boot configuration
//!
//! A v1 LCOW request starts from a default boot configuration (or the one the
//! caller supplied), overlays the recognized `lcow.*` runtime options and
//! validates the result before anything is created.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::options::{self, RuntimeOptions};
use crate::{Error, Result};

pub const DEFAULT_KIRD_PATH: &str = r"C:\Program Files\Linux Containers";
pub const DEFAULT_KERNEL_FILE: &str = "bootx64.efi";
pub const DEFAULT_INITRD_FILE: &str = "initrd.img";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LcowConfig {
    /// Folder in which the kernel and initrd reside
    pub kird_path: PathBuf,
    pub kernel_file: String,
    pub initrd_file: String,
    #[serde(default)]
    pub boot_parameters: String,
    /// Utility VM shared across containers
    #[serde(default)]
    pub global_mode: bool,
    pub timeout_secs: u64,
}

impl Default for LcowConfig {
    fn default() -> Self {
        Self {
            kird_path: PathBuf::from(DEFAULT_KIRD_PATH),
            kernel_file: DEFAULT_KERNEL_FILE.to_string(),
            initrd_file: DEFAULT_INITRD_FILE.to_string(),
            boot_parameters: String::new(),
            global_mode: false,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl LcowConfig {
    /// Default configuration merged with `options`, then validated
    pub fn from_options(options: &RuntimeOptions) -> Result<Self> {
        Self::default().merge(options)
    }

    /// Overlay recognized `lcow.*` options and validate. Unrecognized keys are
    /// left alone.
    pub fn merge(mut self, options: &RuntimeOptions) -> Result<Self> {
        if let Some(v) = options.get(options::LCOW_KIRD_PATH) {
            self.kird_path = PathBuf::from(v);
        }
        if let Some(v) = options.get(options::LCOW_KERNEL_FILE) {
            self.kernel_file = v.to_string();
        }
        if let Some(v) = options.get(options::LCOW_INITRD_FILE) {
            self.initrd_file = v.to_string();
        }
        if let Some(v) = options.get(options::LCOW_BOOT_PARAMETERS) {
            self.boot_parameters = v.to_string();
        }
        if options.contains(options::LCOW_GLOBAL_MODE) {
            self.global_mode = true;
        }
        if let Some(secs) = options
            .get_u64(options::LCOW_TIMEOUT)
            .map_err(|e| Error::Lcow(e.to_string()))?
        {
            self.timeout_secs = secs;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn kernel_path(&self) -> PathBuf {
        self.kird_path.join(&self.kernel_file)
    }

    pub fn initrd_path(&self) -> PathBuf {
        self.kird_path.join(&self.initrd_file)
    }

    /// Check the kernel and initrd resolve to files under the kird path
    pub fn validate(&self) -> Result<()> {
        if self.kird_path.as_os_str().is_empty() {
            return Err(Error::Lcow("kernel/initrd path must be supplied".into()));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Lcow("timeout must be greater than zero".into()));
        }
        check_file_name("kernel", &self.kernel_file)?;
        check_file_name("initrd", &self.initrd_file)?;
        check_exists("kernel", &self.kernel_path())?;
        check_exists("initrd", &self.initrd_path())?;
        Ok(())
    }
}

fn check_file_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Lcow(format!("{} file name must be supplied", what)));
    }
    // Must name a file directly inside the kird path
    if Path::new(name).components().count() != 1 || name.contains(['/', '\\']) {
        return Err(Error::Lcow(format!(
            "{} file '{}' must be a file name, not a path",
            what, name
        )));
    }
    Ok(())
}

fn check_exists(what: &str, path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Lcow(format!("{} not found at {}", what, path.display())))
    }
}
