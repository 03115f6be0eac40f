//! Error types for HCS container creation

use std::path::PathBuf;
use thiserror::Error;

/// Step of the boot flush protocol that touched the sandbox disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskStep {
    Open,
    DisableFlushing,
    RestoreCaching,
}

impl std::fmt::Display for DiskStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskStep::Open => write!(f, "open"),
            DiskStep::DisableFlushing => write!(f, "disable flushing on"),
            DiskStep::RestoreCaching => write!(f, "restore metadata caching on"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("SchemaVersion must be supplied")]
    MissingSchemaVersion,

    #[error("unsupported schema version {major}.{minor}")]
    UnsupportedSchemaVersion { major: u32, minor: u32 },

    #[error("Id must be supplied")]
    MissingId,

    #[error("Owner must be supplied")]
    MissingOwner,

    #[error("a logging span must be supplied")]
    MissingLogger,

    #[error("Spec must be supplied")]
    MissingSpec,

    #[error("HostingSystem must not be supplied for a v1 schema request")]
    HostingSystemOnV1,

    #[error("LCOW options must not be supplied for a v1 schema Windows container request")]
    LcowOptionsOnV1,

    #[error("spec 'windows' section must contain layer folders for a Linux container")]
    MissingWindowsSection,

    #[error("utility VM creation requires a v2 schema request")]
    UtilityVmOnV1,

    #[error("invalid runtime option {key}: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("LCOW configuration error: {0}")]
    Lcow(String),

    #[error("not supported: {0}")]
    Unsupported(String),

    #[error("failed to {step} {}: {source}", .path.display())]
    Disk {
        step: DiskStep,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HCS operation failed: {0}")]
    Hcs(String),

    #[cfg(windows)]
    #[error("Windows API error: {0}")]
    Windows(#[from] windows::core::Error),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container already exists: {0}")]
    ContainerAlreadyExists(String),

    #[error("Invalid state: container is {current}, expected {expected}")]
    InvalidState { current: String, expected: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Insufficient privileges - run as Administrator or add to Hyper-V Administrators")]
    InsufficientPrivileges,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for request validation failures, which are raised before any side effect
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::MissingSchemaVersion
                | Error::UnsupportedSchemaVersion { .. }
                | Error::MissingId
                | Error::MissingOwner
                | Error::MissingLogger
                | Error::MissingSpec
                | Error::HostingSystemOnV1
                | Error::LcowOptionsOnV1
                | Error::MissingWindowsSection
                | Error::UtilityVmOnV1
                | Error::InvalidOption { .. }
                | Error::Lcow(_)
        )
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported(_))
    }

    /// Create from Windows HRESULT if it's a privilege error
    pub fn from_hresult(hr: i32, context: &str) -> Self {
        // 0x8037011B = HCS_E_ACCESS_DENIED
        if hr == 0x8037011Bu32 as i32 {
            Error::InsufficientPrivileges
        } else {
            Error::Hcs(format!("{}: HRESULT 0x{:08X}", context, hr))
        }
    }
}
