//! HCS Container Creation Core
//!
//! Decides how a container or utility VM gets created on a Windows host
//! through the Host Compute Service (HCS), and manages the boot-time cache
//! policy of the container's sandbox disk.
//!
//! # Components
//!
//! - **Router** - validates a [`CreationRequest`] and routes it to one of the
//!   creation paths (v1 container, v1 LCOW, v2 container, v2 utility VM)
//! - **Schema gate** - the closed table of supported schema versions
//! - **UVM sizing** - utility VM CPU/memory from a container's limits
//! - **Boot flush optimizer** - disables flushing on `sandbox.vhdx` while a
//!   container first boots and restores metadata caching once it runs
//!
//! # Example
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> hcs_runtime::Result<()> {
//! use hcs_runtime::{CreationRequest, Router, SchemaVersion, Spec};
//! use hcs_runtime::capability::HostCapabilities;
//! use hcs_runtime::hcs::HcsTransport;
//!
//! let router = Router::new(HcsTransport, HostCapabilities::detect()?);
//! let request = CreationRequest::builder()
//!     .id("web-1")
//!     .owner("moby")
//!     .schema_version(SchemaVersion::V21)
//!     .spec(Spec::load(r"C:\bundles\web-1\config.json")?)
//!     .span(tracing::Span::current())
//!     .build();
//!
//! let created = router.create(&request)?;
//! # drop(created);
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```

pub mod capability;
pub mod config;
pub mod document;
pub mod error;
pub mod flush;
pub mod lcow;
pub mod lifecycle;
pub mod options;
pub mod resources;
pub mod router;
pub mod schema;
pub mod spec;
pub mod transport;

#[cfg(windows)]
pub mod hcs;
#[cfg(windows)]
pub mod vhd;

pub use config::AgentConfig;
pub use error::{Error, Result};
pub use flush::{BootFlushOptimizer, CacheHandle, WriteCacheMode};
pub use lifecycle::{ContainerManager, ContainerState};
pub use options::RuntimeOptions;
pub use router::{CreationPath, CreationRequest, Created, Router};
pub use schema::SchemaVersion;
pub use spec::Spec;
