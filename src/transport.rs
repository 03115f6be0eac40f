//! The compute-system transport consumed by the router
//!
//! On Windows this is HCS itself ([`crate::hcs::HcsTransport`]). The router
//! only hands it an ID and a document; how the call is issued, waited on and
//! retried is the transport's business.

use serde_json::Value;
use crate::Result;

#[cfg_attr(test, mockall::automock(type System = String;))]
pub trait ComputeTransport: Send + Sync {
    /// Handle to a created compute system
    type System: Send;

    fn create(&self, id: &str, document: &Value) -> Result<Self::System>;

    fn start(&self, system: &Self::System) -> Result<()>;

    fn terminate(&self, system: &Self::System) -> Result<()>;
}
