//! HCS transport
//!
//! Safe wrappers around the Windows Host Compute Service APIs, and the
//! [`ComputeTransport`](crate::transport::ComputeTransport) built on them.

pub mod compute;
pub mod operation;

pub use compute::{ComputeSystem, HcsTransport};
pub use operation::Operation;
