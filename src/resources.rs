//! Utility VM sizing for a single hosted container
//!
//! With the v1 schema HCS sized the utility VM itself. A v2 caller creating a
//! utility VM for one container has to derive the figures from the container's
//! own limits.

use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

pub const DEFAULT_UVM_CPU_COUNT: u64 = 2;
pub const DEFAULT_UVM_MEMORY_MB: u64 = 512;
pub const DEFAULT_UVM_MEMORY_OVERHEAD_MB: u64 = 256;
/// Utility VM memory is always allocated in multiples of this
pub const UVM_MEMORY_ALIGNMENT_MB: u64 = 512;

/// Limits declared by a container spec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceSpec {
    pub cpu_count: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
}

/// Resources allocated to a hosting utility VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UvmResources {
    pub cpu_count: u64,
    pub memory_bytes: u64,
}

impl UvmResources {
    pub fn memory_mb(&self) -> u64 {
        self.memory_bytes / MIB
    }
}

/// Size a utility VM with the default 256 MiB overhead
pub fn compute(spec: &ResourceSpec, host_logical_cpus: usize) -> UvmResources {
    compute_with_overhead(spec, host_logical_cpus, DEFAULT_UVM_MEMORY_OVERHEAD_MB)
}

/// Size a utility VM. The CPU count is taken from the spec as-is, without
/// clamping to host capacity.
pub fn compute_with_overhead(
    spec: &ResourceSpec,
    host_logical_cpus: usize,
    overhead_mb: u64,
) -> UvmResources {
    let mut cpu_count = if host_logical_cpus == 1 {
        1
    } else {
        DEFAULT_UVM_CPU_COUNT
    };
    if let Some(count) = spec.cpu_count {
        cpu_count = count;
    }
    // A spec count of zero would give a VM with no processors
    let cpu_count = cpu_count.max(1);

    let base_mb = spec
        .memory_limit_bytes
        .map(|bytes| bytes / MIB)
        .unwrap_or(DEFAULT_UVM_MEMORY_MB);
    let memory_mb = round_up(base_mb.saturating_add(overhead_mb), UVM_MEMORY_ALIGNMENT_MB);

    tracing::debug!(memory_mb, cpu_count, "utility VM resources");

    UvmResources {
        cpu_count,
        memory_bytes: memory_mb.saturating_mul(MIB),
    }
}

fn round_up(value: u64, multiple: u64) -> u64 {
    match value % multiple {
        0 => value.max(multiple),
        rem => value.saturating_add(multiple - rem),
    }
}
