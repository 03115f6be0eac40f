//! Container lifecycle on top of the router and the boot flush optimizer
//!
//! The manager owns each created compute system together with the
//! [`CacheHandle`] produced after creation, and releases that handle during
//! start. Records are individually locked so different containers move through
//! create/start/stop concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::{Mutex, RwLock};
use tracing::{info, warn, Span};
use crate::capability::CapabilityProvider;
use crate::config::AgentConfig;
use crate::flush::{BootFlushOptimizer, CacheHandle, VirtualDiskDriver};
use crate::router::{CreationRequest, Router};
use crate::spec::Spec;
use crate::transport::ComputeTransport;
use crate::{Error, Result};

/// State of a managed compute system
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Starting,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "Created"),
            ContainerState::Starting => write!(f, "Starting"),
            ContainerState::Running => write!(f, "Running"),
            ContainerState::Stopped => write!(f, "Stopped"),
            ContainerState::Error => write!(f, "Error"),
        }
    }
}

struct Record<S, K> {
    spec: Spec,
    system: S,
    state: ContainerState,
    cache: CacheHandle<K>,
    utility_vm: bool,
}

/// Summary of a managed compute system
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub state: ContainerState,
    pub utility_vm: bool,
    /// Boot flush optimization still in effect
    pub flush_suppressed: bool,
}

type Shared<S, K> = Arc<Mutex<Record<S, K>>>;

pub struct ContainerManager<T: ComputeTransport, D: VirtualDiskDriver, C> {
    router: Router<T, C>,
    optimizer: BootFlushOptimizer<D, C>,
    config: AgentConfig,
    containers: RwLock<HashMap<String, Shared<T::System, D::Disk>>>,
}

impl<T, D, C> ContainerManager<T, D, C>
where
    T: ComputeTransport,
    D: VirtualDiskDriver,
    C: CapabilityProvider + Clone,
{
    pub fn new(transport: T, driver: D, capabilities: C, config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let router = Router::new(transport, capabilities.clone())
            .with_uvm_memory_overhead(config.uvm_memory_overhead_mb);
        let optimizer = BootFlushOptimizer::with_window(driver, capabilities, config.flush_window);
        Ok(Self {
            router,
            optimizer,
            config,
            containers: RwLock::new(HashMap::new()),
        })
    }

    pub fn router(&self) -> &Router<T, C> {
        &self.router
    }

    /// Fill in what the agent supplies when the caller leaves it out
    fn complete(&self, mut request: CreationRequest) -> CreationRequest {
        if request.owner.is_empty() {
            request.owner = self.config.owner.clone();
        }
        if request.schema_version.is_none() {
            let caps = self.router.capabilities();
            request.schema_version = Some(self.config.schema_version.unwrap_or_else(|| {
                if caps.supports_v2_schema() {
                    crate::schema::SchemaVersion::default_for_build(caps.os_build())
                } else {
                    crate::schema::SchemaVersion::V10
                }
            }));
        }
        if request.span.is_none() {
            request.span = Some(Span::current());
        }
        request.options = request.options.with_defaults(&self.config.default_options());
        request
    }

    /// Create a container or utility VM and, for containers, suppress flushing
    /// on the sandbox disk until it has started
    pub fn create(&self, request: CreationRequest) -> Result<String> {
        let request = self.complete(request);
        let id = request.id.clone();

        {
            let containers = self.containers.read();
            if containers.len() >= self.config.max_containers {
                return Err(Error::Config(format!(
                    "Maximum container limit ({}) reached",
                    self.config.max_containers
                )));
            }
            if containers.contains_key(&id) {
                return Err(Error::ContainerAlreadyExists(id));
            }
        }

        let created = self.router.create(&request)?;
        let utility_vm = created.is_utility_vm();
        let system = created.into_system();
        let spec = request.spec.unwrap_or_default();

        let cache = if utility_vm {
            CacheHandle::none()
        } else {
            match self.optimizer.pre_start(&spec) {
                Ok(cache) => cache,
                Err(e) => {
                    if let Err(te) = self.router.transport().terminate(&system) {
                        warn!(container = %id, error = %te, "failed to terminate after create failure");
                    }
                    return Err(e);
                }
            }
        };

        let record = Record {
            spec,
            system,
            state: ContainerState::Created,
            cache,
            utility_vm,
        };

        // Concurrent creates may have filled the table since the first check
        let mut containers = self.containers.write();
        let rejected = if containers.contains_key(&id) {
            Some(Error::ContainerAlreadyExists(id.clone()))
        } else if containers.len() >= self.config.max_containers {
            Some(Error::Config(format!(
                "Maximum container limit ({}) reached",
                self.config.max_containers
            )))
        } else {
            None
        };
        if let Some(err) = rejected {
            drop(containers);
            if let Err(e) = self.router.transport().terminate(&record.system) {
                warn!(container = %id, error = %e, "failed to terminate rejected system");
            }
            return Err(err);
        }
        containers.insert(id.clone(), Arc::new(Mutex::new(record)));
        info!(container = %id, utility_vm, "created");
        Ok(id)
    }

    /// Start a created system, then restore caching on its sandbox disk
    ///
    /// The flush-suppression handle is released here whether or not the start
    /// succeeds.
    pub fn start(&self, id: &str) -> Result<()> {
        let record = self.get(id)?;
        let mut record = record.lock();
        ensure_state(&record, ContainerState::Created)?;
        record.state = ContainerState::Starting;

        let cache = std::mem::take(&mut record.cache);
        if let Err(e) = self.router.transport().start(&record.system) {
            drop(cache);
            record.state = ContainerState::Error;
            return Err(e);
        }
        record.state = ContainerState::Running;
        info!(container = %id, "started");

        self.optimizer.post_start(&record.spec, cache)
    }

    pub fn stop(&self, id: &str) -> Result<()> {
        let record = self.get(id)?;
        let mut record = record.lock();
        let state = record.state;
        if state != ContainerState::Running && state != ContainerState::Created {
            return Err(Error::InvalidState {
                current: state.to_string(),
                expected: "Running or Created".into(),
            });
        }
        self.router.transport().terminate(&record.system)?;
        record.cache = CacheHandle::none();
        record.state = ContainerState::Stopped;
        info!(container = %id, "stopped");
        Ok(())
    }

    /// Forget a system, terminating it first if it may still be running
    pub fn remove(&self, id: &str) -> Result<()> {
        let record = self
            .containers
            .write()
            .remove(id)
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))?;
        let record = record.lock();
        if matches!(
            record.state,
            ContainerState::Created | ContainerState::Starting | ContainerState::Running
        ) {
            self.router.transport().terminate(&record.system)?;
        }
        Ok(())
    }

    /// Create and start in one call, removing the container if start fails
    ///
    /// A failure to restore caching after a successful start is returned as an
    /// error, but the container stays registered and `Running` under the ID
    /// the request carried.
    pub fn create_and_start(&self, request: CreationRequest) -> Result<String> {
        let id = self.create(request)?;
        if let Err(e) = self.start(&id) {
            match self.state(&id) {
                Ok(ContainerState::Running) => {
                    warn!(container = %id, error = %e, "container running after start error");
                }
                _ => {
                    if let Err(re) = self.remove(&id) {
                        warn!(container = %id, error = %re, "failed to remove after start failure");
                    }
                }
            }
            return Err(e);
        }
        Ok(id)
    }

    pub fn state(&self, id: &str) -> Result<ContainerState> {
        Ok(self.get(id)?.lock().state)
    }

    pub fn info(&self, id: &str) -> Result<ContainerInfo> {
        let record = self.get(id)?;
        let record = record.lock();
        Ok(ContainerInfo {
            id: id.to_string(),
            state: record.state,
            utility_vm: record.utility_vm,
            flush_suppressed: !record.cache.is_none(),
        })
    }

    pub fn list(&self) -> Vec<String> {
        self.containers.read().keys().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.containers.read().len()
    }

    fn get(&self, id: &str) -> Result<Shared<T::System, D::Disk>> {
        self.containers
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ContainerNotFound(id.to_string()))
    }
}

fn ensure_state<S, K>(record: &Record<S, K>, expected: ContainerState) -> Result<()> {
    if record.state != expected {
        Err(Error::InvalidState {
            current: record.state.to_string(),
            expected: expected.to_string(),
        })
    } else {
        Ok(())
    }
}
