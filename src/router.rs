//! Creation request validation and routing
//!
//! A request is checked field by field, in a fixed order, before anything is
//! created. It then resolves to exactly one [`CreationPath`] from its schema
//! generation, workload kind and hosting role.

use serde_json::Value;
use tracing::{debug, info, info_span, Span};
use crate::capability::CapabilityProvider;
use crate::document;
use crate::lcow::LcowConfig;
use crate::options::{self, RuntimeOptions};
use crate::resources::{self, UvmResources, DEFAULT_UVM_MEMORY_OVERHEAD_MB};
use crate::schema::SchemaVersion;
use crate::spec::Spec;
use crate::transport::ComputeTransport;
use crate::{Error, Result};

/// Everything needed to create a container or utility VM
#[derive(Debug, Clone, Default)]
pub struct CreationRequest {
    pub id: String,
    pub owner: String,
    pub spec: Option<Spec>,
    /// ID of an existing utility VM to place the container in (v2 only)
    pub hosting_system: Option<String>,
    /// Caller-supplied LCOW boot configuration (v1 LCOW only)
    pub lcow_options: Option<LcowConfig>,
    pub schema_version: Option<SchemaVersion>,
    /// The spec describes a utility VM rather than a container
    pub is_hosting_system: bool,
    pub options: RuntimeOptions,
    /// Parent span for everything logged on behalf of this request
    pub span: Option<Span>,
}

impl CreationRequest {
    pub fn builder() -> CreationRequestBuilder {
        CreationRequestBuilder::default()
    }

    /// Schema version in effect. The `hcs.schema.version` option forces a
    /// version over the field.
    pub fn effective_schema_version(&self) -> Result<Option<SchemaVersion>> {
        match self.options.get(options::HCS_SCHEMA_VERSION) {
            Some(raw) => SchemaVersion::parse_option(raw).map(Some),
            None => Ok(self.schema_version),
        }
    }

    /// Explicit flag, or the `hcs.spec.defines.utility.vm` option
    pub fn defines_hosting_system(&self) -> bool {
        self.is_hosting_system || self.options.contains(options::HCS_SPEC_DEFINES_UTILITY_VM)
    }
}

#[derive(Default)]
pub struct CreationRequestBuilder {
    request: CreationRequest,
}

impl CreationRequestBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.request.id = id.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.request.owner = owner.into();
        self
    }

    pub fn spec(mut self, spec: Spec) -> Self {
        self.request.spec = Some(spec);
        self
    }

    pub fn hosting_system(mut self, id: impl Into<String>) -> Self {
        self.request.hosting_system = Some(id.into());
        self
    }

    pub fn lcow_options(mut self, config: LcowConfig) -> Self {
        self.request.lcow_options = Some(config);
        self
    }

    pub fn schema_version(mut self, version: SchemaVersion) -> Self {
        self.request.schema_version = Some(version);
        self
    }

    pub fn hosting_system_role(mut self, is_hosting_system: bool) -> Self {
        self.request.is_hosting_system = is_hosting_system;
        self
    }

    pub fn option(mut self, key: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.request.options.insert(key, value);
        self
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.request.options = options;
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.request.span = Some(span);
        self
    }

    pub fn build(self) -> CreationRequest {
        self.request
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    V1,
    V2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Windows,
    Linux,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Container,
    HostingSystem,
}

/// The creation strategy a request resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationPath {
    /// Linux container in its own utility VM, v1 schema
    LcowV1,
    /// Linux container, v2 schema. Not implemented.
    LcowV2,
    /// Windows utility VM to host containers, v2 schema
    UtilityVmV2,
    /// Windows container from a single generated document
    Container(Generation),
}

impl CreationPath {
    pub fn select(generation: Generation, workload: Workload, role: Role) -> Result<Self> {
        match (generation, workload, role) {
            (Generation::V1, Workload::Linux, _) => Ok(CreationPath::LcowV1),
            (Generation::V2, Workload::Linux, _) => Ok(CreationPath::LcowV2),
            (Generation::V1, Workload::Windows, Role::HostingSystem) => Err(Error::UtilityVmOnV1),
            (Generation::V2, Workload::Windows, Role::HostingSystem) => Ok(CreationPath::UtilityVmV2),
            (generation, Workload::Windows, Role::Container) => {
                Ok(CreationPath::Container(generation))
            }
        }
    }
}

impl std::fmt::Display for CreationPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CreationPath::LcowV1 => write!(f, "lcow-v1"),
            CreationPath::LcowV2 => write!(f, "lcow-v2"),
            CreationPath::UtilityVmV2 => write!(f, "utility-vm-v2"),
            CreationPath::Container(Generation::V1) => write!(f, "container-v1"),
            CreationPath::Container(Generation::V2) => write!(f, "container-v2"),
        }
    }
}

/// A validated request ready for the transport
#[derive(Debug, Clone)]
pub struct Plan {
    pub path: CreationPath,
    pub schema_version: SchemaVersion,
    pub document: Value,
    /// Set when the plan creates a utility VM
    pub utility_vm: Option<UvmResources>,
}

/// What `Router::create` produced
#[derive(Debug)]
pub enum Created<S> {
    Container(S),
    /// A utility VM that containers can later be created in
    UtilityVm(S),
}

impl<S> Created<S> {
    pub fn system(&self) -> &S {
        match self {
            Created::Container(s) | Created::UtilityVm(s) => s,
        }
    }

    pub fn into_system(self) -> S {
        match self {
            Created::Container(s) | Created::UtilityVm(s) => s,
        }
    }

    pub fn is_utility_vm(&self) -> bool {
        matches!(self, Created::UtilityVm(_))
    }
}

/// Validates creation requests and hands the resulting document to the transport
pub struct Router<T, C> {
    transport: T,
    capabilities: C,
    uvm_memory_overhead_mb: u64,
}

impl<T: ComputeTransport, C: CapabilityProvider> Router<T, C> {
    pub fn new(transport: T, capabilities: C) -> Self {
        Self {
            transport,
            capabilities,
            uvm_memory_overhead_mb: DEFAULT_UVM_MEMORY_OVERHEAD_MB,
        }
    }

    /// Memory added to utility VMs unless a request overrides it
    pub fn with_uvm_memory_overhead(mut self, overhead_mb: u64) -> Self {
        self.uvm_memory_overhead_mb = overhead_mb;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn capabilities(&self) -> &C {
        &self.capabilities
    }

    /// Validate and route `request` without creating anything
    pub fn plan(&self, request: &CreationRequest) -> Result<Plan> {
        let (version, spec, path) = validate(request)?;

        let mut utility_vm = None;
        let mut document = match path {
            CreationPath::LcowV1 => {
                let lcow = request
                    .lcow_options
                    .clone()
                    .unwrap_or_default()
                    .merge(&request.options)?;
                document::lcow_v1(&request.id, &request.owner, spec, &lcow)
            }
            CreationPath::LcowV2 => {
                return Err(Error::Unsupported(
                    "LCOW containers with a v2 schema request".into(),
                ));
            }
            CreationPath::UtilityVmV2 => {
                let overhead_mb = request
                    .options
                    .get_u64(options::HCS_WCOW_V2_UVM_MEMORY_OVERHEAD)?
                    .unwrap_or(self.uvm_memory_overhead_mb);
                let sized = resources::compute_with_overhead(
                    &spec.resource_spec(),
                    self.capabilities.logical_cpu_count(),
                    overhead_mb,
                );
                utility_vm = Some(sized);
                document::utility_vm_v2(&request.owner, spec, version, &sized)?
            }
            CreationPath::Container(Generation::V1) => {
                document::container_v1(&request.id, &request.owner, spec)
            }
            CreationPath::Container(Generation::V2) => document::container_v2(
                &request.owner,
                spec,
                version,
                request.hosting_system.as_deref(),
            ),
        };

        document::apply_additional_json(&mut document, &request.options, version)?;

        Ok(Plan {
            path,
            schema_version: version,
            document,
            utility_vm,
        })
    }

    /// Validate `request`, pick its creation path and create the compute system
    pub fn create(&self, request: &CreationRequest) -> Result<Created<T::System>> {
        let plan = self.plan(request)?;

        let parent = request.span.as_ref().ok_or(Error::MissingLogger)?;
        let span = info_span!(parent: parent, "create", container = %request.id, path = %plan.path);
        let _enter = span.enter();

        info!(schema = %plan.schema_version, "creating compute system");
        debug!(document = %plan.document, "create document");

        let system = self.transport.create(&request.id, &plan.document)?;
        Ok(match plan.path {
            CreationPath::UtilityVmV2 => Created::UtilityVm(system),
            _ => Created::Container(system),
        })
    }
}

/// Checks run in order; the first failure is returned
fn validate(request: &CreationRequest) -> Result<(SchemaVersion, &Spec, CreationPath)> {
    let version = request
        .effective_schema_version()?
        .ok_or(Error::MissingSchemaVersion)?;
    version.check_supported()?;
    if request.id.is_empty() {
        return Err(Error::MissingId);
    }
    if request.owner.is_empty() {
        return Err(Error::MissingOwner);
    }
    if request.span.is_none() {
        return Err(Error::MissingLogger);
    }
    let spec = request.spec.as_ref().ok_or(Error::MissingSpec)?;

    if version.is_v1() {
        if request.hosting_system.is_some() {
            return Err(Error::HostingSystemOnV1);
        }
        if request.lcow_options.is_some() && !spec.is_lcow() {
            return Err(Error::LcowOptionsOnV1);
        }
    }
    if spec.is_lcow() && spec.windows.is_none() {
        return Err(Error::MissingWindowsSection);
    }

    let generation = if version.is_v1() {
        Generation::V1
    } else {
        Generation::V2
    };
    let workload = if spec.is_lcow() {
        Workload::Linux
    } else {
        Workload::Windows
    };
    let role = if request.defines_hosting_system() {
        Role::HostingSystem
    } else {
        Role::Container
    };
    let path = CreationPath::select(generation, workload, role)?;
    Ok((version, spec, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::HostCapabilities;
    use crate::spec::WindowsSpec;
    use crate::transport::MockComputeTransport;

    fn wcow_spec() -> Spec {
        Spec {
            windows: Some(WindowsSpec {
                layer_folders: vec![r"C:\l\base".into(), r"C:\l\scratch".into()],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn request(version: SchemaVersion) -> CreationRequestBuilder {
        CreationRequest::builder()
            .id("c1")
            .owner("docker")
            .schema_version(version)
            .spec(wcow_spec())
            .span(Span::none())
    }

    fn router(transport: MockComputeTransport) -> Router<MockComputeTransport, HostCapabilities> {
        Router::new(transport, HostCapabilities::new(true, 17763, 4))
    }

    fn no_calls() -> MockComputeTransport {
        let mut transport = MockComputeTransport::new();
        transport.expect_create().never();
        transport
    }

    #[test]
    fn test_select_table() {
        use Generation::*;
        assert_eq!(
            CreationPath::select(V1, Workload::Linux, Role::Container).unwrap(),
            CreationPath::LcowV1
        );
        assert_eq!(
            CreationPath::select(V2, Workload::Linux, Role::HostingSystem).unwrap(),
            CreationPath::LcowV2
        );
        assert_eq!(
            CreationPath::select(V2, Workload::Windows, Role::HostingSystem).unwrap(),
            CreationPath::UtilityVmV2
        );
        assert_eq!(
            CreationPath::select(V1, Workload::Windows, Role::Container).unwrap(),
            CreationPath::Container(V1)
        );
        assert!(matches!(
            CreationPath::select(V1, Workload::Windows, Role::HostingSystem),
            Err(Error::UtilityVmOnV1)
        ));
    }

    #[test]
    fn test_validation_order() {
        let r = router(no_calls());

        let req = CreationRequest::default();
        assert!(matches!(r.create(&req), Err(Error::MissingSchemaVersion)));

        let req = CreationRequest { schema_version: Some(SchemaVersion::new(9, 9)), ..Default::default() };
        assert!(matches!(r.create(&req), Err(Error::UnsupportedSchemaVersion { major: 9, minor: 9 })));

        let mut req = CreationRequest { schema_version: Some(SchemaVersion::V21), ..Default::default() };
        assert!(matches!(r.create(&req), Err(Error::MissingId)));
        req.id = "c1".into();
        assert!(matches!(r.create(&req), Err(Error::MissingOwner)));
        req.owner = "docker".into();
        assert!(matches!(r.create(&req), Err(Error::MissingLogger)));
        req.span = Some(Span::none());
        assert!(matches!(r.create(&req), Err(Error::MissingSpec)));
    }

    #[test]
    fn test_v1_rejects_hosting_system() {
        let req = request(SchemaVersion::V10).hosting_system("uvm").build();
        assert!(matches!(router(no_calls()).create(&req), Err(Error::HostingSystemOnV1)));
    }

    #[test]
    fn test_v1_rejects_lcow_options_for_windows() {
        let req = request(SchemaVersion::V10).lcow_options(LcowConfig::default()).build();
        assert!(matches!(router(no_calls()).create(&req), Err(Error::LcowOptionsOnV1)));
    }

    #[test]
    fn test_lcow_requires_windows_section() {
        let spec = Spec { linux: Some(serde_json::json!({})), ..Default::default() };
        let req = request(SchemaVersion::V10).spec(spec).build();
        assert!(matches!(router(no_calls()).create(&req), Err(Error::MissingWindowsSection)));
    }

    #[test]
    fn test_lcow_v2_unsupported() {
        let mut spec = wcow_spec();
        spec.linux = Some(serde_json::json!({}));
        let req = request(SchemaVersion::V21).spec(spec).build();
        let err = router(no_calls()).create(&req).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_schema_option_forces_version() {
        let req = request(SchemaVersion::V21)
            .option("HCS.Schema.Version", r#"{"Major":1,"Minor":0}"#)
            .hosting_system("uvm")
            .build();
        assert!(matches!(router(no_calls()).create(&req), Err(Error::HostingSystemOnV1)));
    }

    #[test]
    fn test_utility_vm_on_v1_rejected() {
        let req = request(SchemaVersion::V10).hosting_system_role(true).build();
        assert!(matches!(router(no_calls()).create(&req), Err(Error::UtilityVmOnV1)));
    }

    #[test]
    fn test_container_v2_passes_document_to_transport() {
        let mut transport = MockComputeTransport::new();
        transport
            .expect_create()
            .withf(|id, doc| id == "c1" && doc["HostingSystemId"] == "uvm-7")
            .times(1)
            .returning(|id, _| Ok(format!("system:{}", id)));

        let req = request(SchemaVersion::V21).hosting_system("uvm-7").build();
        let created = router(transport).create(&req).unwrap();
        assert!(!created.is_utility_vm());
        assert_eq!(created.into_system(), "system:c1");
    }

    #[test]
    fn test_utility_vm_sized_from_spec() {
        let mut transport = MockComputeTransport::new();
        transport
            .expect_create()
            .withf(|_, doc| {
                doc["VirtualMachine"]["ComputeTopology"]["Memory"]["SizeInMB"] == 1024
                    && doc["VirtualMachine"]["ComputeTopology"]["Processor"]["Count"] == 2
            })
            .times(1)
            .returning(|_, _| Ok("uvm".to_string()));

        let req = request(SchemaVersion::V21)
            .option(options::HCS_SPEC_DEFINES_UTILITY_VM, "")
            .build();
        let created = router(transport).create(&req).unwrap();
        assert!(created.is_utility_vm());
    }

    #[test]
    fn test_uvm_overhead_option() {
        let req = request(SchemaVersion::V21)
            .hosting_system_role(true)
            .option(options::HCS_WCOW_V2_UVM_MEMORY_OVERHEAD, "1024")
            .build();
        let plan = router(no_calls()).plan(&req).unwrap();
        // 512 default + 1024 overhead, already aligned
        assert_eq!(plan.utility_vm.unwrap().memory_mb(), 1536);
    }

    #[test]
    fn test_transport_error_propagates_unchanged() {
        let mut transport = MockComputeTransport::new();
        transport
            .expect_create()
            .returning(|_, _| Err(Error::Hcs("HRESULT 0x80370100".into())));
        let req = request(SchemaVersion::V10).build();
        match router(transport).create(&req) {
            Err(Error::Hcs(msg)) => assert_eq!(msg, "HRESULT 0x80370100"),
            other => panic!("unexpected: {:?}", other.map(|c| c.into_system())),
        }
    }
}
