//! HCS runtime CLI

use std::path::{Path, PathBuf};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use hcs_runtime::capability::{CapabilityProvider, HostCapabilities};
use hcs_runtime::transport::ComputeTransport;
use hcs_runtime::{resources, AgentConfig, CreationRequest, Error, Router, SchemaVersion, Spec};

#[derive(Parser)]
#[command(name = "hcs-runtime")]
#[command(about = "Route, size and create HCS containers", long_about = None)]
#[command(version)]
struct Cli {
    /// Agent configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show host capabilities
    Info,
    /// Compute utility VM resources for a container spec
    Size {
        /// Path to the OCI config.json
        #[arg(short, long)]
        spec: PathBuf,
        /// Override the host logical processor count
        #[arg(long)]
        host_cpus: Option<usize>,
    },
    /// Validate a request and print the create document without creating anything
    Plan(RequestArgs),
    /// Create and start a container
    #[cfg(windows)]
    Run(RequestArgs),
}

#[derive(Args)]
struct RequestArgs {
    /// Path to the OCI config.json
    #[arg(short, long)]
    spec: PathBuf,
    /// Container ID
    #[arg(long)]
    id: String,
    /// Owner (defaults to the agent's)
    #[arg(long)]
    owner: Option<String>,
    /// Schema version, e.g. 2.1 (defaults to the host's)
    #[arg(long)]
    schema: Option<SchemaVersion>,
    /// ID of an existing utility VM to host the container
    #[arg(long)]
    hosting_system: Option<String>,
    /// The spec describes a utility VM
    #[arg(long)]
    utility_vm: bool,
    /// Runtime option as key=value
    #[arg(short = 'o', long = "option", value_parser = parse_option)]
    options: Vec<(String, String)>,
}

fn parse_option(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

/// Transport for commands that must not create anything
struct DryRun;

impl ComputeTransport for DryRun {
    type System = ();

    fn create(&self, id: &str, _document: &Value) -> hcs_runtime::Result<()> {
        Err(Error::Unsupported(format!("dry run: not creating {}", id)))
    }

    fn start(&self, _system: &()) -> hcs_runtime::Result<()> {
        Ok(())
    }

    fn terminate(&self, _system: &()) -> hcs_runtime::Result<()> {
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hcs_runtime=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    let caps = HostCapabilities::detect()?;

    match cli.command {
        Some(Commands::Info) | None => cmd_info(&caps, &config),
        Some(Commands::Size { spec, host_cpus }) => cmd_size(&spec, host_cpus, &caps, &config),
        Some(Commands::Plan(args)) => cmd_plan(args, caps, &config),
        #[cfg(windows)]
        Some(Commands::Run(args)) => cmd_run(args, caps, config),
    }
}

fn cmd_info(caps: &HostCapabilities, config: &AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== HCS Runtime Info ===\n");
    println!("    OS build:            {}", caps.os_build);
    println!("    Logical processors:  {}", caps.logical_cpus);
    println!("    v2 schema:           {}", if caps.supports_v2_schema { "supported" } else { "not supported" });
    println!(
        "    Default schema:      {}",
        config.schema_version.unwrap_or_else(|| caps.default_schema_version())
    );
    println!(
        "    Boot flush window:   [{}, {}){}",
        config.flush_window.min_build,
        config.flush_window.max_build,
        if config.flush_window.contains(caps.os_build) { " (host inside)" } else { "" }
    );

    #[cfg(windows)]
    match hcs_runtime::hcs::compute::enumerate_compute_systems(None) {
        Ok(systems) => {
            println!("\n[*] Compute Systems:");
            if systems.is_empty() {
                println!("    None found");
            }
            for sys in systems {
                println!(
                    "    - {} ({}, {})",
                    sys.id,
                    sys.owner.as_deref().unwrap_or("unknown"),
                    sys.state.as_deref().unwrap_or("-")
                );
            }
        }
        Err(e) => println!("\n[*] Compute Systems: error: {}", e),
    }

    Ok(())
}

fn cmd_size(
    spec: &Path,
    host_cpus: Option<usize>,
    caps: &HostCapabilities,
    config: &AgentConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let spec = Spec::load(spec)?;
    let host_cpus = host_cpus.unwrap_or_else(|| caps.logical_cpu_count());
    let sized = resources::compute_with_overhead(
        &spec.resource_spec(),
        host_cpus,
        config.uvm_memory_overhead_mb,
    );
    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
        "CpuCount": sized.cpu_count,
        "MemoryInMB": sized.memory_mb(),
        "MemoryBytes": sized.memory_bytes,
    }))?);
    Ok(())
}

fn build_request(
    args: RequestArgs,
    caps: &HostCapabilities,
    config: &AgentConfig,
) -> Result<CreationRequest, Box<dyn std::error::Error>> {
    let mut builder = CreationRequest::builder()
        .id(args.id)
        .owner(args.owner.unwrap_or_else(|| config.owner.clone()))
        .schema_version(
            args.schema
                .or(config.schema_version)
                .unwrap_or_else(|| caps.default_schema_version()),
        )
        .spec(Spec::load(&args.spec)?)
        .hosting_system_role(args.utility_vm)
        .options(config.default_options())
        .span(tracing::info_span!("request"));
    if let Some(host) = args.hosting_system {
        builder = builder.hosting_system(host);
    }
    for (k, v) in args.options {
        builder = builder.option(k, v);
    }
    Ok(builder.build())
}

fn cmd_plan(
    args: RequestArgs,
    caps: HostCapabilities,
    config: &AgentConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = build_request(args, &caps, config)?;
    let router = Router::new(DryRun, caps).with_uvm_memory_overhead(config.uvm_memory_overhead_mb);
    let plan = router.plan(&request)?;

    println!("Path:    {}", plan.path);
    println!("Schema:  {}", plan.schema_version);
    if let Some(uvm) = plan.utility_vm {
        println!("UVM:     {} CPUs, {} MB", uvm.cpu_count, uvm.memory_mb());
    }
    println!("\n{}", serde_json::to_string_pretty(&plan.document)?);
    Ok(())
}

#[cfg(windows)]
fn cmd_run(
    args: RequestArgs,
    caps: HostCapabilities,
    config: AgentConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    use hcs_runtime::hcs::HcsTransport;
    use hcs_runtime::vhd::VhdDriver;
    use hcs_runtime::ContainerManager;

    let mut request = build_request(args, &caps, &config)?;
    // The system handle closes when this process exits
    hcs_runtime::document::keep_running_after_close(&mut request.options)?;
    let manager = ContainerManager::new(HcsTransport, VhdDriver, caps, config)?;
    let id = manager.create_and_start(request)?;
    println!("Container '{}' started", id);
    Ok(())
}
