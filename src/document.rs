//! HCS create documents
//!
//! v1 documents describe one container (and its Hyper-V partition, if any) in a
//! single flat object. v2 documents describe either a container, optionally
//! placed in an existing hosting system, or a utility VM.

use std::path::Path;
use serde_json::{json, Value};
use crate::lcow::LcowConfig;
use crate::options::{self, RuntimeOptions};
use crate::resources::UvmResources;
use crate::schema::SchemaVersion;
use crate::spec::Spec;
use crate::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Stable layer ID derived from the layer folder
fn layer_id(folder: &str) -> String {
    let name = Path::new(folder)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| folder.to_string());
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn v1_layers(spec: &Spec) -> Vec<Value> {
    spec.read_only_layers()
        .iter()
        .map(|folder| json!({ "ID": layer_id(folder), "Path": folder }))
        .collect()
}

fn v2_layers(spec: &Spec) -> Vec<Value> {
    spec.read_only_layers()
        .iter()
        .map(|folder| {
            json!({
                "Id": layer_id(folder),
                "Path": folder,
                "PathType": "AbsolutePath"
            })
        })
        .collect()
}

/// v1 document for a Windows container, process or Hyper-V isolated
pub fn container_v1(id: &str, owner: &str, spec: &Spec) -> Value {
    let windows = spec.windows.clone().unwrap_or_default();
    let resources = spec.resource_spec();

    let mut doc = json!({
        "SystemType": "Container",
        "Name": id,
        "Owner": owner,
        "IgnoreFlushesDuringBoot": windows.ignore_flushes_during_boot,
        "LayerFolderPath": spec.scratch_folder().unwrap_or_default(),
        "Layers": v1_layers(spec),
        "HvPartition": windows.hyperv.is_some(),
        "TerminateOnLastHandleClosed": true
    });

    if let Some(hostname) = &spec.hostname {
        doc["HostName"] = json!(hostname);
    }
    if let Some(hyperv) = &windows.hyperv {
        if !hyperv.utility_vm_path.is_empty() {
            doc["HvRuntime"] = json!({ "ImagePath": hyperv.utility_vm_path });
        }
    }
    if let Some(limit) = resources.memory_limit_bytes {
        doc["MemoryMaximumInMB"] = json!(limit / MIB);
    }
    if let Some(count) = resources.cpu_count {
        doc["ProcessorCount"] = json!(count);
    }
    doc
}

/// v1 document for a Linux container in its own utility VM
pub fn lcow_v1(id: &str, owner: &str, spec: &Spec, lcow: &LcowConfig) -> Value {
    let mut hv_runtime = json!({
        "ImagePath": lcow.kird_path,
        "LinuxKernelFile": lcow.kernel_file,
        "LinuxInitrdFile": lcow.initrd_file,
    });
    if !lcow.boot_parameters.is_empty() {
        hv_runtime["LinuxBootParameters"] = json!(lcow.boot_parameters);
    }

    json!({
        "SystemType": "Container",
        "Name": id,
        "Owner": owner,
        "ContainerType": "Linux",
        "HvPartition": true,
        "HvRuntime": hv_runtime,
        "LayerFolderPath": spec.scratch_folder().unwrap_or_default(),
        "Layers": v1_layers(spec),
        "TerminateOnLastHandleClosed": true
    })
}

/// v2 document for a container, hosted in `hosting_system` when given
pub fn container_v2(
    owner: &str,
    spec: &Spec,
    version: SchemaVersion,
    hosting_system: Option<&str>,
) -> Value {
    let resources = spec.resource_spec();

    let mut container = json!({
        "Storage": {
            "Layers": v2_layers(spec),
            "Path": spec.scratch_folder().unwrap_or_default()
        },
        "Networking": { "AllowUnqualifiedDnsQuery": true }
    });
    if let Some(hostname) = &spec.hostname {
        container["GuestOs"] = json!({ "HostName": hostname });
    }
    if let Some(count) = resources.cpu_count {
        container["Processor"] = json!({ "Count": count });
    }
    if let Some(limit) = resources.memory_limit_bytes {
        container["Memory"] = json!({ "SizeInMB": limit / MIB });
    }

    let mut doc = json!({
        "SchemaVersion": version,
        "Owner": owner,
        "ShouldTerminateOnLastHandleClosed": true,
        "Container": container
    });
    if let Some(host) = hosting_system {
        doc["HostingSystemId"] = json!(host);
    }
    doc
}

/// v2 document for a Windows utility VM sized by `resources`
///
/// The spec's layer folders are the utility VM's own: the image layers and a
/// scratch folder holding the VM's `sandbox.vhdx`.
pub fn utility_vm_v2(
    owner: &str,
    spec: &Spec,
    version: SchemaVersion,
    resources: &UvmResources,
) -> Result<Value> {
    let uvm_path = utility_vm_image_path(spec).ok_or_else(|| {
        Error::Config("utility VM image path not found in spec".into())
    })?;
    let scratch = spec
        .sandbox_vhdx()
        .ok_or_else(|| Error::Config("utility VM spec has no scratch layer".into()))?;

    Ok(json!({
        "SchemaVersion": version,
        "Owner": owner,
        "ShouldTerminateOnLastHandleClosed": true,
        "VirtualMachine": {
            "StopOnReset": true,
            "Chipset": {
                "Uefi": {
                    "BootThis": {
                        "DevicePath": r"\EFI\Microsoft\Boot\bootmgfw.efi",
                        "DeviceType": "VmbFs"
                    }
                }
            },
            "ComputeTopology": {
                "Memory": {
                    "SizeInMB": resources.memory_mb(),
                    "AllowOvercommit": true,
                    "EnableDeferredCommit": true
                },
                "Processor": { "Count": resources.cpu_count }
            },
            "Devices": {
                "Scsi": {
                    "0": {
                        "Attachments": {
                            "0": {
                                "Path": scratch,
                                "Type": "VirtualDisk"
                            }
                        }
                    }
                },
                "HvSocket": {},
                "VirtualSmb": {
                    "Shares": [{
                        "Name": "os",
                        "Path": Path::new(&uvm_path).join("Files"),
                        "Options": {
                            "ReadOnly": true,
                            "PseudoOplocks": true,
                            "TakeBackupPrivilege": true,
                            "CacheIo": true,
                            "ShareRead": true
                        }
                    }]
                }
            }
        }
    }))
}

/// `hyperv.utilityVMPath`, falling back to `UtilityVM` under the base layer
fn utility_vm_image_path(spec: &Spec) -> Option<String> {
    let explicit = spec
        .windows
        .as_ref()
        .and_then(|w| w.hyperv.as_ref())
        .map(|h| h.utility_vm_path.clone())
        .filter(|p| !p.is_empty());
    explicit.or_else(|| {
        spec.read_only_layers()
            .last()
            .map(|base| Path::new(base).join("UtilityVM").to_string_lossy().into_owned())
    })
}

/// Merge `hcs.additional.v1.json` / `hcs.additional.v2.json` into `doc`
pub fn apply_additional_json(
    doc: &mut Value,
    options: &RuntimeOptions,
    version: SchemaVersion,
) -> Result<()> {
    let key = if version.is_v1() {
        options::HCS_ADDITIONAL_JSON_V1
    } else {
        options::HCS_ADDITIONAL_JSON_V2
    };
    let Some(raw) = options.get(key) else {
        return Ok(());
    };
    let extra: Value = serde_json::from_str(raw).map_err(|e| Error::InvalidOption {
        key: key.to_string(),
        reason: e.to_string(),
    })?;
    merge_json(doc, extra);
    Ok(())
}

/// Clear the terminate-on-last-handle-close flag in both document generations
///
/// For callers that exit after creating a system which must keep running.
/// Additional JSON already present in `options` is kept and wins over this.
pub fn keep_running_after_close(options: &mut RuntimeOptions) -> Result<()> {
    let overrides = [
        (options::HCS_ADDITIONAL_JSON_V1, "TerminateOnLastHandleClosed"),
        (options::HCS_ADDITIONAL_JSON_V2, "ShouldTerminateOnLastHandleClosed"),
    ];
    for (key, field) in overrides {
        let mut extra = json!({ field: false });
        if let Some(raw) = options.get(key) {
            let existing: Value = serde_json::from_str(raw).map_err(|e| Error::InvalidOption {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            merge_json(&mut extra, existing);
        }
        options.insert(key, extra.to_string());
    }
    Ok(())
}

/// Objects merge key by key; anything else in `extra` replaces the target
pub fn merge_json(target: &mut Value, extra: Value) {
    match (target, extra) {
        (Value::Object(target), Value::Object(extra)) => {
            for (k, v) in extra {
                match target.get_mut(&k) {
                    Some(existing) => merge_json(existing, v),
                    None => {
                        target.insert(k, v);
                    }
                }
            }
        }
        (target, extra) => *target = extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{HyperV, WindowsSpec, WindowsResources, MemoryResources, CpuResources};

    fn spec(hyperv: bool) -> Spec {
        Spec {
            hostname: Some("web".into()),
            windows: Some(WindowsSpec {
                layer_folders: vec![
                    r"C:\layers\app".into(),
                    r"C:\layers\base".into(),
                    r"C:\layers\scratch".into(),
                ],
                resources: Some(WindowsResources {
                    memory: Some(MemoryResources { limit: Some(1024 * MIB) }),
                    cpu: Some(CpuResources { count: Some(2) }),
                }),
                hyperv: hyperv.then(HyperV::default),
                ignore_flushes_during_boot: true,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_container_v1() {
        let doc = container_v1("c1", "docker", &spec(false));
        assert_eq!(doc["SystemType"], "Container");
        assert_eq!(doc["Name"], "c1");
        assert_eq!(doc["HostName"], "web");
        assert_eq!(doc["LayerFolderPath"], r"C:\layers\scratch");
        assert_eq!(doc["Layers"].as_array().unwrap().len(), 2);
        assert_eq!(doc["HvPartition"], false);
        assert_eq!(doc["IgnoreFlushesDuringBoot"], true);
        assert_eq!(doc["MemoryMaximumInMB"], 1024);
        assert_eq!(doc["ProcessorCount"], 2);
        assert!(doc.get("SchemaVersion").is_none());
    }

    #[test]
    fn test_layer_ids_are_stable() {
        let a = container_v1("a", "o", &spec(false));
        let b = container_v1("b", "o", &spec(true));
        assert_eq!(a["Layers"][0]["ID"], b["Layers"][0]["ID"]);
        assert_ne!(a["Layers"][0]["ID"], a["Layers"][1]["ID"]);
    }

    #[test]
    fn test_container_v2_hosted() {
        let doc = container_v2("docker", &spec(false), SchemaVersion::V21, Some("uvm-1"));
        assert_eq!(doc["SchemaVersion"]["Major"], 2);
        assert_eq!(doc["HostingSystemId"], "uvm-1");
        assert_eq!(doc["Container"]["Storage"]["Layers"][0]["PathType"], "AbsolutePath");
        assert_eq!(doc["Container"]["Memory"]["SizeInMB"], 1024);
        assert_eq!(doc["Container"]["GuestOs"]["HostName"], "web");

        let doc = container_v2("docker", &spec(false), SchemaVersion::V20, None);
        assert!(doc.get("HostingSystemId").is_none());
    }

    #[test]
    fn test_utility_vm_v2() {
        let resources = UvmResources { cpu_count: 2, memory_bytes: 1536 * MIB };
        let doc = utility_vm_v2("docker", &spec(true), SchemaVersion::V21, &resources).unwrap();
        let vm = &doc["VirtualMachine"];
        assert_eq!(vm["ComputeTopology"]["Memory"]["SizeInMB"], 1536);
        assert_eq!(vm["ComputeTopology"]["Processor"]["Count"], 2);
        let share = vm["Devices"]["VirtualSmb"]["Shares"][0]["Path"].as_str().unwrap();
        assert!(share.contains("UtilityVM"));
        assert!(vm["Devices"]["Scsi"]["0"]["Attachments"]["0"]["Path"]
            .as_str()
            .unwrap()
            .ends_with("sandbox.vhdx"));
    }

    #[test]
    fn test_utility_vm_requires_layers() {
        let resources = UvmResources { cpu_count: 1, memory_bytes: 1024 * MIB };
        assert!(utility_vm_v2("o", &Spec::default(), SchemaVersion::V21, &resources).is_err());
    }

    #[test]
    fn test_lcow_v1() {
        let lcow = LcowConfig {
            boot_parameters: "console=ttyS0".into(),
            ..Default::default()
        };
        let doc = lcow_v1("l1", "docker", &spec(false), &lcow);
        assert_eq!(doc["ContainerType"], "Linux");
        assert_eq!(doc["HvPartition"], true);
        assert_eq!(doc["HvRuntime"]["LinuxKernelFile"], "bootx64.efi");
        assert_eq!(doc["HvRuntime"]["LinuxBootParameters"], "console=ttyS0");
    }

    #[test]
    fn test_merge_json() {
        let mut doc = json!({ "A": { "B": 1, "C": 2 }, "D": [1] });
        merge_json(&mut doc, json!({ "A": { "C": 3, "E": 4 }, "D": [2, 3] }));
        assert_eq!(doc, json!({ "A": { "B": 1, "C": 3, "E": 4 }, "D": [2, 3] }));
    }

    #[test]
    fn test_additional_json_by_generation() {
        let options: RuntimeOptions = [
            (options::HCS_ADDITIONAL_JSON_V1, r#"{"Servicing": true}"#),
            (options::HCS_ADDITIONAL_JSON_V2, r#"{"Container": {"Networking": {"Namespace": "n1"}}}"#),
        ]
        .into_iter()
        .collect();

        let mut v1 = container_v1("c", "o", &spec(false));
        apply_additional_json(&mut v1, &options, SchemaVersion::V10).unwrap();
        assert_eq!(v1["Servicing"], true);

        let mut v2 = container_v2("o", &spec(false), SchemaVersion::V21, None);
        apply_additional_json(&mut v2, &options, SchemaVersion::V21).unwrap();
        assert_eq!(v2["Container"]["Networking"]["Namespace"], "n1");
        assert_eq!(v2["Container"]["Networking"]["AllowUnqualifiedDnsQuery"], true);
        assert!(v2.get("Servicing").is_none());
    }

    #[test]
    fn test_keep_running_after_close() {
        let mut options: RuntimeOptions =
            [(options::HCS_ADDITIONAL_JSON_V2, r#"{"Container": {"Networking": {"Namespace": "n1"}}}"#)]
                .into_iter()
                .collect();
        keep_running_after_close(&mut options).unwrap();

        let mut v1 = container_v1("c", "o", &spec(false));
        apply_additional_json(&mut v1, &options, SchemaVersion::V10).unwrap();
        assert_eq!(v1["TerminateOnLastHandleClosed"], false);

        let mut v2 = container_v2("o", &spec(false), SchemaVersion::V21, None);
        apply_additional_json(&mut v2, &options, SchemaVersion::V21).unwrap();
        assert_eq!(v2["ShouldTerminateOnLastHandleClosed"], false);
        assert_eq!(v2["Container"]["Networking"]["Namespace"], "n1");
    }

    #[test]
    fn test_additional_json_invalid() {
        let options: RuntimeOptions =
            [(options::HCS_ADDITIONAL_JSON_V2, "{not json")].into_iter().collect();
        let mut doc = json!({});
        let err = apply_additional_json(&mut doc, &options, SchemaVersion::V20).unwrap_err();
        assert!(err.is_validation());
    }
}
