//! Container Builder (spec §4.6): pure function from `(task spec, driver
//! config, resolved image id)` to engine create-parameters.
//!
//! Generalizes the teacher's `environment/docker/container.rs::create_container`
//! (which built one hardcoded `bollard::container::Config`/`HostConfig` pair
//! per server) into a function that derives every field from a `TaskSpec`
//! instead of from a fixed server shape, and its `dropped_capabilities()`
//! allow/deny split into an explicit allow-list check (spec §4.6
//! "Capabilities").

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::DriverConfig;
use crate::engine::{ContainerCreateSpec, HostConfigSpec, MountKind as EngineMountKind, MountSpec};
use crate::error::{DriverError, DriverResult};

use super::spec::{MountKind, TaskMount, TaskSpec};

pub const ALLOC_ID_LABEL: &str = "com.hashicorp.nomad.alloc_id";
pub const JOB_NAME_LABEL: &str = "com.hashicorp.nomad.job_name";
pub const JOB_ID_LABEL: &str = "com.hashicorp.nomad.job_id";
pub const PARENT_JOB_ID_LABEL: &str = "com.hashicorp.nomad.parent_job_id";
pub const TASK_GROUP_NAME_LABEL: &str = "com.hashicorp.nomad.task_group_name";
pub const TASK_NAME_LABEL: &str = "com.hashicorp.nomad.task_name";
pub const NAMESPACE_LABEL: &str = "com.hashicorp.nomad.namespace";
pub const NODE_NAME_LABEL: &str = "com.hashicorp.nomad.node_name";
pub const NODE_ID_LABEL: &str = "com.hashicorp.nomad.node_id";

const CONTAINER_ALLOC_DIR: &str = "/alloc";
const CONTAINER_LOCAL_DIR: &str = "/local";
const CONTAINER_SECRETS_DIR: &str = "/secrets";

const MIN_CPU_PERIOD: i64 = 1;
const MAX_CPU_PERIOD: i64 = 1_000_000;
const DEFAULT_CPU_PERIOD: i64 = 100_000;

pub struct ContainerBuilder;

impl ContainerBuilder {
    /// Task-local sandbox directory a given task's binds and relative
    /// volume sources are resolved against.
    pub fn task_dir(config: &DriverConfig, spec: &TaskSpec) -> PathBuf {
        config.task_root.join(&spec.task_id)
    }

    pub fn build(spec: &TaskSpec, config: &DriverConfig, image_id: &str) -> DriverResult<ContainerCreateSpec> {
        validate_image(&spec.image)?;
        let command = validate_command(spec.command.as_deref())?;

        let task_dir = Self::task_dir(config, spec);
        let mut host = HostConfigSpec::default();

        apply_resources(spec, config, &mut host)?;
        apply_binds(spec, config, &task_dir, &mut host)?;
        apply_mounts(spec, config, &task_dir, &mut host)?;
        apply_capabilities(spec, config, &mut host)?;
        apply_sysctls_and_ulimits(spec, &mut host);
        apply_runtime_and_isolation(spec, config, &mut host)?;

        let mut exposed_ports = Vec::new();
        apply_networking(spec, &mut host, &mut exposed_ports)?;
        apply_dns(spec, &mut host);
        apply_etc_hosts(spec, &task_dir, &mut host);

        if spec.healthcheck_disabled {
            host.healthcheck_test = Some(vec!["NONE".to_string()]);
        }

        let mut cmd = Vec::new();
        if let Some(command) = command {
            cmd.push(command);
        }
        cmd.extend(spec.args.iter().cloned());

        let labels = build_labels(spec, config)?;
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        Ok(ContainerCreateSpec {
            name: container_name(spec),
            image: image_id.to_string(),
            hostname: None,
            user: spec.user.clone(),
            env,
            cmd,
            entrypoint: spec.entrypoint.clone(),
            working_dir: spec.working_dir.clone(),
            labels,
            exposed_ports,
            tty: false,
            host_config: host,
        })
    }
}

fn validate_image(image: &str) -> DriverResult<()> {
    if image.trim().is_empty() {
        return Err(DriverError::Validation("image reference must not be empty".into()));
    }
    Ok(())
}

/// Command, if present, must be a single non-empty token with no
/// surrounding whitespace (spec §4.6 "Command/args/entrypoint").
fn validate_command(command: Option<&str>) -> DriverResult<Option<String>> {
    let Some(command) = command else { return Ok(None) };
    if command.is_empty() || command != command.trim() || command.split_whitespace().count() > 1 {
        return Err(DriverError::Validation(format!("invalid command {command:?}: must be a single token")));
    }
    Ok(Some(command.to_string()))
}

fn apply_resources(spec: &TaskSpec, config: &DriverConfig, host: &mut HostConfigSpec) -> DriverResult<()> {
    let r = &spec.resources;

    let memory_mb = r.memory_mb.max(0);
    let memory_max_mb = r.memory_max_mb.max(0);
    let hard_limit_mb = memory_max_mb.max(memory_mb);

    if hard_limit_mb > 0 {
        let hard_bytes = hard_limit_mb * 1024 * 1024;
        host.memory = Some(hard_bytes);
        // A real hard cap (memory_max_mb) makes memory_mb the soft
        // reservation; without one, the task memory IS the hard cap and
        // soft stays zero (spec §4.6 "Resource limits").
        host.memory_reservation = Some(if memory_max_mb > 0 { memory_mb * 1024 * 1024 } else { 0 });
        #[cfg(not(target_os = "windows"))]
        {
            host.memory_swap = Some(hard_bytes);
        }
    } else {
        host.memory = None;
        host.memory_reservation = Some(0);
    }

    host.cpu_shares = if r.cpu_shares > 0 { Some(r.cpu_shares) } else { None };

    if r.cpu_hard_limit {
        let period = if r.cpu_period <= 0 { DEFAULT_CPU_PERIOD } else { r.cpu_period };
        if !(MIN_CPU_PERIOD..=MAX_CPU_PERIOD).contains(&period) {
            return Err(DriverError::Validation(format!(
                "cpu_period {period} outside allowed range ({MIN_CPU_PERIOD}, {MAX_CPU_PERIOD}]"
            )));
        }
        let num_cores = num_cpus();
        let quota = (r.percent_ticks * period as f64 * num_cores as f64) as i64;
        host.cpu_period = Some(period);
        host.cpu_quota = Some(quota);
    }

    host.cpuset_cpus = if r.cpuset_cpus.is_empty() { None } else { Some(r.cpuset_cpus.clone()) };

    let task_pids = r.pids_limit.max(0);
    let driver_pids = config.pids_limit.max(0);
    if task_pids > 0 && driver_pids > 0 && task_pids > driver_pids {
        return Err(DriverError::Validation(format!(
            "pids_limit cannot be greater than nomad plugin config pids_limit ({driver_pids})"
        )));
    }
    host.pids_limit = match (task_pids, driver_pids) {
        (0, 0) => None,
        (0, d) => Some(d),
        (t, _) => Some(t),
    };

    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn apply_binds(spec: &TaskSpec, config: &DriverConfig, task_dir: &Path, host: &mut HostConfigSpec) -> DriverResult<()> {
    let alloc_dir = task_dir.join("alloc");
    let local_dir = task_dir.join("local");
    let secrets_dir = task_dir.join("secrets");

    host.binds.push(format!("{}:{}", alloc_dir.display(), CONTAINER_ALLOC_DIR));
    host.binds.push(format!("{}:{}", local_dir.display(), CONTAINER_LOCAL_DIR));
    host.binds.push(format!("{}:{}", secrets_dir.display(), CONTAINER_SECRETS_DIR));

    for raw in &spec.volumes {
        let (source, dest, mode) = parse_volume_spec(raw)?;
        let resolved_source = resolve_bind_source(config, task_dir, &source)?;

        let mut bind = format!("{}:{}", resolved_source.display(), dest);
        if let Some(mode) = mode {
            bind.push(':');
            bind.push_str(&mode);
        }
        host.binds.push(bind);
    }

    Ok(())
}

/// Parses a `source:dest[:mode]` user volume entry.
fn parse_volume_spec(raw: &str) -> DriverResult<(String, String, Option<String>)> {
    let parts: Vec<&str> = raw.splitn(3, ':').collect();
    match parts.as_slice() {
        [source, dest] => Ok((source.to_string(), dest.to_string(), None)),
        [source, dest, mode] => Ok((source.to_string(), dest.to_string(), Some(mode.to_string()))),
        _ => Err(DriverError::Validation(format!("malformed volume spec {raw:?}"))),
    }
}

/// Resolves a bind source against the task sandbox when it is a relative
/// path, and rejects binds escaping the sandbox unless volumes are
/// enabled (spec §4.6 "Volumes/binds").
fn resolve_bind_source(config: &DriverConfig, task_dir: &Path, source: &str) -> DriverResult<PathBuf> {
    let path = Path::new(source);
    let resolved = if path.is_absolute() { path.to_path_buf() } else { task_dir.join(path) };

    if !config.volumes.enabled && !is_descendant(&resolved, task_dir) {
        return Err(DriverError::Validation(format!(
            "volumes are not enabled: bind source {} is outside the allocation directory",
            resolved.display()
        )));
    }

    Ok(resolved)
}

fn is_descendant(path: &Path, ancestor: &Path) -> bool {
    let normalized = normalize_lexically(path);
    let ancestor = normalize_lexically(ancestor);
    normalized.starts_with(&ancestor)
}

/// Lexical `..`/`.` collapse; these paths need not exist on disk yet.
fn normalize_lexically(path: &Path) -> PathBuf {
    use std::path::Component;
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn apply_mounts(spec: &TaskSpec, config: &DriverConfig, task_dir: &Path, host: &mut HostConfigSpec) -> DriverResult<()> {
    for mount in &spec.mounts {
        let engine_mount = build_typed_mount(mount, config, task_dir)?;
        host.mounts.push(engine_mount);
    }
    Ok(())
}

fn build_typed_mount(mount: &TaskMount, config: &DriverConfig, task_dir: &Path) -> DriverResult<MountSpec> {
    match mount.kind {
        MountKind::Tmpfs => Ok(MountSpec {
            source: String::new(),
            target: mount.target.clone(),
            typ: EngineMountKind::Tmpfs,
            read_only: mount.read_only,
        }),
        MountKind::Volume => {
            if !config.volumes.enabled {
                return Err(DriverError::Validation("volumes are not enabled: volume mount requested".into()));
            }
            Ok(MountSpec { source: mount.source.clone(), target: mount.target.clone(), typ: EngineMountKind::Volume, read_only: mount.read_only })
        }
        MountKind::Bind => {
            let resolved = resolve_bind_source(config, task_dir, &mount.source)?;
            Ok(MountSpec {
                source: resolved.display().to_string(),
                target: mount.target.clone(),
                typ: EngineMountKind::Bind,
                read_only: mount.read_only,
            })
        }
    }
}

fn apply_capabilities(spec: &TaskSpec, config: &DriverConfig, host: &mut HostConfigSpec) -> DriverResult<()> {
    let allow_all = config.allowed_capabilities.iter().any(|c| c.eq_ignore_ascii_case("all"));

    if !allow_all {
        let allowed: std::collections::HashSet<String> =
            config.allowed_capabilities.iter().map(|c| c.to_ascii_uppercase()).collect();

        let offending: Vec<&str> = spec
            .cap_add
            .iter()
            .map(|c| c.as_str())
            .filter(|c| !allowed.contains(&c.to_ascii_uppercase()))
            .collect();

        if !offending.is_empty() {
            return Err(DriverError::Validation(format!(
                "capabilities not in driver allow-list: {}",
                offending.join(", ")
            )));
        }
    }

    host.cap_add = spec.cap_add.clone();
    host.cap_drop = spec.cap_drop.clone();
    host.security_opt = spec.security_opt.clone();
    Ok(())
}

fn apply_sysctls_and_ulimits(spec: &TaskSpec, host: &mut HostConfigSpec) {
    host.sysctls = spec.sysctls.clone();
    host.ulimits = spec.ulimits.iter().map(|u| (u.name.clone(), u.soft, u.hard)).collect();
    host.devices = spec.devices.clone();
}

fn apply_runtime_and_isolation(spec: &TaskSpec, config: &DriverConfig, host: &mut HostConfigSpec) -> DriverResult<()> {
    let wants_gpu = spec.devices.iter().any(|d| d.to_ascii_lowercase().contains("nvidia"));

    if wants_gpu && config.gpu_runtime.is_empty() {
        return Err(DriverError::Validation("task requests an nvidia device but no gpu runtime is configured".into()));
    }

    if let Some(runtime) = &spec.runtime {
        if wants_gpu && runtime != &config.gpu_runtime {
            return Err(DriverError::Validation(format!(
                "task runtime {runtime:?} conflicts with configured gpu runtime {:?}",
                config.gpu_runtime
            )));
        }
        if !config.allowed_runtimes.iter().any(|r| r == runtime) {
            return Err(DriverError::Validation(format!("runtime {runtime:?} is not in the driver's allowed runtimes")));
        }
        host.runtime = Some(runtime.clone());
    } else if wants_gpu {
        host.runtime = Some(config.gpu_runtime.clone());
    }

    if let Some(isolation) = &spec.isolation {
        #[cfg(target_os = "windows")]
        {
            if isolation != "process" && isolation != "hyperv" {
                return Err(DriverError::Validation(format!("invalid isolation mode {isolation:?}")));
            }
            host.isolation = Some(isolation.clone());
        }
        #[cfg(not(target_os = "windows"))]
        {
            if !isolation.is_empty() {
                return Err(DriverError::Validation("isolation is a Windows-only setting".into()));
            }
        }
    }
    #[cfg(target_os = "windows")]
    {
        if spec.isolation.is_none() {
            host.isolation = Some("hyperv".to_string());
        }
    }

    Ok(())
}

fn apply_networking(spec: &TaskSpec, host: &mut HostConfigSpec, exposed_ports: &mut Vec<String>) -> DriverResult<()> {
    let net = &spec.network;

    let network_mode = if !net.mode.is_empty() {
        Some(net.mode.clone())
    } else if let Some(pause_id) = &net.pause_container_id {
        Some(format!("container:{pause_id}"))
    } else {
        None
    };
    let joined_sandbox = matches!(&network_mode, Some(m) if m.starts_with("container:"));
    host.network_mode = network_mode;

    if !net.ports.is_empty() {
        if !joined_sandbox {
            for port in &net.ports {
                bind_port(host, exposed_ports, &port.host_ip, port.host_port, port.container_port);
            }
        }
        // joined to a sibling container network: bindings are owned by the sandbox (no-op).
    } else if !net.reserved_ports.is_empty() || !net.dynamic_ports.is_empty() {
        for port in net.reserved_ports.iter().chain(net.dynamic_ports.iter()) {
            let container_port = net.port_map.get(&port.label).copied().unwrap_or(port.container_port);
            bind_port(host, exposed_ports, &port.host_ip, port.host_port, container_port);
        }
    } else if !net.port_map.is_empty() {
        return Err(DriverError::Validation("port_map specified without a network".into()));
    }

    Ok(())
}

fn bind_port(host: &mut HostConfigSpec, exposed_ports: &mut Vec<String>, host_ip: &str, host_port: u16, container_port: u16) {
    for proto in ["tcp", "udp"] {
        let key = format!("{container_port}/{proto}");
        exposed_ports.push(key.clone());
        host.port_bindings
            .entry(key)
            .or_default()
            .push((host_ip.to_string(), host_port.to_string()));
    }
}

/// Task-level DNS overrides driver DNS fields; the options list is
/// consulted by the host's generated resolv.conf, not the engine API.
fn apply_dns(spec: &TaskSpec, host: &mut HostConfigSpec) {
    if let Some(dns) = &spec.dns {
        host.dns = dns.servers.clone();
        host.dns_search = dns.searches.clone();
    }
}

/// Synthesizes an `/etc/hosts` bind when the task is in a Nomad-owned
/// sandbox with no explicit network mode, and clears `extra_hosts` to
/// avoid conflicting with it (spec §4.6 "/etc/hosts").
fn apply_etc_hosts(spec: &TaskSpec, task_dir: &Path, host: &mut HostConfigSpec) {
    let in_sandbox = spec.network.mode.is_empty() && spec.network.pause_container_id.is_some();
    if in_sandbox {
        let hosts_file = task_dir.join("alloc").join("hosts");
        host.binds.push(format!("{}:/etc/hosts", hosts_file.display()));
        host.extra_hosts.clear();
    }
}

fn build_labels(spec: &TaskSpec, config: &DriverConfig) -> DriverResult<HashMap<String, String>> {
    if spec.labels.contains_key(ALLOC_ID_LABEL) {
        return Err(DriverError::Validation(format!("user labels may not override reserved label {ALLOC_ID_LABEL}")));
    }

    let mut labels = spec.labels.clone();
    labels.insert(ALLOC_ID_LABEL.to_string(), spec.alloc_id.clone());

    let candidates = [
        (JOB_NAME_LABEL, &spec.job_name),
        (JOB_ID_LABEL, &spec.job_id),
        (PARENT_JOB_ID_LABEL, &spec.parent_job_id),
        (TASK_GROUP_NAME_LABEL, &spec.task_group_name),
        (TASK_NAME_LABEL, &spec.task_name),
        (NAMESPACE_LABEL, &spec.namespace),
        (NODE_NAME_LABEL, &spec.node_name),
        (NODE_ID_LABEL, &spec.node_id),
    ];

    for (label, value) in candidates {
        if config.extra_labels.iter().any(|pattern| glob_match(pattern, label)) {
            labels.insert(label.to_string(), value.clone());
        }
    }

    Ok(labels)
}

fn glob_match(pattern: &str, candidate: &str) -> bool {
    glob::Pattern::new(pattern).map(|p| p.matches(candidate)).unwrap_or(false)
}

fn container_name(spec: &TaskSpec) -> String {
    format!("{}-{}", spec.task_name.replace('/', "_"), spec.alloc_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::task::spec::{PortMapping, TaskNetwork, TaskResources};

    fn base_config() -> DriverConfig {
        toml::from_str("").unwrap()
    }

    fn base_spec() -> TaskSpec {
        TaskSpec {
            task_id: "t1".into(),
            alloc_id: "alloc1".into(),
            task_name: "demo".into(),
            image: "busybox:latest".into(),
            remove_container_on_exit: true,
            ..Default::default()
        }
    }

    #[test]
    fn container_name_replaces_slashes_and_appends_alloc() {
        let mut spec = base_spec();
        spec.task_name = "group/task".into();
        assert_eq!(container_name(&spec), "group_task-alloc1");
    }

    #[test]
    fn reserved_label_is_always_present_and_not_overridable() {
        let config = base_config();
        let spec = base_spec();
        let created = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap();
        assert_eq!(created.labels.get(ALLOC_ID_LABEL), Some(&"alloc1".to_string()));

        let mut overriding = base_spec();
        overriding.labels.insert(ALLOC_ID_LABEL.to_string(), "bogus".into());
        let err = ContainerBuilder::build(&overriding, &config, "sha256:abc").unwrap_err();
        assert!(!err.recoverable());
    }

    #[test]
    fn scenario_e_volume_policy_disabled_rejects_absolute_outside_bind() {
        let mut config = base_config();
        config.volumes.enabled = false;
        let mut spec = base_spec();
        spec.volumes = vec!["/abs/path:/c".into()];

        let err = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap_err();
        match err {
            DriverError::Validation(msg) => assert!(msg.contains("volumes are not enabled")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn scenario_e_volume_policy_disabled_allows_relative_bind_inside_sandbox() {
        let mut config = base_config();
        config.volumes.enabled = false;
        let mut spec = base_spec();
        spec.volumes = vec!["./rel:/c".into()];

        let created = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap();
        let task_dir = ContainerBuilder::task_dir(&config, &spec);
        let expected_source = task_dir.join("rel");
        assert!(created
            .host_config
            .binds
            .iter()
            .any(|b| b.starts_with(&format!("{}:/c", expected_source.display()))));
    }

    #[test]
    fn scenario_f_pids_limit_override_rejects_larger_task_value() {
        let mut config = base_config();
        config.pids_limit = 5;
        let mut spec = base_spec();
        spec.resources.pids_limit = 7;

        let err = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap_err();
        match err {
            DriverError::Validation(msg) => assert!(msg.contains("pids_limit cannot be greater")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn scenario_f_pids_limit_override_accepts_smaller_task_value() {
        let mut config = base_config();
        config.pids_limit = 5;
        let mut spec = base_spec();
        spec.resources.pids_limit = 3;

        let created = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap();
        assert_eq!(created.host_config.pids_limit, Some(3));
    }

    #[test]
    fn capabilities_outside_allow_list_are_rejected() {
        let config = base_config();
        let mut spec = base_spec();
        spec.cap_add = vec!["SYS_ADMIN".into()];

        let err = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap_err();
        match err {
            DriverError::Validation(msg) => assert!(msg.contains("SYS_ADMIN")),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn port_map_without_network_is_an_error() {
        let config = base_config();
        let mut spec = base_spec();
        spec.network = TaskNetwork { port_map: HashMap::from([("web".to_string(), 8080)]), ..Default::default() };

        let err = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap_err();
        assert!(!err.recoverable());
    }

    #[test]
    fn group_allocated_ports_bind_tcp_and_udp() {
        let config = base_config();
        let mut spec = base_spec();
        spec.network = TaskNetwork {
            ports: vec![PortMapping { label: "web".into(), host_ip: "0.0.0.0".into(), host_port: 8080, container_port: 80 }],
            ..Default::default()
        };

        let created = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap();
        assert!(created.host_config.port_bindings.contains_key("80/tcp"));
        assert!(created.host_config.port_bindings.contains_key("80/udp"));
    }

    #[test]
    fn command_must_be_a_single_token() {
        assert!(validate_command(Some("sh -c foo")).is_err());
        assert!(validate_command(Some(" sh")).is_err());
        assert_eq!(validate_command(Some("sh")).unwrap(), Some("sh".to_string()));
    }

    #[test]
    fn healthcheck_disabled_injects_none_test() {
        let config = base_config();
        let mut spec = base_spec();
        spec.healthcheck_disabled = true;

        let created = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap();
        assert_eq!(created.host_config.healthcheck_test, Some(vec!["NONE".to_string()]));
    }

    #[test]
    fn resources_hard_limit_uses_larger_of_memory_and_memory_max() {
        let config = base_config();
        let mut spec = base_spec();
        spec.resources = TaskResources { memory_mb: 128, memory_max_mb: 256, ..Default::default() };

        let created = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap();
        assert_eq!(created.host_config.memory, Some(256 * 1024 * 1024));
        assert_eq!(created.host_config.memory_reservation, Some(128 * 1024 * 1024));
    }

    #[test]
    fn resources_without_a_hard_cap_use_memory_mb_as_the_limit_and_zero_soft() {
        let config = base_config();
        let mut spec = base_spec();
        spec.resources = TaskResources { memory_mb: 128, ..Default::default() };

        let created = ContainerBuilder::build(&spec, &config, "sha256:abc").unwrap();
        assert_eq!(created.host_config.memory, Some(128 * 1024 * 1024));
        assert_eq!(created.host_config.memory_reservation, Some(0));
    }
}
