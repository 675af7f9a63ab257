//! Task Spec data model (spec §3 "Task Spec (input)").
//!
//! A plain data structure. Decoding it from the host's wire format is out
//! of scope (spec.md §1, §12); callers hand the Lifecycle Controller an
//! already-populated `TaskSpec`.

use std::collections::HashMap;

/// One task's full declarative description, as handed to `StartTask`.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    pub task_id: String,
    pub alloc_id: String,
    pub job_name: String,
    pub job_id: String,
    pub parent_job_id: String,
    pub task_group_name: String,
    pub task_name: String,
    pub namespace: String,
    pub node_name: String,
    pub node_id: String,

    pub user: Option<String>,

    pub resources: TaskResources,
    pub network: TaskNetwork,

    pub devices: Vec<String>,
    pub volumes: Vec<String>,
    pub mounts: Vec<TaskMount>,

    pub env: HashMap<String, String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: Option<String>,

    pub logging: LoggingSelector,

    pub image: String,
    pub image_pull_archive_path: Option<String>,
    pub auth: Option<AuthConfig>,
    pub force_pull: bool,
    pub pull_timeout_secs: Option<u64>,

    pub dns: Option<TaskDns>,

    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub sysctls: HashMap<String, String>,
    pub ulimits: Vec<Ulimit>,
    pub security_opt: Vec<String>,

    pub runtime: Option<String>,
    pub isolation: Option<String>,

    pub labels: HashMap<String, String>,
    pub healthcheck_disabled: bool,

    pub remove_container_on_exit: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TaskResources {
    pub cpu_shares: i64,
    pub cpu_hard_limit: bool,
    pub percent_ticks: f64,
    pub cpu_period: i64,
    pub memory_mb: i64,
    pub memory_max_mb: i64,
    pub cpuset_cpus: String,
    pub pids_limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TaskNetwork {
    /// Explicit network mode; empty means "let the Builder decide."
    pub mode: String,
    /// Group-allocated port list (spec §4.6 branch (a)).
    pub ports: Vec<PortMapping>,
    /// Legacy reserved/dynamic port lists (branch (b)).
    pub reserved_ports: Vec<PortMapping>,
    pub dynamic_ports: Vec<PortMapping>,
    /// Legacy label -> container-port remap (branch (b)).
    pub port_map: HashMap<String, u16>,
    /// Set when the allocation owns a network sandbox (a pause container)
    /// and this task should join it.
    pub pause_container_id: Option<String>,
    pub auto_advertise_non_default_networks: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PortMapping {
    pub label: String,
    pub host_ip: String,
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MountKind {
    #[default]
    Bind,
    Tmpfs,
    Volume,
}

#[derive(Debug, Clone, Default)]
pub struct TaskMount {
    pub source: String,
    pub target: String,
    pub kind: MountKind,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingSelector {
    pub stdout: String,
    pub stderr: String,
}

impl LoggingSelector {
    /// Whether log collection should run at all (spec §4.7 step 11).
    pub fn wants_collection(&self) -> bool {
        self.stdout != "/dev/null" && self.stderr != "/dev/null"
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

#[derive(Debug, Clone, Default)]
pub struct TaskDns {
    pub servers: Vec<String>,
    pub searches: Vec<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}
