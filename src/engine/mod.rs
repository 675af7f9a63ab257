//! Typed façade over the container engine (spec §4.1, §6).
//!
//! The engine surface is a trait rather than a concrete `bollard::Docker`
//! wrapper so the Image Coordinator and Lifecycle Controller can be driven
//! against a fake in tests (spec §8's testable properties require counting
//! and dedup-checking calls to `ImagePull`, `ImageRemove`, etc).

mod bollard_engine;
mod client;

pub use bollard_engine::BollardEngine;
pub use client::EngineClients;

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

/// Classification of engine errors (spec §4.1, §7).
#[derive(Debug, thiserror::Error, Clone)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("terminal: {0}")]
    Terminal(String),
}

impl EngineError {
    pub fn recoverable(&self) -> bool {
        matches!(self, EngineError::Transient(_) | EngineError::Conflict(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// One line-delimited status frame from a pull or load response.
#[derive(Debug, Clone, Default)]
pub struct PullStatusFrame {
    pub id: Option<String>,
    pub status: Option<String>,
    pub progress_current: Option<i64>,
    pub progress_total: Option<i64>,
    pub error: Option<String>,
}

pub type PullStream = Pin<Box<dyn Stream<Item = EngineResult<PullStatusFrame>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct ImageInspect {
    pub id: String,
    pub user: String,
    pub os: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerCreateSpec {
    pub name: String,
    pub image: String,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub entrypoint: Vec<String>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    pub exposed_ports: Vec<String>,
    pub tty: bool,
    pub host_config: HostConfigSpec,
}

#[derive(Debug, Clone, Default)]
pub struct HostConfigSpec {
    pub binds: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub port_bindings: HashMap<String, Vec<(String, String)>>,
    pub memory: Option<i64>,
    pub memory_reservation: Option<i64>,
    pub memory_swap: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub cpuset_cpus: Option<String>,
    pub pids_limit: Option<i64>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub devices: Vec<String>,
    pub network_mode: Option<String>,
    pub runtime: Option<String>,
    pub isolation: Option<String>,
    pub security_opt: Vec<String>,
    pub sysctls: HashMap<String, String>,
    pub ulimits: Vec<(String, i64, i64)>,
    pub privileged: bool,
    pub healthcheck_test: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub typ: MountKind,
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: i64,
    pub oom_killed: bool,
    pub error: Option<String>,
    pub started_at: Option<String>,
    /// Host pid of the container's init process; used to derive its
    /// network namespace path (`/proc/<pid>/ns/net`) for sandbox
    /// containers (spec §4.7 "Network sandbox lifecycle").
    pub pid: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub image_id: String,
    pub state: ContainerState,
    pub ip_addresses: HashMap<String, String>,
    pub network_mode: Option<String>,
    /// The container's effective STOPSIGNAL, inherited from the image
    /// unless overridden (spec §4.5 `Kill`).
    pub stop_signal: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ExecInspect {
    pub running: bool,
    pub exit_code: Option<i64>,
}

/// One demuxed chunk from an exec's attached output (spec §4.5 `Exec`
/// "capture stdout/stderr").
#[derive(Debug, Clone)]
pub enum ExecOutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

pub type ExecOutputStream = Pin<Box<dyn Stream<Item = EngineResult<ExecOutputChunk>> + Send>>;

/// One sample from a container's stats stream (spec §4.5 `Stats`).
#[derive(Debug, Clone, Default)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub cpu_percent: f64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

pub type StatsStream = Pin<Box<dyn Stream<Item = EngineResult<ResourceUsage>> + Send>>;

/// The exact surface spec §6 requires, and nothing else.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn image_pull(&self, image_ref: &str, auth: Option<&str>) -> EngineResult<PullStream>;
    async fn image_inspect(&self, image_ref: &str) -> EngineResult<ImageInspect>;
    async fn image_load(&self, archive_path: &std::path::Path) -> EngineResult<()>;
    async fn image_remove(&self, image_id: &str, force: bool) -> EngineResult<()>;

    async fn container_create(&self, spec: &ContainerCreateSpec) -> EngineResult<String>;
    async fn container_inspect(&self, id: &str) -> EngineResult<ContainerInspect>;
    async fn container_start(&self, id: &str) -> EngineResult<()>;
    async fn container_stop(&self, id: &str, timeout_secs: i64) -> EngineResult<()>;
    async fn container_kill(&self, id: &str, signal: &str) -> EngineResult<()>;
    async fn container_remove(&self, id: &str, force: bool, remove_volumes: bool) -> EngineResult<()>;
    async fn container_list(&self, all: bool, label_filter: &str) -> EngineResult<Vec<ContainerSummary>>;
    async fn container_by_name(&self, name: &str) -> EngineResult<Option<ContainerSummary>>;

    async fn container_wait(&self, id: &str) -> EngineResult<i64>;
    async fn container_stats(&self, id: &str) -> EngineResult<StatsStream>;

    async fn exec_create(&self, container_id: &str, spec: &ExecSpec) -> EngineResult<String>;
    async fn exec_start(&self, exec_id: &str) -> EngineResult<ExecOutputStream>;
    async fn exec_inspect(&self, exec_id: &str) -> EngineResult<ExecInspect>;
    async fn exec_resize(&self, exec_id: &str, width: u16, height: u16) -> EngineResult<()>;

    async fn server_version(&self) -> EngineResult<String>;
}
