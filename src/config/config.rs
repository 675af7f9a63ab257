//! Process-wide driver configuration (spec §3 "Driver Config").
//!
//! Loaded from TOML the way the teacher's `Configuration::load` does:
//! per-field `#[serde(default = "...")]` plus directory creation on load.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Everything the Container Builder and Lifecycle Controller consult that
/// is not part of a single task spec.
#[derive(Debug, Clone, Deserialize)]
pub struct DriverConfig {
    /// Engine endpoint, e.g. `unix:///var/run/docker.sock` or
    /// `tcp://host:2376`. `None` uses the platform default.
    #[serde(default)]
    pub docker_host: Option<String>,

    #[serde(default)]
    pub tls: TlsConfig,

    /// Whether tasks may request `privileged: true`.
    #[serde(default)]
    pub allow_privileged: bool,

    /// Capability allow-list consulted by the Container Builder. `"all"`
    /// disables the check entirely.
    #[serde(default = "default_allowed_capabilities")]
    pub allowed_capabilities: Vec<String>,

    #[serde(default)]
    pub volumes: VolumesConfig,

    #[serde(default)]
    pub image_gc: ImageGcConfig,

    /// Whether stopped task containers are force-removed once GC'd.
    #[serde(default = "default_true")]
    pub container_gc_enabled: bool,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Runtimes (`runc`, `nvidia`, ...) tasks may request.
    #[serde(default)]
    pub allowed_runtimes: Vec<String>,

    /// Runtime name used when a task requests an nvidia device.
    #[serde(default = "default_gpu_runtime")]
    pub gpu_runtime: String,

    /// Glob patterns matched against extra reserved-label candidates
    /// (job name, task name, ...).
    #[serde(default)]
    pub extra_labels: Vec<String>,

    /// Default activity timeout applied to a pull when the task doesn't
    /// specify one.
    #[serde(default = "default_pull_activity_timeout_secs")]
    pub pull_activity_timeout_secs: u64,

    /// Infra/pause-container image reference.
    #[serde(default = "default_infra_image")]
    pub infra_image: String,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Driver-wide pids limit cap; a task may only request a lower value.
    #[serde(default)]
    pub pids_limit: i64,

    /// Directory task sandboxes (alloc/local/secrets) are resolved under.
    #[serde(default = "default_task_root")]
    pub task_root: PathBuf,
}

impl DriverConfig {
    pub fn pull_activity_timeout(&self) -> Duration {
        Duration::from_secs(self.pull_activity_timeout_secs)
    }

    /// Load configuration from a TOML file, resolving `task_root` against
    /// the config file's directory and ensuring it exists.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = std::path::Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {path}"))?;

        let mut config: DriverConfig =
            toml::from_str(&content).with_context(|| "failed to parse driver configuration")?;

        let base_dir = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        if config.task_root.is_relative() {
            config.task_root = base_dir.join(&config.task_root);
        }
        std::fs::create_dir_all(&config.task_root)
            .with_context(|| format!("failed to create task root {}", config.task_root.display()))?;

        Ok(config)
    }
}

fn default_allowed_capabilities() -> Vec<String> {
    vec![
        "CHOWN", "DAC_OVERRIDE", "FSETID", "FOWNER", "MKNOD", "NET_RAW", "SETGID", "SETUID",
        "SETFCAP", "SETPCAP", "NET_BIND_SERVICE", "SYS_CHROOT", "KILL", "AUDIT_WRITE",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_gpu_runtime() -> String {
    "nvidia".into()
}

fn default_pull_activity_timeout_secs() -> u64 {
    2 * 60
}

fn default_infra_image() -> String {
    "registry.k8s.io/pause:3.9".into()
}

fn default_task_root() -> PathBuf {
    PathBuf::from(".driver/tasks")
}

/// TLS material shared by both engine clients.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_file: Option<String>,
    #[serde(default)]
    pub cert_file: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VolumesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub selinuxlabel: String,
}

impl Default for VolumesConfig {
    fn default() -> Self {
        Self { enabled: true, selinuxlabel: String::new() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageGcConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Delay before a zero-reference image is actually removed.
    #[serde(default = "default_image_delay_secs")]
    pub delay_secs: u64,
}

impl ImageGcConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

impl Default for ImageGcConfig {
    fn default() -> Self {
        Self { enabled: true, delay_secs: default_image_delay_secs() }
    }
}

fn default_image_delay_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_driver")]
    pub driver_type: String,
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { driver_type: default_log_driver(), config: HashMap::new() }
    }
}

fn default_log_driver() -> String {
    "json-file".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts against "container already exists" before giving up.
    #[serde(default = "default_container_exists_attempts")]
    pub container_exists_attempts: u32,
    /// Attempts against transient errors on create/start.
    #[serde(default = "default_transient_attempts")]
    pub transient_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            container_exists_attempts: default_container_exists_attempts(),
            transient_attempts: default_transient_attempts(),
        }
    }
}

fn default_container_exists_attempts() -> u32 {
    5
}

fn default_transient_attempts() -> u32 {
    5
}
