//! Production `Engine` implementation backed by `bollard::Docker`.
//!
//! Grounded on the teacher's `environment/docker/{container,power,stats,
//! environment}.rs` and `docker/service.rs`: the same bollard option
//! structs, the same 404/409-to-classified-error matching, the same
//! `futures_util::StreamExt` pull-stream consumption, generalized from
//! "one container per struct instance" to "one client, many containers."

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as BollardConfig, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions};
use bollard::image::{CreateImageOptions, ImportImageOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::codec::{BytesCodec, FramedRead};

use super::{
    ContainerCreateSpec, ContainerInspect, ContainerState, ContainerSummary, Engine, EngineError,
    EngineResult, ExecInspect, ExecOutputChunk, ExecOutputStream, ExecSpec, ImageInspect, MountKind,
    PullStatusFrame, PullStream, ResourceUsage, StatsStream,
};

pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    pub fn connect(docker_host: Option<&str>, timeout: Duration) -> Self {
        let docker = match docker_host {
            Some(host) => Docker::connect_with_socket(host, timeout.as_secs(), bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .expect("failed to construct docker client");
        Self { docker }
    }

    pub fn connect_unbounded(docker_host: Option<&str>) -> Self {
        // bollard clients are not actually bound by a hard deadline on the
        // transport; the "infinity" distinction is enforced by callers never
        // wrapping these calls in a bounded select/timeout.
        Self::connect(docker_host, Duration::from_secs(0))
    }

    fn classify(err: bollard::errors::Error) -> EngineError {
        match &err {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                EngineError::NotFound(err.to_string())
            }
            bollard::errors::Error::DockerResponseServerError { status_code: 409, .. } => {
                EngineError::Conflict(err.to_string())
            }
            bollard::errors::Error::DockerResponseServerError { status_code: 500, .. } => {
                EngineError::Transient(err.to_string())
            }
            bollard::errors::Error::RequestTimeoutError => EngineError::Transient(err.to_string()),
            bollard::errors::Error::HyperResponseError { .. } => EngineError::Transient(err.to_string()),
            _ => EngineError::Terminal(err.to_string()),
        }
    }
}

#[async_trait]
impl Engine for BollardEngine {
    async fn image_pull(&self, image_ref: &str, _auth: Option<&str>) -> EngineResult<PullStream> {
        let (repo, tag) = split_image_ref(image_ref);
        let options = CreateImageOptions {
            from_image: repo,
            tag,
            ..Default::default()
        };

        let stream = self
            .docker
            .create_image(Some(options), None, None)
            .map(|item| {
                item.map(|info| PullStatusFrame {
                    id: info.id,
                    status: info.status,
                    progress_current: info.progress_detail.as_ref().and_then(|p| p.current),
                    progress_total: info.progress_detail.as_ref().and_then(|p| p.total),
                    error: info.error,
                })
                .map_err(BollardEngine::classify)
            });

        Ok(Box::pin(stream))
    }

    async fn image_inspect(&self, image_ref: &str) -> EngineResult<ImageInspect> {
        let inspect = self
            .docker
            .inspect_image(image_ref)
            .await
            .map_err(BollardEngine::classify)?;

        Ok(ImageInspect {
            id: inspect.id.unwrap_or_default(),
            user: inspect
                .config
                .and_then(|c| c.user)
                .unwrap_or_default(),
            os: inspect.os.unwrap_or_default(),
        })
    }

    async fn image_load(&self, archive_path: &Path) -> EngineResult<()> {
        let file = tokio::fs::File::open(archive_path)
            .await
            .map_err(|e| EngineError::Terminal(e.to_string()))?;
        let byte_stream = FramedRead::new(file, BytesCodec::new())
            .map_ok(|bytes| bytes.freeze())
            .map_err(|e| bollard::errors::Error::IOError { err: e });

        let mut stream = self
            .docker
            .import_image(ImportImageOptions { quiet: true }, hyper::Body::wrap_stream(byte_stream), None);

        while let Some(result) = stream.next().await {
            result.map_err(BollardEngine::classify)?;
        }
        Ok(())
    }

    async fn image_remove(&self, image_id: &str, force: bool) -> EngineResult<()> {
        match self
            .docker
            .remove_image(image_id, Some(bollard::image::RemoveImageOptions { force, ..Default::default() }), None)
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
            Err(e) => Err(BollardEngine::classify(e)),
        }
    }

    async fn container_create(&self, spec: &ContainerCreateSpec) -> EngineResult<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        for port in &spec.exposed_ports {
            exposed_ports.insert(port.clone(), HashMap::new());
        }

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for (port, bindings) in &spec.host_config.port_bindings {
            let value = bindings
                .iter()
                .map(|(host_ip, host_port)| PortBinding {
                    host_ip: Some(host_ip.clone()),
                    host_port: Some(host_port.clone()),
                })
                .collect();
            port_bindings.insert(port.clone(), Some(value));
        }

        let mounts: Vec<Mount> = spec
            .host_config
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.clone()),
                target: Some(m.target.clone()),
                typ: Some(match m.typ {
                    MountKind::Bind => MountTypeEnum::BIND,
                    MountKind::Volume => MountTypeEnum::VOLUME,
                    MountKind::Tmpfs => MountTypeEnum::TMPFS,
                }),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let host_config = HostConfig {
            binds: if spec.host_config.binds.is_empty() {
                None
            } else {
                Some(spec.host_config.binds.clone())
            },
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            memory: spec.host_config.memory,
            memory_reservation: spec.host_config.memory_reservation,
            memory_swap: spec.host_config.memory_swap,
            cpu_shares: spec.host_config.cpu_shares,
            cpu_quota: spec.host_config.cpu_quota,
            cpu_period: spec.host_config.cpu_period,
            cpuset_cpus: spec.host_config.cpuset_cpus.clone(),
            pids_limit: spec.host_config.pids_limit,
            cap_add: if spec.host_config.cap_add.is_empty() {
                None
            } else {
                Some(spec.host_config.cap_add.clone())
            },
            cap_drop: if spec.host_config.cap_drop.is_empty() {
                None
            } else {
                Some(spec.host_config.cap_drop.clone())
            },
            dns: if spec.host_config.dns.is_empty() {
                None
            } else {
                Some(spec.host_config.dns.clone())
            },
            dns_search: if spec.host_config.dns_search.is_empty() {
                None
            } else {
                Some(spec.host_config.dns_search.clone())
            },
            extra_hosts: if spec.host_config.extra_hosts.is_empty() {
                None
            } else {
                Some(spec.host_config.extra_hosts.clone())
            },
            devices: if spec.host_config.devices.is_empty() {
                None
            } else {
                Some(
                    spec.host_config
                        .devices
                        .iter()
                        .map(|d| bollard::models::DeviceMapping {
                            path_on_host: Some(d.clone()),
                            path_in_container: Some(d.clone()),
                            cgroup_permissions: Some("rwm".to_string()),
                        })
                        .collect(),
                )
            },
            network_mode: spec.host_config.network_mode.clone(),
            runtime: spec.host_config.runtime.clone(),
            security_opt: if spec.host_config.security_opt.is_empty() {
                None
            } else {
                Some(spec.host_config.security_opt.clone())
            },
            sysctls: if spec.host_config.sysctls.is_empty() {
                None
            } else {
                Some(spec.host_config.sysctls.clone())
            },
            ulimits: if spec.host_config.ulimits.is_empty() {
                None
            } else {
                Some(
                    spec.host_config
                        .ulimits
                        .iter()
                        .map(|(name, soft, hard)| bollard::models::ResourcesUlimits {
                            name: Some(name.clone()),
                            soft: Some(*soft),
                            hard: Some(*hard),
                        })
                        .collect(),
                )
            },
            privileged: Some(spec.host_config.privileged),
            ..Default::default()
        };

        let healthcheck = spec.host_config.healthcheck_test.as_ref().map(|test| bollard::models::HealthConfig {
            test: Some(test.clone()),
            ..Default::default()
        });

        let config = BollardConfig {
            hostname: spec.hostname.clone(),
            user: spec.user.clone(),
            env: Some(spec.env.clone()),
            cmd: Some(spec.cmd.clone()),
            entrypoint: if spec.entrypoint.is_empty() {
                None
            } else {
                Some(spec.entrypoint.clone())
            },
            image: Some(spec.image.clone()),
            working_dir: spec.working_dir.clone(),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            tty: Some(spec.tty),
            healthcheck,
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), config)
            .await
            .map(|r| r.id)
            .map_err(BollardEngine::classify)
    }

    async fn container_inspect(&self, id: &str) -> EngineResult<ContainerInspect> {
        let info = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(BollardEngine::classify)?;

        let state = info.state.unwrap_or_default();
        let network_settings = info.network_settings.unwrap_or_default();

        let mut ip_addresses = HashMap::new();
        if let Some(networks) = network_settings.networks {
            for (name, endpoint) in networks {
                if let Some(ip) = endpoint.ip_address.filter(|ip| !ip.is_empty()) {
                    ip_addresses.insert(name, ip);
                }
            }
        }

        Ok(ContainerInspect {
            id: info.id.unwrap_or_default(),
            name: info.name.unwrap_or_default(),
            image_id: info.image.unwrap_or_default(),
            state: ContainerState {
                running: state.running.unwrap_or(false),
                exit_code: state.exit_code.unwrap_or(0),
                oom_killed: state.oom_killed.unwrap_or(false),
                error: state.error.filter(|s| !s.is_empty()),
                started_at: state.started_at,
                pid: state.pid.unwrap_or(0),
            },
            ip_addresses,
            network_mode: info
                .host_config
                .and_then(|h| h.network_mode),
            stop_signal: info.config.and_then(|c| c.stop_signal),
        })
    }

    async fn container_start(&self, id: &str) -> EngineResult<()> {
        match self
            .docker
            .start_container(id, None::<bollard::container::StartContainerOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(BollardEngine::classify(e)),
        }
    }

    async fn container_stop(&self, id: &str, timeout_secs: i64) -> EngineResult<()> {
        let options = StopContainerOptions { t: timeout_secs };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(BollardEngine::classify(e)),
        }
    }

    async fn container_kill(&self, id: &str, signal: &str) -> EngineResult<()> {
        let options = KillContainerOptions { signal };
        match self.docker.kill_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
            Err(e) => Err(BollardEngine::classify(e)),
        }
    }

    async fn container_remove(&self, id: &str, force: bool, remove_volumes: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: remove_volumes,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(BollardEngine::classify(e)),
        }
    }

    async fn container_list(&self, all: bool, label_filter: &str) -> EngineResult<Vec<ContainerSummary>> {
        let mut filters = HashMap::new();
        if !label_filter.is_empty() {
            filters.insert("label".to_string(), vec![label_filter.to_string()]);
        }

        let options = ListContainersOptions {
            all,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(BollardEngine::classify)?;

        Ok(summaries
            .into_iter()
            .map(|s| ContainerSummary {
                id: s.id.unwrap_or_default(),
                names: s.names.unwrap_or_default(),
                labels: s.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn container_by_name(&self, name: &str) -> EngineResult<Option<ContainerSummary>> {
        let wanted = format!("/{name}");
        let containers = self.container_list(true, "").await?;
        Ok(containers
            .into_iter()
            .find(|c| c.names.iter().any(|n| n == &wanted || n == name)))
    }

    async fn container_wait(&self, id: &str) -> EngineResult<i64> {
        let options = WaitContainerOptions { condition: "not-running" };
        let mut stream = self.docker.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(e)) => Err(BollardEngine::classify(e)),
            None => Ok(0),
        }
    }

    async fn container_stats(&self, id: &str) -> EngineResult<StatsStream> {
        let options = StatsOptions { stream: true, one_shot: false };
        let stream = self.docker.stats(id, Some(options)).scan(
            (None::<u64>, None::<u64>),
            |(prev_cpu, prev_system), item| {
                let result = item.map_err(BollardEngine::classify).map(|docker_stats| {
                    let memory_bytes = docker_stats.memory_stats.usage.unwrap_or(0);
                    let memory_limit_bytes = docker_stats.memory_stats.limit.unwrap_or(0);

                    let current_cpu = docker_stats.cpu_stats.cpu_usage.total_usage;
                    let current_system = docker_stats.cpu_stats.system_cpu_usage.unwrap_or(0);
                    let cpu_percent = match (*prev_cpu, *prev_system) {
                        (Some(pc), Some(ps)) => {
                            let cpu_delta = current_cpu.saturating_sub(pc);
                            let system_delta = current_system.saturating_sub(ps);
                            let cpus = docker_stats.cpu_stats.online_cpus.unwrap_or(1) as f64;
                            if system_delta > 0 && cpu_delta > 0 {
                                (cpu_delta as f64 / system_delta as f64 * 100.0 * cpus).min(100.0 * cpus)
                            } else {
                                0.0
                            }
                        }
                        _ => 0.0,
                    };
                    *prev_cpu = Some(current_cpu);
                    *prev_system = Some(current_system);

                    let (rx_bytes, tx_bytes) = docker_stats.networks.unwrap_or_default().values().fold(
                        (0u64, 0u64),
                        |(rx, tx), net| (rx + net.rx_bytes, tx + net.tx_bytes),
                    );

                    ResourceUsage { memory_bytes, memory_limit_bytes, cpu_percent, rx_bytes, tx_bytes }
                });
                futures_util::future::ready(Some(result))
            },
        );

        Ok(Box::pin(stream))
    }

    async fn exec_create(&self, container_id: &str, spec: &ExecSpec) -> EngineResult<String> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(spec.attach_stdout),
            attach_stderr: Some(spec.attach_stderr),
            tty: Some(spec.tty),
            ..Default::default()
        };

        self.docker
            .create_exec(container_id, options)
            .await
            .map(|r| r.id)
            .map_err(BollardEngine::classify)
    }

    /// Attaches and demuxes the exec's output stream so `TaskHandle::exec`
    /// can capture stdout/stderr (spec §4.5) instead of discarding it.
    async fn exec_start(&self, exec_id: &str) -> EngineResult<ExecOutputStream> {
        match self.docker.start_exec(exec_id, None).await.map_err(BollardEngine::classify)? {
            bollard::exec::StartExecResults::Attached { output, .. } => {
                let mapped = output.map(|item| {
                    item.map_err(BollardEngine::classify).map(|log| match log {
                        bollard::container::LogOutput::StdOut { message } => ExecOutputChunk::Stdout(message.to_vec()),
                        bollard::container::LogOutput::StdErr { message } => ExecOutputChunk::Stderr(message.to_vec()),
                        bollard::container::LogOutput::StdIn { message } => ExecOutputChunk::Stdout(message.to_vec()),
                        bollard::container::LogOutput::Console { message } => ExecOutputChunk::Stdout(message.to_vec()),
                    })
                });
                Ok(Box::pin(mapped))
            }
            bollard::exec::StartExecResults::Detached => Ok(Box::pin(futures_util::stream::empty())),
        }
    }

    async fn exec_inspect(&self, exec_id: &str) -> EngineResult<ExecInspect> {
        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .map_err(BollardEngine::classify)?;

        Ok(ExecInspect {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }

    async fn exec_resize(&self, exec_id: &str, width: u16, height: u16) -> EngineResult<()> {
        self.docker
            .resize_exec(exec_id, ResizeExecOptions { height, width })
            .await
            .map_err(BollardEngine::classify)
    }

    async fn server_version(&self) -> EngineResult<String> {
        self.docker
            .version()
            .await
            .map(|v| v.api_version.unwrap_or_default())
            .map_err(BollardEngine::classify)
    }
}

/// Split an image reference into `(repository, tag)`, the way
/// `bollard::image::CreateImageOptions` wants it.
fn split_image_ref(image_ref: &str) -> (&str, &str) {
    if let Some(at) = image_ref.rfind('@') {
        return (&image_ref[..at], &image_ref[at + 1..]);
    }
    match image_ref.rfind(':') {
        // Guard against a port number in a registry host, e.g. `host:5000/repo`.
        Some(idx) if !image_ref[idx + 1..].contains('/') => (&image_ref[..idx], &image_ref[idx + 1..]),
        _ => (image_ref, "latest"),
    }
}
