//! Lifecycle Controller (spec §4.7): composes the Engine Client pair, the
//! Image Coordinator, the Task Store, and the Pause Registry behind the
//! driver-plugin surface (spec §6).
//!
//! Generalizes the teacher's `server/manager.rs` + `routes/servers.rs`
//! orchestration (look server up in the `Manager`, delegate to its
//! `ProcessEnvironment`) into the host-facing operations a container
//! task driver exposes, plus the create/start retry rules and image
//! bookkeeping spec.md §4.7 spells out in detail.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::engine::{ContainerCreateSpec, ContainerInspect, Engine, EngineClients, EngineError, HostConfigSpec, StatsStream};
use crate::error::{DriverError, DriverResult};
use crate::image::ImageCoordinator;
use crate::network::PauseRegistry;
use crate::task::{
    ContainerBuilder, ExecResult, ExecStreamingOptions, ExitResult, NetworkMetadata, TaskHandle, TaskHandleBlob,
    TaskSpec, TaskStore, ALLOC_ID_LABEL,
};

/// Everything `CreateNetwork` hands back to the host (spec §4.7 "Network
/// sandbox lifecycle").
#[derive(Debug, Clone)]
pub struct NetworkSandbox {
    pub container_id: String,
    pub namespace_path: String,
    pub labels: HashMap<String, String>,
}

pub struct LifecycleController {
    short: Arc<dyn Engine>,
    infinity: Arc<dyn Engine>,
    images: Arc<ImageCoordinator>,
    store: Arc<TaskStore>,
    pause: Arc<PauseRegistry>,
    config: Arc<DriverConfig>,
}

impl LifecycleController {
    /// Resolves the engine-client pair eagerly through the once-guarded
    /// holder (spec §9 "Global engine client": a once-initialized holder,
    /// not an unsynchronized global), since the Image Coordinator and
    /// every Task Handle need a concrete `Arc<dyn Engine>` up front.
    pub async fn new(config: DriverConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let engines = EngineClients::new(config.docker_host.clone());
        let short = engines.short().await;
        let infinity = engines.infinity().await;

        match short.server_version().await {
            Ok(version) => info!(engine_version = %version, "connected to container engine"),
            Err(e) => warn!(error = %e, "failed to read container engine version"),
        }

        Self::from_engine_pair(short, infinity, config)
    }

    fn from_engine_pair(short: Arc<dyn Engine>, infinity: Arc<dyn Engine>, config: Arc<DriverConfig>) -> Arc<Self> {
        let images = ImageCoordinator::new(short.clone(), config.image_gc.enabled, config.image_gc.delay());

        Arc::new(Self {
            short,
            infinity,
            images,
            store: Arc::new(TaskStore::new()),
            pause: Arc::new(PauseRegistry::new()),
            config,
        })
    }

    /// Rebuilds the pause-container registry by scanning the engine for
    /// the reserved label (spec §3, §4.7, §11 supplemented reconciliation
    /// sweep). Callers invoke this once at startup.
    pub async fn reconcile(&self) -> DriverResult<usize> {
        self.pause.reconcile(self.short.as_ref()).await.map_err(DriverError::from)
    }

    pub async fn start_task(self: &Arc<Self>, mut spec: TaskSpec) -> DriverResult<Arc<TaskHandle>> {
        if self.store.contains(&spec.task_id) {
            return Err(DriverError::AlreadyExists(spec.task_id.clone()));
        }
        if spec.image.trim().is_empty() {
            return Err(DriverError::Validation("task image must not be empty".into()));
        }
        spec.image = normalize_image_ref(&spec.image);

        let image_user = self.create_image(&spec).await?;

        #[cfg(target_os = "windows")]
        {
            validate_windows_image_user(&image_user, &spec, &self.config)?;
            rewrite_lcow_alloc_paths(&mut spec, &image_user);
        }

        let create_spec = ContainerBuilder::build(&spec, &self.config, &image_user.image_id)?;

        let container_id = self.create_container(&spec, &create_spec).await?;
        self.start_container(&container_id).await?;

        let short = self.short.clone();
        let inspect = short.container_inspect(&container_id).await.map_err(DriverError::from)?;

        let network = NetworkMetadata {
            ip: advertisable_ip(&inspect),
            port_map: spec.network.port_map.clone(),
            auto_advertise: spec.network.auto_advertise_non_default_networks,
        };

        // The sidecar process itself is out of scope (spec §1, §12); the
        // handle is always installed with no sidecar to stop on exit, but
        // we still honor the gate so the decision shows up in logs.
        if spec.logging.wants_collection() {
            debug!(task_id = %spec.task_id, "log collection requested, no sidecar to attach");
        }
        let log_sidecar = None;

        let infinity = self.infinity.clone();
        let handle = Arc::new(TaskHandle::new(
            short,
            infinity,
            spec.task_id.clone(),
            container_id,
            image_user.image_id,
            spec.clone(),
            spec.remove_container_on_exit,
            network,
            log_sidecar,
        ));
        handle.mark_running();

        self.store.set(&spec.task_id, handle.clone());
        info!(task_id = %spec.task_id, container_id = %handle.container_id(), "started task");
        tokio::spawn(handle.clone().run());

        Ok(handle)
    }

    /// Decode blob; if already installed, succeed. Else re-inspect the
    /// container and reassemble the handle (spec §4.7 "RecoverTask").
    pub async fn recover_task(self: &Arc<Self>, blob: TaskHandleBlob, spec: TaskSpec) -> DriverResult<Arc<TaskHandle>> {
        if let Some(handle) = self.store.get(&blob.task_id) {
            debug!(task_id = %blob.task_id, "recover_task: handle already installed");
            return Ok(handle);
        }

        let short = self.short.clone();
        let inspect = short.container_inspect(&blob.container_id).await.map_err(DriverError::from)?;

        let network = NetworkMetadata {
            ip: advertisable_ip(&inspect),
            port_map: spec.network.port_map.clone(),
            auto_advertise: spec.network.auto_advertise_non_default_networks,
        };

        let infinity = self.infinity.clone();
        let handle = Arc::new(TaskHandle::new(
            short,
            infinity,
            blob.task_id.clone(),
            blob.container_id,
            blob.image_id,
            spec,
            blob.remove_container_on_exit,
            network,
            None,
        ));

        if inspect.state.running {
            handle.mark_running();
        } else {
            handle.mark_unknown();
        }

        self.store.set(&blob.task_id, handle.clone());
        info!(task_id = %blob.task_id, container_id = %handle.container_id(), "recovered task");
        tokio::spawn(handle.clone().run());

        Ok(handle)
    }

    /// Look up the container, stop/remove it if still present, release
    /// the image reference, and drop the handle (spec §4.7 "DestroyTask").
    pub async fn destroy_task(&self, task_id: &str, force: bool) -> DriverResult<()> {
        let handle = self.lookup(task_id)?;
        let short = self.short.clone();

        match short.container_inspect(handle.container_id()).await {
            Err(EngineError::NotFound(_)) => {
                warn!(task_id, "container already removed out of band during destroy");
            }
            Err(e) => return Err(DriverError::Engine(e)),
            Ok(inspect) => {
                if inspect.state.running && !force {
                    return Err(DriverError::Validation(format!(
                        "task {task_id} container is still running; destroy requires force"
                    )));
                }
                short.container_stop(handle.container_id(), 0).await.map_err(DriverError::from)?;
                if handle.spec().remove_container_on_exit {
                    short.container_remove(handle.container_id(), true, true).await.map_err(DriverError::from)?;
                }
            }
        }

        if self.config.image_gc.enabled {
            self.images.remove_image(handle.image_id(), task_id);
        }

        self.store.delete(task_id);
        info!(task_id, "destroyed task");
        Ok(())
    }

    pub async fn wait_task(&self, task_id: &str, ctx: CancellationToken) -> DriverResult<ExitResult> {
        Ok(self.lookup(task_id)?.wait(ctx).await)
    }

    /// Sends `signal` (or the platform default), then SIGKILL if the
    /// container is still running after `grace` (spec §8 property 5,
    /// Scenario D).
    pub async fn stop_task(&self, task_id: &str, grace: Duration, signal: &str) -> DriverResult<()> {
        self.lookup(task_id)?.kill(grace, signal).await.map_err(DriverError::from)
    }

    pub async fn signal_task(&self, task_id: &str, signal: &str) -> DriverResult<()> {
        self.lookup(task_id)?.signal(signal).await.map_err(DriverError::from)
    }

    pub async fn exec_task(&self, task_id: &str, cmd: Vec<String>) -> DriverResult<ExecResult> {
        self.lookup(task_id)?.exec(cmd).await.map_err(DriverError::from)
    }

    pub async fn exec_task_streaming(&self, task_id: &str, opts: ExecStreamingOptions) -> DriverResult<ExitResult> {
        self.lookup(task_id)?.exec_streaming(opts).await.map_err(DriverError::from)
    }

    pub fn inspect_task(&self, task_id: &str) -> DriverResult<Arc<TaskHandle>> {
        self.lookup(task_id)
    }

    pub async fn task_stats(&self, task_id: &str, interval: Duration) -> DriverResult<StatsStream> {
        self.lookup(task_id)?.stats(interval).await.map_err(DriverError::from)
    }

    /// Pulls the infra image (refcounted like any other image), creates
    /// and starts a `none`-network "pause" container carrying the
    /// reserved alloc-id label, and registers it (spec §4.7 "Network
    /// sandbox lifecycle").
    pub async fn create_network(self: &Arc<Self>, alloc_id: &str) -> DriverResult<NetworkSandbox> {
        let short = self.short.clone();

        let image_user = self
            .images
            .pull_image(
                &self.config.infra_image,
                None,
                alloc_id,
                Arc::new(|_| {}),
                self.config.pull_activity_timeout(),
                self.config.pull_activity_timeout(),
            )
            .await?;

        let mut labels = HashMap::new();
        labels.insert(ALLOC_ID_LABEL.to_string(), alloc_id.to_string());

        let create_spec = ContainerCreateSpec {
            name: PauseRegistry::pause_container_name(alloc_id),
            image: image_user.image_id,
            labels: labels.clone(),
            host_config: HostConfigSpec { network_mode: Some("none".to_string()), ..Default::default() },
            ..Default::default()
        };

        let container_id = short.container_create(&create_spec).await.map_err(DriverError::from)?;
        short.container_start(&container_id).await.map_err(DriverError::from)?;
        self.pause.insert(alloc_id, &container_id);
        info!(alloc_id, container_id = %container_id, "created network sandbox");

        let inspect = short.container_inspect(&container_id).await.map_err(DriverError::from)?;

        Ok(NetworkSandbox {
            container_id,
            namespace_path: format!("/proc/{}/ns/net", inspect.state.pid),
            labels,
        })
    }

    /// Stops and removes the pause container, releasing its infra-image
    /// reference if image GC is enabled.
    pub async fn destroy_network(&self, alloc_id: &str) -> DriverResult<()> {
        let Some(container_id) = self.pause.remove(alloc_id) else { return Ok(()) };
        let short = self.short.clone();

        let image_id = match short.container_inspect(&container_id).await {
            Err(EngineError::NotFound(_)) => None,
            Err(e) => return Err(DriverError::Engine(e)),
            Ok(inspect) => {
                short.container_stop(&container_id, 0).await.map_err(DriverError::from)?;
                short.container_remove(&container_id, true, true).await.map_err(DriverError::from)?;
                Some(inspect.image_id)
            }
        };

        if let Some(image_id) = image_id {
            if self.config.image_gc.enabled {
                self.images.remove_image(&image_id, alloc_id);
            }
        }

        info!(alloc_id, "destroyed network sandbox");
        Ok(())
    }

    fn lookup(&self, task_id: &str) -> DriverResult<Arc<TaskHandle>> {
        self.store.get(task_id).ok_or_else(|| DriverError::NotFound(task_id.to_string()))
    }

    /// Resolve the task's image per spec §4.7 "createImage": force-pull,
    /// else a cache hit for a non-`:latest` tag, else an archive load, else
    /// a pull through the Image Coordinator.
    async fn create_image(&self, spec: &TaskSpec) -> DriverResult<crate::image::ImageUser> {
        let short = self.short.clone();

        if !spec.force_pull {
            if !is_latest_tag(&spec.image) {
                if let Ok(inspect) = short.image_inspect(&spec.image).await {
                    if self.config.image_gc.enabled {
                        self.images.increment_image_reference(&inspect.id, &spec.image, &spec.task_id);
                    }
                    return Ok(crate::image::ImageUser { image_id: inspect.id, user: inspect.user, os: inspect.os });
                }
            }

            if let Some(archive_path) = &spec.image_pull_archive_path {
                let full_path = ContainerBuilder::task_dir(&self.config, spec).join("local").join(archive_path);
                short.image_load(&full_path).await.map_err(DriverError::from)?;
                let inspect = short.image_inspect(&spec.image).await.map_err(DriverError::from)?;
                if self.config.image_gc.enabled {
                    self.images.increment_image_reference(&inspect.id, &spec.image, &spec.task_id);
                }
                return Ok(crate::image::ImageUser { image_id: inspect.id, user: inspect.user, os: inspect.os });
            }
        }

        let pull_timeout = spec
            .pull_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.config.pull_activity_timeout());
        let auth = spec.auth.as_ref().map(|a| format!("{}:{}", a.username, a.password));

        self.images
            .pull_image(
                &spec.image,
                auth.as_deref(),
                &spec.task_id,
                Arc::new(|_| {}),
                pull_timeout,
                self.config.pull_activity_timeout(),
            )
            .await
    }

    /// `createContainer` (spec §4.7): retries transient/conflict errors
    /// with exponential backoff, recovering a stale already-exists
    /// conflict by removing the stopped container that owns the name.
    async fn create_container(&self, _spec: &TaskSpec, create_spec: &ContainerCreateSpec) -> DriverResult<String> {
        let short = self.short.clone();
        let mut backoff = retry_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match short.container_create(create_spec).await {
                Ok(id) => return Ok(id),
                Err(EngineError::Conflict(msg)) if is_already_exists(&msg) => {
                    if attempt > self.config.retry.container_exists_attempts {
                        return Err(DriverError::Engine(EngineError::Conflict(msg)));
                    }
                    if let Some(existing) = short.container_by_name(&create_spec.name).await.map_err(DriverError::from)? {
                        let existing_inspect = short.container_inspect(&existing.id).await.map_err(DriverError::from)?;
                        if existing_inspect.state.running {
                            debug!(name = %create_spec.name, container_id = %existing.id, "reusing already-running container");
                            return Ok(existing.id);
                        }
                        debug!(name = %create_spec.name, container_id = %existing.id, "removing stopped container to free its name");
                        short.container_remove(&existing.id, true, false).await.map_err(DriverError::from)?;
                    }
                    sleep_backoff(&mut backoff).await?;
                }
                Err(EngineError::Conflict(msg)) if is_recoverable_mount_conflict(&msg) => {
                    if attempt > self.config.retry.transient_attempts {
                        return Err(DriverError::Engine(EngineError::Conflict(msg)));
                    }
                    sleep_backoff(&mut backoff).await?;
                }
                Err(EngineError::NotFound(msg)) => {
                    // race with a concurrent image GC; recoverable within budget.
                    if attempt > self.config.retry.transient_attempts {
                        return Err(DriverError::Engine(EngineError::NotFound(msg)));
                    }
                    sleep_backoff(&mut backoff).await?;
                }
                Err(e) if e.recoverable() => {
                    if attempt > self.config.retry.transient_attempts {
                        return Err(DriverError::Engine(e));
                    }
                    sleep_backoff(&mut backoff).await?;
                }
                Err(e) => return Err(DriverError::Engine(e)),
            }
        }
    }

    /// `startContainer` (spec §4.7): idempotent against already-running,
    /// retries transients with the same backoff schedule.
    async fn start_container(&self, container_id: &str) -> DriverResult<()> {
        let short = self.short.clone();
        let mut backoff = retry_backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match short.container_start(container_id).await {
                Ok(()) => return Ok(()),
                Err(EngineError::Conflict(msg)) if msg.to_ascii_lowercase().contains("already started") => return Ok(()),
                Err(e) if e.recoverable() => {
                    if attempt > self.config.retry.transient_attempts {
                        return Err(DriverError::Engine(e));
                    }
                    sleep_backoff(&mut backoff).await?;
                }
                Err(e) => return Err(DriverError::Engine(e)),
            }
        }
    }
}

/// Strips a `https://` scheme prefix a user may have copied from a
/// registry URL (spec §4.7 step 3).
fn normalize_image_ref(image: &str) -> String {
    image.strip_prefix("https://").unwrap_or(image).to_string()
}

/// Refuses an image that runs as `ContainerAdmin` unless the driver
/// allows privileged/insecure mode, and validates the isolation mode
/// (spec §4.7 step 6, Windows-only).
#[cfg(target_os = "windows")]
fn validate_windows_image_user(
    image_user: &crate::image::ImageUser,
    spec: &TaskSpec,
    config: &DriverConfig,
) -> DriverResult<()> {
    if image_user.user.eq_ignore_ascii_case("ContainerAdmin") && !config.allow_privileged {
        return Err(DriverError::Validation(
            "image runs as ContainerAdmin, which requires privileged/insecure mode to be enabled".into(),
        ));
    }
    if let Some(isolation) = &spec.isolation {
        if isolation != "process" && isolation != "hyperv" {
            return Err(DriverError::Validation(format!("invalid isolation mode {isolation:?}")));
        }
    }
    Ok(())
}

/// LCOW alloc/local/secrets path rewriting (spec §4.7 step 7, Windows-only):
/// when the image's OS is Linux, strip the drive-letter prefix and
/// normalize separators in the env vars that carry the sandbox paths.
#[cfg(target_os = "windows")]
fn rewrite_lcow_alloc_paths(spec: &mut TaskSpec, image_user: &crate::image::ImageUser) {
    if !image_user.os.eq_ignore_ascii_case("linux") {
        return;
    }
    for key in ["NOMAD_ALLOC_DIR", "NOMAD_TASK_DIR", "NOMAD_SECRETS_DIR"] {
        if let Some(value) = spec.env.get(key).cloned() {
            spec.env.insert(key.to_string(), lcow_path(&value));
        }
    }
}

#[cfg(target_os = "windows")]
fn lcow_path(path: &str) -> String {
    let without_drive = if path.as_bytes().get(1) == Some(&b':') { &path[2..] } else { path };
    without_drive.replace('\\', "/")
}

fn is_latest_tag(image: &str) -> bool {
    !image.contains(':') || image.ends_with(":latest")
}

fn is_already_exists(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("already in use") || lower.contains("already exists")
}

fn is_recoverable_mount_conflict(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("duplicate mount point") || lower.contains("volume attached elsewhere")
}

fn advertisable_ip(inspect: &ContainerInspect) -> Option<String> {
    inspect.ip_addresses.values().find(|ip| !ip.is_empty()).cloned()
}

/// 50ms * 2^attempt, capped at 1 minute (spec §7 "Retry budgets").
fn retry_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(50),
        multiplier: 2.0,
        max_interval: Duration::from_secs(60),
        max_elapsed_time: None,
        ..Default::default()
    }
}

async fn sleep_backoff(backoff: &mut ExponentialBackoff) -> DriverResult<()> {
    match backoff.next_backoff() {
        Some(delay) => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
        None => Err(DriverError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        ContainerState, ContainerSummary, EngineResult, ExecInspect, ExecSpec, ImageInspect, PullStatusFrame, PullStream,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Scenario-C fake: starts with one pre-created stopped container
    /// named `demo-alloc1`; `container_create` simulates the engine's
    /// 409-already-exists response the first time that name is used.
    #[derive(Default)]
    struct FakeEngine {
        containers: Mutex<HashMap<String, (ContainerSummary, bool /* running */)>>,
        created_ids: Mutex<HashSet<String>>,
        next_id: Mutex<u64>,
    }

    impl FakeEngine {
        fn with_stopped(name: &str, id: &str) -> Self {
            let mut containers = HashMap::new();
            containers.insert(
                name.to_string(),
                (ContainerSummary { id: id.to_string(), names: vec![format!("/{name}")], labels: HashMap::new() }, false),
            );
            Self { containers: Mutex::new(containers), created_ids: Mutex::new(HashSet::new()), next_id: Mutex::new(1) }
        }
    }

    #[async_trait]
    impl Engine for FakeEngine {
        async fn image_pull(&self, _r: &str, _a: Option<&str>) -> EngineResult<PullStream> {
            let frames: Vec<EngineResult<PullStatusFrame>> = vec![Ok(PullStatusFrame {
                id: Some("layer".into()),
                status: Some("done".into()),
                progress_current: Some(1),
                progress_total: Some(1),
                error: None,
            })];
            Ok(Box::pin(futures_util::stream::iter(frames)))
        }
        async fn image_inspect(&self, image_ref: &str) -> EngineResult<ImageInspect> {
            Ok(ImageInspect { id: format!("sha256:{image_ref}"), user: String::new(), os: "linux".into() })
        }
        async fn image_load(&self, _p: &std::path::Path) -> EngineResult<()> {
            Ok(())
        }
        async fn image_remove(&self, _id: &str, _f: bool) -> EngineResult<()> {
            Ok(())
        }
        async fn container_create(&self, spec: &ContainerCreateSpec) -> EngineResult<String> {
            let mut containers = self.containers.lock();
            if let Some((existing, _)) = containers.get(&spec.name) {
                if !self.created_ids.lock().contains(&existing.id) {
                    return Err(EngineError::Conflict(format!("container {} already exists", spec.name)));
                }
            }
            let mut next_id = self.next_id.lock();
            let id = format!("fresh-{}", *next_id);
            *next_id += 1;
            self.created_ids.lock().insert(id.clone());
            containers.insert(
                spec.name.clone(),
                (ContainerSummary { id: id.clone(), names: vec![format!("/{}", spec.name)], labels: spec.labels.clone() }, false),
            );
            Ok(id)
        }
        async fn container_inspect(&self, id: &str) -> EngineResult<ContainerInspect> {
            let containers = self.containers.lock();
            let running = containers.values().find(|(c, _)| c.id == id).map(|(_, r)| *r).unwrap_or(false);
            Ok(ContainerInspect { id: id.to_string(), image_id: "sha256:img".into(), state: ContainerState { running, ..Default::default() }, ..Default::default() })
        }
        async fn container_start(&self, id: &str) -> EngineResult<()> {
            let mut containers = self.containers.lock();
            if let Some(entry) = containers.values_mut().find(|(c, _)| c.id == id) {
                entry.1 = true;
            }
            Ok(())
        }
        async fn container_stop(&self, _id: &str, _t: i64) -> EngineResult<()> {
            Ok(())
        }
        async fn container_kill(&self, _id: &str, _s: &str) -> EngineResult<()> {
            Ok(())
        }
        async fn container_remove(&self, id: &str, _f: bool, _v: bool) -> EngineResult<()> {
            self.containers.lock().retain(|_, (c, _)| c.id != id);
            Ok(())
        }
        async fn container_list(&self, _all: bool, _label_filter: &str) -> EngineResult<Vec<ContainerSummary>> {
            Ok(self.containers.lock().values().map(|(c, _)| c.clone()).collect())
        }
        async fn container_by_name(&self, name: &str) -> EngineResult<Option<ContainerSummary>> {
            Ok(self.containers.lock().get(name.trim_start_matches('/')).map(|(c, _)| c.clone()))
        }
        async fn container_wait(&self, _id: &str) -> EngineResult<i64> {
            std::future::pending().await
        }
        async fn container_stats(&self, _id: &str) -> EngineResult<StatsStream> {
            unimplemented!()
        }
        async fn exec_create(&self, _c: &str, _s: &ExecSpec) -> EngineResult<String> {
            unimplemented!()
        }
        async fn exec_start(&self, _id: &str) -> EngineResult<crate::engine::ExecOutputStream> {
            unimplemented!()
        }
        async fn exec_inspect(&self, _id: &str) -> EngineResult<ExecInspect> {
            unimplemented!()
        }
        async fn exec_resize(&self, _id: &str, _w: u16, _h: u16) -> EngineResult<()> {
            unimplemented!()
        }
        async fn server_version(&self) -> EngineResult<String> {
            Ok("1.45".into())
        }
    }

    fn test_config() -> DriverConfig {
        toml::from_str("").unwrap()
    }

    fn base_spec(task_id: &str, alloc_id: &str, task_name: &str) -> TaskSpec {
        TaskSpec {
            task_id: task_id.into(),
            alloc_id: alloc_id.into(),
            task_name: task_name.into(),
            image: "busybox:latest".into(),
            remove_container_on_exit: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scenario_c_container_name_conflict_recovers_by_removing_stopped() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine::with_stopped("demo-alloc1", "stale-1"));
        let config = Arc::new(test_config());
        let controller = LifecycleController::from_engine_pair(engine.clone(), engine, config);

        let spec = base_spec("t1", "alloc1", "demo");
        let handle = controller.start_task(spec).await.unwrap();

        assert_ne!(handle.container_id(), "stale-1");
        assert!(controller.store.contains("t1"));
    }

    #[tokio::test]
    async fn start_task_rejects_empty_image() {
        let engine: Arc<dyn Engine> = Arc::new(FakeEngine::default());
        let config = Arc::new(test_config());
        let controller = LifecycleController::from_engine_pair(engine.clone(), engine, config);

        let mut spec = base_spec("t1", "alloc1", "demo");
        spec.image = String::new();

        let err = controller.start_task(spec).await.unwrap_err();
        assert!(!err.recoverable());
    }

    #[test]
    fn normalize_image_ref_strips_https_scheme() {
        assert_eq!(normalize_image_ref("https://registry.example.com/busybox:1.0"), "registry.example.com/busybox:1.0");
        assert_eq!(normalize_image_ref("busybox:latest"), "busybox:latest");
    }
}
