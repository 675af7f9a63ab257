//! Task Handle (spec §4.5): owns one container's lifecycle.
//!
//! Generalizes the teacher's `power.rs` (`wait_for_container_exit`,
//! `terminate_container`, `attach_container`) and `stats.rs`
//! (`poll_stats`/`calculate_cpu`/`calculate_memory`/`calculate_network`)
//! free functions, plus its `AtomicU8`-backed `ProcessState` in
//! `environment/docker/environment.rs`, into methods on one struct shared
//! by every container the driver owns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{Engine, EngineResult, ExecSpec, StatsStream};

use super::spec::TaskSpec;

/// Mirrors the teacher's `AtomicU8`-backed `ProcessState`, generalized
/// from "server process" states to the driver's handle states (spec
/// §4.5's state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created = 0,
    Running = 1,
    Exited = 2,
    Unknown = 3,
}

impl HandleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => HandleState::Created,
            1 => HandleState::Running,
            2 => HandleState::Exited,
            _ => HandleState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExitResult {
    pub exit_code: i64,
    pub oom_killed: bool,
    pub error: Option<String>,
    pub finished_at: Option<String>,
}

impl ExitResult {
    fn cancelled() -> Self {
        Self { exit_code: -1, oom_killed: false, error: Some("context cancelled".into()), finished_at: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NetworkMetadata {
    pub ip: Option<String>,
    pub port_map: HashMap<String, u16>,
    pub auto_advertise: bool,
}

/// The sidecar process itself is out of scope (spec §1, §12); the handle
/// only needs enough to reattach or to kill it on exit.
pub struct LogSidecarHandle {
    pub reattach_blob: Vec<u8>,
    pub kill: Arc<dyn Fn() + Send + Sync>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

pub const TASK_HANDLE_BLOB_VERSION: u32 = 1;

/// The only state the host persists on our behalf (spec §6 "Persisted
/// state"); everything else (pause registry, image references) is
/// rebuilt by scanning the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHandleBlob {
    pub version: u32,
    pub task_id: String,
    pub container_id: String,
    pub image_id: String,
    pub remove_container_on_exit: bool,
    pub log_sidecar_reattach: Option<Vec<u8>>,
}

/// The streaming-exec multiplexer deliberately takes already-opened
/// duplex handles rather than a wire protocol; the terminal/exec
/// streaming frame format is out of scope (spec §1, §12).
pub struct ExecStreamingOptions {
    pub cmd: Vec<String>,
    pub tty: bool,
    pub attach_stdin: bool,
    pub resize: Option<tokio::sync::mpsc::Receiver<(u16, u16)>>,
}

pub struct TaskHandle {
    short: Arc<dyn Engine>,
    infinity: Arc<dyn Engine>,

    log_sidecar: RwLock<Option<LogSidecarHandle>>,

    task_id: String,
    container_id: String,
    image_id: String,
    spec: TaskSpec,
    remove_container_on_exit: bool,

    network: RwLock<NetworkMetadata>,

    state: AtomicU8,
    done: Arc<Notify>,
    exit_result: OnceCell<ExitResult>,
}

impl TaskHandle {
    pub fn new(
        short: Arc<dyn Engine>,
        infinity: Arc<dyn Engine>,
        task_id: String,
        container_id: String,
        image_id: String,
        spec: TaskSpec,
        remove_container_on_exit: bool,
        network: NetworkMetadata,
        log_sidecar: Option<LogSidecarHandle>,
    ) -> Self {
        Self {
            short,
            infinity,
            log_sidecar: RwLock::new(log_sidecar),
            task_id,
            container_id,
            image_id,
            spec,
            remove_container_on_exit,
            network: RwLock::new(network),
            state: AtomicU8::new(HandleState::Created as u8),
            done: Arc::new(Notify::new()),
            exit_result: OnceCell::new(),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn image_id(&self) -> &str {
        &self.image_id
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn network(&self) -> NetworkMetadata {
        self.network.read().clone()
    }

    pub fn set_network(&self, network: NetworkMetadata) {
        *self.network.write() = network;
    }

    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: HandleState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn mark_running(&self) {
        self.set_state(HandleState::Running);
    }

    pub fn mark_unknown(&self) {
        self.set_state(HandleState::Unknown);
    }

    pub fn to_blob(&self) -> TaskHandleBlob {
        TaskHandleBlob {
            version: TASK_HANDLE_BLOB_VERSION,
            task_id: self.task_id.clone(),
            container_id: self.container_id.clone(),
            image_id: self.image_id.clone(),
            remove_container_on_exit: self.remove_container_on_exit,
            log_sidecar_reattach: self.log_sidecar.read().as_ref().map(|s| s.reattach_blob.clone()),
        }
    }

    pub fn take_log_sidecar(&self) -> Option<LogSidecarHandle> {
        self.log_sidecar.write().take()
    }

    pub fn set_log_sidecar(&self, sidecar: Option<LogSidecarHandle>) {
        *self.log_sidecar.write() = sidecar;
    }

    /// Drives the engine's `container_wait` exactly once regardless of how
    /// many callers (explicit `wait()`s and the background `run()`) race
    /// for it, the same single-assignment/multi-await `OnceCell` idiom
    /// the Image Coordinator's `PullFuture` uses for pull de-bounce (spec
    /// §8 property 3).
    async fn resolve_exit(&self) -> ExitResult {
        self.exit_result
            .get_or_init(|| async {
                let result = match self.infinity.container_wait(&self.container_id).await {
                    Ok(exit_code) => {
                        let oom_killed = self
                            .infinity
                            .container_inspect(&self.container_id)
                            .await
                            .map(|inspect| inspect.state.oom_killed)
                            .unwrap_or(false);
                        ExitResult { exit_code, oom_killed, error: None, finished_at: Some(now_rfc3339()) }
                    }
                    Err(e) => ExitResult { exit_code: -1, oom_killed: false, error: Some(e.to_string()), finished_at: None },
                };
                self.set_state(HandleState::Exited);
                self.done.notify_waiters();
                result
            })
            .await
            .clone()
    }

    /// Blocks until exit. Cancelling `ctx` returns a context-cancelled
    /// result immediately without cancelling the underlying wait, so the
    /// real exit is still captured by `run()` (spec §4.5).
    pub async fn wait(&self, ctx: CancellationToken) -> ExitResult {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => ExitResult::cancelled(),
            result = self.resolve_exit() => result,
        }
    }

    async fn is_running(&self) -> bool {
        self.infinity
            .container_inspect(&self.container_id)
            .await
            .map(|inspect| inspect.state.running)
            .unwrap_or(false)
    }

    /// Sends `signal` (or the platform default if empty), then SIGKILL if
    /// the container is still running after `timeout`. The container's
    /// STOPSIGNAL, if known, is sent in addition to the caller's signal
    /// and the final SIGKILL, not instead of them.
    pub async fn kill(&self, timeout: Duration, signal: &str) -> EngineResult<()> {
        let effective = if signal.is_empty() { default_stop_signal() } else { signal.to_string() };
        self.short.container_kill(&self.container_id, &effective).await?;

        let stop_signal = self
            .short
            .container_inspect(&self.container_id)
            .await
            .ok()
            .and_then(|inspect| inspect.stop_signal);
        if let Some(stop_sig) = stop_signal.filter(|s| !s.is_empty() && *s != effective) {
            if let Err(e) = self.short.container_kill(&self.container_id, &stop_sig).await {
                warn!(task_id = %self.task_id, error = %e, "failed to forward STOPSIGNAL");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if self.is_running().await {
                    info!(task_id = %self.task_id, container_id = %self.container_id, "grace period elapsed, sending SIGKILL");
                    self.short.container_kill(&self.container_id, "SIGKILL").await?;
                }
            }
            _ = self.done.notified() => {}
        }

        Ok(())
    }

    pub async fn signal(&self, sig: &str) -> EngineResult<()> {
        self.short.container_kill(&self.container_id, sig).await
    }

    /// Synchronous exec: create, start (non-TTY), capture stdout/stderr
    /// while polling exec-inspect until the running flag flips false,
    /// return the exit code (spec §4.5).
    pub async fn exec(&self, cmd: Vec<String>) -> EngineResult<ExecResult> {
        let exec_id = self
            .short
            .exec_create(
                &self.container_id,
                &ExecSpec { cmd, tty: false, attach_stdin: false, attach_stdout: true, attach_stderr: true },
            )
            .await?;
        let mut output = self.short.exec_start(&exec_id).await?;

        let collector = tokio::spawn(async move {
            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(crate::engine::ExecOutputChunk::Stdout(bytes)) => stdout.extend(bytes),
                    Ok(crate::engine::ExecOutputChunk::Stderr(bytes)) => stderr.extend(bytes),
                    Err(_) => break,
                }
            }
            (stdout, stderr)
        });

        let exit_code = loop {
            let inspect = self.short.exec_inspect(&exec_id).await?;
            if !inspect.running {
                break inspect.exit_code.unwrap_or(0);
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        };

        let (stdout, stderr) = collector.await.unwrap_or_default();
        Ok(ExecResult { exit_code, stdout, stderr })
    }

    /// Bidirectional streaming exec. Resize events (if any) are forwarded
    /// to the engine as they arrive; stdout/stderr multiplexing wire
    /// framing is the caller's concern (spec §1, §12).
    pub async fn exec_streaming(&self, opts: ExecStreamingOptions) -> EngineResult<ExitResult> {
        let exec_id = self
            .short
            .exec_create(
                &self.container_id,
                &ExecSpec {
                    cmd: opts.cmd,
                    tty: opts.tty,
                    attach_stdin: opts.attach_stdin,
                    attach_stdout: true,
                    attach_stderr: !opts.tty,
                },
            )
            .await?;
        // The streaming multiplexer hands the caller already-opened duplex
        // handles rather than owning a wire protocol (spec §1, §12); drain
        // the attached output here so the exec's own write buffer never
        // blocks on an unread pipe.
        let mut output = self.short.exec_start(&exec_id).await?;
        tokio::spawn(async move { while output.next().await.is_some() {} });

        if let Some(mut resize_rx) = opts.resize {
            let engine = self.short.clone();
            let exec_id_for_resize = exec_id.clone();
            tokio::spawn(async move {
                while let Some((width, height)) = resize_rx.recv().await {
                    let _ = engine.exec_resize(&exec_id_for_resize, width, height).await;
                }
            });
        }

        loop {
            let inspect = self.short.exec_inspect(&exec_id).await?;
            if !inspect.running {
                return Ok(ExitResult {
                    exit_code: inspect.exit_code.unwrap_or(0),
                    oom_killed: false,
                    error: None,
                    finished_at: Some(now_rfc3339()),
                });
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    /// Stream of `ResourceUsage`, throttled to at most one sample per
    /// `interval` (errors always pass through immediately).
    pub async fn stats(&self, interval: Duration) -> EngineResult<StatsStream> {
        let inner = self.infinity.container_stats(&self.container_id).await?;
        let start = tokio::time::Instant::now()
            .checked_sub(interval)
            .unwrap_or_else(tokio::time::Instant::now);

        let throttled = futures_util::stream::unfold((inner, start), move |(mut inner, mut last)| async move {
            loop {
                match inner.next().await {
                    Some(Err(e)) => return Some((Err(e), (inner, last))),
                    Some(Ok(sample)) => {
                        if last.elapsed() >= interval {
                            last = tokio::time::Instant::now();
                            return Some((Ok(sample), (inner, last)));
                        }
                    }
                    None => return None,
                }
            }
        });

        Ok(Box::pin(throttled))
    }

    /// Background routine spawned by the Lifecycle Controller on install:
    /// waits for exit, stops the log sidecar, optionally removes the
    /// container (spec §4.5).
    pub async fn run(self: Arc<Self>) {
        let _ = self.resolve_exit().await;

        if let Some(sidecar) = self.take_log_sidecar() {
            (sidecar.kill)();
        }

        if self.remove_container_on_exit {
            if let Err(e) = self.infinity.container_remove(&self.container_id, true, true).await {
                warn!(task_id = %self.task_id, error = %e, "failed to remove container after exit");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(container_id: &str) -> Self {
        Self::new(
            Arc::new(tests::UnimplementedEngine),
            Arc::new(tests::UnimplementedEngine),
            format!("task-{container_id}"),
            container_id.to_string(),
            "sha256:test".into(),
            TaskSpec::default(),
            true,
            NetworkMetadata::default(),
            None,
        )
    }
}

fn default_stop_signal() -> String {
    #[cfg(target_os = "windows")]
    {
        "SIGTERM".to_string()
    }
    #[cfg(not(target_os = "windows"))]
    {
        "SIGINT".to_string()
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        ContainerCreateSpec, ContainerInspect, ContainerState, ContainerSummary, EngineResult as Res,
        ExecInspect, ImageInspect, PullStream,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// Placeholder engine for handles constructed only to exercise the
    /// Task Store's map semantics, never the handle's own operations.
    pub(crate) struct UnimplementedEngine;

    #[async_trait]
    impl Engine for UnimplementedEngine {
        async fn image_pull(&self, _r: &str, _a: Option<&str>) -> Res<PullStream> {
            unimplemented!()
        }
        async fn image_inspect(&self, _r: &str) -> Res<ImageInspect> {
            unimplemented!()
        }
        async fn image_load(&self, _p: &std::path::Path) -> Res<()> {
            unimplemented!()
        }
        async fn image_remove(&self, _id: &str, _f: bool) -> Res<()> {
            unimplemented!()
        }
        async fn container_create(&self, _s: &ContainerCreateSpec) -> Res<String> {
            unimplemented!()
        }
        async fn container_inspect(&self, _id: &str) -> Res<ContainerInspect> {
            unimplemented!()
        }
        async fn container_start(&self, _id: &str) -> Res<()> {
            unimplemented!()
        }
        async fn container_stop(&self, _id: &str, _t: i64) -> Res<()> {
            unimplemented!()
        }
        async fn container_kill(&self, _id: &str, _signal: &str) -> Res<()> {
            unimplemented!()
        }
        async fn container_remove(&self, _id: &str, _f: bool, _v: bool) -> Res<()> {
            unimplemented!()
        }
        async fn container_list(&self, _a: bool, _l: &str) -> Res<Vec<ContainerSummary>> {
            unimplemented!()
        }
        async fn container_by_name(&self, _n: &str) -> Res<Option<ContainerSummary>> {
            unimplemented!()
        }
        async fn container_wait(&self, _id: &str) -> Res<i64> {
            unimplemented!()
        }
        async fn container_stats(&self, _id: &str) -> Res<StatsStream> {
            unimplemented!()
        }
        async fn exec_create(&self, _c: &str, _s: &ExecSpec) -> Res<String> {
            unimplemented!()
        }
        async fn exec_start(&self, _id: &str) -> Res<crate::engine::ExecOutputStream> {
            unimplemented!()
        }
        async fn exec_inspect(&self, _id: &str) -> Res<ExecInspect> {
            unimplemented!()
        }
        async fn exec_resize(&self, _id: &str, _w: u16, _h: u16) -> Res<()> {
            unimplemented!()
        }
        async fn server_version(&self) -> Res<String> {
            unimplemented!()
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        exit_code: i64,
        running_then_exits_after: usize,
        inspect_calls: AtomicUsize,
        kill_signals: Mutex<Vec<String>>,
        still_running: std::sync::atomic::AtomicBool,
        stop_signal: Option<String>,
    }

    #[async_trait]
    impl Engine for FakeEngine {
        async fn image_pull(&self, _r: &str, _a: Option<&str>) -> Res<PullStream> {
            unimplemented!()
        }
        async fn image_inspect(&self, _r: &str) -> Res<ImageInspect> {
            unimplemented!()
        }
        async fn image_load(&self, _p: &std::path::Path) -> Res<()> {
            unimplemented!()
        }
        async fn image_remove(&self, _id: &str, _f: bool) -> Res<()> {
            unimplemented!()
        }
        async fn container_create(&self, _s: &ContainerCreateSpec) -> Res<String> {
            unimplemented!()
        }
        async fn container_inspect(&self, _id: &str) -> Res<ContainerInspect> {
            let running = self.still_running.load(Ordering::SeqCst);
            Ok(ContainerInspect {
                state: ContainerState { running, ..Default::default() },
                stop_signal: self.stop_signal.clone(),
                ..Default::default()
            })
        }
        async fn container_start(&self, _id: &str) -> Res<()> {
            unimplemented!()
        }
        async fn container_stop(&self, _id: &str, _t: i64) -> Res<()> {
            unimplemented!()
        }
        async fn container_kill(&self, _id: &str, signal: &str) -> Res<()> {
            self.kill_signals.lock().push(signal.to_string());
            if signal == "SIGKILL" {
                self.still_running.store(false, Ordering::SeqCst);
            }
            Ok(())
        }
        async fn container_remove(&self, _id: &str, _f: bool, _v: bool) -> Res<()> {
            Ok(())
        }
        async fn container_list(&self, _a: bool, _l: &str) -> Res<Vec<ContainerSummary>> {
            unimplemented!()
        }
        async fn container_by_name(&self, _n: &str) -> Res<Option<ContainerSummary>> {
            unimplemented!()
        }
        async fn container_wait(&self, _id: &str) -> Res<i64> {
            Ok(self.exit_code)
        }
        async fn container_stats(&self, _id: &str) -> Res<StatsStream> {
            unimplemented!()
        }
        async fn exec_create(&self, _c: &str, _s: &ExecSpec) -> Res<String> {
            Ok("exec1".into())
        }
        async fn exec_start(&self, _id: &str) -> Res<crate::engine::ExecOutputStream> {
            let frames: Vec<Res<crate::engine::ExecOutputChunk>> =
                vec![Ok(crate::engine::ExecOutputChunk::Stdout(b"hello\n".to_vec()))];
            Ok(Box::pin(futures_util::stream::iter(frames)))
        }
        async fn exec_inspect(&self, _id: &str) -> Res<ExecInspect> {
            let calls = self.inspect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(ExecInspect { running: calls < self.running_then_exits_after, exit_code: Some(0) })
        }
        async fn exec_resize(&self, _id: &str, _w: u16, _h: u16) -> Res<()> {
            Ok(())
        }
        async fn server_version(&self) -> Res<String> {
            unimplemented!()
        }
    }

    fn handle_with(engine: FakeEngine) -> Arc<TaskHandle> {
        let engine: Arc<dyn Engine> = Arc::new(engine);
        Arc::new(TaskHandle::new(
            engine.clone(),
            engine,
            "t1".into(),
            "c1".into(),
            "img1".into(),
            TaskSpec::default(),
            true,
            NetworkMetadata::default(),
            None,
        ))
    }

    #[tokio::test]
    async fn wait_agrees_across_concurrent_awaiters() {
        let handle = handle_with(FakeEngine { exit_code: 7, ..Default::default() });

        let h1 = handle.clone();
        let h2 = handle.clone();
        let (r1, r2) = tokio::join!(h1.wait(CancellationToken::new()), h2.wait(CancellationToken::new()));

        assert_eq!(r1.exit_code, 7);
        assert_eq!(r2.exit_code, 7);
        assert_eq!(handle.state(), HandleState::Exited);
    }

    #[tokio::test]
    async fn run_removes_container_on_exit() {
        let handle = handle_with(FakeEngine { exit_code: 0, ..Default::default() });
        handle.clone().run().await;
        assert_eq!(handle.state(), HandleState::Exited);
    }

    #[tokio::test]
    async fn exec_polls_until_not_running() {
        let handle = handle_with(FakeEngine { running_then_exits_after: 2, ..Default::default() });
        let result = handle.exec(vec!["true".into()]).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"hello\n");
    }

    #[tokio::test]
    async fn cancelled_wait_does_not_cancel_underlying_wait() {
        let handle = handle_with(FakeEngine { exit_code: 3, ..Default::default() });
        let ctx = CancellationToken::new();
        ctx.cancel();

        let cancelled = handle.wait(ctx).await;
        assert_eq!(cancelled.error.as_deref(), Some("context cancelled"));

        let real = handle.wait(CancellationToken::new()).await;
        assert_eq!(real.exit_code, 3);
    }

    #[tokio::test]
    async fn scenario_d_default_signal_then_sigkill_after_grace() {
        let engine = Arc::new(FakeEngine { still_running: std::sync::atomic::AtomicBool::new(true), ..Default::default() });
        let dyn_engine: Arc<dyn Engine> = engine.clone();
        let handle = Arc::new(TaskHandle::new(
            dyn_engine.clone(),
            dyn_engine,
            "t1".into(),
            "c1".into(),
            "img1".into(),
            TaskSpec::default(),
            true,
            NetworkMetadata::default(),
            None,
        ));

        handle.kill(Duration::from_millis(20), "").await.unwrap();

        let signals = engine.kill_signals.lock().clone();
        assert_eq!(signals, vec![default_stop_signal(), "SIGKILL".to_string()]);
    }

    #[tokio::test]
    async fn scenario_d_no_sigkill_if_already_stopped_by_grace() {
        // still_running defaults to false: the container is already gone
        // by the time the grace timeout elapses, so no SIGKILL follows.
        let engine = Arc::new(FakeEngine::default());
        let dyn_engine: Arc<dyn Engine> = engine.clone();
        let handle = Arc::new(TaskHandle::new(
            dyn_engine.clone(),
            dyn_engine,
            "t1".into(),
            "c1".into(),
            "img1".into(),
            TaskSpec::default(),
            true,
            NetworkMetadata::default(),
            None,
        ));

        handle.kill(Duration::from_millis(20), "SIGTERM").await.unwrap();

        let signals = engine.kill_signals.lock().clone();
        assert_eq!(signals, vec!["SIGTERM".to_string()]);
    }

    #[tokio::test]
    async fn kill_forwards_stop_signal_in_addition_to_the_caller_signal() {
        let engine = Arc::new(FakeEngine { stop_signal: Some("SIGQUIT".into()), ..Default::default() });
        let dyn_engine: Arc<dyn Engine> = engine.clone();
        let handle = Arc::new(TaskHandle::new(
            dyn_engine.clone(),
            dyn_engine,
            "t1".into(),
            "c1".into(),
            "img1".into(),
            TaskSpec::default(),
            true,
            NetworkMetadata::default(),
            None,
        ));

        handle.kill(Duration::from_millis(20), "SIGTERM").await.unwrap();

        let signals = engine.kill_signals.lock().clone();
        assert_eq!(signals, vec!["SIGTERM".to_string(), "SIGQUIT".to_string()]);
    }

    #[tokio::test]
    async fn kill_does_not_duplicate_stop_signal_matching_the_caller_signal() {
        let engine = Arc::new(FakeEngine { stop_signal: Some("SIGTERM".into()), ..Default::default() });
        let dyn_engine: Arc<dyn Engine> = engine.clone();
        let handle = Arc::new(TaskHandle::new(
            dyn_engine.clone(),
            dyn_engine,
            "t1".into(),
            "c1".into(),
            "img1".into(),
            TaskSpec::default(),
            true,
            NetworkMetadata::default(),
            None,
        ));

        handle.kill(Duration::from_millis(20), "SIGTERM").await.unwrap();

        let signals = engine.kill_signals.lock().clone();
        assert_eq!(signals, vec!["SIGTERM".to_string()]);
    }
}
