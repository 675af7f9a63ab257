//! Pull Progress Monitor (spec §4.2).
//!
//! Consumes the line-delimited status-frame stream from a pull response,
//! aggregates per-layer progress, throttles the human-readable emit, and
//! watches for inactivity. Same `tokio::select!`-over-a-stream-plus-timer
//! shape the teacher uses to race a container wait against a timeout and
//! a cancellation token in `environment/docker/power.rs::wait_for_stop`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::{EngineResult, PullStream};

/// Aggregate progress across all layers of a pull, ready to format into a
/// human-readable message.
#[derive(Debug, Clone, Default)]
pub struct PullProgress {
    pub current: i64,
    pub total: i64,
}

impl PullProgress {
    pub fn message(&self, image_ref: &str) -> String {
        if self.total > 0 {
            format!(
                "pulling {image_ref}: {:.1}%",
                100.0 * self.current as f64 / self.total as f64
            )
        } else {
            format!("pulling {image_ref}")
        }
    }
}

pub type EmitFn = Arc<dyn Fn(PullProgress) + Send + Sync>;
pub type InactivityFn = Arc<dyn Fn() + Send + Sync>;

pub struct PullProgressMonitor {
    emit_interval: Duration,
    activity_timeout: Duration,
}

impl PullProgressMonitor {
    pub fn new(emit_interval: Duration, activity_timeout: Duration) -> Self {
        Self {
            emit_interval,
            activity_timeout,
        }
    }

    /// Drive `stream` to completion, emitting aggregate progress through
    /// `emit` at most once per `emit_interval`, and invoking `on_inactivity`
    /// (then cancelling `ctx`) if no frame arrives within `activity_timeout`.
    ///
    /// Runs on its own scheduling unit: callers `tokio::spawn` this.
    pub async fn run(
        &self,
        mut stream: PullStream,
        ctx: CancellationToken,
        emit: EmitFn,
        on_inactivity: InactivityFn,
    ) -> EngineResult<()> {
        use futures_util::StreamExt;

        let mut layers: HashMap<String, (i64, i64)> = HashMap::new();
        let mut last_emit = tokio::time::Instant::now() - self.emit_interval;

        loop {
            tokio::select! {
                biased;

                _ = ctx.cancelled() => {
                    return Ok(());
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            match (frame.progress_current, frame.progress_total) {
                                (Some(current), Some(total)) => {
                                    if let Some(id) = frame.id.clone() {
                                        layers.insert(id, (current, total));
                                    }

                                    if last_emit.elapsed() >= self.emit_interval {
                                        let aggregate = aggregate(&layers);
                                        emit(aggregate);
                                        last_emit = tokio::time::Instant::now();
                                    }
                                }
                                _ => {
                                    if let Some(status) = &frame.status {
                                        debug!(status, "non-progress pull frame");
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    }
                }

                _ = tokio::time::sleep(self.activity_timeout) => {
                    on_inactivity();
                    ctx.cancel();
                    return Ok(());
                }
            }
        }
    }
}

fn aggregate(layers: &HashMap<String, (i64, i64)>) -> PullProgress {
    let (current, total) = layers
        .values()
        .fold((0i64, 0i64), |(c, t), (lc, lt)| (c + lc, t + lt));
    PullProgress { current, total }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PullStatusFrame;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn frame(id: &str, current: i64, total: i64) -> EngineResult<PullStatusFrame> {
        Ok(PullStatusFrame {
            id: Some(id.to_string()),
            status: Some("Downloading".into()),
            progress_current: Some(current),
            progress_total: Some(total),
            error: None,
        })
    }

    #[tokio::test]
    async fn aggregates_across_layers() {
        let frames = vec![frame("layer1", 10, 100), frame("layer2", 20, 200)];
        let stream: PullStream = Box::pin(futures_util::stream::iter(frames));

        let emitted = Arc::new(Mutex::new(Vec::new()));
        let emitted2 = emitted.clone();

        let monitor = PullProgressMonitor::new(Duration::from_secs(0), Duration::from_secs(30));
        let ctx = CancellationToken::new();

        monitor
            .run(
                stream,
                ctx,
                Arc::new(move |p: PullProgress| emitted2.lock().unwrap().push((p.current, p.total))),
                Arc::new(|| {}),
            )
            .await
            .unwrap();

        let last = *emitted.lock().unwrap().last().unwrap();
        assert_eq!(last, (30, 300));
    }

    #[tokio::test]
    async fn inactivity_triggers_callback_and_cancel() {
        let stream: PullStream = Box::pin(futures_util::stream::pending());
        let monitor = PullProgressMonitor::new(Duration::from_secs(60), Duration::from_millis(10));
        let ctx = CancellationToken::new();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();

        monitor
            .run(stream, ctx.clone(), Arc::new(|_| {}), Arc::new(move || { fired2.fetch_add(1, Ordering::SeqCst); }))
            .await
            .unwrap();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(ctx.is_cancelled());
    }
}
