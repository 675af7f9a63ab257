//! Lazily-constructed, once-guarded holder for the short/infinity engine
//! client pair (spec §4.1, §5, §9 "Global engine client").
//!
//! The teacher builds a single `Arc<Docker>` lazily under a constructor
//! (`docker::service::DockerService::new`); this generalizes that to a pair
//! with distinct per-request timeouts, built once behind a `tokio::sync::
//! OnceCell` so "the first concurrent caller wins and subsequent callers
//! observe the same instance" (spec §4.1) without reintroducing an
//! unsynchronized global (spec §9).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use super::{BollardEngine, Engine};

/// Bounded timeout used for ordinary calls.
pub const SHORT_CLIENT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The pair of engine clients the core depends on: `short` for ordinary
/// calls, `infinity` for long-poll operations (wait, stats, exec-stream).
pub struct EngineClients {
    short: OnceCell<Arc<dyn Engine>>,
    infinity: OnceCell<Arc<dyn Engine>>,
    docker_host: Option<String>,
}

impl EngineClients {
    pub fn new(docker_host: Option<String>) -> Self {
        Self {
            short: OnceCell::new(),
            infinity: OnceCell::new(),
            docker_host,
        }
    }

    /// The bounded-timeout client used for create/start/stop/inspect/etc.
    pub async fn short(&self) -> Arc<dyn Engine> {
        self.short
            .get_or_init(|| async {
                Arc::new(BollardEngine::connect(self.docker_host.as_deref(), SHORT_CLIENT_TIMEOUT))
                    as Arc<dyn Engine>
            })
            .await
            .clone()
    }

    /// The unbounded client used only for wait/stop/stats/exec-stream.
    pub async fn infinity(&self) -> Arc<dyn Engine> {
        self.infinity
            .get_or_init(|| async {
                Arc::new(BollardEngine::connect_unbounded(self.docker_host.as_deref())) as Arc<dyn Engine>
            })
            .await
            .clone()
    }
}
