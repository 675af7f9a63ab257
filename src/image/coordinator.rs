//! Image Coordinator (spec §4.3): dedups concurrent pulls, reference-counts
//! images, debounces deletions against concurrent reuse.
//!
//! The single-execution/multi-await idiom for de-bounced pulls mirrors the
//! `pantsbuild/pants` Docker command runner's `ImagePullCache`
//! (`async_oncecell::OnceCell` keyed by image name under a
//! `parking_lot::Mutex`-guarded map), here built on `tokio::sync::OnceCell`
//! so every caller racing for the same image reference calls the exact same
//! `get_or_init` closure and only one of them ever actually executes it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::error::{DriverError, DriverResult};

use super::progress::{EmitFn, PullProgress, PullProgressMonitor};

/// Resolved image id plus the image's default user, as discovered by
/// `ImageInspect` after a pull (spec §3 "Image Entry").
#[derive(Debug, Clone, Default)]
pub struct ImageUser {
    pub image_id: String,
    pub user: String,
    /// Image OS (`"linux"`/`"windows"`), as discovered by `ImageInspect`.
    /// Consulted by the Lifecycle Controller's Windows-only LCOW branch
    /// (spec §4.7 step 7).
    pub os: String,
}

#[derive(Debug, Clone)]
struct PullFailure {
    message: String,
}

type PullOutcome = Result<ImageUser, PullFailure>;

struct PullFuture {
    cell: OnceCell<PullOutcome>,
}

impl PullFuture {
    fn new() -> Self {
        Self { cell: OnceCell::new() }
    }
}

#[derive(Default)]
struct Inner {
    in_flight: HashMap<String, Arc<PullFuture>>,
    references: HashMap<String, HashSet<String>>,
    // Tagged with a generation id so a deferred-deletion worker can tell,
    // under the lock, whether the entry it's about to clean up is still the
    // one it created or has since been superseded by a newer deletion cycle
    // for the same image id (remove -> re-increment -> remove again, racing
    // the first worker's own teardown).
    pending_deletions: HashMap<String, (u64, CancellationToken)>,
}

pub struct ImageCoordinator {
    engine: Arc<dyn Engine>,
    gc_enabled: bool,
    remove_delay: Duration,
    inner: Mutex<Inner>,
    loggers: Arc<RwLock<HashMap<String, Vec<EmitFn>>>>,
    next_deletion_generation: AtomicU64,
}

impl ImageCoordinator {
    pub fn new(engine: Arc<dyn Engine>, gc_enabled: bool, remove_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            engine,
            gc_enabled,
            remove_delay,
            inner: Mutex::new(Inner::default()),
            loggers: Arc::new(RwLock::new(HashMap::new())),
            next_deletion_generation: AtomicU64::new(0),
        })
    }

    /// Locate or create the Pull Future for `image_ref`, register `emit` as
    /// a logger, await the (possibly shared) result, and on success
    /// increment the image's reference count (spec §4.3).
    pub async fn pull_image(
        self: &Arc<Self>,
        image_ref: &str,
        auth: Option<&str>,
        caller_id: &str,
        emit: EmitFn,
        pull_timeout: Duration,
        activity_timeout: Duration,
    ) -> DriverResult<ImageUser> {
        let future = {
            let mut inner = self.inner.lock();
            inner
                .in_flight
                .entry(image_ref.to_string())
                .or_insert_with(|| Arc::new(PullFuture::new()))
                .clone()
        };

        self.loggers
            .write()
            .entry(image_ref.to_string())
            .or_default()
            .push(emit);

        let this = self.clone();
        let image_ref_owned = image_ref.to_string();
        let auth_owned = auth.map(str::to_string);

        let outcome = future
            .cell
            .get_or_init(|| async move {
                this.run_pull(&image_ref_owned, auth_owned.as_deref(), pull_timeout, activity_timeout)
                    .await
            })
            .await
            .clone();

        // Unconditionally drop the in-flight entry once the first awaiter
        // observes completion, so an externally-deleted image is re-pulled
        // on the next request (spec §3 "Pull Future" lifetime).
        self.inner.lock().in_flight.remove(image_ref);
        self.loggers.write().remove(image_ref);

        match outcome {
            Ok(image_user) => {
                info!(image = %image_ref, image_id = %image_user.image_id, caller_id, "pulled image");
                if self.gc_enabled {
                    self.increment_image_reference(&image_user.image_id, image_ref, caller_id);
                }
                Ok(image_user)
            }
            Err(failure) => Err(DriverError::image_pull(image_ref, failure.message)),
        }
    }

    async fn run_pull(
        &self,
        image_ref: &str,
        auth: Option<&str>,
        pull_timeout: Duration,
        activity_timeout: Duration,
    ) -> PullOutcome {
        let ctx = CancellationToken::new();
        let loggers = self.loggers.clone();
        let image_ref_for_emit = image_ref.to_string();

        let emit: EmitFn = Arc::new(move |progress: PullProgress| {
            if let Some(list) = loggers.read().get(&image_ref_for_emit) {
                for logger in list {
                    logger(progress.clone());
                }
            }
        });

        let engine = self.engine.clone();
        let image_ref_owned = image_ref.to_string();
        let auth_owned = auth.map(str::to_string);
        let ctx_for_monitor = ctx.clone();

        let attempt = async move {
            let stream = engine.image_pull(&image_ref_owned, auth_owned.as_deref()).await?;
            let monitor = PullProgressMonitor::new(Duration::from_secs(2), activity_timeout);
            monitor
                .run(
                    stream,
                    ctx_for_monitor,
                    emit,
                    Arc::new(move || debug!(image = %image_ref_owned, "pull activity timeout")),
                )
                .await
        };

        let pull_result = tokio::select! {
            res = attempt => res,
            _ = tokio::time::sleep(pull_timeout) => {
                ctx.cancel();
                Err(EngineError::Transient(format!(
                    "pull of {image_ref} timed out after {pull_timeout:?}"
                )))
            }
        };

        if let Err(e) = pull_result {
            return Err(PullFailure { message: e.to_string() });
        }

        match self.engine.image_inspect(image_ref).await {
            Ok(inspect) => Ok(ImageUser {
                image_id: inspect.id,
                user: inspect.user,
                os: inspect.os,
            }),
            Err(e) => Err(PullFailure {
                message: format!("failed to inspect pulled image {image_ref}: {e}"),
            }),
        }
    }

    /// Cancel and forget any pending deletion for `image_id`, insert
    /// `caller_id` into its reference set. Idempotent per `(image_id,
    /// caller_id)`.
    pub fn increment_image_reference(&self, image_id: &str, _image_ref: &str, caller_id: &str) {
        let mut inner = self.inner.lock();
        if let Some((_, cancel)) = inner.pending_deletions.remove(image_id) {
            cancel.cancel();
            debug!(image_id, "cancelled pending deletion on reference increment");
        }
        inner
            .references
            .entry(image_id.to_string())
            .or_default()
            .insert(caller_id.to_string());
    }

    /// Remove `caller_id` from `image_id`'s reference set; if the set
    /// becomes empty, schedule a deferred deletion (spec §4.3).
    pub fn remove_image(self: &Arc<Self>, image_id: &str, caller_id: &str) {
        let (generation, cancel) = {
            let mut inner = self.inner.lock();
            if let Some(set) = inner.references.get_mut(image_id) {
                set.remove(caller_id);
                if !set.is_empty() {
                    return;
                }
            }
            inner.references.remove(image_id);

            let generation = self.next_deletion_generation.fetch_add(1, Ordering::SeqCst);
            let cancel = CancellationToken::new();
            inner
                .pending_deletions
                .insert(image_id.to_string(), (generation, cancel.clone()));
            (generation, cancel)
        };

        debug!(image_id, generation, "scheduled deferred image deletion");
        let this = self.clone();
        let image_id_owned = image_id.to_string();
        let remove_delay = self.remove_delay;

        tokio::spawn(async move {
            this.run_deferred_deletion(image_id_owned, generation, cancel, remove_delay).await;
        });
    }

    async fn run_deferred_deletion(
        self: Arc<Self>,
        image_id: String,
        generation: u64,
        cancel: CancellationToken,
        remove_delay: Duration,
    ) {
        // Whichever branch this worker exits through, clear its own entry
        // only if it's still the current one for `image_id` -- a newer
        // deletion cycle may have already replaced it (reference added back
        // then dropped again while this worker was still winding down).
        let this = self.clone();
        let image_id_for_guard = image_id.clone();
        let _forget_on_exit = scopeguard::guard((), move |_| {
            let mut inner = this.inner.lock();
            if let std::collections::hash_map::Entry::Occupied(entry) =
                inner.pending_deletions.entry(image_id_for_guard)
            {
                if entry.get().0 == generation {
                    entry.remove();
                }
            }
        });

        tokio::select! {
            _ = tokio::time::sleep(remove_delay) => {}
            _ = cancel.cancelled() => {
                debug!(image_id, "deferred deletion cancelled before firing");
                return;
            }
        }

        {
            let inner = self.inner.lock();
            match inner.pending_deletions.get(&image_id) {
                Some((gen, _)) if *gen == generation => {}
                _ => {
                    debug!(image_id, "deferred deletion cancelled before firing");
                    return;
                }
            }
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.engine.image_remove(&image_id, true).await {
                Ok(()) => {
                    info!(image_id, "removed unreferenced image");
                    break;
                }
                Err(EngineError::NotFound(_)) | Err(EngineError::Conflict(_)) => break,
                Err(e) if attempt < 3 => {
                    warn!(image_id, attempt, error = %e, "image remove failed, retrying");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                Err(e) => {
                    warn!(image_id, error = %e, "image remove failed after retries, giving up");
                    break;
                }
            }
        }
    }

    /// Snapshot of the callers currently holding `image_id` (test/diagnostic use).
    pub fn reference_holders(&self, image_id: &str) -> HashSet<String> {
        self.inner
            .lock()
            .references
            .get(image_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_pending_deletion(&self, image_id: &str) -> bool {
        self.inner.lock().pending_deletions.contains_key(image_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().in_flight.len()
    }
}
