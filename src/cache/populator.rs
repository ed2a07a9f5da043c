//! Background cache population.
//!
//! A miss routes the client to the origin immediately and hands the key to
//! the [`Populator`], which fetches the same artifact from the origin and
//! writes it into the cache.  Tasks are spawned on a [`TaskTracker`] so that
//! shutdown can drain them, hold a semaphore permit while talking to the
//! origin, and stop early when the shutdown token fires.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use super::inflight::{Claim, Completion, InFlight, OutcomeReceiver, PopulateOutcome};
use super::key::CacheKey;
use super::manager::{CacheManager, CacheState};
use crate::config::PopulateConfig;
use crate::error::PopulateError;
use crate::metrics::MetricsRegistry;

/// Mode of a published entry.  `tempfile` creates its files `0600`.
#[cfg(unix)]
const PUBLISHED_MODE: u32 = 0o644;

/// How a call to [`Populator::start`] was satisfied.
#[derive(Debug)]
pub enum PopulateStart {
    /// A new populate task was spawned.
    Launched(OutcomeReceiver),
    /// A populate for the key was already running and is shared.
    Joined(OutcomeReceiver),
}

impl PopulateStart {
    pub fn is_launched(&self) -> bool {
        matches!(self, Self::Launched(_))
    }

    /// Receiver for the outcome of the populate this call started or joined.
    #[cfg(test)]
    pub fn into_receiver(self) -> OutcomeReceiver {
        match self {
            Self::Launched(rx) | Self::Joined(rx) => rx,
        }
    }
}

// ---------------------------------------------------------------------------
// Populator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Populator {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    origin_base: String,
    cache: CacheManager,
    settings: PopulateConfig,
    in_flight: InFlight,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    permits: Semaphore,
    metrics: MetricsRegistry,
    launched: AtomicU64,
}

impl Populator {
    pub fn new(
        client: reqwest::Client,
        origin_base: &str,
        cache: CacheManager,
        settings: PopulateConfig,
        metrics: MetricsRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        let permits = Semaphore::new(settings.max_concurrent.max(1));
        Self {
            inner: Arc::new(Inner {
                client,
                origin_base: origin_base.trim_end_matches('/').to_string(),
                cache,
                settings,
                in_flight: InFlight::new(),
                tracker: TaskTracker::new(),
                shutdown,
                permits,
                metrics,
                launched: AtomicU64::new(0),
            }),
        }
    }

    /// Start populating `key` in the background.  Never waits for the fetch.
    ///
    /// With single-flight enabled, a key that is already being populated is
    /// joined rather than fetched a second time.
    pub fn start(&self, key: CacheKey) -> PopulateStart {
        let completion = if self.inner.settings.single_flight {
            match self.inner.in_flight.claim(&key) {
                Claim::Leader(completion) => completion,
                Claim::Follower(rx) => {
                    debug!(%key, "populate already in flight, joining");
                    return PopulateStart::Joined(rx);
                }
            }
        } else {
            InFlight::untracked()
        };

        let rx = completion.subscribe();
        self.inner.launched.fetch_add(1, Ordering::Relaxed);
        self.inner.metrics.metrics.populates_in_flight.inc();

        let inner = Arc::clone(&self.inner);
        self.inner.tracker.spawn(inner.run(key, completion));

        PopulateStart::Launched(rx)
    }

    /// Whether a populate for `key` is registered as in flight.  Always
    /// `false` when single-flight is disabled.
    pub fn is_populating(&self, key: &CacheKey) -> bool {
        self.inner.in_flight.contains(key)
    }

    /// Total number of populate tasks spawned since startup.
    pub fn launched(&self) -> u64 {
        self.inner.launched.load(Ordering::Relaxed)
    }

    /// Number of populate tasks still queued or running.
    pub fn active(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Stop accepting drain waits, give running tasks `grace` to finish, then
    /// cancel whatever is left and wait for it to unwind.
    pub async fn shutdown(&self, grace: Duration) {
        let tracker = &self.inner.tracker;
        tracker.close();
        if tracker.is_empty() {
            return;
        }

        info!(active = self.active(), ?grace, "draining populate tasks");
        if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
            warn!(
                active = self.active(),
                "populate drain timed out, cancelling remaining tasks"
            );
            self.inner.shutdown.cancel();
            tracker.wait().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Task body
// ---------------------------------------------------------------------------

impl Inner {
    #[instrument(skip_all, fields(%key, package = key.package_name()))]
    async fn run(self: Arc<Self>, key: CacheKey, completion: Completion) {
        let started = Instant::now();

        let result = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(PopulateError::Cancelled),
            result = self.populate_with_deadline(&key) => result,
        };

        let metrics = &self.metrics.metrics;
        let outcome = match result {
            Ok(outcome) => {
                match &outcome {
                    PopulateOutcome::Stored { bytes } => {
                        info!(bytes, elapsed_ms = started.elapsed().as_millis() as u64, "artifact cached");
                        metrics.record_populate("stored");
                    }
                    _ => {
                        debug!("artifact already cached, skipped fetch");
                        metrics.record_populate("already_cached");
                    }
                }
                outcome
            }
            Err(e) => {
                warn!(error = %e, kind = e.kind(), "populate failed");
                metrics.record_populate(e.kind());
                PopulateOutcome::Failed {
                    kind: e.kind(),
                    message: e.to_string(),
                }
            }
        };

        metrics
            .populate_duration_seconds
            .observe(started.elapsed().as_secs_f64());
        metrics.populates_in_flight.dec();
        completion.finish(outcome);
    }

    async fn populate_with_deadline(&self, key: &CacheKey) -> Result<PopulateOutcome, PopulateError> {
        match self.settings.timeout_secs {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), self.populate(key))
                .await
                .unwrap_or(Err(PopulateError::Timeout { secs })),
            None => self.populate(key).await,
        }
    }

    async fn populate(&self, key: &CacheKey) -> Result<PopulateOutcome, PopulateError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PopulateError::Cancelled)?;

        // Another writer may have published while this task was queued.
        if self.cache.inspect(key).await == CacheState::Present {
            return Ok(PopulateOutcome::AlreadyCached);
        }

        let url = format!("{}{}", self.origin_base, key.request_path());

        debug!(%url, %key, atomic = self.settings.atomic_publish, "starting artifact download");

        let bytes = if self.settings.atomic_publish {
            self.download_atomic(&url, key).await?
        } else {
            self.download_in_place(&url, key).await?
        };

        self.metrics.metrics.populate_bytes.inc_by(bytes);
        Ok(PopulateOutcome::Stored { bytes })
    }

    async fn entry_dir(&self, key: &CacheKey) -> Result<PathBuf, PopulateError> {
        self.cache
            .ensure_entry_dir(key)
            .await
            .map_err(|e| PopulateError::write(self.cache.entry_path(key), e))
    }

    /// Write straight to the entry path.  The file is visible from creation,
    /// so a failed fetch leaves an empty file and a broken transfer leaves a
    /// partial one; both are later classified as present.
    async fn download_in_place(&self, url: &str, key: &CacheKey) -> Result<u64, PopulateError> {
        let dest = self.entry_dir(key).await?;
        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| PopulateError::write(&dest, e))?;

        let resp = self.fetch(url).await?;
        let bytes = copy_body(resp, &mut file, url, &dest).await?;
        file.flush().await.map_err(|e| PopulateError::write(&dest, e))?;
        Ok(bytes)
    }

    /// Write to a hidden temp file next to the entry path and rename it into
    /// place only after the whole body has been written and synced.  Nothing
    /// touches the cache directory until the origin has answered `200 OK`,
    /// and the temp file is deleted on every failure path, including
    /// cancellation.
    async fn download_atomic(&self, url: &str, key: &CacheKey) -> Result<u64, PopulateError> {
        let resp = self.fetch(url).await?;

        let dest = self.entry_dir(key).await?;
        let parent = dest.parent().unwrap_or(self.cache.base_path.as_path());

        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", key.filename()))
            .suffix(".part")
            .tempfile_in(parent)
            .map_err(|e| PopulateError::write(parent, e))?;
        let (std_file, tmp_path) = tmp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let bytes = copy_body(resp, &mut file, url, &tmp_path).await?;

        file.flush().await.map_err(|e| PopulateError::write(&*tmp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| PopulateError::write(&*tmp_path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            file.set_permissions(std::fs::Permissions::from_mode(PUBLISHED_MODE))
                .await
                .map_err(|e| PopulateError::write(&*tmp_path, e))?;
        }
        drop(file);

        tmp_path
            .persist(&dest)
            .map_err(|e| PopulateError::write(&dest, e.error))?;
        Ok(bytes)
    }

    async fn fetch(&self, url: &str) -> Result<reqwest::Response, PopulateError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| PopulateError::Fetch {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if status != StatusCode::OK {
            return Err(PopulateError::UpstreamStatus {
                url: url.to_string(),
                status,
            });
        }
        Ok(resp)
    }
}

/// Stream `resp` into `file` chunk by chunk and return the byte count.
async fn copy_body(
    resp: reqwest::Response,
    file: &mut tokio::fs::File,
    url: &str,
    path: &Path,
) -> Result<u64, PopulateError> {
    let mut stream = resp.bytes_stream();
    let mut written: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| PopulateError::Fetch {
            url: url.to_string(),
            source,
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| PopulateError::write(path, e))?;
        written += chunk.len() as u64;
    }

    Ok(written)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
