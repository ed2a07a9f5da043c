//! Per-request upstream selection.
//!
//! Every request is classified from scratch: non-archive paths go to the
//! origin untouched, archive paths are looked up in the cache and either
//! served by the internal cache server or sent to the origin while the cache
//! is warmed in the background.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::cache::key::{PathResolutionError, is_archive_path};
use crate::cache::{CacheKey, CacheManager, CacheState, PopulateStart, Populator};
use crate::config::Config;
use crate::metrics::{MetricsRegistry, RouteOutcome, UpstreamKind};

/// Where a request is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upstream {
    /// The internal cache file server.
    Internal,
    /// The origin registry.
    Origin,
}

impl Upstream {
    pub fn kind(self) -> UpstreamKind {
        match self {
            Self::Internal => UpstreamKind::Internal,
            Self::Origin => UpstreamKind::Origin,
        }
    }
}

/// Why [`RouteEngine::decide`] picked its upstream.
#[derive(Debug)]
pub enum RouteReason {
    /// Not an archive request; caching does not apply.
    Passthrough,
    /// Archive extension, but the path cannot be mapped into the cache.
    Unresolvable(PathResolutionError),
    Hit,
    /// Absent from the cache; a populate was launched or joined.
    Miss(PopulateStart),
    /// Absent from the cache with a populate already running.
    Populating,
    /// The cache lookup failed; nothing is written for this key.
    Indeterminate,
}

#[derive(Debug)]
pub struct RouteDecision {
    pub upstream: Upstream,
    pub reason: RouteReason,
}

impl RouteDecision {
    fn origin(reason: RouteReason) -> Self {
        Self {
            upstream: Upstream::Origin,
            reason,
        }
    }

    pub fn outcome(&self) -> RouteOutcome {
        match self.reason {
            RouteReason::Passthrough => RouteOutcome::Passthrough,
            RouteReason::Unresolvable(_) => RouteOutcome::Unresolvable,
            RouteReason::Hit => RouteOutcome::Hit,
            RouteReason::Miss(_) => RouteOutcome::Miss,
            RouteReason::Populating => RouteOutcome::Populating,
            RouteReason::Indeterminate => RouteOutcome::Indeterminate,
        }
    }
}

// ---------------------------------------------------------------------------
// RouteEngine
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RouteEngine {
    cache: CacheManager,
    populator: Populator,
    archive_extensions: Arc<[String]>,
    internal_base: String,
    origin_base: String,
    metrics: MetricsRegistry,
}

impl RouteEngine {
    pub fn new(
        config: &Config,
        cache: CacheManager,
        populator: Populator,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            cache,
            populator,
            archive_extensions: config.cache.archive_extensions.clone().into(),
            internal_base: config.cache_server.base_url.trim_end_matches('/').to_string(),
            origin_base: config.origin.base_url.trim_end_matches('/').to_string(),
            metrics,
        }
    }

    /// Base URL for `upstream`, without a trailing slash.
    pub fn target(&self, upstream: Upstream) -> &str {
        match upstream {
            Upstream::Internal => &self.internal_base,
            Upstream::Origin => &self.origin_base,
        }
    }

    /// Classify `path` and pick its upstream, launching a background
    /// populate when an archive is missing from the cache.
    #[instrument(skip(self))]
    pub async fn decide(&self, path: &str) -> RouteDecision {
        let decision = self.classify(path).await;
        self.metrics.metrics.record_route(decision.outcome());
        decision
    }

    async fn classify(&self, path: &str) -> RouteDecision {
        if !is_archive_path(path, &self.archive_extensions[..]) {
            debug!("not an archive request, routing to origin");
            return RouteDecision::origin(RouteReason::Passthrough);
        }

        let key = match CacheKey::for_archive(path, &self.archive_extensions[..]) {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "archive path cannot be cached, routing to origin");
                return RouteDecision::origin(RouteReason::Unresolvable(e));
            }
        };

        let state = match self.cache.inspect(&key).await {
            CacheState::Absent if self.populator.is_populating(&key) => CacheState::Populating,
            state => state,
        };

        match state {
            CacheState::Present => {
                debug!(%key, "cache hit, routing to cache server");
                RouteDecision {
                    upstream: Upstream::Internal,
                    reason: RouteReason::Hit,
                }
            }
            CacheState::Absent => {
                let start = self.populator.start(key);
                debug!(
                    joined = !start.is_launched(),
                    "cache miss, routing to origin and populating"
                );
                RouteDecision::origin(RouteReason::Miss(start))
            }
            CacheState::Populating => {
                debug!(%key, "populate in flight, routing to origin");
                RouteDecision::origin(RouteReason::Populating)
            }
            CacheState::Indeterminate => RouteDecision::origin(RouteReason::Indeterminate),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
