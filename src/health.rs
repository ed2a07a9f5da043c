use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Serialize;

use crate::AppState;
use crate::cache::CacheManager;
use crate::config::Config;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub origin: CheckResult,
    pub disk: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

/// Subset of [`AppState`] required by the health-check handler.
#[derive(Clone)]
pub struct HealthState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub cache: CacheManager,
    pub metrics: MetricsRegistry,
}

impl From<&AppState> for HealthState {
    fn from(state: &AppState) -> Self {
        Self {
            config: Arc::clone(&state.config),
            http_client: state.http_client.clone(),
            cache: state.cache_manager.clone(),
            metrics: state.metrics.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_origin(client: &reqwest::Client, base_url: &str) -> CheckResult {
    let url = format!("{}/", base_url.trim_end_matches('/'));
    match client.head(&url).send().await {
        Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
            CheckResult::healthy()
        }
        Ok(resp) => CheckResult::unhealthy(format!("HEAD {} returned {}", url, resp.status())),
        Err(e) => CheckResult::unhealthy(format!("HEAD {} failed: {e}", url)),
    }
}

async fn check_disk(cache: &CacheManager, metrics: &MetricsRegistry) -> CheckResult {
    let cache = cache.clone();

    match tokio::task::spawn_blocking(move || disk_usage(&cache)).await {
        Ok(Ok(used)) => {
            metrics
                .metrics
                .cache_size_bytes
                .set(i64::try_from(used).unwrap_or(i64::MAX));
            CheckResult {
                ok: true,
                detail: Some(format!("used {used} bytes")),
            }
        }
        Ok(Err(e)) => CheckResult::unhealthy(format!("disk check failed: {e:#}")),
        Err(e) => CheckResult::unhealthy(format!("disk check task failed: {e}")),
    }
}

/// Bytes used under the cache root, after confirming it is a writable
/// directory.
fn disk_usage(cache: &CacheManager) -> anyhow::Result<u64> {
    let dir = cache.base_path.as_path();
    anyhow::ensure!(dir.is_dir(), "{} is not a directory", dir.display());
    tempfile::Builder::new()
        .prefix(".healthz")
        .tempfile_in(dir)
        .map_err(|e| anyhow::anyhow!("{} is not writable: {e}", dir.display()))?;
    cache.total_size_bytes()
}

// ---------------------------------------------------------------------------
// Aggregate status
// ---------------------------------------------------------------------------

/// The cache directory is required to serve anything from disk; an
/// unreachable origin only degrades service since hits still work.
fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    if checks.origin.ok && checks.disk.ok {
        HealthStatus::Ok
    } else if !checks.disk.ok {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

// ---------------------------------------------------------------------------
// Axum handler
// ---------------------------------------------------------------------------

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (origin, disk) = tokio::join!(
        check_origin(&state.http_client, &state.config.origin.base_url),
        check_disk(&state.cache, &state.metrics),
    );

    let checks = HealthChecks { origin, disk };
    let status = aggregate_status(&checks);
    let body = HealthResponse { status, checks };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(ok: bool) -> CheckResult {
        if ok {
            CheckResult::healthy()
        } else {
            CheckResult::unhealthy("down")
        }
    }

    #[test]
    fn aggregate() {
        let status = |origin, disk| {
            aggregate_status(&HealthChecks {
                origin: result(origin),
                disk: result(disk),
            })
        };
        assert_eq!(status(true, true), HealthStatus::Ok);
        assert_eq!(status(false, true), HealthStatus::Degraded);
        assert_eq!(status(true, false), HealthStatus::Unhealthy);
        assert_eq!(status(false, false), HealthStatus::Unhealthy);
    }

    #[test]
    fn disk_usage_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("pkg/-")).unwrap();
        std::fs::write(dir.path().join("pkg/-/pkg-1.0.0.tgz"), vec![0u8; 300]).unwrap();
        assert_eq!(disk_usage(&CacheManager::with_base_path(dir.path())).unwrap(), 300);
    }

    #[test]
    fn disk_usage_requires_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        assert!(disk_usage(&CacheManager::with_base_path(file)).is_err());
        assert!(disk_usage(&CacheManager::with_base_path(dir.path().join("missing"))).is_err());
    }
}
