//! Internal file server for populated archives.
//!
//! Cache hits are forwarded here by the gateway with the client's original
//! path.  The path is resolved through [`CacheKey`] exactly as the populator
//! resolved it when writing, so the file served is the file written.

use std::io;
use std::sync::Arc;

use anyhow::Context as _;
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use super::handler::AppError;
use crate::AppState;
use crate::cache::{CacheKey, CacheManager};

#[derive(Clone)]
struct CacheServerState {
    cache: CacheManager,
    /// Path component of the configured base URL, without a trailing slash.
    prefix: String,
}

/// Build the cache server [`Router`] serving files under the cache root.
pub fn create_router(state: &AppState) -> anyhow::Result<Router> {
    let prefix = mount_prefix(&state.config.cache_server.base_url)?;
    let state = Arc::new(CacheServerState {
        cache: state.cache_manager.clone(),
        prefix,
    });
    Ok(Router::new().fallback(serve_cached).with_state(state))
}

fn mount_prefix(base_url: &str) -> anyhow::Result<String> {
    let url = url::Url::parse(base_url)
        .with_context(|| format!("invalid cache server base_url: {base_url}"))?;
    Ok(url.path().trim_end_matches('/').to_string())
}

/// Strip the mount prefix, requiring it to end on a segment boundary.
fn strip_mount<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(path);
    }
    path.strip_prefix(prefix)
        .filter(|rest| rest.starts_with('/'))
}

#[instrument(skip_all, fields(%method, path = %uri.path()))]
async fn serve_cached(
    State(state): State<Arc<CacheServerState>>,
    method: Method,
    uri: Uri,
) -> Result<Response, AppError> {
    if method != Method::GET && method != Method::HEAD {
        return Ok((
            StatusCode::METHOD_NOT_ALLOWED,
            [(header::ALLOW, HeaderValue::from_static("GET, HEAD"))],
        )
            .into_response());
    }

    let Some(path) = strip_mount(uri.path(), &state.prefix) else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let key = match CacheKey::from_request_path(path) {
        Ok(key) => key,
        Err(e) => {
            debug!(error = %e, "unresolvable cache path");
            return Ok(StatusCode::NOT_FOUND.into_response());
        }
    };

    let file_path = state.cache.entry_path(&key);
    let file = match tokio::fs::File::open(&file_path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(%key, "not in cache");
            return Ok(StatusCode::NOT_FOUND.into_response());
        }
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("open cached archive: {}", file_path.display()))
                .into());
        }
    };
    let meta = file
        .metadata()
        .await
        .with_context(|| format!("stat cached archive: {}", file_path.display()))?;
    if !meta.is_file() {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(file))
    };

    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len()));
    Ok(response)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::Config;

    async fn serve(root: &std::path::Path, base_url: &str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = Config::default();
        config.cache.path = root.display().to_string();
        config.cache_server.base_url = base_url.replace(
            "{addr}",
            &listener.local_addr().unwrap().to_string(),
        );
        let state = AppState::new(Arc::new(config), CancellationToken::new()).unwrap();
        let app = create_router(&state).unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        state.config.cache_server.base_url.trim_end_matches('/').to_string()
    }

    fn seed(root: &std::path::Path, rel: &str, body: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn mount_prefix_is_the_base_path() {
        assert_eq!(mount_prefix("http://localhost:3000").unwrap(), "");
        assert_eq!(mount_prefix("http://localhost:3000/").unwrap(), "");
        assert_eq!(mount_prefix("http://cache:3000/npm/").unwrap(), "/npm");
        assert!(mount_prefix("not a url").is_err());
    }

    #[test]
    fn strip_mount_respects_segment_boundary() {
        assert_eq!(strip_mount("/a/b", ""), Some("/a/b"));
        assert_eq!(strip_mount("/npm/pkg/-/x.tgz", "/npm"), Some("/pkg/-/x.tgz"));
        assert_eq!(strip_mount("/npmx/pkg", "/npm"), None);
        assert_eq!(strip_mount("/npm", "/npm"), None);
        assert_eq!(strip_mount("/other/pkg", "/npm"), None);
    }

    #[tokio::test]
    async fn serves_cached_bytes_with_length() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "@scope/pkg/-/pkg-1.0.0.tgz", b"tarball-bytes");
        let base = serve(dir.path(), "http://{addr}").await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("{base}/@scope/pkg/-/pkg-1.0.0.tgz"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/octet-stream"
        );
        assert_eq!(resp.headers().get("content-length").unwrap(), "13");
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"tarball-bytes");

        let head = client
            .head(format!("{base}/@scope/pkg/-/pkg-1.0.0.tgz"))
            .send()
            .await
            .unwrap();
        assert_eq!(head.status(), 200);
        assert_eq!(head.headers().get("content-length").unwrap(), "13");
    }

    #[tokio::test]
    async fn honours_base_url_prefix() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "pkg/-/pkg-2.0.0.tgz", b"unscoped");
        let base = serve(dir.path(), "http://{addr}/mirror/").await;

        let resp = reqwest::get(format!("{base}/pkg/-/pkg-2.0.0.tgz"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.bytes().await.unwrap().as_ref(), b"unscoped");
    }

    #[tokio::test]
    async fn missing_unsafe_and_short_paths_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        seed(dir.path(), "@scope/pkg/-/pkg-1.0.0.tgz", b"x");
        let base = serve(dir.path(), "http://{addr}").await;

        for path in [
            "/@scope/pkg/-/pkg-9.9.9.tgz",
            "/@scope/pkg/-/..hidden.tgz",
            "/pkg-1.0.0.tgz",
            "/@scope/pkg/-",
        ] {
            let resp = reqwest::get(format!("{base}{path}")).await.unwrap();
            assert_eq!(resp.status(), 404, "{path}");
        }
    }

    #[tokio::test]
    async fn rejects_other_methods() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(dir.path(), "http://{addr}").await;

        let resp = reqwest::Client::new()
            .put(format!("{base}/@scope/pkg/-/pkg-1.0.0.tgz"))
            .body("x")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 405);
        assert_eq!(resp.headers().get("allow").unwrap(), "GET, HEAD");
    }
}
