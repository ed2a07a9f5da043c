//! Streaming reverse proxy used by the gateway for both upstreams.

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, header};
use axum::response::Response;
use tracing::debug;

/// Connection-scoped headers that must not be relayed by a proxy.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Copy `headers` minus hop-by-hop entries and anything the `Connection`
/// header names.
fn relay_headers(headers: &HeaderMap) -> HeaderMap {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(&name.as_str()) || listed.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Whether the incoming request carries a body worth streaming upstream.
fn has_body(headers: &HeaderMap) -> bool {
    headers.contains_key(header::TRANSFER_ENCODING)
        || headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.trim() != "0")
}

/// Forward `req` to `target_base` + its path and query and stream the
/// upstream response back.
///
/// The client's `Host` is replaced by the upstream's own and preserved in
/// `X-Forwarded-Host`.  Redirects are returned to the client as-is; that is
/// a property of `client`, which must be built with redirects disabled.
pub async fn forward(client: &reqwest::Client, target_base: &str, req: Request) -> Result<Response> {
    let (parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{target_base}{path_and_query}");

    let mut headers = relay_headers(&parts.headers);
    headers.remove(header::HOST);
    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert(X_FORWARDED_HOST, host.clone());
    }

    let mut upstream_req = client.request(parts.method.clone(), &url).headers(headers);
    if has_body(&parts.headers) {
        upstream_req = upstream_req.body(reqwest::Body::wrap_stream(body.into_data_stream()));
    }

    let upstream = upstream_req
        .send()
        .await
        .with_context(|| format!("{} {url} failed", parts.method))?;

    let status = upstream.status();
    debug!(%url, %status, "upstream responded");

    let response_headers = relay_headers(upstream.headers());
    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    Ok(response)
}
