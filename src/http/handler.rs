//! Gateway router: every method and path is routed.
//!
//! The request path is handed to the [`RouteEngine`](crate::routing::RouteEngine),
//! which picks the cache server or the origin, and the original request is
//! forwarded there unchanged apart from host rewriting.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::{error, info, instrument, warn};

use super::forward;
use crate::AppState;
use crate::metrics::UpstreamLabels;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the gateway [`Router`].
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new().fallback(handle_request).with_state(state)
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(method = %req.method(), path = %req.uri().path()))]
async fn handle_request(
    State(state): State<Arc<AppState>>,
    req: Request,
) -> Result<Response, AppError> {
    let decision = state.routes.decide(req.uri().path()).await;
    let target = state.routes.target(decision.upstream);

    info!(
        upstream = ?decision.upstream,
        outcome = ?decision.outcome(),
        %target,
        "routing request"
    );

    forward::forward(&state.proxy_client, target, req)
        .await
        .map_err(|e| {
            state
                .metrics
                .metrics
                .forward_errors_total
                .get_or_create(&UpstreamLabels {
                    upstream: decision.upstream.kind(),
                })
                .inc();
            AppError::BadGateway(e)
        })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// The chosen upstream could not be reached or broke off.
    BadGateway(anyhow::Error),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadGateway(err) => {
                warn!(error = %format!("{err:#}"), "upstream unavailable");
                (StatusCode::BAD_GATEWAY, format!("Bad gateway: {err:#}")).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
