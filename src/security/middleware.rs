use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::net::{IpAddr, SocketAddr};

use crate::security::origin::client_ip;
use crate::state::AppState;

/// Who is calling, as far as abuse control is concerned.
#[derive(Clone, Debug)]
pub struct SecurityContext {
    pub ip: IpAddr,
    /// Hashed address; the only form that reaches registries and logs.
    pub origin: String,
}

/// Resolve the caller address and attach a [`SecurityContext`] to the request.
pub async fn security_middleware(
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(req.headers(), peer, state.config.trust_forwarded_for);
    let origin = state.origin_keys.generate(&ip);
    req.extensions_mut().insert(SecurityContext { ip, origin });
    next.run(req).await
}

/// Per-IP throttle for the account endpoints.
pub async fn auth_throttle_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(ctx) = req.extensions().get::<SecurityContext>() {
        if !state.auth_throttle.check(&ctx.ip) {
            tracing::warn!(origin = %ctx.origin, "account endpoint throttled");
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "Too many attempts, slow down."})),
            )
                .into_response();
        }
    }

    next.run(req).await
}
