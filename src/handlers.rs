use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    error::ChatError,
    models::{LoginRequest, Participant, RegisterRequest, SessionResponse},
    security::{middleware::SecurityContext, AuthError},
    state::AppState,
    telemetry::HealthStatus,
    websocket::handle_websocket,
};

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AuthError::InvalidInput(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
            AuthError::InvalidCredentials => {
                (StatusCode::UNAUTHORIZED, "Invalid name or secret.".to_string())
            }
            AuthError::UnknownToken => (StatusCode::UNAUTHORIZED, "Please sign in again.".to_string()),
            AuthError::Banned => (StatusCode::FORBIDDEN, "This account is banned.".to_string()),
            AuthError::Chat(err) => {
                let status = match err {
                    ChatError::Validation(_) => StatusCode::BAD_REQUEST,
                    ChatError::Conflict(_) => StatusCode::CONFLICT,
                    ChatError::Persistence(cause) => {
                        tracing::error!(error = %cause, "account storage failure");
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.notice())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn session_response(participant: Participant, token: String) -> SessionResponse {
    SessionResponse {
        id: participant.id,
        name: participant.name,
        role: participant.role,
        banned: participant.banned,
        color: participant.color,
        token,
    }
}

pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AuthError> {
    let (participant, token) = state.auth.register(&request.name, &request.secret).await?;
    Ok((StatusCode::CREATED, Json(session_response(participant, token))))
}

pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, AuthError> {
    let (participant, token) = state.auth.login(&request.name, &request.secret)?;
    Ok(Json(session_response(participant, token)))
}

#[derive(Deserialize)]
pub struct WsParams {
    token: Option<String>,
}

/// Upgrade to a chat session. Without a token the session can only watch.
///
/// The origin slot is claimed before the upgrade, so a full origin gets a plain 429.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(ctx): Extension<SecurityContext>,
    Query(params): Query<WsParams>,
) -> Response {
    let participant = match params.token.as_deref() {
        None => None,
        Some(token) => match state.auth.resolve(token) {
            Ok(participant) => Some(participant.id),
            Err(err) => return err.into_response(),
        },
    };

    let (guard, events) = match state.engine.broadcaster().connect(&ctx.origin) {
        Ok(session) => session,
        Err(refused) => {
            tracing::warn!(origin = %ctx.origin, "connection refused: {}", refused);
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": refused.to_string() })),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, guard, events, participant))
}

/// Health check endpoint for load balancer
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let health = HealthStatus::check(state.repo.as_ref(), state.engine.broadcaster()).await;

    if health.healthy {
        Ok(Json(health))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(health)))
    }
}

pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}
