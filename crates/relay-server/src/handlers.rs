//! HTTP handlers: the connection upgrade endpoint plus the account and
//! history endpoints around it.

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_auth::{bearer_from_parts, password, IdentityGate};
use relay_core::{Identity, RelayError, StoreError, StoredMessage};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::config::LivenessTimings;
use crate::connection::run_connection;
use crate::health::{health_check, HealthResponse};
use crate::responses::{ApiError, RefreshBody, SuccessBody};
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct TokenParams {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: String,
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

fn authenticate(gate: &IdentityGate, token: Option<&str>) -> Result<Identity, ApiError> {
    let token = token.ok_or_else(|| ApiError::unauthorized("unauthorized; token missing"))?;
    gate.validate(token).map_err(|e| {
        let e = RelayError::from(e);
        debug!(error = %e, kind = e.error_kind(), "token rejected");
        ApiError::unauthorized("unauthorized; invalid token")
    })
}

/// `GET /ws`: authenticate, then upgrade. A rejected credential never
/// reaches the hub or the store.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TokenParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = bearer_from_parts(authorization(&headers), params.token.as_deref());
    let identity = match authenticate(&state.gate, token) {
        Ok(identity) => identity,
        Err(e) => {
            warn!(reason = %e.message, "connection upgrade rejected");
            return ApiError::unauthorized("unauthorized").into_response();
        }
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let hub = state.hub.clone();
    let timings = LivenessTimings::from(state.config.as_ref());
    let capacity = state.config.outbound_queue_capacity;
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| run_connection(socket, identity, hub, timings, capacity))
}

/// `POST /register`
pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<(StatusCode, Json<SuccessBody>), ApiError> {
    let Json(creds) = body.map_err(|_| ApiError::bad_request("invalid request body"))?;
    if creds.username.trim().is_empty() || creds.password.is_empty() {
        return Err(ApiError::bad_request("username and password are required"));
    }

    let secret = creds.password;
    let hash = tokio::task::spawn_blocking(move || password::hash(&secret))
        .await
        .map_err(|e| ApiError::internal(format!("server error: {e}")))?
        .map_err(|e| {
            error!(error = %e, "password hashing failed");
            ApiError::internal("server error")
        })?;

    match state.accounts.create_user(&creds.username, &hash) {
        Ok(user_id) => {
            info!(username = %creds.username, %user_id, "user registered");
            Ok((
                StatusCode::CREATED,
                Json(
                    SuccessBody::new("user created")
                        .username(creds.username)
                        .masked_password(),
                ),
            ))
        }
        Err(StoreError::Conflict(_)) => Err(ApiError::conflict(
            "user with this username already exists",
        )),
        Err(e) => {
            error!(error = %e, "failed to create user");
            Err(ApiError::internal("failed to create user"))
        }
    }
}

/// `POST /login`
pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<Credentials>, JsonRejection>,
) -> Result<Json<SuccessBody>, ApiError> {
    let Json(creds) = body.map_err(|_| ApiError::bad_request("invalid request body"))?;

    let (user_id, stored_hash) = match state.accounts.credentials(&creds.username) {
        Ok(found) => found,
        Err(StoreError::NotFound(_)) => return Err(ApiError::unauthorized("invalid credentials")),
        Err(e) => {
            error!(error = %e, "credential lookup failed");
            return Err(ApiError::internal("server error"));
        }
    };

    let supplied = creds.password;
    let matches = tokio::task::spawn_blocking(move || password::verify(&stored_hash, &supplied))
        .await
        .unwrap_or(false);
    if !matches {
        return Err(ApiError::unauthorized("invalid credentials"));
    }

    let identity = Identity::new(user_id, creds.username);
    let token = state.gate.issue_access(&identity).map_err(|e| {
        error!(error = %e, "access token issue failed");
        ApiError::internal("server error")
    })?;
    let refresh = state.gate.issue_refresh(user_id).map_err(|e| {
        error!(error = %e, "refresh token issue failed");
        ApiError::internal("failed to generate refresh token")
    })?;

    info!(username = %identity.username, %user_id, "login");
    Ok(Json(
        SuccessBody::new("login success")
            .username(identity.username)
            .tokens(token, refresh),
    ))
}

/// `POST /logout`. Tokens are stateless; the client discards them.
pub async fn logout() -> Json<SuccessBody> {
    Json(SuccessBody::new("logout success"))
}

/// `GET /whoami`
pub async fn whoami(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<SuccessBody>, ApiError> {
    let identity = authenticate(&state.gate, bearer_from_parts(authorization(&headers), None))?;
    Ok(Json(SuccessBody::new("here you are!").username(identity.username)))
}

/// `POST /refresh-token`
pub async fn refresh_token(
    State(state): State<AppState>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<RefreshBody>, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::bad_request("invalid request body"))?;

    let user_id = state
        .gate
        .validate_refresh(&req.refresh_token)
        .map_err(|_| ApiError::unauthorized("invalid or expired refresh token"))?;
    let username = state.accounts.username_of(user_id).map_err(|e| {
        warn!(%user_id, error = %e, "refresh for unknown user");
        ApiError::internal("user not found for refresh token")
    })?;
    let access_token = state
        .gate
        .issue_access(&Identity::new(user_id, username))
        .map_err(|_| ApiError::internal("failed to generate new access token"))?;

    Ok(Json(RefreshBody {
        access_token,
        message: "new access token generated".into(),
    }))
}

/// `GET /messages`: recent history, oldest first.
pub async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<TokenParams>,
) -> Result<Json<Vec<StoredMessage>>, ApiError> {
    authenticate(
        &state.gate,
        bearer_from_parts(authorization(&headers), params.token.as_deref()),
    )?;
    let history = state
        .chat
        .recent_messages(state.config.history_limit)
        .map_err(|e| {
            error!(error = %e, "history query failed");
            ApiError::internal("failed to load messages")
        })?;
    Ok(Json(history))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.hub.connection_count().await;
    Json(health_check(
        state.start_time,
        connections,
        state.metrics.snapshot(),
    ))
}
