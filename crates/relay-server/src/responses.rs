//! JSON bodies for the HTTP account endpoints.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Success body shared by register/login/logout/whoami.
#[derive(Clone, Debug, Serialize)]
pub struct SuccessBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl SuccessBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            token: None,
            refresh_token: None,
            username: None,
            password: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn masked_password(mut self) -> Self {
        self.password = Some("*****".into());
        self
    }

    pub fn tokens(mut self, token: String, refresh_token: String) -> Self {
        self.token = Some(token);
        self.refresh_token = Some(refresh_token);
        self
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RefreshBody {
    pub access_token: String,
    pub message: String,
}

#[derive(Clone, Debug, Serialize)]
struct ErrorBody {
    error: String,
    timestamp: DateTime<Utc>,
}

/// An HTTP error with a `{error, timestamp}` body.
#[derive(Clone, Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            timestamp: Utc::now(),
        };
        (self.status, Json(body)).into_response()
    }
}
