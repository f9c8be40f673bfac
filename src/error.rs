//! Unified error type surfaced by every public SDK operation.

use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::realtime::client::SseError;

/// Error returned by CRUD, auth, and realtime operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The request never produced an HTTP response.
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The backend answered with a non-success status.
    #[error("{url} returned {status}: {}", response_message(.response).unwrap_or("client error"))]
    Status {
        url: String,
        status: StatusCode,
        /// Response body parsed as an object, or `{"error": raw}` when the
        /// body was not JSON.
        response: Map<String, Value>,
        /// Raw response text.
        body: String,
    },

    /// Realtime connection failure.
    #[error("realtime connection to {url} failed: {source}")]
    Realtime {
        url: String,
        #[source]
        source: SseError,
    },

    /// Client-side failure that never reached or followed the wire
    /// (missing ids, OAuth2 state mismatch, unknown provider).
    #[error("{message}")]
    Application {
        url: Option<String>,
        status: u16,
        response: Map<String, Value>,
        message: String,
    },
}

impl ClientError {
    /// Builds an [`ClientError::Application`] without an HTTP context.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application {
            url: None,
            status: 0,
            response: Map::new(),
            message: message.into(),
        }
    }

    /// Builds a synthesized 404 shaped like a backend not-found response.
    pub fn not_found(url: impl Into<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let mut response = Map::new();
        response.insert("code".to_string(), json!(404));
        response.insert("message".to_string(), json!(message));
        response.insert("data".to_string(), json!({}));

        Self::Application {
            url: Some(url.into()),
            status: 404,
            response,
            message,
        }
    }

    /// Request URL, when known.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Transport { url, .. } | Self::Status { url, .. } | Self::Realtime { url, .. } => {
                Some(url)
            }
            Self::Application { url, .. } => url.as_deref(),
        }
    }

    /// HTTP status code, `0` when no response was received.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Status { status, .. } => status.as_u16(),
            Self::Application { status, .. } => *status,
            Self::Transport { source, .. } => source.status().map_or(0, |s| s.as_u16()),
            Self::Realtime { .. } => 0,
        }
    }

    /// Parsed response body (empty for failures without a response).
    pub fn response(&self) -> Map<String, Value> {
        match self {
            Self::Status { response, .. } | Self::Application { response, .. } => response.clone(),
            Self::Transport { .. } | Self::Realtime { .. } => Map::new(),
        }
    }

    /// Returns `true` when the request timed out or could not connect.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Realtime { .. } => true,
            Self::Application { .. } => false,
        }
    }

    /// Renders the full diagnostic `{url, statusCode, response, originalError}`.
    pub fn diagnostic(&self) -> String {
        let original_error = match self {
            Self::Transport { source, .. } => Value::String(source.to_string()),
            Self::Status { body, .. } => Value::String(body.clone()),
            Self::Realtime { source, .. } => Value::String(source.to_string()),
            Self::Application { message, .. } => Value::String(message.clone()),
        };
        let data = json!({
            "url": self.url(),
            "statusCode": self.status_code(),
            "response": self.response(),
            "originalError": original_error,
        });
        let rendered = serde_json::to_string_pretty(&data).unwrap_or_else(|_| data.to_string());
        format!("ClientError: {rendered}")
    }
}

fn response_message(response: &Map<String, Value>) -> Option<&str> {
    response.get("message").and_then(Value::as_str)
}

/// Parses a failed response body into the map carried by [`ClientError`].
pub(crate) fn parse_error_body(body: &str) -> Map<String, Value> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => map,
        _ => {
            let mut map = Map::new();
            if !body.is_empty() {
                map.insert("error".to_string(), Value::String(body.to_string()));
            }
            map
        }
    }
}
