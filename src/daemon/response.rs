//! JSON response envelope
//!
//! Every reply has the shape
//! `{"type": ..., "status-code": ..., "status": ..., "result": ..., "change"?: ...}`.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    Sync,
    Async,
    Error,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: ResponseType,
    #[serde(rename = "status-code")]
    status_code: u16,
    status: &'a str,
    result: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    change: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub kind: ResponseType,
    pub status: StatusCode,
    pub result: Value,
    pub change: Option<String>,
}

/// 200 reply carrying `result`
pub fn sync_response(result: impl Serialize) -> Response {
    match serde_json::to_value(result) {
        Ok(result) => Response {
            kind: ResponseType::Sync,
            status: StatusCode::OK,
            result,
            change: None,
        },
        Err(err) => ApiError::internal(format!("cannot marshal result: {err}")).into(),
    }
}

/// 202 reply pointing at the change doing the work
pub fn async_response(result: impl Serialize, change: impl Into<String>) -> Response {
    match serde_json::to_value(result) {
        Ok(result) => Response {
            kind: ResponseType::Async,
            status: StatusCode::ACCEPTED,
            result,
            change: Some(change.into()),
        },
        Err(err) => ApiError::internal(format!("cannot marshal result: {err}")).into(),
    }
}

impl Response {
    pub fn is_error(&self) -> bool {
        self.kind == ResponseType::Error
    }

    /// Serialized envelope
    pub fn body(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&Envelope {
            kind: self.kind,
            status_code: self.status.as_u16(),
            status: self.status.canonical_reason().unwrap_or(""),
            result: &self.result,
            change: self.change.as_deref(),
        })
    }

    pub fn into_http(self) -> hyper::Response<Full<Bytes>> {
        let body = match self.body() {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "cannot marshal response");
                let mut resp = hyper::Response::new(Full::new(Bytes::from_static(
                    b"{\"type\":\"error\",\"status-code\":500,\"status\":\"Internal Server Error\",\"result\":{\"message\":\"cannot marshal response\"}}",
                )));
                *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                resp.headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                return resp;
            }
        };

        let mut resp = hyper::Response::new(Full::new(Bytes::from(body)));
        *resp.status_mut() = self.status;
        let headers = resp.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if matches!(self.status, StatusCode::CREATED | StatusCode::ACCEPTED) {
            let location = self
                .result
                .get("resource")
                .and_then(Value::as_str)
                .filter(|resource| !resource.is_empty())
                .and_then(|resource| HeaderValue::from_str(resource).ok());
            if let Some(location) = location {
                headers.insert(LOCATION, location);
            }
        }
        resp
    }
}

/// An error reply
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub kind: Option<String>,
    pub value: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            kind: None,
            value: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn method_not_allowed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::METHOD_NOT_ALLOWED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, message)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, self.status) {
            (Some(kind), _) => write!(f, "{} (api: {})", self.message, kind),
            (None, StatusCode::BAD_REQUEST) => write!(f, "{} (api)", self.message),
            (None, status) => write!(f, "{} (api {})", self.message, status.as_u16()),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ApiError> for Response {
    fn from(err: ApiError) -> Self {
        let mut result = json!({ "message": err.message });
        if let Some(kind) = err.kind {
            result["kind"] = Value::String(kind);
        }
        if let Some(value) = err.value {
            result["value"] = value;
        }
        Response {
            kind: ResponseType::Error,
            status: err.status,
            result,
            change: None,
        }
    }
}
