//! Error codes and the JSON shape of proxy-generated error responses
//!
//! Placeholder handlers and the router answer with these instead of ad-hoc
//! bodies, so callers always get the same shape plus an `X-Proxy-Error`
//! header they can match on without parsing the body.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No route matches the request host and path
    UnknownRoute,
    /// The route references a service that does not (yet) exist
    UnknownService,
    /// The service handler could not be built
    ServiceFailed,
    /// Failed to connect to the upstream server
    UpstreamConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownRoute => StatusCode::NOT_FOUND,
            ProxyErrorCode::UnknownService => StatusCode::NOT_FOUND,
            ProxyErrorCode::ServiceFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::UpstreamConnectionFailed => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownRoute => "UNKNOWN_ROUTE",
            ProxyErrorCode::UnknownService => "UNKNOWN_SERVICE",
            ProxyErrorCode::ServiceFailed => "SERVICE_FAILED",
            ProxyErrorCode::UpstreamConnectionFailed => "UPSTREAM_CONNECTION_FAILED",
        }
    }
}

/// Body of a proxy-generated error response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: ProxyErrorCode,
    pub status: u16,
    pub message: String,
}

/// Build the error response for a code: JSON body, matching status, and the
/// code repeated in the X-Proxy-Error header.
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let status = code.status_code();
    let body = ErrorBody {
        code,
        status: status.as_u16(),
        message: message.into(),
    };

    // the shape above always serializes; the bare code is a last resort
    let json = serde_json::to_vec(&body)
        .unwrap_or_else(|_| code.as_header_value().as_bytes().to_vec());

    let mut response =
        Response::new(Full::new(Bytes::from(json)).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert("x-proxy-error", HeaderValue::from_static(code.as_header_value()));

    response
}
