//! Failure taxonomy and plain-text error responses for the proxy data path

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Why a proxied request could not be served from a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyFailure {
    /// No site matched the host + path.
    NoRoute,
    /// The site's backend is marked errored and has not aged out yet.
    AppInError,
    /// Dialing the backend failed (after any warm-up grace).
    Connect,
    /// Writing the request to the backend failed.
    Forward,
    /// Reading or parsing the backend response failed.
    Read,
}

impl ProxyFailure {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyFailure::NoRoute => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short cause tag for the access log line.
    pub fn log_cause(&self) -> &'static str {
        match self {
            ProxyFailure::NoRoute => "no route",
            ProxyFailure::AppInError => "app in error",
            ProxyFailure::Connect => "connecting to app",
            ProxyFailure::Forward => "writing to app",
            ProxyFailure::Read => "reading from app",
        }
    }
}

/// Boxed response body shared by every handler in the crate.
pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// The plain-text response the data path sends for a failure.
pub fn failure_response(failure: ProxyFailure) -> Response<ResponseBody> {
    let (status, body) = match failure.status() {
        StatusCode::NOT_FOUND => (StatusCode::NOT_FOUND, "404 Not Found"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "500 Internal Error"),
    };
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body))
        .expect("static response parts are valid")
}
