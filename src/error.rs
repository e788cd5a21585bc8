//! Supervisor errors and diagnostic error responses for the proxy

use crate::diagnostic::DiagnosticReport;
use crate::page::PageTemplate;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Header naming the failure kind on every rendered diagnostic
pub const X_HOTGATE_ERROR: &str = "X-Hotgate-Error";

/// Errors from the build/run lifecycle.
///
/// `Clone` so every caller joined to a single-flight receives the same value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// The toolchain reported errors; holds its output with banners stripped
    #[error("build failed:\n{0}")]
    Build(String),
    /// The artifact could not be launched or never became ready
    #[error("backend failed to start: {0}")]
    Startup(String),
    #[error("I/O error: {0}")]
    Io(String),
    /// The lifecycle operation was torn down before it finished
    #[error("lifecycle operation interrupted")]
    Interrupted,
}

impl From<std::io::Error> for SupervisorError {
    fn from(err: std::io::Error) -> Self {
        SupervisorError::Io(err.to_string())
    }
}

impl From<crate::flight::Aborted> for SupervisorError {
    fn from(_: crate::flight::Aborted) -> Self {
        SupervisorError::Interrupted
    }
}

/// A panic blob captured from the backend's stderr
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFailure {
    pub raw: String,
}

impl RuntimeFailure {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }
}

/// Failure kinds a diagnostic page can describe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The toolchain rejected the source
    Build,
    /// The artifact built but the process never became ready
    Startup,
    /// The backend panicked while serving a request
    Runtime,
    /// The backend process exited on its own
    Exit,
    /// The backend could not be reached
    Connection,
}

impl FailureKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FailureKind::Connection => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the kind as a string for the X-Hotgate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            FailureKind::Build => "BUILD_ERROR",
            FailureKind::Startup => "STARTUP_FAILED",
            FailureKind::Runtime => "RUNTIME_PANIC",
            FailureKind::Exit => "UNEXPECTED_EXIT",
            FailureKind::Connection => "CONNECTION_FAILED",
        }
    }

    /// Page title shown above the message
    pub fn title(&self) -> &'static str {
        match self {
            FailureKind::Build => "Build Error",
            FailureKind::Startup => "Startup Error",
            FailureKind::Runtime => "Application Error",
            FailureKind::Exit | FailureKind::Connection => "Error",
        }
    }
}

/// Render a report through `template` as an HTML error page
pub fn diagnostic_response(
    report: &DiagnosticReport,
    template: &dyn PageTemplate,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = template.render(report);

    Response::builder()
        .status(report.kind.status_code())
        .header("Content-Type", "text/html; charset=utf-8")
        .header(X_HOTGATE_ERROR, report.kind.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// The same report as JSON, for clients that ask for it
pub fn json_diagnostic_response(report: &DiagnosticReport) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = serde_json::to_string(report).unwrap_or_else(|_| {
        format!(
            r#"{{"kind":"{}","message":"{}"}}"#,
            report.kind.as_header_value(),
            report.message.replace('\"', "\\\"")
        )
    });

    Response::builder()
        .status(report.kind.status_code())
        .header("Content-Type", "application/json")
        .header(X_HOTGATE_ERROR, report.kind.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::DefaultPage;

    #[test]
    fn test_failure_kind_status_codes() {
        assert_eq!(
            FailureKind::Build.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            FailureKind::Runtime.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            FailureKind::Exit.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            FailureKind::Connection.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_failure_kind_header_values() {
        assert_eq!(FailureKind::Build.as_header_value(), "BUILD_ERROR");
        assert_eq!(FailureKind::Exit.as_header_value(), "UNEXPECTED_EXIT");
    }

    #[test]
    fn test_diagnostic_response_headers() {
        let report = DiagnosticReport::build("main.go:3: syntax error");
        let response = diagnostic_response(&report, &DefaultPage);

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            response.headers().get(X_HOTGATE_ERROR).unwrap(),
            "BUILD_ERROR"
        );
    }

    #[test]
    fn test_json_diagnostic_response() {
        let report = DiagnosticReport::message(FailureKind::Connection, "connection refused");
        let response = json_diagnostic_response(&report);

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_supervisor_error_display() {
        let err = SupervisorError::Build("main.go:3: undefined: x".to_string());
        assert!(err.to_string().contains("undefined: x"));

        let err: SupervisorError = crate::flight::Aborted.into();
        assert_eq!(err, SupervisorError::Interrupted);
    }
}
