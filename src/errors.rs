//! Error taxonomy shared by the dispatcher and the platform adapter.

use axum::http::StatusCode;
use thiserror::Error;

/// Failures observed while waiting for a freshly created pod to become ready.
///
/// The wording is part of the hub's contract: these strings are surfaced
/// verbatim to WebDriver clients in the error response body.
#[derive(Debug, Error)]
pub enum PodWaitError {
    #[error("pod exited early with status {0}")]
    ExitedEarly(String),

    #[error("couldn't obtain pod state")]
    StateUnknown,

    #[error("pod has unknown status")]
    UnknownStatus,

    #[error("pod was deleted before becoming available")]
    DeletedBeforeReady,

    #[error("received error while watching pod: {0}")]
    Watch(String),

    #[error("received unknown event type {0} while watching pod")]
    UnknownEventType(String),

    #[error("timed out waiting for pod to become ready")]
    Timeout,
}

/// Errors raised by the Kubernetes adapter.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("failed to create pod: {0}")]
    CreateFailed(#[source] kube::Error),

    #[error("pod is not ready after creation: {0}")]
    NotReady(#[from] PodWaitError),

    #[error("service is not reachable: {0}")]
    ServiceUnreachable(String),

    #[error("pods {0:?} not found")]
    PodNotFound(String),

    #[error("failed to delete pod: {0}")]
    DeleteFailed(#[source] kube::Error),

    #[error("failed to list pods: {0}")]
    ListFailed(#[source] kube::Error),

    #[error("failed to watch pods: {0}")]
    WatchFailed(#[source] kube::Error),

    #[error("failed to read browser container logs: {0}")]
    LogsFailed(#[source] kube::Error),
}

/// Dispatcher-level errors, rendered to clients as WebDriver error responses.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unknown browser: {0}")]
    UnknownBrowser(String),

    #[error("unknown browser version: {0}")]
    UnknownVersion(String),

    #[error("session limit reached")]
    SessionLimitReached,

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl HubError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            HubError::BadRequest(_) | HubError::UnknownBrowser(_) | HubError::UnknownVersion(_) => {
                StatusCode::BAD_REQUEST
            }
            HubError::SessionLimitReached => StatusCode::TOO_MANY_REQUESTS,
            HubError::UnknownSession(_) => StatusCode::NOT_FOUND,
            HubError::Platform(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// W3C WebDriver error code for the `value.error` field.
    pub fn error_code(&self) -> &'static str {
        match self {
            HubError::BadRequest(_) | HubError::UnknownBrowser(_) | HubError::UnknownVersion(_) => {
                "invalid argument"
            }
            HubError::SessionLimitReached | HubError::Platform(_) => "session not created",
            HubError::UnknownSession(_) => "invalid session id",
        }
    }
}
