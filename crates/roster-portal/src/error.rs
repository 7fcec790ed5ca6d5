use roster_core::SyncErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal authentication failed: {0}")]
    UpstreamAuth(String),
    #[error(
        "{} failed{}: {}",
        .operation,
        .status.map(|s| format!(" with status {s}")).unwrap_or_default(),
        .detail
    )]
    UpstreamUnavailable {
        operation: &'static str,
        status: Option<u16>,
        detail: String,
    },
    #[error("{operation} timed out")]
    Timeout { operation: &'static str },
    #[error("failed to decode {operation} response: {detail}")]
    Decode {
        operation: &'static str,
        detail: String,
    },
    #[error("student {0} not found on portal")]
    NotFound(String),
    #[error("class {0} has no students on portal")]
    EmptyResult(String),
    #[error("not connected to the portal")]
    NotAuthenticated,
    #[error("portal session expired")]
    AuthExpired,
}

impl PortalError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            PortalError::UpstreamAuth(_)
            | PortalError::NotAuthenticated
            | PortalError::AuthExpired => SyncErrorKind::NotAuthenticated,
            PortalError::UpstreamUnavailable { .. }
            | PortalError::Timeout { .. }
            | PortalError::Decode { .. } => SyncErrorKind::UpstreamUnavailable,
            PortalError::NotFound(_) => SyncErrorKind::NotFound,
            PortalError::EmptyResult(_) => SyncErrorKind::EmptyResult,
        }
    }

    pub(crate) fn transport(operation: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PortalError::Timeout { operation }
        } else if err.is_decode() {
            PortalError::Decode {
                operation,
                detail: err.to_string(),
            }
        } else {
            PortalError::UpstreamUnavailable {
                operation,
                status: err.status().map(|status| status.as_u16()),
                detail: err.to_string(),
            }
        }
    }
}
