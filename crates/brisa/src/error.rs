//! Error kinds surfaced by the retrieval pipeline.

use serde::Serialize;

use crate::http::HttpError;

/// Boxed cause attached to solver failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Payload-free discriminant of [`BrisaError`], for branching and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidAccessKey,
    CaptchaUnavailable,
    CaptchaSolveFailed,
    CaptchaRejected,
    MalformedResponse,
    InvoiceNotFound,
    RetryBudgetExceeded,
    Cancelled,
    Transport,
    HttpStatus,
    Config,
    Io,
}

/// Errors that can occur while retrieving or parsing an invoice.
#[derive(thiserror::Error, Debug)]
pub enum BrisaError {
    #[error("Invalid access key: {0}")]
    InvalidAccessKey(String),

    #[error("Captcha unavailable: {reason}")]
    CaptchaUnavailable {
        reason: String,
        #[source]
        source: Option<HttpError>,
    },

    #[error("Captcha solve failed: {reason}")]
    CaptchaSolveFailed {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Captcha solution rejected by the portal")]
    CaptchaRejected,

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Invoice not found: {0}")]
    InvoiceNotFound(String),

    #[error("Retry budget exceeded after {attempts} attempt(s)")]
    RetryBudgetExceeded {
        attempts: u32,
        #[source]
        last: Box<BrisaError>,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrisaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrisaError::InvalidAccessKey(_) => ErrorKind::InvalidAccessKey,
            BrisaError::CaptchaUnavailable { .. } => ErrorKind::CaptchaUnavailable,
            BrisaError::CaptchaSolveFailed { .. } => ErrorKind::CaptchaSolveFailed,
            BrisaError::CaptchaRejected => ErrorKind::CaptchaRejected,
            BrisaError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            BrisaError::InvoiceNotFound(_) => ErrorKind::InvoiceNotFound,
            BrisaError::RetryBudgetExceeded { .. } => ErrorKind::RetryBudgetExceeded,
            BrisaError::Cancelled => ErrorKind::Cancelled,
            BrisaError::Http(HttpError::Status(_)) => ErrorKind::HttpStatus,
            BrisaError::Http(HttpError::Transport(_)) | BrisaError::Http(HttpError::TooManyRedirects(_)) => {
                ErrorKind::Transport
            }
            BrisaError::Http(_) | BrisaError::Config(_) => ErrorKind::Config,
            BrisaError::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn unavailable(reason: impl Into<String>, source: Option<HttpError>) -> Self {
        BrisaError::CaptchaUnavailable {
            reason: reason.into(),
            source,
        }
    }

    pub(crate) fn solve_failed(reason: impl Into<String>, source: Option<BoxError>) -> Self {
        BrisaError::CaptchaSolveFailed {
            reason: reason.into(),
            source,
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        BrisaError::MalformedResponse(reason.into())
    }
}

/// Convenience result type.
pub type BrisaResult<T> = Result<T, BrisaError>;
