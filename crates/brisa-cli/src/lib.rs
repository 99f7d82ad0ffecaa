//! Library half of the `brisa` command: option resolution, the terminal
//! captcha prompt and exit-code mapping.

pub mod config;
pub mod prompt;

use brisa::{BrisaError, ErrorKind, RetrievalError};

/// Process exit code for a failed command.
pub fn exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::InvalidAccessKey => 2,
        ErrorKind::CaptchaUnavailable => 3,
        ErrorKind::CaptchaSolveFailed => 4,
        ErrorKind::CaptchaRejected | ErrorKind::RetryBudgetExceeded => 5,
        ErrorKind::InvoiceNotFound => 6,
        ErrorKind::MalformedResponse => 7,
        ErrorKind::Transport | ErrorKind::HttpStatus => 8,
        ErrorKind::Config | ErrorKind::Io => 9,
        ErrorKind::Cancelled => 130,
    }
}

/// Exit code for any error reaching `main`; 1 when it carries no [`ErrorKind`].
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<RetrievalError>() {
        return exit_code(e.kind());
    }
    if let Some(e) = err.downcast_ref::<BrisaError>() {
        return exit_code(e.kind());
    }
    if err.downcast_ref::<std::io::Error>().is_some() {
        return exit_code(ErrorKind::Io);
    }
    1
}
