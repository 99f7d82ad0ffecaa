//! Brisa: retrieve electronic invoices (NF-e / NFC-e) from the public tax portal.
//!
//! The pipeline seeds a portal session, acquires and solves a captcha with a pluggable
//! strategy, submits the query form and parses the returned markup into an [`Invoice`].

pub mod access_key;
pub mod captcha;
pub mod config;
pub mod error;
pub mod form;
pub mod http;
pub mod manual;
pub mod parser;
pub mod retriever;
pub mod session;
pub mod types;

pub use access_key::{AccessKey, ACCESS_KEY_LEN};
pub use captcha::{CaptchaChallenge, CaptchaMode, CaptchaResult, CaptchaSolver};
pub use config::{PortalConfig, RetrieverOptions};
pub use error::{BrisaError, BrisaResult, ErrorKind};
pub use http::{HttpClient, HttpError, HttpResponse, RequestConfig, RequestExecutor};
pub use manual::{manual_channel, ManualHandle, ManualSink, PendingChallenge};
pub use parser::parse;
pub use retriever::{retrieve_invoice, retrieve_invoice_from, Retrieval, RetrievalContext, RetrievalError, Retriever};
pub use session::{Cookie, Session};
pub use types::*;
