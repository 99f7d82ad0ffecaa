//! Third-party captcha solving service client.
//!
//! Speaks the common two-step task protocol: submit the image to `{endpoint}/in`,
//! then poll `{endpoint}/res` until the task is ready.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BrisaError, BrisaResult};

/// Per-call timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const DEFAULT_MAX_POLLS: u32 = 24;

/// Pending marker returned while the task is being worked on.
const NOT_READY: &str = "CAPCHA_NOT_READY";

#[derive(Serialize)]
struct TaskRequest<'a> {
    key: &'a str,
    method: &'static str,
    body: String,
    json: u8,
}

#[derive(Deserialize)]
struct Reply {
    status: i64,
    request: String,
}

#[derive(Clone)]
pub struct ServiceSolver {
    endpoint: Url,
    api_key: String,
    timeout: Duration,
    poll_interval: Duration,
    max_polls: u32,
    client: reqwest::Client,
}

impl fmt::Debug for ServiceSolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSolver")
            .field("endpoint", &self.endpoint.as_str())
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("max_polls", &self.max_polls)
            .finish_non_exhaustive()
    }
}

impl ServiceSolver {
    pub fn new(endpoint: &str, api_key: impl Into<String>) -> BrisaResult<Self> {
        let mut endpoint = Url::parse(endpoint)
            .map_err(|e| BrisaError::Config(format!("invalid solver endpoint '{endpoint}': {e}")))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(BrisaError::Config("solver api key is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| BrisaError::Config(format!("cannot build solver HTTP client: {e}")))?;

        Ok(Self {
            endpoint,
            api_key,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
            client,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_polls(mut self, max_polls: u32) -> Self {
        self.max_polls = max_polls.max(1);
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Submit `image` and wait for the solution text.
    pub async fn solve(&self, image: &[u8]) -> BrisaResult<String> {
        let task = TaskRequest {
            key: &self.api_key,
            method: "base64",
            body: base64::engine::general_purpose::STANDARD.encode(image),
            json: 1,
        };
        let request = self
            .client
            .post(self.url("in")?)
            .timeout(self.timeout)
            .json(&task);
        let reply = self.call(request).await?;
        if reply.status != 1 {
            return Err(BrisaError::solve_failed(
                format!("service refused task: {}", reply.request),
                None,
            ));
        }
        let task_id = reply.request;
        tracing::debug!(%task_id, "captcha task submitted");

        for poll in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;
            let request = self
                .client
                .get(self.url("res")?)
                .timeout(self.timeout)
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", task_id.as_str()),
                    ("json", "1"),
                ]);
            let reply = self.call(request).await?;
            match reply.status {
                1 => return Ok(reply.request),
                _ if reply.request == NOT_READY => {
                    tracing::debug!(%task_id, poll, "captcha task not ready");
                }
                _ => {
                    return Err(BrisaError::solve_failed(
                        format!("service reported error: {}", reply.request),
                        None,
                    ));
                }
            }
        }

        Err(BrisaError::solve_failed(
            format!("no solution after {} poll(s)", self.max_polls),
            None,
        ))
    }

    fn url(&self, path: &str) -> BrisaResult<Url> {
        self.endpoint
            .join(path)
            .map_err(|e| BrisaError::Config(format!("invalid solver endpoint: {e}")))
    }

    async fn call(&self, request: reqwest::RequestBuilder) -> BrisaResult<Reply> {
        let response = request
            .send()
            .await
            .map_err(|e| BrisaError::solve_failed("solver service unreachable", Some(Box::new(e))))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BrisaError::solve_failed(
                format!("solver service returned HTTP {}", status.as_u16()),
                None,
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| BrisaError::solve_failed("solver response unreadable", Some(Box::new(e))))?;
        serde_json::from_str(&body)
            .map_err(|e| BrisaError::solve_failed("solver response is not valid JSON", Some(Box::new(e))))
    }
}
