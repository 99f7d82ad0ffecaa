//! Captcha acquisition and solving.
//!
//! The pipeline moves `Idle → Requested → Solving → {Solved, NeedsManual, Failed}`.
//! `NeedsManual` is resumable: [`CaptchaPipeline::resume`] supplies the
//! human answer, [`CaptchaPipeline::abort`] gives up.

pub mod ocr;
pub mod service;
pub mod solver;

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};

use crate::error::{BrisaError, BrisaResult, ErrorKind};
use crate::http::{HttpError, HttpResponse, RequestConfig, RequestExecutor};
use crate::session::{Method, Session};

pub use ocr::{OcrSolver, Recognition};
pub use service::ServiceSolver;
pub use solver::CaptchaSolver;

/// How captchas are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaMode {
    /// Hand the image to a human.
    #[default]
    Manual,
    /// Built-in template OCR.
    Ocr,
    /// Third-party solving service.
    Service,
}

impl fmt::Display for CaptchaMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaptchaMode::Manual => "manual",
            CaptchaMode::Ocr => "ocr",
            CaptchaMode::Service => "service",
        })
    }
}

impl FromStr for CaptchaMode {
    type Err = BrisaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(CaptchaMode::Manual),
            "ocr" => Ok(CaptchaMode::Ocr),
            "service" | "third-party" | "thirdparty" => Ok(CaptchaMode::Service),
            other => Err(BrisaError::Config(format!(
                "unknown captcha mode '{other}' (expected manual, ocr or service)"
            ))),
        }
    }
}

/// A challenge image issued by the portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaChallenge {
    image_bytes: Vec<u8>,
    issued_at: DateTime<Utc>,
}

impl CaptchaChallenge {
    pub fn new(image_bytes: Vec<u8>) -> Self {
        Self {
            image_bytes,
            issued_at: Utc::now(),
        }
    }

    pub fn image_bytes(&self) -> &[u8] {
        &self.image_bytes
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// File extension matching the image format, `"img"` when unknown.
    pub fn image_extension(&self) -> &'static str {
        image::guess_format(&self.image_bytes)
            .ok()
            .and_then(|f| f.extensions_str().first().copied())
            .unwrap_or("img")
    }
}

/// What a solver produced. Either a non-empty solution or a manual request,
/// never both and never neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaResult {
    solution: Option<String>,
    needs_manual: bool,
    image_bytes: Vec<u8>,
}

impl CaptchaResult {
    /// A solved challenge. A blank guess degrades to a manual request.
    pub fn solved(solution: impl Into<String>, image_bytes: Vec<u8>) -> Self {
        let solution = solution.into().trim().to_string();
        if solution.is_empty() {
            return Self::manual(image_bytes);
        }
        Self {
            solution: Some(solution),
            needs_manual: false,
            image_bytes,
        }
    }

    pub fn manual(image_bytes: Vec<u8>) -> Self {
        Self {
            solution: None,
            needs_manual: true,
            image_bytes,
        }
    }

    pub fn solution(&self) -> Option<&str> {
        self.solution.as_deref()
    }

    pub fn needs_manual(&self) -> bool {
        self.needs_manual
    }

    pub fn image_bytes(&self) -> &[u8] {
        &self.image_bytes
    }
}

/// Pipeline state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaState {
    Idle,
    Requested(CaptchaChallenge),
    Solving,
    Solved(String),
    NeedsManual(CaptchaChallenge),
    Failed(ErrorKind),
}

impl CaptchaState {
    pub fn name(&self) -> &'static str {
        match self {
            CaptchaState::Idle => "idle",
            CaptchaState::Requested(_) => "requested",
            CaptchaState::Solving => "solving",
            CaptchaState::Solved(_) => "solved",
            CaptchaState::NeedsManual(_) => "needs_manual",
            CaptchaState::Failed(_) => "failed",
        }
    }
}

/// Result of running the pipeline up to its first stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaOutcome {
    Solved(String),
    NeedsManual(CaptchaChallenge),
}

/// Drives one captcha at a time through acquisition and solving.
pub struct CaptchaPipeline<'a> {
    solver: &'a CaptchaSolver,
    endpoint: String,
    state: CaptchaState,
}

impl<'a> CaptchaPipeline<'a> {
    pub fn new(solver: &'a CaptchaSolver, endpoint: impl Into<String>) -> Self {
        Self {
            solver,
            endpoint: endpoint.into(),
            state: CaptchaState::Idle,
        }
    }

    pub fn state(&self) -> &CaptchaState {
        &self.state
    }

    /// Fetch a new challenge in `session`. Any previous challenge is discarded.
    pub async fn acquire_challenge(
        &mut self,
        session: &mut Session,
        executor: &dyn RequestExecutor,
    ) -> BrisaResult<()> {
        self.discard();

        let config = RequestConfig::default().param("t", Utc::now().timestamp_millis().to_string());
        let response = match session
            .send(executor, Method::Get, &self.endpoint, config)
            .await
        {
            Ok(response) => response,
            Err(e @ HttpError::Status(_)) => {
                return Err(self.fail(BrisaError::unavailable("captcha endpoint returned an error status", Some(e))));
            }
            Err(e) => {
                return Err(self.fail(BrisaError::unavailable("captcha request failed", Some(e))));
            }
        };

        let bytes = match locate_image(&response) {
            Some(ImageSource::Inline(bytes)) => Some(bytes),
            Some(ImageSource::Linked(src)) => Some(self.fetch_linked(session, executor, &response, &src).await?),
            None => None,
        };

        match bytes {
            Some(bytes) => {
                tracing::debug!(bytes = bytes.len(), "captcha challenge acquired");
                self.state = CaptchaState::Requested(CaptchaChallenge::new(bytes));
                Ok(())
            }
            None if response.body.is_empty() => {
                Err(self.fail(BrisaError::unavailable("captcha response body was empty", None)))
            }
            None => Err(self.fail(BrisaError::unavailable(
                "captcha response did not contain an image",
                None,
            ))),
        }
    }

    /// Follow the `src` of a captcha `<img>` found in an HTML page.
    async fn fetch_linked(
        &mut self,
        session: &mut Session,
        executor: &dyn RequestExecutor,
        page: &HttpResponse,
        src: &str,
    ) -> BrisaResult<Vec<u8>> {
        let target = match url::Url::parse(&page.final_url).and_then(|base| base.join(src)) {
            Ok(url) => url,
            Err(e) => {
                return Err(self.fail(BrisaError::unavailable(format!("captcha image link '{src}' is invalid: {e}"), None)));
            }
        };
        tracing::debug!(src = %target, "following captcha image link");

        let image = match session
            .send(executor, Method::Get, target.as_str(), RequestConfig::default())
            .await
        {
            Ok(image) => image,
            Err(e) => return Err(self.fail(BrisaError::unavailable("captcha image request failed", Some(e)))),
        };
        match raw_image(&image) {
            Some(bytes) => Ok(bytes),
            None => Err(self.fail(BrisaError::unavailable(
                format!("captcha image link '{src}' did not return an image"),
                None,
            ))),
        }
    }

    /// Hand the requested challenge to the solver.
    pub async fn solve(&mut self) -> BrisaResult<()> {
        let challenge = match std::mem::replace(&mut self.state, CaptchaState::Solving) {
            CaptchaState::Requested(challenge) => challenge,
            other => {
                let name = other.name();
                self.state = other;
                return Err(BrisaError::solve_failed(
                    format!("no challenge to solve (state {name})"),
                    None,
                ));
            }
        };

        match self.solver.solve(&challenge).await {
            Ok(result) => {
                self.state = match result.solution {
                    Some(solution) if !result.needs_manual => CaptchaState::Solved(solution),
                    _ => CaptchaState::NeedsManual(challenge),
                };
                tracing::debug!(state = self.state.name(), "captcha solver finished");
                Ok(())
            }
            Err(e) => {
                let kind = e.kind();
                let err = match kind {
                    ErrorKind::CaptchaSolveFailed => e,
                    _ => BrisaError::solve_failed("captcha solver failed", Some(Box::new(e))),
                };
                Err(self.fail(err))
            }
        }
    }

    /// Supply a human answer to a `NeedsManual` challenge.
    pub fn resume(&mut self, solution: &str) -> BrisaResult<()> {
        if !matches!(self.state, CaptchaState::NeedsManual(_)) {
            return Err(BrisaError::solve_failed(
                format!("no captcha awaiting manual resolution (state {})", self.state.name()),
                None,
            ));
        }
        let solution = solution.trim();
        if solution.is_empty() {
            return Err(BrisaError::solve_failed("manual solution was empty", None));
        }
        self.state = CaptchaState::Solved(solution.to_string());
        Ok(())
    }

    /// Give up on a `NeedsManual` challenge.
    pub fn abort(&mut self) {
        if matches!(self.state, CaptchaState::NeedsManual(_)) {
            self.state = CaptchaState::Failed(ErrorKind::Cancelled);
        }
    }

    /// Consume the solution, returning to `Idle`. Yields it at most once.
    pub fn take_solution(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, CaptchaState::Idle) {
            CaptchaState::Solved(solution) => Some(solution),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Drop whatever challenge is held.
    pub fn discard(&mut self) {
        self.state = CaptchaState::Idle;
    }

    /// Acquire and solve, stopping at `Solved` (solution taken) or `NeedsManual`.
    pub async fn run(
        &mut self,
        session: &mut Session,
        executor: &dyn RequestExecutor,
    ) -> BrisaResult<CaptchaOutcome> {
        self.acquire_challenge(session, executor).await?;
        self.solve().await?;
        if let CaptchaState::NeedsManual(challenge) = &self.state {
            return Ok(CaptchaOutcome::NeedsManual(challenge.clone()));
        }
        self.take_solution()
            .map(CaptchaOutcome::Solved)
            .ok_or_else(|| BrisaError::solve_failed("solver produced no solution", None))
    }

    fn fail(&mut self, err: BrisaError) -> BrisaError {
        tracing::warn!(error = %err, "captcha pipeline failed");
        self.state = CaptchaState::Failed(err.kind());
        err
    }
}

/// Where the challenge image lives in a captcha response.
#[derive(Debug, PartialEq, Eq)]
enum ImageSource {
    Inline(Vec<u8>),
    /// `src` of an `<img>`, relative to the response URL.
    Linked(String),
}

/// The body itself when it is an image.
fn raw_image(response: &HttpResponse) -> Option<Vec<u8>> {
    if response.body.is_empty() {
        return None;
    }
    let content_type = response.content_type().unwrap_or("").to_ascii_lowercase();
    if content_type.starts_with("image/") || image::guess_format(&response.body).is_ok() {
        return Some(response.body.clone());
    }
    None
}

/// Find the challenge in a response: a raw image body, an `<img>` in an HTML
/// page (data URI or link), or a data URI embedded in a JSON body.
fn locate_image(response: &HttpResponse) -> Option<ImageSource> {
    if let Some(bytes) = raw_image(response) {
        return Some(ImageSource::Inline(bytes));
    }
    let text = response.text();
    if let Some(src) = captcha_img_src(&text) {
        if src.starts_with("data:") {
            return data_uri_image(&src).map(ImageSource::Inline);
        }
        return Some(ImageSource::Linked(src));
    }
    data_uri_image(&text).map(ImageSource::Inline)
}

/// `src` of the captcha `<img>`: the first one whose id, class or src names a
/// captcha, else the only image on the page.
fn captcha_img_src(html: &str) -> Option<String> {
    let selector = Selector::parse("img[src]").ok()?;
    let doc = Html::parse_document(html);
    let images: Vec<_> = doc.select(&selector).collect();

    let names_captcha = |img: &scraper::ElementRef<'_>| {
        ["id", "class", "src", "alt"].iter().any(|attr| {
            img.value()
                .attr(attr)
                .is_some_and(|v| v.to_ascii_lowercase().contains("captcha"))
        })
    };
    let chosen = images
        .iter()
        .find(|img| names_captcha(*img))
        .or(if images.len() == 1 { images.first() } else { None })?;

    let src = chosen.value().attr("src")?.trim();
    (!src.is_empty()).then(|| src.to_string())
}

fn data_uri_image(text: &str) -> Option<Vec<u8>> {
    let start = text.find("data:image/")?;
    let rest = &text[start..];
    let payload_start = rest.find(";base64,")? + ";base64,".len();
    let payload: String = rest[payload_start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '\\'))
        .filter(|c| *c != '\\')
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .ok()
        .filter(|bytes| !bytes.is_empty())
}
