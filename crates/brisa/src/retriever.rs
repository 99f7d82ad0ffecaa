//! The retrieval orchestrator.
//!
//! One [`Retriever::retrieve`] call owns one [`Session`] and walks it through
//! seeding, captcha, submission and parsing, retrying on rejected captchas up
//! to the session's retry budget.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::access_key::AccessKey;
use crate::captcha::{CaptchaOutcome, CaptchaPipeline, CaptchaSolver};
use crate::config::{PortalConfig, RetrieverOptions};
use crate::error::{BrisaError, BrisaResult, ErrorKind};
use crate::form::{harvest_hidden_fields, FormSubmitter};
use crate::http::{HttpClient, RequestConfig, RequestExecutor};
use crate::manual::ManualSink;
use crate::session::{Method, Session};
use crate::types::Invoice;

/// A successful retrieval.
#[derive(Debug, Clone)]
pub struct Retrieval {
    pub invoice: Invoice,
    /// Form submissions made, including the accepted one.
    pub submissions: u32,
}

/// A failed retrieval, with the submissions consumed before it failed.
#[derive(thiserror::Error, Debug)]
#[error("retrieval failed after {attempts} submission attempt(s)")]
pub struct RetrievalError {
    pub attempts: u32,
    #[source]
    pub error: BrisaError,
}

impl RetrievalError {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

/// Per-call collaborators of a retrieval.
#[derive(Debug, Default)]
pub struct RetrievalContext {
    pub cancel: Option<CancellationToken>,
    /// Use this session instead of a fresh one.
    pub session: Option<Session>,
    pub manual: Option<ManualSink>,
}

impl RetrievalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_manual(mut self, sink: ManualSink) -> Self {
        self.manual = Some(sink);
        self
    }
}

/// Race `fut` against cancellation. Losing drops `fut`, aborting its request.
async fn guard<T>(cancel: &CancellationToken, fut: impl Future<Output = BrisaResult<T>>) -> BrisaResult<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BrisaError::Cancelled),
        result = fut => result,
    }
}

pub struct Retriever {
    executor: Arc<dyn RequestExecutor>,
    options: RetrieverOptions,
    portal: PortalConfig,
    solver: CaptchaSolver,
}

impl Retriever {
    pub fn new(options: RetrieverOptions, portal: PortalConfig, solver: CaptchaSolver) -> BrisaResult<Self> {
        let client = HttpClient::new(options.timeout)?.with_base_url(portal.base_url()?);
        Self::with_executor(Arc::new(client), options, portal, solver)
    }

    pub fn with_executor(
        executor: Arc<dyn RequestExecutor>,
        options: RetrieverOptions,
        portal: PortalConfig,
        solver: CaptchaSolver,
    ) -> BrisaResult<Self> {
        portal.validate()?;
        if options.retry_attempts == 0 {
            return Err(BrisaError::Config("retry attempts must be at least 1".to_string()));
        }
        Ok(Self {
            executor,
            options,
            portal,
            solver,
        })
    }

    pub fn options(&self) -> &RetrieverOptions {
        &self.options
    }

    pub fn portal(&self) -> &PortalConfig {
        &self.portal
    }

    pub fn solver(&self) -> &CaptchaSolver {
        &self.solver
    }

    /// A fresh session for this portal and these options.
    pub fn new_session(&self) -> BrisaResult<Session> {
        Ok(
            Session::initialize(self.portal.base_url()?, self.options.user_agent.clone(), self.options.timeout)
                .with_retry_budget(self.options.retry_attempts),
        )
    }

    /// Retrieve the invoice for `access_key`.
    pub async fn retrieve(&self, access_key: &str, ctx: RetrievalContext) -> Result<Retrieval, RetrievalError> {
        let fail = |attempts, error| RetrievalError { attempts, error };

        let key = AccessKey::parse(access_key).map_err(|e| fail(0, e))?;
        if !key.check_digit_matches() {
            tracing::warn!(
                access_key = %key,
                expected = key.expected_check_digit(),
                "access key check digit does not match"
            );
        }

        let RetrievalContext { cancel, session, manual } = ctx;
        let cancel = cancel.unwrap_or_default();
        let mut session = match session {
            Some(session) => session,
            None => self.new_session().map_err(|e| fail(0, e))?,
        };

        tracing::info!(
            access_key = %key,
            mode = %self.solver.mode(),
            budget = session.retry_budget(),
            "retrieving invoice"
        );

        let mut submissions = 0;
        let result = self
            .run(&key, &mut session, &cancel, manual.as_ref(), &mut submissions)
            .await;
        drop(session);

        match result {
            Ok(invoice) => {
                tracing::info!(access_key = %key, submissions, items = invoice.items().len(), "invoice retrieved");
                Ok(Retrieval { invoice, submissions })
            }
            Err(error) => {
                tracing::warn!(access_key = %key, submissions, error = %error, "retrieval failed");
                Err(fail(submissions, error))
            }
        }
    }

    async fn run(
        &self,
        key: &AccessKey,
        session: &mut Session,
        cancel: &CancellationToken,
        manual: Option<&ManualSink>,
        submissions: &mut u32,
    ) -> BrisaResult<Invoice> {
        let executor = self.executor.as_ref();

        let home = guard(cancel, async {
            session
                .send(executor, Method::Get, &self.portal.home_path, RequestConfig::default())
                .await
                .map_err(BrisaError::from)
        })
        .await?;
        session.set_hidden_fields(harvest_hidden_fields(&home.text()));
        tracing::debug!(
            cookies = session.cookies().len(),
            hidden_fields = session.hidden_fields().len(),
            "session seeded"
        );

        let mut pipeline = CaptchaPipeline::new(&self.solver, self.portal.captcha_path.clone());
        let submitter = FormSubmitter::new(&self.portal);
        let budget = session.retry_budget().max(1);
        let mut last_error = None;

        while *submissions < budget {
            let attempt = *submissions + 1;
            let solution = match guard(cancel, pipeline.run(session, executor)).await? {
                CaptchaOutcome::Solved(solution) => solution,
                CaptchaOutcome::NeedsManual(challenge) => {
                    let sink = manual.ok_or_else(|| {
                        BrisaError::solve_failed("captcha needs manual resolution but no handler is attached", None)
                    })?;
                    match guard(cancel, sink.request(challenge, attempt)).await {
                        Ok(answer) => pipeline.resume(&answer)?,
                        Err(e) => {
                            pipeline.abort();
                            return Err(e);
                        }
                    }
                    pipeline
                        .take_solution()
                        .ok_or_else(|| BrisaError::solve_failed("manual solution was not recorded", None))?
                }
            };

            *submissions = attempt;
            match guard(cancel, submitter.submit(session, executor, key, &solution)).await {
                Ok(body) => {
                    if self.options.debug {
                        tracing::debug!(attempt, body = %body, "query response");
                    }
                    let invoice = crate::parser::parse(&body)?;
                    if invoice.access_key() != key {
                        return Err(BrisaError::malformed(format!(
                            "portal returned invoice {} for key {key}",
                            invoice.access_key()
                        )));
                    }
                    return Ok(invoice);
                }
                Err(BrisaError::CaptchaRejected) => {
                    tracing::warn!(attempt, budget, "captcha rejected by the portal");
                    pipeline.discard();
                    last_error = Some(BrisaError::CaptchaRejected);
                }
                Err(e) => return Err(e),
            }
        }

        Err(BrisaError::RetryBudgetExceeded {
            attempts: *submissions,
            last: Box::new(last_error.unwrap_or(BrisaError::CaptchaRejected)),
        })
    }
}

/// Retrieve one invoice from the default portal with a solver derived from
/// `options.captcha_mode`.
///
/// In manual mode pass the sink of a [`manual_channel`](crate::manual_channel)
/// and answer challenges on its handle; without one the retrieval fails with
/// `CaptchaSolveFailed` once a challenge arrives.
pub async fn retrieve_invoice(
    access_key: &str,
    options: RetrieverOptions,
    manual: Option<ManualSink>,
) -> Result<Invoice, RetrievalError> {
    retrieve_invoice_from(PortalConfig::default(), access_key, options, manual).await
}

/// [`retrieve_invoice`] against another portal.
pub async fn retrieve_invoice_from(
    portal: PortalConfig,
    access_key: &str,
    options: RetrieverOptions,
    manual: Option<ManualSink>,
) -> Result<Invoice, RetrievalError> {
    let setup = |error| RetrievalError { attempts: 0, error };
    let solver = CaptchaSolver::for_mode(options.captcha_mode).map_err(setup)?;
    let retriever = Retriever::new(options, portal, solver).map_err(setup)?;

    let ctx = RetrievalContext {
        manual,
        ..RetrievalContext::default()
    };
    retriever.retrieve(access_key, ctx).await.map(|r| r.invoice)
}
