//! Human-in-the-loop captcha resolution.
//!
//! [`manual_channel`] links a running retrieval (through its [`ManualSink`])
//! with whoever answers challenges (through the [`ManualHandle`]).

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::captcha::CaptchaChallenge;
use crate::error::{BrisaError, BrisaResult};

enum Reply {
    Solution(String),
    Abort,
}

/// A challenge waiting for a human answer. Answer it exactly once, with
/// [`PendingChallenge::resolve_manual`] or [`PendingChallenge::abort`].
/// Dropping it unanswered aborts the retrieval.
pub struct PendingChallenge {
    challenge: CaptchaChallenge,
    attempt: u32,
    reply: oneshot::Sender<Reply>,
}

impl std::fmt::Debug for PendingChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingChallenge")
            .field("bytes", &self.challenge.image_bytes().len())
            .field("issued_at", &self.challenge.issued_at())
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl PendingChallenge {
    pub fn image_bytes(&self) -> &[u8] {
        self.challenge.image_bytes()
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.challenge.issued_at()
    }

    /// Submission attempt this challenge is for, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn challenge(&self) -> &CaptchaChallenge {
        &self.challenge
    }

    /// Answer with the characters read off the image. A blank answer is not
    /// submitted; the same challenge is published again.
    pub fn resolve_manual(self, solution: impl Into<String>) {
        // The retrieval may have been cancelled meanwhile.
        let _ = self.reply.send(Reply::Solution(solution.into()));
    }

    pub fn abort(self) {
        let _ = self.reply.send(Reply::Abort);
    }
}

/// Retrieval side of the channel.
#[derive(Clone, Debug)]
pub struct ManualSink {
    tx: mpsc::Sender<PendingChallenge>,
}

impl ManualSink {
    /// Publish `challenge` and wait, unbounded, for a non-blank answer.
    pub(crate) async fn request(&self, challenge: CaptchaChallenge, attempt: u32) -> BrisaResult<String> {
        loop {
            let (reply, answer) = oneshot::channel();
            self.tx
                .send(PendingChallenge {
                    challenge: challenge.clone(),
                    attempt,
                    reply,
                })
                .await
                .map_err(|_| BrisaError::Cancelled)?;
            tracing::info!(attempt, "waiting for manual captcha resolution");

            match answer.await {
                Ok(Reply::Solution(solution)) if solution.trim().is_empty() => {
                    tracing::warn!(attempt, "blank manual answer, asking again");
                }
                Ok(Reply::Solution(solution)) => return Ok(solution.trim().to_string()),
                Ok(Reply::Abort) => {
                    tracing::info!(attempt, "manual captcha resolution aborted");
                    return Err(BrisaError::Cancelled);
                }
                Err(_) => return Err(BrisaError::Cancelled),
            }
        }
    }
}

/// Answering side of the channel.
#[derive(Debug)]
pub struct ManualHandle {
    rx: mpsc::Receiver<PendingChallenge>,
}

impl ManualHandle {
    /// Next challenge needing an answer; `None` once the retrieval has ended.
    pub async fn await_manual_solution(&mut self) -> Option<PendingChallenge> {
        self.rx.recv().await
    }
}

pub fn manual_channel() -> (ManualSink, ManualHandle) {
    let (tx, rx) = mpsc::channel(1);
    (ManualSink { tx }, ManualHandle { rx })
}
