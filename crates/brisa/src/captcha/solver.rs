//! Solver strategies.

use super::{CaptchaChallenge, CaptchaMode, CaptchaResult, OcrSolver, ServiceSolver};
use crate::error::{BrisaError, BrisaResult};

/// The strategy used to answer a challenge.
#[derive(Debug, Clone, Default)]
pub enum CaptchaSolver {
    /// Always defer to a human.
    #[default]
    Manual,
    /// Local template OCR.
    Ocr(OcrSolver),
    /// Remote solving service.
    Service(ServiceSolver),
    /// Answer every challenge with the same text. Useful for tests and replays.
    Fixture(String),
}

impl CaptchaSolver {
    /// Solver for `mode` when it needs no further configuration.
    ///
    /// OCR needs templates and the service needs an endpoint and key, so only
    /// manual mode can be built from the mode alone.
    pub fn for_mode(mode: CaptchaMode) -> BrisaResult<Self> {
        match mode {
            CaptchaMode::Manual => Ok(CaptchaSolver::Manual),
            CaptchaMode::Ocr => Err(BrisaError::Config(
                "ocr captcha mode needs a template directory".to_string(),
            )),
            CaptchaMode::Service => Err(BrisaError::Config(
                "service captcha mode needs a solver endpoint and api key".to_string(),
            )),
        }
    }

    pub fn mode(&self) -> CaptchaMode {
        match self {
            CaptchaSolver::Manual | CaptchaSolver::Fixture(_) => CaptchaMode::Manual,
            CaptchaSolver::Ocr(_) => CaptchaMode::Ocr,
            CaptchaSolver::Service(_) => CaptchaMode::Service,
        }
    }

    pub async fn solve(&self, challenge: &CaptchaChallenge) -> BrisaResult<CaptchaResult> {
        let image = challenge.image_bytes().to_vec();
        match self {
            CaptchaSolver::Manual => Ok(CaptchaResult::manual(image)),
            CaptchaSolver::Fixture(answer) => Ok(CaptchaResult::solved(answer.clone(), image)),
            CaptchaSolver::Ocr(ocr) => {
                let recognition = ocr.recognize(challenge.image_bytes())?;
                tracing::debug!(
                    text = %recognition.text,
                    confidence = recognition.confidence,
                    "ocr recognition"
                );
                if !recognition.is_confident(ocr.threshold()) {
                    tracing::debug!(
                        threshold = ocr.threshold(),
                        "ocr confidence below threshold, submitting best guess"
                    );
                }
                Ok(CaptchaResult::solved(recognition.text, image))
            }
            CaptchaSolver::Service(service) => {
                let text = service.solve(challenge.image_bytes()).await?;
                Ok(CaptchaResult::solved(text, image))
            }
        }
    }
}
