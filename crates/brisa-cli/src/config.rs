//! Option resolution for `brisa fetch`.
//!
//! Each setting comes from the explicit flag, else the environment, else the
//! portal-config file (portal fields only), else the library default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use brisa::captcha::{OcrSolver, ServiceSolver};
use brisa::{BrisaError, BrisaResult, CaptchaMode, CaptchaSolver, PortalConfig, RetrieverOptions};

pub const ENV_PORTAL_CONFIG: &str = "BRISA_PORTAL_CONFIG";
pub const ENV_BASE_URL: &str = "BRISA_BASE_URL";
pub const ENV_TIMEOUT_SECS: &str = "BRISA_TIMEOUT_SECS";
pub const ENV_USER_AGENT: &str = "BRISA_USER_AGENT";
pub const ENV_CAPTCHA_MODE: &str = "BRISA_CAPTCHA_MODE";
pub const ENV_RETRY_ATTEMPTS: &str = "BRISA_RETRY_ATTEMPTS";
pub const ENV_OCR_TEMPLATES: &str = "BRISA_OCR_TEMPLATES";
pub const ENV_SOLVER_URL: &str = "BRISA_SOLVER_URL";
pub const ENV_SOLVER_KEY: &str = "BRISA_SOLVER_KEY";

/// Flags of `brisa fetch` that feed the configuration.
#[derive(Debug, Clone, Default)]
pub struct FetchFlags {
    pub captcha: Option<String>,
    pub templates: Option<PathBuf>,
    pub retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub user_agent: Option<String>,
    pub base_url: Option<String>,
    pub portal_config: Option<PathBuf>,
    pub solver_url: Option<String>,
    pub debug: bool,
}

/// Everything needed to build a [`brisa::Retriever`].
#[derive(Debug)]
pub struct Resolved {
    pub options: RetrieverOptions,
    pub portal: PortalConfig,
    pub solver: CaptchaSolver,
}

pub fn resolve(flags: &FetchFlags) -> BrisaResult<Resolved> {
    resolve_with(flags, |name| std::env::var(name).ok())
}

/// [`resolve`] with an injectable environment.
pub fn resolve_with(flags: &FetchFlags, env: impl Fn(&str) -> Option<String>) -> BrisaResult<Resolved> {
    let pick = |flag: &Option<String>, var: &str| {
        flag.clone()
            .or_else(|| env(var))
            .filter(|v| !v.trim().is_empty())
    };

    let portal_path = flags
        .portal_config
        .clone()
        .or_else(|| env(ENV_PORTAL_CONFIG).filter(|v| !v.is_empty()).map(PathBuf::from));
    let mut portal = match portal_path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "loading portal config");
            PortalConfig::from_json_file(&path)?
        }
        None => PortalConfig::default(),
    };
    if let Some(base_url) = pick(&flags.base_url, ENV_BASE_URL) {
        portal.base_url = base_url;
    }
    portal.validate()?;

    let defaults = RetrieverOptions::default();
    let timeout = match flags.timeout_secs {
        Some(secs) => Duration::from_secs(secs),
        None => match env(ENV_TIMEOUT_SECS) {
            Some(v) => Duration::from_secs(parse_var(ENV_TIMEOUT_SECS, &v)?),
            None => defaults.timeout,
        },
    };
    if timeout.is_zero() {
        return Err(BrisaError::Config("timeout must be positive".to_string()));
    }
    let retry_attempts = match flags.retries {
        Some(n) => n,
        None => match env(ENV_RETRY_ATTEMPTS) {
            Some(v) => parse_var(ENV_RETRY_ATTEMPTS, &v)?,
            None => defaults.retry_attempts,
        },
    };
    let captcha_mode = match pick(&flags.captcha, ENV_CAPTCHA_MODE) {
        Some(mode) => mode.parse::<CaptchaMode>()?,
        None => defaults.captcha_mode,
    };

    let solver = match captcha_mode {
        CaptchaMode::Manual => CaptchaSolver::Manual,
        CaptchaMode::Ocr => {
            let dir = flags
                .templates
                .clone()
                .or_else(|| env(ENV_OCR_TEMPLATES).map(PathBuf::from))
                .ok_or_else(|| {
                    BrisaError::Config(format!("ocr mode needs --templates or {ENV_OCR_TEMPLATES}"))
                })?;
            CaptchaSolver::Ocr(OcrSolver::from_dir(&dir)?)
        }
        CaptchaMode::Service => {
            let url = pick(&flags.solver_url, ENV_SOLVER_URL).ok_or_else(|| {
                BrisaError::Config(format!("service mode needs --solver-url or {ENV_SOLVER_URL}"))
            })?;
            let key = env(ENV_SOLVER_KEY)
                .ok_or_else(|| BrisaError::Config(format!("service mode needs {ENV_SOLVER_KEY}")))?;
            CaptchaSolver::Service(ServiceSolver::new(&url, key)?.with_timeout(timeout))
        }
    };

    let options = RetrieverOptions {
        timeout,
        user_agent: pick(&flags.user_agent, ENV_USER_AGENT).unwrap_or(defaults.user_agent),
        captcha_mode,
        retry_attempts,
        debug: flags.debug,
    };

    Ok(Resolved {
        options,
        portal,
        solver,
    })
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> BrisaResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| BrisaError::Config(format!("{name}='{value}': {e}")))
}
