//! Retrieval options and the portal description.
//!
//! The portal's request/response shapes (paths, field names, markers) are not
//! fixed by any public contract, so they live in a serializable
//! [`PortalConfig`] that can be loaded from JSON when the portal changes.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::captcha::CaptchaMode;
use crate::error::{BrisaError, BrisaResult};
use crate::session::DEFAULT_RETRY_BUDGET;

/// Desktop Chrome user agent sent unless overridden.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
                                      AppleWebKit/537.36 (KHTML, like Gecko) \
                                      Chrome/131.0.0.0 Safari/537.36";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Public NF-e query portal.
pub const DEFAULT_PORTAL_URL: &str = "https://www.nfe.fazenda.gov.br/portal/";

/// Caller-facing knobs of a retrieval.
#[derive(Debug, Clone)]
pub struct RetrieverOptions {
    /// Per network call; the manual-resolution wait is not bounded by it.
    pub timeout: Duration,
    pub user_agent: String,
    pub captcha_mode: CaptchaMode,
    /// Maximum form submissions per retrieval.
    pub retry_attempts: u32,
    /// Log response bodies at debug level.
    pub debug: bool,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            captcha_mode: CaptchaMode::default(),
            retry_attempts: DEFAULT_RETRY_BUDGET,
            debug: false,
        }
    }
}

/// Where the portal lives and how its query form looks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub base_url: String,
    /// Page fetched first to seed cookies and hidden fields.
    pub home_path: String,
    pub captcha_path: String,
    /// Form action for the query POST.
    pub query_path: String,
    pub access_key_field: String,
    pub captcha_field: String,
    /// Static fields posted with every query (e.g. the submit button).
    pub extra_fields: Vec<(String, String)>,
    /// Body fragments meaning "wrong captcha". Matched accent- and case-insensitively.
    pub rejection_markers: Vec<String>,
    /// Statuses meaning "wrong captcha".
    pub rejection_statuses: Vec<u16>,
    /// Body fragments meaning "no such invoice".
    pub not_found_markers: Vec<String>,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_PORTAL_URL.to_string(),
            home_path: "consultaCompleta.aspx".to_string(),
            captcha_path: "captcha.aspx".to_string(),
            query_path: "consultaCompleta.aspx".to_string(),
            access_key_field: "ctl00$ContentPlaceHolder1$txtChaveAcessoCompleta".to_string(),
            captcha_field: "ctl00$ContentPlaceHolder1$txtCaptcha".to_string(),
            extra_fields: vec![(
                "ctl00$ContentPlaceHolder1$btnConsultar".to_string(),
                "Continuar".to_string(),
            )],
            rejection_markers: vec![
                "código da imagem inválido".to_string(),
                "captcha inválido".to_string(),
                "caracteres da imagem não conferem".to_string(),
            ],
            rejection_statuses: Vec::new(),
            not_found_markers: vec![
                "nf-e inexistente".to_string(),
                "nfc-e não encontrada".to_string(),
                "nota fiscal não encontrada".to_string(),
            ],
        }
    }
}

impl PortalConfig {
    /// Portal rooted at `base_url`, other settings default.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file; absent keys keep their defaults.
    pub fn from_json_file(path: &Path) -> BrisaResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: PortalConfig = serde_json::from_str(&text).map_err(|e| {
            BrisaError::Config(format!("invalid portal config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BrisaResult<()> {
        self.base_url()?;
        for (name, value) in [
            ("home_path", &self.home_path),
            ("captcha_path", &self.captcha_path),
            ("query_path", &self.query_path),
            ("access_key_field", &self.access_key_field),
            ("captcha_field", &self.captcha_field),
        ] {
            if value.trim().is_empty() {
                return Err(BrisaError::Config(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    /// Parsed base URL. A missing trailing slash is added so relative paths
    /// resolve beneath it.
    pub fn base_url(&self) -> BrisaResult<Url> {
        let mut base = self.base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Url::parse(&base)
            .map_err(|e| BrisaError::Config(format!("invalid base URL '{}': {e}", self.base_url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        PortalConfig::default().validate().unwrap();
        let opts = RetrieverOptions::default();
        assert_eq!(opts.retry_attempts, 3);
        assert_eq!(opts.timeout, Duration::from_secs(10));
        assert_eq!(opts.captcha_mode, CaptchaMode::Manual);
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let cfg = PortalConfig::with_base_url("http://127.0.0.1:8080/nfe");
        assert_eq!(cfg.base_url().unwrap().as_str(), "http://127.0.0.1:8080/nfe/");
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"base_url": "https://sefaz.example.gov.br/", "captcha_path": "img/captcha.png"}}"#
        )
        .unwrap();
        let cfg = PortalConfig::from_json_file(file.path()).unwrap();
        assert_eq!(cfg.captcha_path, "img/captcha.png");
        assert_eq!(cfg.home_path, PortalConfig::default().home_path);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"base_url": "not a url"}}"#).unwrap();
        let err = PortalConfig::from_json_file(file.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
