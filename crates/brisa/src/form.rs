//! Query form submission and response classification.

use scraper::{Html, Selector};

use crate::access_key::AccessKey;
use crate::config::PortalConfig;
use crate::error::{BrisaError, BrisaResult};
use crate::http::{HttpError, HttpResponse, RequestConfig, RequestExecutor};
use crate::parser::text::fold;
use crate::session::{Method, Session};

/// `name`/`value` of every `<input type="hidden">` with a name.
pub fn harvest_hidden_fields(html: &str) -> Vec<(String, String)> {
    let Ok(selector) = Selector::parse(r#"input[type="hidden" i]"#) else {
        return Vec::new();
    };
    let doc = Html::parse_document(html);
    doc.select(&selector)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or("");
            Some((name.to_string(), value.to_string()))
        })
        .collect()
}

fn refresh_hidden_fields(session: &mut Session, body: &str) {
    let hidden = harvest_hidden_fields(body);
    if !hidden.is_empty() {
        tracing::debug!(fields = hidden.len(), "hidden fields refreshed");
        session.set_hidden_fields(hidden);
    }
}

/// What a submission response means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    CaptchaRejected,
    NotFound,
}

pub struct FormSubmitter<'a> {
    portal: &'a PortalConfig,
}

impl<'a> FormSubmitter<'a> {
    pub fn new(portal: &'a PortalConfig) -> Self {
        Self { portal }
    }

    /// Fields posted for one query, hidden fields first.
    pub fn fields(&self, session: &Session, access_key: &AccessKey, solution: &str) -> Vec<(String, String)> {
        let own = [&self.portal.access_key_field, &self.portal.captcha_field];
        let mut fields: Vec<(String, String)> = session
            .hidden_fields()
            .iter()
            .filter(|(name, _)| !own.contains(&name) && !self.portal.extra_fields.iter().any(|(n, _)| n == name))
            .cloned()
            .collect();
        fields.push((self.portal.access_key_field.clone(), access_key.to_string()));
        fields.push((self.portal.captcha_field.clone(), solution.to_string()));
        fields.extend(self.portal.extra_fields.iter().cloned());
        fields
    }

    /// Post the query and return the raw response body.
    ///
    /// Wrong captchas surface as `CaptchaRejected`, unknown keys as
    /// `InvoiceNotFound`. Hidden fields of any response, rejections included,
    /// replace the session's so the next attempt posts the portal's latest state.
    pub async fn submit(
        &self,
        session: &mut Session,
        executor: &dyn RequestExecutor,
        access_key: &AccessKey,
        solution: &str,
    ) -> BrisaResult<String> {
        let referer = session.resolve(&self.portal.home_path)?;
        let config = RequestConfig::default()
            .header("Referer", referer.as_str())
            .form(self.fields(session, access_key, solution));

        let response = match session
            .send(executor, Method::Post, &self.portal.query_path, config)
            .await
        {
            Ok(response) => response,
            Err(HttpError::Status(response)) => {
                refresh_hidden_fields(session, &response.text());
                if self.classify(&response) == Verdict::CaptchaRejected {
                    return Err(BrisaError::CaptchaRejected);
                }
                return Err(HttpError::Status(response).into());
            }
            Err(e) => return Err(e.into()),
        };

        let body = response.text();
        refresh_hidden_fields(session, &body);
        match self.classify(&response) {
            Verdict::CaptchaRejected => Err(BrisaError::CaptchaRejected),
            Verdict::NotFound => Err(BrisaError::InvoiceNotFound(access_key.to_string())),
            Verdict::Accepted => Ok(body),
        }
    }

    pub fn classify(&self, response: &HttpResponse) -> Verdict {
        if self.portal.rejection_statuses.contains(&response.status) {
            return Verdict::CaptchaRejected;
        }
        let body = fold(&response.text());
        let contains_any = |markers: &[String]| markers.iter().any(|m| !m.trim().is_empty() && body.contains(&fold(m)));
        if contains_any(&self.portal.rejection_markers) {
            Verdict::CaptchaRejected
        } else if contains_any(&self.portal.not_found_markers) {
            Verdict::NotFound
        } else {
            Verdict::Accepted
        }
    }
}
