//! Per-run session state: cookies, user agent, base URL, timeout, retry budget.
//!
//! A session is owned by exactly one retrieval. Every response it sees is
//! absorbed into its cookie jar, and every request it sends carries the
//! matching cookies, so the portal treats the run as one browsing context.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::http::{HttpError, HttpResponse, RequestConfig, RequestExecutor};

/// Redirect hops followed per request.
const MAX_REDIRECTS: usize = 5;

/// Upper bound for `Max-Age`, about ten years.
const MAX_COOKIE_AGE_SECS: i64 = 10 * 365 * 24 * 3600;

/// Default number of form submissions per retrieval.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// HTTP method used by [`Session::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// A cookie received through `Set-Cookie`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// Lower-cased domain, without a leading dot.
    pub domain: String,
    pub path: String,
    pub expires: Option<DateTime<Utc>>,
    pub secure: bool,
    /// Set when the response carried no `Domain` attribute.
    pub host_only: bool,
}

impl Cookie {
    /// Parse a `Set-Cookie` header received from `origin`.
    ///
    /// Returns `None` for unparseable headers and for cookies whose `Domain`
    /// does not cover the origin host. Expired cookies are returned so the
    /// caller can delete a stored counterpart.
    pub fn parse(header: &str, origin: &Url, now: DateTime<Utc>) -> Option<Cookie> {
        let host = origin.host_str()?.to_ascii_lowercase();
        let mut parts = header.split(';');
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            domain: host.clone(),
            path: default_path(origin),
            expires: None,
            secure: false,
            host_only: true,
        };
        let mut max_age: Option<i64> = None;

        for attr in parts {
            let (key, val) = match attr.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => (attr.trim(), ""),
            };
            match key.to_ascii_lowercase().as_str() {
                "domain" if !val.is_empty() => {
                    let domain = val.trim_start_matches('.').to_ascii_lowercase();
                    if !domain_matches(&host, &domain) {
                        tracing::debug!(cookie = %cookie.name, %domain, %host, "ignoring cookie for foreign domain");
                        return None;
                    }
                    cookie.domain = domain;
                    cookie.host_only = false;
                }
                "path" if val.starts_with('/') => cookie.path = val.to_string(),
                "expires" => cookie.expires = parse_http_date(val),
                "max-age" => max_age = val.parse().ok(),
                "secure" => cookie.secure = true,
                _ => {}
            }
        }

        if let Some(secs) = max_age {
            cookie.expires = Some(if secs <= 0 {
                now - chrono::Duration::seconds(1)
            } else {
                now + chrono::Duration::seconds(secs.min(MAX_COOKIE_AGE_SECS))
            });
        }

        Some(cookie)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|e| e <= now)
    }

    /// Whether this cookie should be sent with a request to `url`.
    pub fn matches(&self, url: &Url, now: DateTime<Utc>) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain_ok = if self.host_only {
            host == self.domain
        } else {
            domain_matches(&host, &self.domain)
        };
        domain_ok
            && path_matches(url.path(), &self.path)
            && (!self.secure || url.scheme() == "https")
            && !self.is_expired(now)
    }

    fn same_slot(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

/// State threaded through one retrieval.
#[derive(Debug)]
pub struct Session {
    cookies: Vec<Cookie>,
    user_agent: String,
    base_url: Url,
    timeout: Duration,
    retry_budget: u32,
    hidden_fields: Vec<(String, String)>,
}

impl Session {
    pub fn initialize(base_url: Url, user_agent: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cookies: Vec::new(),
            user_agent: user_agent.into(),
            base_url,
            timeout,
            retry_budget: DEFAULT_RETRY_BUDGET,
            hidden_fields: Vec::new(),
        }
    }

    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Hidden form fields harvested from the portal page, posted back on submit.
    pub fn hidden_fields(&self) -> &[(String, String)] {
        &self.hidden_fields
    }

    pub fn set_hidden_fields(&mut self, fields: Vec<(String, String)>) {
        self.hidden_fields = fields;
    }

    /// Merge the response's `Set-Cookie` headers into the jar.
    pub fn absorb_response(&mut self, response: &HttpResponse) {
        self.absorb_response_at(response, Utc::now());
    }

    pub fn absorb_response_at(&mut self, response: &HttpResponse, now: DateTime<Utc>) {
        let Ok(origin) = Url::parse(&response.final_url) else {
            return;
        };

        for header in response.headers_all("set-cookie") {
            let Some(cookie) = Cookie::parse(header, &origin, now) else {
                continue;
            };
            self.cookies.retain(|c| !c.same_slot(&cookie));
            if cookie.is_expired(now) {
                tracing::debug!(cookie = %cookie.name, "cookie expired by server");
                continue;
            }
            tracing::debug!(cookie = %cookie.name, domain = %cookie.domain, "cookie stored");
            self.cookies.push(cookie);
        }

        self.cookies.retain(|c| !c.is_expired(now));
    }

    /// `Cookie` header value for a request to `url`, if any cookie applies.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        let now = Utc::now();
        let mut matching: Vec<&Cookie> = self.cookies.iter().filter(|c| c.matches(url, now)).collect();
        if matching.is_empty() {
            return None;
        }
        // Longer paths first.
        matching.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        Some(
            matching
                .iter()
                .map(|c| format!("{}={}", c.name, c.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Resolve a path against the session base URL.
    pub fn resolve(&self, target: &str) -> Result<Url, HttpError> {
        match Url::parse(target) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base_url
                .join(target)
                .map_err(|e| HttpError::InvalidUrl(target.to_string(), e)),
            Err(e) => Err(HttpError::InvalidUrl(target.to_string(), e)),
        }
    }

    /// Send a request in this session: inject user agent, cookies and timeout,
    /// execute, absorb the response and follow redirects.
    ///
    /// Error-status responses are absorbed too before the error is returned.
    pub async fn send(
        &mut self,
        executor: &dyn RequestExecutor,
        method: Method,
        target: &str,
        config: RequestConfig,
    ) -> Result<HttpResponse, HttpError> {
        let mut url = self.resolve(target)?;
        let mut method = method;
        let mut config = config;

        for _ in 0..=MAX_REDIRECTS {
            let mut request = config.clone();
            request
                .headers
                .push(("User-Agent".to_string(), self.user_agent.clone()));
            if let Some(cookies) = self.cookie_header(&url) {
                request.headers.push(("Cookie".to_string(), cookies));
            }
            request.timeout.get_or_insert(self.timeout);

            let result = match method {
                Method::Get => executor.get(url.as_str(), request).await,
                Method::Post => executor.post(url.as_str(), request).await,
            };

            let response = match result {
                Ok(response) => response,
                Err(HttpError::Status(response)) => {
                    self.absorb_response(&response);
                    return Err(HttpError::Status(response));
                }
                Err(e) => return Err(e),
            };
            self.absorb_response(&response);

            let Some(next) = redirect_target(&response) else {
                return Ok(response);
            };
            tracing::debug!(from = %url, to = %next, status = response.status, "following redirect");
            if !matches!(response.status, 307 | 308) {
                method = Method::Get;
                config.form = None;
            }
            config.params.clear();
            url = next;
        }

        Err(HttpError::TooManyRedirects(target.to_string()))
    }
}

fn redirect_target(response: &HttpResponse) -> Option<Url> {
    if !response.is_redirect() {
        return None;
    }
    let location = response.header("location")?;
    let base = Url::parse(&response.final_url).ok()?;
    base.join(location).ok()
}

fn domain_matches(host: &str, domain: &str) -> bool {
    host == domain
        || (host.len() > domain.len()
            && host.ends_with(domain)
            && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
}

fn path_matches(request_path: &str, cookie_path: &str) -> bool {
    if request_path == cookie_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || request_path[cookie_path.len()..].starts_with('/'))
}

fn default_path(origin: &Url) -> String {
    let path = origin.path();
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Netscape formats still emitted by older servers.
    ["%a, %d-%b-%Y %H:%M:%S GMT", "%A, %d-%b-%y %H:%M:%S GMT"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpClient;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn response(url: &str, cookies: &[&str]) -> HttpResponse {
        HttpResponse {
            url: url.to_string(),
            final_url: url.to_string(),
            status: 200,
            headers: cookies
                .iter()
                .map(|c| ("set-cookie".to_string(), c.to_string()))
                .collect(),
            body: Vec::new(),
        }
    }

    fn session() -> Session {
        Session::initialize(
            Url::parse("https://portal.example.gov.br/nfe/").unwrap(),
            "brisa-test",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_absorb_and_overwrite() {
        let mut s = session();
        let url = "https://portal.example.gov.br/nfe/consulta.aspx";
        s.absorb_response(&response(url, &["ASP.NET_SessionId=abc; path=/; HttpOnly"]));
        s.absorb_response(&response(url, &["ASP.NET_SessionId=def; path=/"]));
        assert_eq!(s.cookies().len(), 1);
        assert_eq!(s.cookie("ASP.NET_SessionId").unwrap().value, "def");
    }

    #[test]
    fn test_expired_cookie_deletes_stored_one() {
        let mut s = session();
        let url = "https://portal.example.gov.br/nfe/consulta.aspx";
        s.absorb_response(&response(url, &["token=1; Path=/"]));
        s.absorb_response(&response(url, &["token=; Path=/; Max-Age=0"]));
        assert!(s.cookie("token").is_none());

        s.absorb_response(&response(
            url,
            &["old=1; Path=/; Expires=Thu, 01 Jan 1970 00:00:01 GMT"],
        ));
        assert!(s.cookie("old").is_none());
    }

    #[test]
    fn test_cookie_header_matches_domain_and_path() {
        let mut s = session();
        let url = "https://portal.example.gov.br/nfe/consulta.aspx";
        s.absorb_response(&response(
            url,
            &[
                "a=1; Path=/",
                "b=2; Path=/nfe",
                "c=3; Path=/other",
                "d=4; Domain=example.gov.br; Path=/",
                "e=5; Domain=evil.com; Path=/",
            ],
        ));
        assert!(s.cookie("e").is_none());

        let header = s
            .cookie_header(&Url::parse("https://portal.example.gov.br/nfe/captcha.aspx").unwrap())
            .unwrap();
        assert!(header.starts_with("b=2"));
        assert!(header.contains("a=1"));
        assert!(header.contains("d=4"));
        assert!(!header.contains("c=3"));

        let sibling = s
            .cookie_header(&Url::parse("https://www.example.gov.br/").unwrap())
            .unwrap();
        assert_eq!(sibling, "d=4");
    }

    #[test]
    fn test_secure_cookie_only_over_https() {
        let mut s = session();
        s.absorb_response(&response(
            "https://portal.example.gov.br/",
            &["s=1; Path=/; Secure"],
        ));
        assert!(s
            .cookie_header(&Url::parse("http://portal.example.gov.br/").unwrap())
            .is_none());
        assert!(s
            .cookie_header(&Url::parse("https://portal.example.gov.br/").unwrap())
            .is_some());
    }

    #[test]
    fn test_sessions_do_not_share_cookies() {
        let mut a = session();
        let b = session();
        a.absorb_response(&response("https://portal.example.gov.br/", &["x=1; Path=/"]));
        assert_eq!(a.cookies().len(), 1);
        assert!(b.cookies().is_empty());
    }

    #[tokio::test]
    async fn test_send_threads_cookies_and_follows_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/home"))
            .respond_with(
                ResponseTemplate::new(302)
                    .append_header("set-cookie", "sid=abc; Path=/")
                    .append_header("location", "/landing"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .and(header("cookie", "sid=abc"))
            .and(header("user-agent", "brisa-test"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let mut s = Session::initialize(
            Url::parse(&format!("{}/", server.uri())).unwrap(),
            "brisa-test",
            Duration::from_secs(5),
        );
        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        let resp = s
            .send(&client, Method::Get, "home", RequestConfig::default())
            .await
            .unwrap();
        assert_eq!(resp.text(), "ok");
        assert_eq!(s.cookie("sid").unwrap().value, "abc");
    }
}
