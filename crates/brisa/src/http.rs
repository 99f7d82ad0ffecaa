//! Request executor wrapping reqwest.
//!
//! Resolves paths against an optional base URL, merges query parameters,
//! applies per-request headers and timeouts, and classifies status >= 400 as
//! an error that still carries the response. Cookies are not stored here:
//! every pipeline run threads them through its own [`crate::Session`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

/// Response to a GET or POST, with every header and the raw body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Requested URL.
    pub url: String,
    /// URL the response came from.
    pub final_url: String,
    /// HTTP status code.
    pub status: u16,
    /// All response headers, in wire order (repeated names kept).
    pub headers: Vec<(String, String)>,
    /// Raw response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// First value of a header (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of a repeated header such as `set-cookie`.
    pub fn headers_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308)
    }
}

/// Errors at the request executor boundary.
#[derive(thiserror::Error, Debug)]
pub enum HttpError {
    #[error("invalid URL or path '{0}': {1}")]
    InvalidUrl(String, url::ParseError),

    #[error("cannot resolve relative path '{0}' without a base URL")]
    NoBaseUrl(String),

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("request to {} returned error status {}", .0.final_url, .0.status)]
    Status(Box<HttpResponse>),

    #[error("too many redirects starting at {0}")]
    TooManyRedirects(String),

    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl HttpError {
    /// The response behind a status error.
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            HttpError::Status(r) => Some(r),
            _ => None,
        }
    }
}

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Query parameters merged into the URL.
    pub params: Vec<(String, String)>,
    /// Headers set on this request only.
    pub headers: Vec<(String, String)>,
    /// URL-encoded form body (POST).
    pub form: Option<Vec<(String, String)>>,
    /// Overrides the executor's default timeout.
    pub timeout: Option<Duration>,
}

impl RequestConfig {
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.form = Some(fields);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The HTTP boundary the pipeline consumes.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// GET an absolute URL or a path relative to the executor's base URL.
    async fn get(&self, target: &str, config: RequestConfig) -> Result<HttpResponse, HttpError>;
    /// POST an absolute URL or a path relative to the executor's base URL.
    async fn post(&self, target: &str, config: RequestConfig) -> Result<HttpResponse, HttpError>;
    /// Number of requests currently awaiting a response.
    fn in_flight(&self) -> usize {
        0
    }
}

/// reqwest-backed executor. Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: Option<Url>,
    timeout: Duration,
    in_flight: Arc<AtomicUsize>,
}

impl HttpClient {
    /// Create a client with a default per-request timeout.
    ///
    /// Redirects are not followed here; [`crate::Session::send`] follows them so
    /// cookies set on intermediate hops are not lost.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(HttpError::Client)?;

        Ok(Self {
            client,
            base_url: None,
            timeout,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// Resolve a path or URL and append query parameters.
    pub fn resolve_url(&self, target: &str, params: &[(String, String)]) -> Result<Url, HttpError> {
        let mut url = match Url::parse(target) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self
                    .base_url
                    .as_ref()
                    .ok_or_else(|| HttpError::NoBaseUrl(target.to_string()))?;
                base.join(target)
                    .map_err(|e| HttpError::InvalidUrl(target.to_string(), e))?
            }
            Err(e) => return Err(HttpError::InvalidUrl(target.to_string(), e)),
        };

        if !params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in params {
                pairs.append_pair(name, value);
            }
        }

        Ok(url)
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        target: &str,
        config: RequestConfig,
    ) -> Result<HttpResponse, HttpError> {
        let url = self.resolve_url(target, &config.params)?;
        let _in_flight = InFlight::enter(&self.in_flight);

        let mut builder = self
            .client
            .request(method.clone(), url.clone())
            .timeout(config.timeout.unwrap_or(self.timeout));

        for (name, value) in &config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(fields) = &config.form {
            builder = builder.form(fields);
        }

        let r = builder.send().await?;
        let status = r.status().as_u16();
        let final_url = r.url().to_string();

        let headers: Vec<(String, String)> = r
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let body = r.bytes().await?.to_vec();

        tracing::debug!(%method, url = %url, status, bytes = body.len(), "http response");

        let response = HttpResponse {
            url: url.to_string(),
            final_url,
            status,
            headers,
            body,
        };

        if status >= 400 {
            return Err(HttpError::Status(Box::new(response)));
        }
        Ok(response)
    }
}

#[async_trait]
impl RequestExecutor for HttpClient {
    async fn get(&self, target: &str, config: RequestConfig) -> Result<HttpResponse, HttpError> {
        self.execute(reqwest::Method::GET, target, config).await
    }

    async fn post(&self, target: &str, config: RequestConfig) -> Result<HttpResponse, HttpError> {
        self.execute(reqwest::Method::POST, target, config).await
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

/// Counts a request as in flight until dropped, including when the request
/// future is dropped by cancellation.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_resolve_relative_and_absolute() {
        let client = HttpClient::new(Duration::from_secs(5))
            .unwrap()
            .with_base_url(Url::parse("https://portal.example.gov.br/nfe/").unwrap());

        let rel = client.resolve_url("consulta.aspx", &[]).unwrap();
        assert_eq!(rel.as_str(), "https://portal.example.gov.br/nfe/consulta.aspx");

        let abs = client
            .resolve_url(
                "https://other.example.com/x",
                &[("t".to_string(), "1".to_string())],
            )
            .unwrap();
        assert_eq!(abs.as_str(), "https://other.example.com/x?t=1");
    }

    #[test]
    fn test_relative_without_base_fails() {
        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            client.resolve_url("consulta.aspx", &[]),
            Err(HttpError::NoBaseUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_get_merges_params_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/captcha"))
            .and(query_param("t", "42"))
            .and(header("x-probe", "yes"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        let config = RequestConfig::default().param("t", "42").header("x-probe", "yes");
        let resp = client
            .get(&format!("{}/captcha", server.uri()), config)
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, vec![1, 2, 3]);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_post_form_and_error_status_keeps_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/consulta"))
            .and(body_string_contains("chave=123"))
            .respond_with(ResponseTemplate::new(403).set_body_string("bloqueado"))
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5))
            .unwrap()
            .with_base_url(Url::parse(&format!("{}/", server.uri())).unwrap());
        let config =
            RequestConfig::default().form(vec![("chave".to_string(), "123".to_string())]);
        let err = client.post("consulta", config).await.unwrap_err();
        let resp = err.response().expect("status error keeps response");
        assert_eq!(resp.status, 403);
        assert_eq!(resp.text(), "bloqueado");
    }

    #[tokio::test]
    async fn test_redirects_are_returned_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/start"))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", "/landing")
                    .insert_header("set-cookie", "hop=1; Path=/"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let client = HttpClient::new(Duration::from_secs(5)).unwrap();
        let resp = client
            .get(&format!("{}/start", server.uri()), RequestConfig::default())
            .await
            .unwrap();
        assert!(resp.is_redirect());
        assert_eq!(resp.header("location"), Some("/landing"));
        assert_eq!(resp.header("set-cookie"), Some("hop=1; Path=/"));
    }
}
