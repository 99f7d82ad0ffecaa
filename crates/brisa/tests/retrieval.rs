use std::sync::Arc;
use std::time::Duration;

use brisa::{
    manual_channel, retrieve_invoice_from, BrisaError, CaptchaMode, CaptchaSolver, ErrorKind, HttpClient,
    HttpResponse, PortalConfig, RequestExecutor, RetrievalContext, Retriever, RetrieverOptions,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, header, header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: &str = "35240512345678000190550010000000011234567890";
const INVOICE_HTML: &str = include_str!("fixtures/nfe_completa.html");
const REJECTED_HTML: &str =
    "<html><body><span id=\"lblMensagem\">Código da Imagem inválido. Tente novamente.</span></body></html>";

const HOME_HTML: &str = r#"<html><body><form action="consultaCompleta.aspx" method="post">
<input type="hidden" name="__VIEWSTATE" value="seed-state" />
<input type="text" name="ctl00$ContentPlaceHolder1$txtChaveAcessoCompleta" />
<img id="ctl00_ContentPlaceHolder1_imgCaptcha" src="captcha.aspx" />
</form></body></html>"#;

fn captcha_png() -> Vec<u8> {
    let img = image::DynamicImage::new_luma8(40, 16);
    let mut buf = Vec::new();
    img.write_with_encoder(image::codecs::png::PngEncoder::new(&mut buf))
        .unwrap();
    buf
}

/// Home page with a session cookie, and a captcha endpoint.
async fn mount_portal(server: &MockServer) {
    mount_portal_with_home(server, HOME_HTML).await;
}

async fn mount_portal_with_home(server: &MockServer, home: &str) {
    Mock::given(method("GET"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "ASP.NET_SessionId=s3ss10n; path=/; HttpOnly")
                .set_body_string(home),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/captcha.aspx"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/png")
                .set_body_bytes(captcha_png()),
        )
        .mount(server)
        .await;
}

fn options(retry_attempts: u32) -> RetrieverOptions {
    RetrieverOptions {
        timeout: Duration::from_secs(5),
        retry_attempts,
        ..Default::default()
    }
}

fn retriever(server: &MockServer, retry_attempts: u32, solver: CaptchaSolver) -> (Retriever, Arc<HttpClient>) {
    let client = Arc::new(HttpClient::new(Duration::from_secs(5)).unwrap());
    let retriever = Retriever::with_executor(
        client.clone(),
        options(retry_attempts),
        PortalConfig::with_base_url(server.uri()),
        solver,
    )
    .unwrap();
    (retriever, client)
}

fn fixture() -> CaptchaSolver {
    CaptchaSolver::Fixture("x7k2".to_string())
}

#[tokio::test]
async fn test_succeeds_after_rejections() {
    for k in 0..3u32 {
        let server = MockServer::start().await;
        mount_portal(&server).await;
        if k > 0 {
            Mock::given(method("POST"))
                .and(path("/consultaCompleta.aspx"))
                .respond_with(ResponseTemplate::new(200).set_body_string(REJECTED_HTML))
                .up_to_n_times(k as u64)
                .expect(k as u64)
                .mount(&server)
                .await;
        }
        Mock::given(method("POST"))
            .and(path("/consultaCompleta.aspx"))
            .and(header("cookie", "ASP.NET_SessionId=s3ss10n"))
            .and(body_string_contains("__VIEWSTATE=seed-state"))
            .and(body_string_contains("txtCaptcha=x7k2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(INVOICE_HTML))
            .expect(1)
            .mount(&server)
            .await;

        let (retriever, _) = retriever(&server, 3, fixture());
        let retrieval = retriever
            .retrieve(KEY, RetrievalContext::new())
            .await
            .unwrap();
        assert_eq!(retrieval.submissions, k + 1);
        assert_eq!(retrieval.invoice.access_key().as_str(), KEY);
    }
}

#[tokio::test]
async fn test_budget_exceeded_stops_submitting() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(REJECTED_HTML))
        .expect(3)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 3, fixture());
    let err = retriever
        .retrieve(KEY, RetrievalContext::new())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RetryBudgetExceeded);
    assert_eq!(err.attempts, 3);
    match err.error {
        BrisaError::RetryBudgetExceeded { attempts, last } => {
            assert_eq!(attempts, 3);
            assert_eq!(last.kind(), ErrorKind::CaptchaRejected);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_malformed_response_not_retried() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>Manutenção</body></html>"))
        .expect(1)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 3, fixture());
    let err = retriever
        .retrieve(KEY, RetrievalContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    assert_eq!(err.attempts, 1);
}

#[tokio::test]
async fn test_invoice_not_found_is_terminal() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<p>NF-e inexistente na base nacional</p>"))
        .expect(1)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 3, fixture());
    let err = retriever
        .retrieve(KEY, RetrievalContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvoiceNotFound);
}

#[tokio::test]
async fn test_mismatched_key_is_malformed() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INVOICE_HTML))
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 3, fixture());
    let other_key = "35240512345678000190550010000000021234567891";
    let err = retriever
        .retrieve(other_key, RetrievalContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
}

#[tokio::test]
async fn test_captcha_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(HOME_HTML))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/captcha.aspx"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 3, fixture());
    let err = retriever
        .retrieve(KEY, RetrievalContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CaptchaUnavailable);
    assert_eq!(err.attempts, 0);
}

#[tokio::test]
async fn test_cancel_mid_submission() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(INVOICE_HTML)
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let (retriever, client) = retriever(&server, 3, fixture());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let err = retriever
        .retrieve(KEY, RetrievalContext::new().with_cancel(cancel))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.attempts, 1);
    assert_eq!(client.in_flight(), 0);
}

#[tokio::test]
async fn test_manual_resolution_round_trip() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .and(body_string_contains("txtCaptcha=h3lp"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INVOICE_HTML))
        .expect(1)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 3, CaptchaSolver::Manual);
    let (sink, mut handle) = manual_channel();
    let human = tokio::spawn(async move {
        let pending = handle.await_manual_solution().await.unwrap();
        assert_eq!(pending.attempt(), 1);
        assert_eq!(pending.image_bytes(), captcha_png().as_slice());
        pending.resolve_manual("h3lp");
    });

    let retrieval = retriever
        .retrieve(KEY, RetrievalContext::new().with_manual(sink))
        .await
        .unwrap();
    assert_eq!(retrieval.submissions, 1);
    human.await.unwrap();
}

#[tokio::test]
async fn test_manual_abort_cancels() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 3, CaptchaSolver::Manual);
    let (sink, mut handle) = manual_channel();
    tokio::spawn(async move {
        if let Some(pending) = handle.await_manual_solution().await {
            pending.abort();
        }
    });

    let err = retriever
        .retrieve(KEY, RetrievalContext::new().with_manual(sink))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(err.attempts, 0);
}

#[tokio::test]
async fn test_manual_without_handler_fails() {
    let server = MockServer::start().await;
    mount_portal(&server).await;

    let (retriever, _) = retriever(&server, 3, CaptchaSolver::Manual);
    let err = retriever
        .retrieve(KEY, RetrievalContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CaptchaSolveFailed);
}

#[tokio::test]
async fn test_garbled_key_in_response_is_malformed() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    let garbled = INVOICE_HTML.replace("3456 7890</span>", "3456 789</span>");
    assert_ne!(garbled, INVOICE_HTML);
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(garbled))
        .expect(1)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 3, fixture());
    let err = retriever
        .retrieve(KEY, RetrievalContext::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    assert_eq!(err.attempts, 1);
}

#[tokio::test]
async fn test_retry_posts_state_from_rejection_page() {
    let home = r#"<html><body><form method="post">
<input type="hidden" name="__VIEWSTATE" value="vs-1" />
<input type="hidden" name="__EVENTVALIDATION" value="ev-1" />
</form></body></html>"#;
    let rejected = r#"<html><body><form method="post">
<input type="hidden" name="__VIEWSTATE" value="vs-2" />
<input type="hidden" name="__EVENTVALIDATION" value="ev-2" />
<span id="lblMensagem">Código da Imagem inválido.</span>
</form></body></html>"#;

    let server = MockServer::start().await;
    mount_portal_with_home(&server, home).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .and(body_string_contains("__VIEWSTATE=vs-2"))
        .and(body_string_contains("__EVENTVALIDATION=ev-2"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INVOICE_HTML))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .and(body_string_contains("__EVENTVALIDATION=ev-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(rejected))
        .expect(1)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 2, fixture());
    let retrieval = retriever
        .retrieve(KEY, RetrievalContext::new())
        .await
        .unwrap();
    assert_eq!(retrieval.submissions, 2);
}

#[tokio::test]
async fn test_manual_answer_rejected_then_accepted() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .and(body_string_contains("txtCaptcha=err0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(REJECTED_HTML))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .and(body_string_contains("txtCaptcha=r1ght"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INVOICE_HTML))
        .expect(1)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 2, CaptchaSolver::Manual);
    let (sink, mut handle) = manual_channel();
    let human = tokio::spawn(async move {
        let mut attempts = Vec::new();
        for answer in ["err0", "r1ght"] {
            let pending = handle.await_manual_solution().await.unwrap();
            attempts.push(pending.attempt());
            // Time spent answering must not count against the budget.
            tokio::time::sleep(Duration::from_millis(50)).await;
            pending.resolve_manual(answer);
        }
        attempts
    });

    let retrieval = retriever
        .retrieve(KEY, RetrievalContext::new().with_manual(sink))
        .await
        .unwrap();
    assert_eq!(retrieval.submissions, 2);
    assert_eq!(human.await.unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn test_injected_session_cookie_is_sent() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .and(header_regex("cookie", "pref=keep"))
        .and(header_regex("cookie", "ASP.NET_SessionId=s3ss10n"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INVOICE_HTML))
        .expect(1)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 1, fixture());
    let mut session = retriever.new_session().unwrap();
    session.absorb_response(&HttpResponse {
        url: format!("{}/", server.uri()),
        final_url: format!("{}/", server.uri()),
        status: 200,
        headers: vec![("set-cookie".to_string(), "pref=keep; Path=/".to_string())],
        body: Vec::new(),
    });
    assert!(session.cookie("pref").is_some());

    let retrieval = retriever
        .retrieve(KEY, RetrievalContext::new().with_session(session))
        .await
        .unwrap();
    assert_eq!(retrieval.submissions, 1);
}

#[tokio::test]
async fn test_injected_session_budget_overrides_options() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string(REJECTED_HTML))
        .expect(1)
        .mount(&server)
        .await;

    let (retriever, _) = retriever(&server, 3, fixture());
    let session = retriever.new_session().unwrap().with_retry_budget(1);
    let err = retriever
        .retrieve(KEY, RetrievalContext::new().with_session(session))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RetryBudgetExceeded);
    assert_eq!(err.attempts, 1);
}

fn manual_options() -> RetrieverOptions {
    RetrieverOptions {
        captcha_mode: CaptchaMode::Manual,
        ..options(3)
    }
}

#[tokio::test]
async fn test_retrieve_invoice_with_manual_sink() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .and(body_string_contains("txtCaptcha=m4n0"))
        .respond_with(ResponseTemplate::new(200).set_body_string(INVOICE_HTML))
        .expect(1)
        .mount(&server)
        .await;

    let (sink, mut handle) = manual_channel();
    tokio::spawn(async move {
        while let Some(pending) = handle.await_manual_solution().await {
            pending.resolve_manual("m4n0");
        }
    });

    let invoice = retrieve_invoice_from(PortalConfig::with_base_url(server.uri()), KEY, manual_options(), Some(sink))
        .await
        .unwrap();
    assert_eq!(invoice.access_key().as_str(), KEY);
}

#[tokio::test]
async fn test_retrieve_invoice_error_keeps_attempts() {
    let server = MockServer::start().await;
    mount_portal(&server).await;
    Mock::given(method("POST"))
        .and(path("/consultaCompleta.aspx"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html><body>Manutenção</body></html>"))
        .mount(&server)
        .await;

    let (sink, mut handle) = manual_channel();
    tokio::spawn(async move {
        while let Some(pending) = handle.await_manual_solution().await {
            pending.resolve_manual("abcd");
        }
    });

    let err = retrieve_invoice_from(PortalConfig::with_base_url(server.uri()), KEY, manual_options(), Some(sink))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    assert_eq!(err.attempts, 1);
}
