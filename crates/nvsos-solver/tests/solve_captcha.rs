use std::time::Duration;

use nvsos_core::{CaptchaChallenge, TokenWidget};
use nvsos_solver::{CaptchaSolver, SolveCaptchaClient, SolverConfig, SolverError};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PAGE_URL: &str = "https://esos.nv.gov/EntitySearch/OnlineEntitySearch";

fn client_for(server: &MockServer) -> SolveCaptchaClient {
    let mut config = SolverConfig::new("test-key");
    config.submit_url = format!("{}/in.php", server.uri());
    config.result_url = format!("{}/res.php", server.uri());
    config.poll_interval = Duration::from_millis(20);
    SolveCaptchaClient::new(config).expect("client")
}

fn hcaptcha() -> CaptchaChallenge {
    CaptchaChallenge::token(TokenWidget::HCaptcha, "10000000-ffff-ffff-ffff-000000000001", PAGE_URL)
}

async fn mount_submit_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/in.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "7351"})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn polls_until_the_token_is_ready() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/in.php"))
        .and(body_string_contains("method=hcaptcha"))
        .and(body_string_contains("sitekey=10000000-ffff-ffff-ffff-000000000001"))
        .and(body_string_contains("key=test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "7351"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/res.php"))
        .and(query_param("action", "get"))
        .and(query_param("id", "7351"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": 0, "request": "CAPCHA_NOT_READY"})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/res.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": 1,
            "request": "P1_token-value",
            "useragent": "Mozilla/5.0 (solver)",
            "respKey": "E0_resp"
        })))
        .mount(&server)
        .await;

    let solution = client_for(&server)
        .solve(&hcaptcha(), Duration::from_secs(5))
        .await
        .expect("solution");
    assert_eq!(solution.token, "P1_token-value");
    assert_eq!(solution.user_agent.as_deref(), Some("Mozilla/5.0 (solver)"));
}

#[tokio::test]
async fn exhausted_balance_is_rejected_at_submit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/in.php"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": 0, "request": "ERROR_ZERO_BALANCE"})),
        )
        .mount(&server)
        .await;

    let err = client_for(&server)
        .solve(&hcaptcha(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SolverError::Rejected { ref code } if code == "ERROR_ZERO_BALANCE"));
}

#[tokio::test]
async fn unsolvable_result_is_rejected_while_polling() {
    let server = MockServer::start().await;
    mount_submit_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/res.php"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"status": 0, "request": "ERROR_CAPTCHA_UNSOLVABLE"})),
        )
        .mount(&server)
        .await;

    let err = client_for(&server)
        .solve(&hcaptcha(), Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(matches!(err, SolverError::Rejected { ref code } if code == "ERROR_CAPTCHA_UNSOLVABLE"));
}

#[tokio::test]
async fn gives_up_when_the_timeout_elapses() {
    let server = MockServer::start().await;
    mount_submit_ok(&server).await;
    Mock::given(method("GET"))
        .and(path("/res.php"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"status": 0, "request": "CAPCHA_NOT_READY"})),
        )
        .mount(&server)
        .await;

    let started = std::time::Instant::now();
    let err = client_for(&server)
        .solve(&hcaptcha(), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, SolverError::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn image_challenges_use_the_base64_method() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/in.php"))
        .and(body_string_contains("method=base64"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": 99})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/res.php"))
        .and(query_param("id", "99"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "XK42"})))
        .mount(&server)
        .await;

    let challenge = CaptchaChallenge::image("iVBORw0KGgo", PAGE_URL);
    let solution = client_for(&server)
        .solve(&challenge, Duration::from_secs(5))
        .await
        .expect("solution");
    assert_eq!(solution.token, "XK42");
    assert_eq!(solution.user_agent, None);
}
