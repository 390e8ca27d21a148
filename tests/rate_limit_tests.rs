//! Local rate limiting observed at the pipeline level.

use std::time::{Duration, Instant};

use qianfan::{ChatRequest, Error, LimitParams, Message, Qianfan};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHAT_PATH: &str = "/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/ernie_speed";

fn chat_success() -> serde_json::Value {
    json!({
        "id": "as-rl",
        "object": "chat.completion",
        "created": 1700000000,
        "result": "ok",
        "is_end": true,
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
    })
}

async fn mount_chat(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_success()))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok", "expires_in": 2592000
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn qps_limit_spaces_out_calls() {
    let server = MockServer::start().await;
    mount_chat(&server).await;

    let client = Qianfan::builder()
        .with_access_key("", "")
        .with_app_key("app_ak", "app_sk")
        .with_base_url(server.uri())
        .with_qps_limit(2.0)
        .build()
        .unwrap();
    let chat = client.chat().with_model("ERNIE-Speed");

    let started = Instant::now();
    for _ in 0..3 {
        chat.execute(ChatRequest::new(vec![Message::user("hi")])).await.unwrap();
    }
    // burst of 2, then the third waits for a 0.5s refill
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn limiter_timeout_fails_without_reaching_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_success()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/oauth/2.0/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "tok", "expires_in": 2592000
        })))
        .mount(&server)
        .await;

    let client = Qianfan::builder()
        .with_access_key("", "")
        .with_app_key("app_ak", "app_sk")
        .with_base_url(server.uri())
        .with_qps_limit(0.2)
        .with_retry_timeout(0.3)
        .build()
        .unwrap();
    let chat = client.chat().with_model("ERNIE-Speed");

    chat.execute(ChatRequest::new(vec![Message::user("hi")])).await.unwrap();
    // the bucket refills at one request per 5 seconds; the budget is 0.3s
    let err = chat.execute(ChatRequest::new(vec![Message::user("hi")])).await.unwrap_err();
    assert!(matches!(err, Error::RateLimitExceeded { .. }));
}

#[tokio::test]
async fn per_instance_limit_params_override_config() {
    let server = MockServer::start().await;
    mount_chat(&server).await;

    // config allows nothing; the instance override allows a generous burst
    let client = Qianfan::builder()
        .with_access_key("", "")
        .with_app_key("app_ak", "app_sk")
        .with_base_url(server.uri())
        .with_qps_limit(0.01)
        .build()
        .unwrap();
    let chat = client
        .chat()
        .with_model("ERNIE-Speed")
        .with_limit_params(LimitParams { qps: 100.0, rpm: 0, tpm: 0 });

    let started = Instant::now();
    for _ in 0..3 {
        chat.execute(ChatRequest::new(vec![Message::user("hi")])).await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn limit_keys_isolate_tenants() {
    let server = MockServer::start().await;
    mount_chat(&server).await;

    let client = Qianfan::builder()
        .with_access_key("", "")
        .with_app_key("app_ak", "app_sk")
        .with_base_url(server.uri())
        .with_qps_limit(1.0)
        .build()
        .unwrap();

    // one bucket per key: two instances under different keys both get their
    // initial burst without waiting on each other
    let a = client.chat().with_model("ERNIE-Speed").with_limit_key("tenant-a");
    let b = client.chat().with_model("ERNIE-Speed").with_limit_key("tenant-b");

    let started = Instant::now();
    a.execute(ChatRequest::new(vec![Message::user("hi")])).await.unwrap();
    b.execute(ChatRequest::new(vec![Message::user("hi")])).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(900));
}
