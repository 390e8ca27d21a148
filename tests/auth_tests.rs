//! Credential selection and bearer exchange against a mock platform.

use qianfan::{ChatRequest, Error, Message, Qianfan};
use serde_json::json;
use wiremock::matchers::{method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHAT_PATH: &str = "/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/ernie_speed";
const TOKEN_PATH: &str = "/oauth/2.0/token";

fn chat_success() -> serde_json::Value {
    json!({
        "id": "as-auth",
        "object": "chat.completion",
        "created": 1700000000,
        "result": "ok",
        "is_end": true,
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
    })
}

#[tokio::test]
async fn bearer_exchange_forwards_key_pair() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .and(query_param("grant_type", "client_credentials"))
        .and(query_param("client_id", "my-ak"))
        .and(query_param("client_secret", "my-sk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "minted", "expires_in": 2592000
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(query_param("access_token", "minted"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_success()))
        .expect(1)
        .mount(&server)
        .await;

    Qianfan::builder()
        .with_access_key("", "")
        .with_app_key("my-ak", "my-sk")
        .with_base_url(server.uri())
        .build()
        .unwrap()
        .chat()
        .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-Speed"))
        .await
        .unwrap();
}

#[tokio::test]
async fn rejected_exchange_surfaces_platform_description() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "invalid_client",
            "error_description": "unknown client id"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = Qianfan::builder()
        .with_access_key("", "")
        .with_app_key("bad-ak", "bad-sk")
        .with_base_url(server.uri())
        .build()
        .unwrap()
        .chat()
        .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-Speed"))
        .await
        .unwrap_err();
    match err {
        Error::AuthFailed { message } => assert_eq!(message, "unknown client id"),
        other => panic!("expected auth failure, got {other:?}"),
    }
}

#[tokio::test]
async fn preset_access_token_is_used_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(query_param("access_token", "pre-minted"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_success()))
        .expect(1)
        .mount(&server)
        .await;

    Qianfan::builder()
        .with_access_key("", "")
        .with_app_key("", "")
        .with_access_token("pre-minted")
        .with_base_url(server.uri())
        .build()
        .unwrap()
        .chat()
        .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-Speed"))
        .await
        .unwrap();

    // no exchange endpoint was touched
    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() != TOKEN_PATH));
}

#[tokio::test]
async fn forced_refresh_is_debounced_within_min_interval() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "minted", "expires_in": 2592000
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = Qianfan::builder()
        .with_access_key("", "")
        .with_app_key("my-ak", "my-sk")
        .with_base_url(server.uri())
        .build()
        .unwrap();
    client.refresh_access_token().await.unwrap();
    // still within the refresh window; the cached token is kept
    client.refresh_access_token().await.unwrap();
}

#[tokio::test]
async fn no_auth_mode_sends_neither_mechanism() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(query_param_is_missing("access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_success()))
        .expect(1)
        .mount(&server)
        .await;

    Qianfan::builder()
        .with_no_auth(true)
        .with_base_url(server.uri())
        .build()
        .unwrap()
        .chat()
        .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-Speed"))
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(!requests[0].headers.contains_key("authorization"));
}
