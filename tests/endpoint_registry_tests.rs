//! Dynamic endpoint resolution against a mock console.

use qianfan::{ChatRequest, Error, Message, Qianfan};
use serde_json::json;
use wiremock::matchers::{header_exists, method, path, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SERVICE_LIST_PATH: &str = "/wenxinworkshop/service/list";
const PREFIX: &str = "/rpc/2.0/ai_custom/v1/wenxinworkshop";

fn chat_success() -> serde_json::Value {
    json!({
        "id": "as-ep",
        "object": "chat.completion",
        "created": 1700000000,
        "result": "resolved",
        "is_end": true,
        "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}
    })
}

fn admin_client(server: &MockServer) -> Qianfan {
    Qianfan::builder()
        .with_access_key("admin-ak", "admin-sk")
        .with_base_url(server.uri())
        .with_console_base_url(server.uri())
        .build()
        .unwrap()
}

// unknown model resolved through a console refresh; the request is signed
// with the admin pair
#[tokio::test]
async fn unknown_model_resolves_after_console_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SERVICE_LIST_PATH))
        .and(header_exists("authorization"))
        .and(header_exists("x-bce-date"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "log_id": "log-1",
            "result": {
                "common": [{
                    "name": "ERNIE-99",
                    "url": "https://aip.baidubce.com/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/eb99"
                }],
                "custom": []
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{PREFIX}/chat/eb99")))
        .and(header_exists("authorization"))
        .and(query_param_is_missing("access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_success()))
        .expect(1)
        .mount(&server)
        .await;

    let response = admin_client(&server)
        .chat()
        .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-99"))
        .await
        .unwrap();
    assert_eq!(response.result, "resolved");
}

#[tokio::test]
async fn unknown_model_without_mapping_is_unsupported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SERVICE_LIST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "log_id": "log-2",
            "result": {"common": [], "custom": []}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let err = admin_client(&server)
        .chat()
        .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-99"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedModel { .. }));
}

#[tokio::test]
async fn failed_refresh_keeps_builtin_table() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SERVICE_LIST_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("console down"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{PREFIX}/chat/ernie_speed")))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_success()))
        .expect(1)
        .mount(&server)
        .await;

    let client = admin_client(&server);

    // a miss triggers a refresh that fails
    let err = client
        .chat()
        .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-99"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedModel { .. }));

    // the built-in catalog still routes
    let response = client
        .chat()
        .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-Speed"))
        .await
        .unwrap();
    assert_eq!(response.result, "resolved");
}

#[tokio::test]
async fn unsupported_endpoint_error_replays_after_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{PREFIX}/chat/ernie_speed")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error_code": 336005, "error_msg": "api name not exists"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(SERVICE_LIST_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "log_id": "log-3",
            "result": {
                "common": [{
                    "name": "ERNIE-Speed",
                    "url": "https://aip.baidubce.com/rpc/2.0/ai_custom/v1/wenxinworkshop/chat/ernie_speed_v2"
                }],
                "custom": []
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{PREFIX}/chat/ernie_speed_v2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_success()))
        .expect(1)
        .mount(&server)
        .await;

    let response = admin_client(&server)
        .chat()
        .execute(ChatRequest::new(vec![Message::user("hi")]).with_model("ERNIE-Speed"))
        .await
        .unwrap();
    assert_eq!(response.result, "resolved");
}

#[tokio::test]
async fn custom_endpoint_bypasses_resolution() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{PREFIX}/chat/my_custom_service")))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_success()))
        .expect(1)
        .mount(&server)
        .await;

    let response = admin_client(&server)
        .chat()
        .with_endpoint("my_custom_service")
        .execute(ChatRequest::new(vec![Message::user("hi")]))
        .await
        .unwrap();
    assert_eq!(response.result, "resolved");
}
