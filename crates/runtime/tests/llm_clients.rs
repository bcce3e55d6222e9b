use futures::StreamExt;
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use askql_common::circuit_breaker::CircuitState;
use askql_common::config::{BreakerSettings, LlmSettings, RetrySettings};
use askql_error::{Classify, ErrorClass};
use askql_runtime::collaborators::{AnalysisInput, Analyst, GenerationRequest, SqlGenerator};
use askql_runtime::llm::{
    ChatMessage, LlmAnalyst, LlmSqlGenerator, OpenAiChatClient, OpenAiEmbeddingClient,
};
use askql_runtime::LlmError;

fn settings(base_url: &str) -> LlmSettings {
    LlmSettings {
        base_url: base_url.to_string(),
        api_key: Some(SecretString::from("sk-test")),
        model: "test-model".to_string(),
        temperature: 0.1,
        timeout_secs: 5,
        retry: RetrySettings {
            retries: 2,
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        breaker: BreakerSettings {
            failure_threshold: 2,
            recovery_timeout_secs: 60,
        },
    }
}

fn completion(content: &str) -> serde_json::Value {
    json!({"choices": [{"message": {"role": "assistant", "content": content}}]})
}

fn question() -> Vec<ChatMessage> {
    vec![ChatMessage::user("how many orders?")]
}

#[tokio::test]
async fn test_chat_returns_message_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({"model": "test-model"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("SELECT 1")))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiChatClient::from_settings(&settings(&server.uri())).unwrap();
    let text = client.chat(&question(), None).await.unwrap();

    assert_eq!(text, "SELECT 1");
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiChatClient::from_settings(&settings(&server.uri())).unwrap();

    assert_eq!(client.chat(&question(), None).await.unwrap(), "ok");
    assert_eq!(client.breaker().state().await, CircuitState::Closed);
}

#[tokio::test]
async fn test_missing_content_is_a_shape_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiChatClient::from_settings(&settings(&server.uri())).unwrap();
    let err = client.chat(&question(), None).await.unwrap_err();

    assert!(matches!(err, LlmError::UnexpectedShape { .. }));
    assert_eq!(err.class(), ErrorClass::UpstreamShape);
}

#[tokio::test]
async fn test_non_json_body_is_a_shape_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway page</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiChatClient::from_settings(&settings(&server.uri())).unwrap();
    let err = client.chat(&question(), None).await.unwrap_err();

    assert!(matches!(err, LlmError::UnexpectedShape { .. }), "{err:?}");
    assert_eq!(err.class(), ErrorClass::UpstreamShape);
    assert_eq!(client.breaker().failure_count().await, 1);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiChatClient::from_settings(&settings(&server.uri())).unwrap();
    let err = client.chat(&question(), None).await.unwrap_err();

    match err {
        LlmError::Status { status, body, .. } => {
            assert_eq!(status, 401);
            assert_eq!(body, "bad key");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_breaker_opens_after_repeated_failures() {
    let server = MockServer::start().await;
    // Two guarded calls, three attempts each; the third call is refused.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .expect(6)
        .mount(&server)
        .await;

    let client = OpenAiChatClient::from_settings(&settings(&server.uri())).unwrap();
    for _ in 0..2 {
        let err = client.chat(&question(), None).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }
    let err = client.chat(&question(), None).await.unwrap_err();

    assert!(matches!(err, LlmError::CircuitOpen(ref open) if open.name == "llm_chat"));
    assert_eq!(client.breaker().state().await, CircuitState::Open);
}

#[tokio::test]
async fn test_stream_yields_deltas_until_done() {
    let server = MockServer::start().await;
    let body = concat!(
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiChatClient::from_settings(&settings(&server.uri())).unwrap();
    let chunks: Vec<String> = client
        .chat_stream(&question(), None)
        .await
        .unwrap()
        .map(|c| c.unwrap())
        .collect()
        .await;

    assert_eq!(chunks, vec!["Hel", "lo"]);
    assert_eq!(client.breaker().failure_count().await, 0);
}

#[tokio::test]
async fn test_embeddings_follow_input_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .and(body_partial_json(json!({"input": ["orders", "customers"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = OpenAiEmbeddingClient::from_settings(&settings(&server.uri())).unwrap();
    let vectors = client
        .embed(&["orders".to_string(), "customers".to_string()])
        .await
        .unwrap();

    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
}

#[tokio::test]
async fn test_embedding_count_mismatch_is_a_shape_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{"index": 0, "embedding": [1.0]}]
        })))
        .mount(&server)
        .await;

    let client = OpenAiEmbeddingClient::from_settings(&settings(&server.uri())).unwrap();
    let err = client
        .embed(&["a".to_string(), "b".to_string()])
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::UpstreamShape);
}

#[test]
fn test_unconfigured_clients_are_refused() {
    let settings = LlmSettings::default();
    assert!(matches!(
        OpenAiChatClient::from_settings(&settings),
        Err(LlmError::NotConfigured(_))
    ));
    assert!(matches!(
        OpenAiEmbeddingClient::from_settings(&settings),
        Err(LlmError::NotConfigured(_))
    ));
}

#[tokio::test]
async fn test_generator_strips_fences() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("```sql\nSELECT COUNT(*) FROM orders\n```")),
        )
        .mount(&server)
        .await;

    let client = Arc::new(OpenAiChatClient::from_settings(&settings(&server.uri())).unwrap());
    let generator = LlmSqlGenerator::new(client);
    let sql = generator
        .generate(&GenerationRequest {
            question: "how many orders?".to_string(),
            max_rows: 500,
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(sql, "SELECT COUNT(*) FROM orders");
}

#[tokio::test]
async fn test_analyst_falls_back_to_plain_completion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(" Orders grew. ")))
        .expect(1)
        .mount(&server)
        .await;

    let client = Arc::new(OpenAiChatClient::from_settings(&settings(&server.uri())).unwrap());
    let analyst = LlmAnalyst::new(client);
    let chunks: Vec<Result<String, LlmError>> = analyst
        .analyze(AnalysisInput {
            question: "q".to_string(),
            sql: "SELECT 1".to_string(),
            columns: vec!["n".to_string()],
            rows: vec![vec![json!(1)]],
            row_count: 1,
        })
        .collect()
        .await;

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].as_ref().unwrap(), "Orders grew.");
}
