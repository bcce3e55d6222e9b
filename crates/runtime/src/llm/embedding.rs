use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};

use askql_common::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use askql_common::config::LlmSettings;
use askql_common::retry::{guarded, RetryPolicy};

use super::chat::{build_http, check_status, read_json};
use super::LlmError;

const SERVICE: &str = "embedding";

/// Client for `POST {base_url}/embeddings`.
pub struct OpenAiEmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl OpenAiEmbeddingClient {
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, LlmError> {
        let api_key = match &settings.api_key {
            Some(key) if settings.is_configured() => key.clone(),
            _ => return Err(LlmError::NotConfigured("embedding")),
        };
        Ok(Self {
            http: build_http(settings.timeout_secs, SERVICE)?,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: settings.model.clone(),
            breaker: CircuitBreaker::new(CircuitBreakerConfig::from_settings(
                "llm_embed",
                &settings.breaker,
            )),
            retry: settings.retry.into(),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// One vector per input, in input order.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let payload = json!({ "model": self.model, "input": texts });
        let body: Value = guarded(
            "llm_embed",
            &self.breaker,
            &self.retry,
            LlmError::is_retryable,
            || async {
                let response = self
                    .http
                    .post(format!("{}/embeddings", self.base_url))
                    .bearer_auth(self.api_key.expose_secret())
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| LlmError::transport(SERVICE, e))?;
                let response = check_status(SERVICE, response).await?;
                read_json(SERVICE, response).await
            },
        )
        .await?;

        let vectors = parse_embeddings(&body)?;
        if vectors.len() != texts.len() {
            return Err(LlmError::UnexpectedShape {
                service: SERVICE,
                detail: format!("expected {} embeddings, got {}", texts.len(), vectors.len()),
            });
        }
        Ok(vectors)
    }
}

/// `{"data": [{"embedding": [...], "index": n}, ...]}`, ordered by `index`
/// when every item carries one.
fn parse_embeddings(body: &Value) -> Result<Vec<Vec<f32>>, LlmError> {
    let shape = |detail: &str| LlmError::UnexpectedShape {
        service: SERVICE,
        detail: detail.to_string(),
    };
    let items = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| shape("missing data array"))?;

    let mut indexed = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let vector = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| shape("item without embedding"))?
            .iter()
            .map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Option<Vec<f32>>>()
            .ok_or_else(|| shape("non-numeric embedding component"))?;
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_orders_by_index() {
        let body = json!({"data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]}
        ]});
        let vectors = parse_embeddings(&body).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_rejects_bad_shape() {
        assert!(parse_embeddings(&json!({"result": []})).is_err());
        assert!(parse_embeddings(&json!({"data": [{"embedding": ["x"]}]})).is_err());
    }
}
