use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::TelegramConfig;
use crate::update::{classify, Fetched};

/// Why a fetch produced no usable batch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Connect, timeout or read failure. Retried at the same offset.
    #[error("transport error: {0}")]
    Transport(String),

    /// The API answered but rejected the call (`ok: false` or non-2xx status).
    #[error("api error ({code}): {description}")]
    Api { code: i64, description: String },

    /// The body was not a usable getUpdates response.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// A long-poll source of updates keyed by a monotonically increasing offset.
///
/// Calling `fetch` again with the same offset must return the same (or a
/// superset of the same) updates, in ascending `update_id` order.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn fetch(
        &self,
        offset: i64,
        limit: u32,
        wait: Duration,
    ) -> Result<Vec<Fetched>, FetchError>;

    /// Offset to request before anything has been acknowledged.
    fn initial_offset(&self) -> i64 {
        0
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    result: Option<Vec<Value>>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

/// `getUpdates` over HTTP.
pub struct TelegramSource {
    client: reqwest::Client,
    api_url: String,
    token: String,
    grace: Duration,
}

impl TelegramSource {
    pub fn new(config: &TelegramConfig, grace: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
            grace,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/bot{}/getUpdates", self.api_url, self.token)
    }

    /// Strip the bot token out of anything that may end up in a log line.
    fn redact(&self, text: &str) -> String {
        if self.token.is_empty() {
            text.to_string()
        } else {
            text.replace(&self.token, "<redacted>")
        }
    }
}

#[async_trait]
impl UpdateSource for TelegramSource {
    async fn fetch(
        &self,
        offset: i64,
        limit: u32,
        wait: Duration,
    ) -> Result<Vec<Fetched>, FetchError> {
        debug!(
            "getUpdates offset={} limit={} wait={}s via {}",
            offset,
            limit,
            wait.as_secs(),
            self.redact(&self.endpoint())
        );

        let response = self
            .client
            .get(self.endpoint())
            .query(&[
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
                ("timeout", wait.as_secs().to_string()),
            ])
            .timeout(wait + self.grace)
            .send()
            .await
            .map_err(|e| FetchError::Transport(self.redact(&e.to_string())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transport(self.redact(&e.to_string())))?;

        parse_response(status.as_u16(), &body)
    }
}

/// Turn a getUpdates HTTP response into classified updates.
fn parse_response(status: u16, body: &str) -> Result<Vec<Fetched>, FetchError> {
    let parsed: ApiResponse = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) if !(200..300).contains(&status) => {
            return Err(FetchError::Api {
                code: status as i64,
                description: format!("non-JSON error body ({})", e),
            })
        }
        Err(e) => return Err(FetchError::Malformed(e.to_string())),
    };

    if !parsed.ok || !(200..300).contains(&status) {
        return Err(FetchError::Api {
            code: parsed.error_code.unwrap_or(status as i64),
            description: parsed
                .description
                .unwrap_or_else(|| "no description".to_string()),
        });
    }

    let raw_updates = parsed
        .result
        .ok_or_else(|| FetchError::Malformed("missing result".to_string()))?;

    let mut updates = Vec::with_capacity(raw_updates.len());
    for raw in &raw_updates {
        let fetched = classify(raw)
            .ok_or_else(|| FetchError::Malformed("update without integer update_id".to_string()))?;
        updates.push(fetched);
    }

    // The API already returns ascending ids; enforce it so callers can rely on it
    updates.sort_by_key(Fetched::update_id);
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn source_for(server: &MockServer) -> TelegramSource {
        TelegramSource::new(
            &TelegramConfig {
                bot_token: "123:secret".to_string(),
                api_url: server.base_url(),
            },
            Duration::from_secs(2),
        )
    }

    fn private_message(update_id: i64) -> Value {
        json!({
            "update_id": update_id,
            "message": {
                "message_id": 1,
                "date": 1700000000,
                "chat": { "id": 5, "type": "private" },
                "text": "hi"
            }
        })
    }

    #[test]
    fn test_parse_sorts_and_classifies() {
        let body = json!({
            "ok": true,
            "result": [private_message(12), private_message(10), { "update_id": 11, "poll": {} }]
        })
        .to_string();

        let updates = parse_response(200, &body).unwrap();
        let ids: Vec<i64> = updates.iter().map(Fetched::update_id).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert!(matches!(updates[1], Fetched::Unsupported { .. }));
    }

    #[test]
    fn test_parse_keeps_malformed_element_with_its_id() {
        let mut broken = private_message(5);
        broken["message"]["date"] = json!("yesterday");
        let body = json!({ "ok": true, "result": [broken, private_message(6)] }).to_string();

        let updates = parse_response(200, &body).unwrap();
        assert!(matches!(updates[0], Fetched::Malformed { update_id: 5, .. }));
        assert!(matches!(updates[1], Fetched::Supported(_)));
    }

    #[test]
    fn test_parse_error_taxonomy() {
        assert!(matches!(
            parse_response(200, "<html>gateway</html>"),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(
            parse_response(200, r#"{"ok":true}"#),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(
            parse_response(200, r#"{"ok":true,"result":[{"message":{}}]}"#),
            Err(FetchError::Malformed(_))
        ));
        assert!(matches!(
            parse_response(502, "Bad Gateway"),
            Err(FetchError::Api { code: 502, .. })
        ));

        match parse_response(
            409,
            r#"{"ok":false,"error_code":409,"description":"Conflict: terminated by other getUpdates request"}"#,
        ) {
            Err(FetchError::Api { code, description }) => {
                assert_eq!(code, 409);
                assert!(description.starts_with("Conflict"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_empty_result_is_zero_updates() {
        assert!(parse_response(200, r#"{"ok":true,"result":[]}"#)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_fetch_sends_offset_limit_and_timeout() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/bot123:secret/getUpdates")
                    .query_param("offset", "10")
                    .query_param("limit", "50")
                    .query_param("timeout", "0");
                then.status(200)
                    .json_body(json!({ "ok": true, "result": [private_message(10), private_message(11)] }));
            })
            .await;

        let source = source_for(&server);
        let updates = source.fetch(10, 50, Duration::ZERO).await.unwrap();

        mock.assert_async().await;
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].update_id(), 10);
        assert!(matches!(updates[0], Fetched::Supported(_)));
    }

    #[tokio::test]
    async fn test_fetch_surfaces_api_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/bot123:secret/getUpdates");
                then.status(401)
                    .json_body(json!({ "ok": false, "error_code": 401, "description": "Unauthorized" }));
            })
            .await;

        let err = source_for(&server)
            .fetch(0, 100, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Api { code: 401, .. }));
    }

    #[tokio::test]
    async fn test_transport_error_hides_token() {
        let source = TelegramSource::new(
            &TelegramConfig {
                bot_token: "999:topsecret".to_string(),
                api_url: "http://127.0.0.1:1".to_string(),
            },
            Duration::from_secs(1),
        );

        match source.fetch(0, 1, Duration::ZERO).await {
            Err(FetchError::Transport(message)) => assert!(!message.contains("topsecret")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
