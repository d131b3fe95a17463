use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::network::sse::{SseDecoder, SseEvent};
use crate::network::{DeltaSink, LlmBackend, LlmConfig, LlmError, ProviderKind};

const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";
const TEMPERATURE: f64 = 0.3;
const MAX_RAW_ERROR_CHARS: usize = 200;

/// `(prompt chars strictly above, tokens)`, longest first.
const TOKEN_BUCKETS: &[(usize, u32)] = &[(3000, 8192), (1500, 6144), (500, 4096)];
const MIN_TOKEN_BUCKET: u32 = 2048;

pub fn normalize_endpoint(endpoint: &str) -> String {
    let base = endpoint.trim().trim_end_matches('/');
    if base.ends_with(CHAT_COMPLETIONS_PATH) {
        base.to_string()
    } else {
        format!("{base}{CHAT_COMPLETIONS_PATH}")
    }
}

/// Output budget sized from prompt length and capped by the configured ceiling.
pub fn token_budget(prompt_chars: usize, ceiling: u32) -> u32 {
    let bucket = TOKEN_BUCKETS
        .iter()
        .find(|(threshold, _)| prompt_chars > *threshold)
        .map(|(_, tokens)| *tokens)
        .unwrap_or(MIN_TOKEN_BUCKET);
    bucket.min(ceiling.max(1))
}

/// Remote OpenAI-family chat and reasoning models reject `max_tokens`.
pub fn token_limit_field(provider: ProviderKind, model: &str) -> &'static str {
    if provider != ProviderKind::Remote {
        return "max_tokens";
    }

    let model = model.trim().to_ascii_lowercase();
    let family = model.rsplit('/').next().unwrap_or(&model);
    let modern = family.starts_with("gpt-")
        || family.contains("gpt-4o")
        || family.contains("gpt-4-turbo")
        || ["o1", "o3", "o4"].iter().any(|prefix| family.starts_with(prefix));

    if modern {
        "max_completion_tokens"
    } else {
        "max_tokens"
    }
}

pub fn build_request_body(config: &LlmConfig, prompt: &str, stream: bool) -> Value {
    let budget = token_budget(prompt.chars().count(), config.max_tokens);
    let mut body = json!({
        "model": config.model,
        "messages": [{ "role": "user", "content": prompt }],
        "temperature": TEMPERATURE,
        "stream": stream,
    });
    body[token_limit_field(config.provider, &config.model)] = json!(budget);
    body
}

fn provider_error_message(status: StatusCode, body: &str) -> String {
    if let Some(message) = serde_json::from_str::<Value>(body)
        .ok()
        .as_ref()
        .and_then(|value| value.get("error"))
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
    {
        return message.to_string();
    }

    let trimmed = body.trim();
    if !trimmed.is_empty() && trimmed.chars().count() < MAX_RAW_ERROR_CHARS {
        return trimmed.to_string();
    }

    match status.canonical_reason() {
        Some(reason) => format!("HTTP {} {reason}", status.as_u16()),
        None => format!("HTTP {}", status.as_u16()),
    }
}

fn map_transport_error(err: reqwest::Error, config: &LlmConfig) -> LlmError {
    if err.is_timeout() {
        LlmError::Timeout(config.timeout.as_millis() as u64)
    } else if err.is_builder() {
        LlmError::RequestBuild(err.to_string())
    } else {
        LlmError::Network(err.to_string())
    }
}

fn completion_content(value: &Value) -> Result<String, LlmError> {
    let choice = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .ok_or_else(|| LlmError::MalformedResponse("response has no choices".to_string()))?;

    let content = choice
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| LlmError::MalformedResponse("choice has no message content".to_string()))?;

    if content.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    Ok(content.to_string())
}

fn is_event_stream(response: &Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("text/event-stream"))
}

/// OpenAI-compatible chat-completions client.
#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new() -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| LlmError::RequestBuild(err.to_string()))?;
        Ok(Self { http })
    }

    async fn send(&self, config: &LlmConfig, prompt: &str, stream: bool) -> Result<Response, LlmError> {
        let url = normalize_endpoint(&config.endpoint);
        let body = build_request_body(config, prompt, stream);

        let mut request = self.http.post(&url).timeout(config.timeout).json(&body);
        if config.provider == ProviderKind::Remote {
            if let Some(key) = config.api_key.as_deref().filter(|key| !key.trim().is_empty()) {
                request = request.header(AUTHORIZATION, format!("Bearer {}", key.trim()));
            }
        }

        info!(
            provider = config.provider.as_str(),
            model = %config.model,
            prompt_chars = prompt.chars().count(),
            max_tokens = token_budget(prompt.chars().count(), config.max_tokens),
            token_field = token_limit_field(config.provider, &config.model),
            has_api_key = config.api_key.is_some(),
            stream,
            "sending LLM request"
        );

        let response = request
            .send()
            .await
            .map_err(|err| map_transport_error(err, config))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = provider_error_message(status, &body);
            warn!(status = status.as_u16(), "LLM endpoint returned an error: {message}");
            return Err(LlmError::Http {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn read_json(response: Response, config: &LlmConfig) -> Result<String, LlmError> {
        let bytes = response
            .bytes()
            .await
            .map_err(|err| map_transport_error(err, config))?;
        let value: Value = serde_json::from_slice(&bytes)
            .map_err(|err| LlmError::MalformedResponse(err.to_string()))?;
        completion_content(&value)
    }

    async fn read_stream(
        response: Response,
        config: &LlmConfig,
        on_delta: DeltaSink<'_>,
    ) -> Result<String, LlmError> {
        let mut decoder = SseDecoder::new();
        let mut aggregate = String::new();
        let mut chunks = 0_usize;
        let mut body = response.bytes_stream();

        'body: while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| map_transport_error(err, config))?;
            for event in decoder.push(&chunk) {
                match event {
                    SseEvent::Delta(delta) => {
                        aggregate.push_str(&delta);
                        chunks += 1;
                        on_delta(&delta, &aggregate);
                    }
                    SseEvent::Done => break 'body,
                }
            }
        }

        if let Some(SseEvent::Delta(delta)) = decoder.finish() {
            aggregate.push_str(&delta);
            chunks += 1;
            on_delta(&delta, &aggregate);
        }

        debug!(chunks, response_chars = aggregate.chars().count(), "LLM stream finished");
        if aggregate.trim().is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(aggregate)
    }
}

#[async_trait]
impl LlmBackend for LlmClient {
    async fn complete(
        &self,
        config: &LlmConfig,
        prompt: &str,
        on_delta: Option<DeltaSink<'_>>,
    ) -> Result<String, LlmError> {
        let started_at = Instant::now();
        let streaming = config.stream && on_delta.is_some();
        let response = self.send(config, prompt, streaming).await?;

        let result = match on_delta {
            Some(sink) if streaming && is_event_stream(&response) => {
                Self::read_stream(response, config, sink).await
            }
            Some(sink) if streaming => {
                // Endpoint ignored `stream: true`; deliver the whole body as one delta.
                let text = Self::read_json(response, config).await?;
                sink(&text, &text);
                Ok(text)
            }
            _ => Self::read_json(response, config).await,
        };

        match &result {
            Ok(text) => info!(
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                response_chars = text.chars().count(),
                "LLM request completed"
            ),
            Err(err) => warn!(
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "LLM request failed: {err}"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;

    fn config(endpoint: String, provider: ProviderKind) -> LlmConfig {
        LlmConfig {
            provider,
            endpoint,
            api_key: Some("sk-test".to_string()),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 4096,
            timeout: Duration::from_secs(5),
            stream: false,
        }
    }

    fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|window| window == needle)
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0_u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
            if let Some(header_end) = find_subsequence(&raw, b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&raw[..header_end]).to_ascii_lowercase();
                let content_length = headers
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&raw).into_owned()
    }

    /// Serves one canned response and hands back the raw request it received.
    async fn serve_once(response: String) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            request
        });
        (format!("http://{addr}/v1/"), handle)
    }

    fn json_response(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn endpoint_normalization_appends_path_once() {
        assert_eq!(
            normalize_endpoint("http://127.0.0.1:1234/v1/"),
            "http://127.0.0.1:1234/v1/chat/completions"
        );
        assert_eq!(
            normalize_endpoint("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn token_budget_buckets_and_ceiling() {
        assert_eq!(token_budget(10, 8192), 2048);
        assert_eq!(token_budget(501, 8192), 4096);
        assert_eq!(token_budget(1501, 8192), 6144);
        assert_eq!(token_budget(3001, 16_000), 8192);
        assert_eq!(token_budget(3001, 1024), 1024);
    }

    #[test]
    fn token_field_depends_on_provider_and_model() {
        assert_eq!(token_limit_field(ProviderKind::Remote, "gpt-4o-mini"), "max_completion_tokens");
        assert_eq!(token_limit_field(ProviderKind::Remote, "o3-mini"), "max_completion_tokens");
        assert_eq!(token_limit_field(ProviderKind::Remote, "openai/gpt-4-turbo"), "max_completion_tokens");
        assert_eq!(token_limit_field(ProviderKind::Remote, "claude-3-5-sonnet"), "max_tokens");
        assert_eq!(token_limit_field(ProviderKind::Local, "gpt-4o-mini"), "max_tokens");
    }

    #[test]
    fn request_body_carries_exactly_one_limit_field() {
        let remote = build_request_body(&config(String::new(), ProviderKind::Remote), "hi", false);
        assert!(remote.get("max_completion_tokens").is_some());
        assert!(remote.get("max_tokens").is_none());
        assert_eq!(remote["temperature"], json!(0.3));
        assert_eq!(remote["messages"][0]["role"], "user");

        let local = build_request_body(&config(String::new(), ProviderKind::Local), "hi", true);
        assert!(local.get("max_tokens").is_some());
        assert!(local.get("max_completion_tokens").is_none());
        assert_eq!(local["stream"], json!(true));
    }

    #[test]
    fn provider_error_message_prefers_json_then_short_text() {
        assert_eq!(
            provider_error_message(StatusCode::UNAUTHORIZED, r#"{"error":{"message":"bad key"}}"#),
            "bad key"
        );
        assert_eq!(provider_error_message(StatusCode::BAD_GATEWAY, "upstream down"), "upstream down");
        assert_eq!(
            provider_error_message(StatusCode::INTERNAL_SERVER_ERROR, &"x".repeat(300)),
            "HTTP 500 Internal Server Error"
        );
    }

    #[tokio::test]
    async fn blocking_completion_sends_auth_for_remote() {
        let (endpoint, server) =
            serve_once(json_response("200 OK", r#"{"choices":[{"message":{"content":"Bonjour"}}]}"#)).await;
        let client = LlmClient::new().unwrap();

        let text = client
            .complete(&config(endpoint, ProviderKind::Remote), "Translate: Hello", None)
            .await
            .unwrap();
        assert_eq!(text, "Bonjour");

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /v1/chat/completions "));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer sk-test"));
        assert!(request.contains("\"max_completion_tokens\""));
    }

    #[tokio::test]
    async fn local_provider_never_sends_auth() {
        let (endpoint, server) =
            serve_once(json_response("200 OK", r#"{"choices":[{"message":{"content":"ok"}}]}"#)).await;
        let client = LlmClient::new().unwrap();

        client
            .complete(&config(endpoint, ProviderKind::Local), "hi", None)
            .await
            .unwrap();

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(!request.contains("authorization:"));
        assert!(request.contains("\"max_tokens\""));
    }

    #[tokio::test]
    async fn streaming_completion_reports_each_delta() {
        let events = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
                      data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
                      data: [DONE]\n\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\n{events}"
        );
        let (endpoint, server) = serve_once(response).await;
        let client = LlmClient::new().unwrap();
        let mut cfg = config(endpoint, ProviderKind::Local);
        cfg.stream = true;

        let mut seen = Vec::new();
        let mut sink = |delta: &str, aggregate: &str| seen.push((delta.to_string(), aggregate.to_string()));
        let text = client.complete(&cfg, "hi", Some(&mut sink)).await.unwrap();

        assert_eq!(text, "Hello");
        assert_eq!(
            seen,
            vec![
                ("Hel".to_string(), "Hel".to_string()),
                ("lo".to_string(), "Hello".to_string()),
            ]
        );
        assert!(server.await.unwrap().contains("\"stream\":true"));
    }

    #[tokio::test]
    async fn http_errors_carry_provider_message() {
        let (endpoint, _server) = serve_once(json_response(
            "401 Unauthorized",
            r#"{"error":{"message":"Incorrect API key provided"}}"#,
        ))
        .await;
        let client = LlmClient::new().unwrap();

        let err = client
            .complete(&config(endpoint, ProviderKind::Remote), "hi", None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LlmError::Http {
                status: 401,
                message: "Incorrect API key provided".to_string()
            }
        );
    }

    #[tokio::test]
    async fn missing_choices_is_malformed() {
        let (endpoint, _server) = serve_once(json_response("200 OK", r#"{"choices":[]}"#)).await;
        let client = LlmClient::new().unwrap();

        let err = client
            .complete(&config(endpoint, ProviderKind::Local), "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn blank_content_is_empty_response() {
        let (endpoint, _server) =
            serve_once(json_response("200 OK", r#"{"choices":[{"message":{"content":"  "}}]}"#)).await;
        let client = LlmClient::new().unwrap();

        let err = client
            .complete(&config(endpoint, ProviderKind::Local), "hi", None)
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::EmptyResponse);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(socket);
        });

        let client = LlmClient::new().unwrap();
        let mut cfg = config(format!("http://{addr}/v1"), ProviderKind::Local);
        cfg.timeout = Duration::from_millis(200);

        let err = client.complete(&cfg, "hi", None).await.unwrap_err();
        assert_eq!(err, LlmError::Timeout(200));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = LlmClient::new().unwrap();
        let err = client
            .complete(&config(format!("http://{addr}/v1"), ProviderKind::Local), "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Network(_)));
    }
}
