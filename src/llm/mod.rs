//! Chat model clients
//!
//! `ChatModel` is the seam between the conversation engine and the language
//! model. `OllamaChat` talks to Ollama `/api/chat`, streaming answers as
//! newline-delimited JSON.

use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::RagConfig;
use crate::error::{query_hash, RagError, Result};

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a chat transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Lazy, finite sequence of answer fragments. Dropping it cancels the call.
pub type TextStream = BoxStream<'static, Result<String>>;

// ============================================================================
// ChatModel Trait
// ============================================================================

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Full answer in one piece
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String>;

    /// Answer as a stream of fragments.
    ///
    /// Default: the `complete` answer as a single fragment.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TextStream> {
        let answer = self.complete(messages).await?;
        Ok(futures::stream::once(async move { Ok(answer) }).boxed())
    }

    fn name(&self) -> &str;
}

/// Hash of the last user message, used to tag generation errors
pub fn transcript_hash(messages: &[ChatMessage]) -> String {
    let last_user = messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("");
    query_hash(last_user)
}

// ============================================================================
// Ollama Chat
// ============================================================================

/// Ollama `/api/chat` client
///
/// ref: https://github.com/ollama/ollama/blob/main/docs/api.md#generate-a-chat-completion
#[derive(Debug, Clone)]
pub struct OllamaChat {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    /// Deadline for a whole non-streaming call, or for the first byte of a stream
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
}

/// One NDJSON line (or the whole body when not streaming)
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

impl OllamaChat {
    pub fn new(base_url: &str, model: &str, temperature: f32, timeout: Duration) -> Result<Self> {
        // no total timeout on the client: streams may legitimately run long
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| RagError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            temperature,
            timeout,
        })
    }

    pub fn from_config(config: &RagConfig) -> Result<Self> {
        Self::new(
            &config.ollama_url,
            &config.llm_model,
            config.temperature,
            config.request_timeout(),
        )
    }

    /// POST the transcript; returns the response once headers arrive with a 2xx status
    async fn send(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::Response> {
        let hash = transcript_hash(messages);
        let url = format!("{}/api/chat", self.base_url);

        let request = self.client.post(&url).json(&ChatRequest {
            model: &self.model,
            messages,
            stream,
            options: ChatOptions {
                temperature: self.temperature,
            },
        });

        let operation = format!("generation for query {}", hash);
        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Err(_) => return Err(RagError::timeout(operation, self.timeout)),
            Ok(Err(e)) if e.is_timeout() => return Err(RagError::timeout(operation, self.timeout)),
            Ok(Err(e)) => return Err(generation_error(&hash, format!("request to {} failed: {}", url, e))),
            Ok(Ok(response)) => response,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ChatChunk>(&body)
                .ok()
                .and_then(|c| c.error)
                .unwrap_or(body);
            return Err(generation_error(
                &hash,
                format!("Ollama API error ({}): {}", status, message),
            ));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatModel for OllamaChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        let hash = transcript_hash(messages);

        let call = async {
            let response = self.send(messages, false).await?;
            let body = response
                .text()
                .await
                .map_err(|e| generation_error(&hash, format!("failed to read response: {}", e)))?;

            let chunk: ChatChunk = serde_json::from_str(&body)
                .map_err(|e| generation_error(&hash, format!("failed to parse response: {}", e)))?;
            if let Some(error) = chunk.error {
                return Err(generation_error(&hash, error));
            }
            Ok::<String, RagError>(chunk.message.map(|m| m.content).unwrap_or_default())
        };

        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                RagError::timeout(format!("generation for query {}", hash), self.timeout)
            })?
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TextStream> {
        let hash = transcript_hash(messages);
        let response = self.send(messages, true).await?;

        let fragments = stream! {
            let mut bytes = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut done = false;
            let mut failed = false;

            'read: while let Some(next) = bytes.next().await {
                match next {
                    Ok(data) => buffer.extend_from_slice(&data),
                    Err(e) => {
                        yield Err(generation_error(&hash, format!("stream interrupted: {}", e)));
                        failed = true;
                        break 'read;
                    }
                }

                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    match parse_line(&line) {
                        Ok(None) => {}
                        Ok(Some(Fragment::Text(text))) => {
                            yield Ok(text);
                        }
                        Ok(Some(Fragment::Done(text))) => {
                            if !text.is_empty() {
                                yield Ok(text);
                            }
                            done = true;
                            break 'read;
                        }
                        Err(reason) => {
                            yield Err(generation_error(&hash, reason));
                            failed = true;
                            break 'read;
                        }
                    }
                }
            }

            // last line without a trailing newline
            if !done && !failed {
                match parse_line(&buffer) {
                    Ok(Some(Fragment::Text(text))) => {
                        yield Ok(text);
                    }
                    Ok(Some(Fragment::Done(text))) => {
                        if !text.is_empty() {
                            yield Ok(text);
                        }
                        done = true;
                    }
                    Err(reason) => {
                        yield Err(generation_error(&hash, reason));
                        failed = true;
                    }
                    Ok(None) => {}
                }
            }

            // a body cut off before the final line is an incomplete answer
            if !done && !failed {
                yield Err(generation_error(&hash, "stream ended before done"));
            }
        };

        Ok(fragments.boxed())
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

enum Fragment {
    Text(String),
    /// Final line; may still carry text
    Done(String),
}

fn parse_line(line: &[u8]) -> std::result::Result<Option<Fragment>, String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let chunk: ChatChunk =
        serde_json::from_str(line).map_err(|e| format!("malformed stream line: {}", e))?;
    if let Some(error) = chunk.error {
        return Err(error);
    }

    let text = chunk.message.map(|m| m.content).unwrap_or_default();
    if chunk.done {
        return Ok(Some(Fragment::Done(text)));
    }
    if text.is_empty() {
        return Ok(None);
    }
    Ok(Some(Fragment::Text(text)))
}

fn generation_error(query_hash: &str, reason: impl Into<String>) -> RagError {
    RagError::Generation {
        query_hash: query_hash.to_string(),
        reason: reason.into(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat(server: &MockServer) -> OllamaChat {
        OllamaChat::new(&server.uri(), "llama3.1", 0.3, Duration::from_secs(5)).unwrap()
    }

    fn ndjson(fragments: &[&str]) -> String {
        let mut body = String::new();
        for fragment in fragments {
            body.push_str(
                &json!({ "message": { "role": "assistant", "content": fragment }, "done": false })
                    .to_string(),
            );
            body.push('\n');
        }
        body.push_str(&json!({ "message": { "role": "assistant", "content": "" }, "done": true }).to_string());
        body.push('\n');
        body
    }

    fn transcript() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("What is due?"),
        ]
    }

    #[test]
    fn test_message_serialization() {
        let value = serde_json::to_value(ChatMessage::assistant("hi")).unwrap();
        assert_eq!(value, json!({ "role": "assistant", "content": "hi" }));
    }

    #[test]
    fn test_transcript_hash_uses_last_user_message() {
        let messages = vec![
            ChatMessage::user("first"),
            ChatMessage::assistant("answer"),
            ChatMessage::user("second"),
        ];
        assert_eq!(transcript_hash(&messages), query_hash("second"));
    }

    #[tokio::test]
    async fn test_complete() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({ "model": "llama3.1", "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "message": { "role": "assistant", "content": "The invoice." },
                "done": true
            })))
            .mount(&server)
            .await;

        let answer = chat(&server).complete(&transcript()).await.unwrap();
        assert_eq!(answer, "The invoice.");
    }

    #[tokio::test]
    async fn test_complete_error_carries_query_hash() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({ "error": "model 'llama3.1' not found" })),
            )
            .mount(&server)
            .await;

        let err = chat(&server).complete(&transcript()).await.unwrap_err();
        match err {
            RagError::Generation { query_hash: hash, reason } => {
                assert_eq!(hash, query_hash("What is due?"));
                assert!(reason.contains("not found"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_complete_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "message": { "content": "late" }, "done": true }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let model =
            OllamaChat::new(&server.uri(), "llama3.1", 0.3, Duration::from_millis(100)).unwrap();
        let err = model.complete(&transcript()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(err.to_string().contains(&query_hash("What is due?")));
    }

    #[tokio::test]
    async fn test_stream_fragments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(json!({ "stream": true })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(ndjson(&["The ", "invoice", "."]), "application/x-ndjson"),
            )
            .mount(&server)
            .await;

        let fragments: Vec<String> = chat(&server)
            .stream(&transcript())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(fragments, vec!["The ", "invoice", "."]);
    }

    #[tokio::test]
    async fn test_stream_error_line() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{}\n",
            json!({ "message": { "content": "partial" }, "done": false }),
            json!({ "error": "model crashed" })
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let mut stream = chat(&server).stream(&transcript()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "partial");
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, RagError::Generation { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_final_line_without_newline() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{}",
            json!({ "message": { "content": "a" }, "done": false }),
            json!({ "message": { "content": "b" }, "done": true })
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let fragments: Vec<String> = chat(&server)
            .stream(&transcript())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(fragments, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_stream_cut_off_before_done() {
        let server = MockServer::start().await;
        let body = format!(
            "{}\n{}",
            json!({ "message": { "content": "a" }, "done": false }),
            json!({ "message": { "content": "b" }, "done": false })
        );
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson"))
            .mount(&server)
            .await;

        let mut stream = chat(&server).stream(&transcript()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(stream.next().await.unwrap().unwrap(), "b");
        match stream.next().await.unwrap().unwrap_err() {
            RagError::Generation { query_hash: hash, reason } => {
                assert_eq!(hash, query_hash("What is due?"));
                assert!(reason.contains("before done"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(stream.next().await.is_none());
    }

    struct Fixed;

    #[async_trait]
    impl ChatModel for Fixed {
        async fn complete(&self, _messages: &[ChatMessage]) -> Result<String> {
            Ok("whole answer".to_string())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[tokio::test]
    async fn test_default_stream_is_single_fragment() {
        let fragments: Vec<String> = Fixed
            .stream(&transcript())
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(fragments, vec!["whole answer"]);
    }
}
