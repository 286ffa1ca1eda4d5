//! HTTP client for llama-server's OpenAI-compatible API.

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::error::StreamError;
use crate::stream::TokenStream;

/// Default bound on the wait for each streamed chunk.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Client for communicating with llama-server.
#[derive(Debug, Clone)]
pub struct LlamaCppClient {
    client: reqwest::Client,
    base_url: String,
    idle_timeout: Duration,
}

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Chat message in OpenAI format.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// OpenAI-compatible chat completion request.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ChatCompletionRequest {
    /// llama-server serves a single model and ignores the name.
    pub fn new(messages: Vec<ChatMessage>, max_tokens: u32) -> Self {
        Self {
            model: "local".to_string(),
            messages,
            stream: false,
            max_tokens,
            temperature: None,
        }
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// OpenAI-compatible chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlamaCppClient {
    /// Create a new client with a custom URL.
    pub fn with_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Create a new client with a custom port on localhost.
    pub fn with_port(port: u16) -> Self {
        Self::with_url(format!("http://127.0.0.1:{}", port))
    }

    /// Bound the wait for each streamed chunk.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Check if the server is running and healthy.
    ///
    /// llama-server answers 503 while the model is still loading.
    pub async fn check_health(&self) -> Result<(), StreamError> {
        let url = format!("{}/health", self.base_url);

        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(StreamError::ServerNotRunning(self.base_url.clone()))
        }
    }

    /// Send a non-streaming completion request and return the reply text.
    pub async fn complete(&self, request: &ChatCompletionRequest) -> Result<String, StreamError> {
        let mut request = request.clone();
        request.stream = false;

        let response = self.post_completion(&request).await?;
        let completion: ChatCompletionResponse = response.json().await?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| StreamError::Decode("No completion returned".to_string()))
    }

    /// Start a streamed completion.
    ///
    /// Uses the OpenAI-compatible `/v1/chat/completions` endpoint with
    /// `stream: true`.
    pub async fn stream_chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<TokenStream, StreamError> {
        let mut request = request.clone();
        request.stream = true;

        let response = self.post_completion(&request).await?;
        Ok(TokenStream::new(
            response.bytes_stream().boxed(),
            self.idle_timeout,
        ))
    }

    async fn post_completion(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, StreamError> {
        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Status { status, body });
        }
        Ok(response)
    }

    fn map_send_error(&self, e: reqwest::Error) -> StreamError {
        if e.is_connect() || e.is_timeout() {
            StreamError::ServerNotRunning(self.base_url.clone())
        } else {
            StreamError::Transport(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sse_content, MockResponse, MockServer};

    #[test]
    fn test_custom_url() {
        let client = LlamaCppClient::with_url("http://192.168.1.100:8080/");
        assert_eq!(client.base_url(), "http://192.168.1.100:8080");
    }

    #[test]
    fn test_custom_port() {
        let client = LlamaCppClient::with_port(9000);
        assert_eq!(client.base_url(), "http://127.0.0.1:9000");
    }

    #[test]
    fn test_request_wire_format() {
        let request = ChatCompletionRequest::new(
            vec![
                ChatMessage::text(Role::System, "be brief"),
                ChatMessage {
                    role: Role::User,
                    content: MessageContent::Parts(vec![
                        ContentPart::Text {
                            text: "what is this?".into(),
                        },
                        ContentPart::ImageUrl {
                            image_url: ImageUrl {
                                url: "data:image/png;base64,AAAA".into(),
                            },
                        },
                    ]),
                },
            ],
            256,
        )
        .streaming();

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["max_tokens"], 256);
        assert!(json.get("temperature").is_none());
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "be brief");
        assert_eq!(json["messages"][1]["content"][1]["type"], "image_url");
        assert_eq!(
            json["messages"][1]["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );
    }

    #[tokio::test]
    async fn test_health_against_unbound_port() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = LlamaCppClient::with_port(port);
        assert!(matches!(
            client.check_health().await,
            Err(StreamError::ServerNotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_health_loading_is_not_ready() {
        let server = MockServer::start().await;
        server.route("GET", "/health", MockResponse::status(503));
        let client = LlamaCppClient::with_url(server.url());
        assert!(client.check_health().await.is_err());

        server.route("GET", "/health", MockResponse::status(200));
        assert!(client.check_health().await.is_ok());
    }

    #[tokio::test]
    async fn test_stream_chat_yields_fragments() {
        let server = MockServer::start().await;
        server.route(
            "POST",
            "/v1/chat/completions",
            MockResponse::sse(vec![sse_content("Hi"), sse_content(" there")]),
        );
        let client = LlamaCppClient::with_url(server.url());
        let request = ChatCompletionRequest::new(vec![ChatMessage::text(Role::User, "hi")], 16);

        let mut stream = client.stream_chat(&request).await.unwrap();
        let mut text = String::new();
        while let Some(fragment) = stream.next_fragment().await {
            text.push_str(&fragment.unwrap());
        }
        assert_eq!(text, "Hi there");

        let sent = server.requests_to("/v1/chat/completions");
        assert_eq!(sent.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
        assert_eq!(body["stream"], true);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        server.route(
            "POST",
            "/v1/chat/completions",
            MockResponse::text(500, "boom"),
        );
        let client = LlamaCppClient::with_url(server.url());
        let request = ChatCompletionRequest::new(vec![], 16);

        match client.stream_chat(&request).await {
            Err(StreamError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "boom");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_complete_returns_message() {
        let server = MockServer::start().await;
        server.route(
            "POST",
            "/v1/chat/completions",
            MockResponse::json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "Rust ownership basics" } }]
            })),
        );
        let client = LlamaCppClient::with_url(server.url());
        let request = ChatCompletionRequest::new(vec![ChatMessage::text(Role::User, "x")], 30);

        assert_eq!(
            client.complete(&request).await.unwrap(),
            "Rust ownership basics"
        );
    }
}
