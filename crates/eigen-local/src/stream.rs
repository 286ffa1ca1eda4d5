//! Server-sent event decoding for streamed chat completions.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::time::timeout;

use crate::error::StreamError;

/// Sentinel payload that ends an OpenAI-style stream.
const DONE: &str = "[DONE]";

#[derive(Debug, Default, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Incremental `text/event-stream` parser.
///
/// Lines are split on raw bytes so multi-byte characters cut across network
/// chunks are reassembled before decoding.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Feed bytes, returning the `data` payload of each completed event.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            self.line(line.trim_end_matches(['\r', '\n']), &mut events);
        }
        events
    }

    /// Flush a trailing event not followed by a blank line.
    pub(crate) fn finish(&mut self) -> Vec<String> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            self.line(line.trim_end_matches('\r'), &mut events);
        }
        self.line("", &mut events);
        events
    }

    fn line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(self.data.join("\n"));
                self.data.clear();
            }
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // Comments (":") and other fields (event, id, retry) are ignored.
    }
}

/// Raw `delta.content` fragments of one streamed completion, in arrival order.
pub struct TokenStream {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    idle_timeout: Duration,
    done: bool,
    saw_done: bool,
    failure: Option<StreamError>,
}

impl TokenStream {
    pub(crate) fn new(
        body: BoxStream<'static, reqwest::Result<Bytes>>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            body,
            decoder: SseDecoder::default(),
            pending: VecDeque::new(),
            idle_timeout,
            done: false,
            saw_done: false,
            failure: None,
        }
    }

    /// Next fragment, or `None` once the server signalled the end.
    ///
    /// Each wait for network data is bounded by the idle timeout. A body
    /// that ends without `[DONE]` yields [`StreamError::Truncated`] after
    /// its last fragment. After an error the stream is finished.
    pub async fn next_fragment(&mut self) -> Option<Result<String, StreamError>> {
        loop {
            if let Some(fragment) = self.pending.pop_front() {
                return Some(Ok(fragment));
            }
            if let Some(failure) = self.failure.take() {
                return Some(Err(failure));
            }
            if self.done {
                return None;
            }

            let mut eof = false;
            let events = match timeout(self.idle_timeout, self.body.next()).await {
                Err(_) => {
                    self.done = true;
                    return Some(Err(StreamError::IdleTimeout(self.idle_timeout)));
                }
                Ok(Some(Err(e))) => {
                    self.done = true;
                    return Some(Err(StreamError::Transport(e)));
                }
                Ok(Some(Ok(bytes))) => self.decoder.push(&bytes),
                Ok(None) => {
                    self.done = true;
                    eof = true;
                    self.decoder.finish()
                }
            };

            for data in events {
                if let Err(e) = self.handle_event(&data) {
                    self.done = true;
                    self.pending.clear();
                    return Some(Err(e));
                }
                if self.saw_done {
                    break;
                }
            }

            if eof && !self.saw_done {
                self.failure = Some(StreamError::Truncated);
            }
        }
    }

    fn handle_event(&mut self, data: &str) -> Result<(), StreamError> {
        if data.trim() == DONE {
            self.done = true;
            self.saw_done = true;
            return Ok(());
        }

        let chunk: StreamChunk = serde_json::from_str(data)
            .map_err(|e| StreamError::Decode(format!("{}: {}", e, data)))?;

        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            return Err(StreamError::Server(message));
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.pending.push_back(content);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("pending", &self.pending.len())
            .field("done", &self.done)
            .field("saw_done", &self.saw_done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn token_stream(chunks: Vec<&'static str>) -> TokenStream {
        let body = stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))));
        TokenStream::new(body.boxed(), Duration::from_secs(5))
    }

    async fn collect(mut stream: TokenStream) -> Vec<Result<String, StreamError>> {
        let mut out = Vec::new();
        while let Some(item) = stream.next_fragment().await {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_decoder_splits_events() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let events = decoder.push(b":1}\n\n: keep-alive\n\ndata: [DONE]\r\n\r\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
    }

    #[test]
    fn test_decoder_multibyte_across_chunks() {
        let text = "data: é\n\n".as_bytes();
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(&text[..7]).is_empty());
        assert_eq!(decoder.push(&text[7..]), vec!["é".to_string()]);
    }

    #[test]
    fn test_decoder_finish_flushes_trailing_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: tail").is_empty());
        assert_eq!(decoder.finish(), vec!["tail".to_string()]);
    }

    #[tokio::test]
    async fn test_fragments_in_order_until_done() {
        let stream = token_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\ndata: {\"choices\":[{\"del",
            "ta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]);
        let fragments: Vec<String> = collect(stream)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(fragments, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn test_eof_without_done_is_truncated() {
        let mut stream = token_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"half an ans\"}}]}\n\n",
        ]);
        assert_eq!(stream.next_fragment().await.unwrap().unwrap(), "half an ans");
        assert!(matches!(
            stream.next_fragment().await,
            Some(Err(StreamError::Truncated))
        ));
        assert!(stream.next_fragment().await.is_none());
    }

    #[tokio::test]
    async fn test_trailing_done_without_blank_line_completes() {
        let items = collect(token_stream(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
            "data: [DONE]",
        ]))
        .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_malformed_event_is_decode_error() {
        let items = collect(token_stream(vec!["data: not json\n\n"])).await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(StreamError::Decode(_))));
    }

    #[tokio::test]
    async fn test_server_error_event() {
        let items = collect(token_stream(vec![
            "data: {\"error\":{\"message\":\"context full\"}}\n\n",
        ]))
        .await;
        assert!(matches!(&items[0], Err(StreamError::Server(m)) if m == "context full"));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let body = stream::pending::<reqwest::Result<Bytes>>().boxed();
        let mut stream = TokenStream::new(body, Duration::from_millis(50));
        assert!(matches!(
            stream.next_fragment().await,
            Some(Err(StreamError::IdleTimeout(_)))
        ));
        assert!(stream.next_fragment().await.is_none());
    }
}
