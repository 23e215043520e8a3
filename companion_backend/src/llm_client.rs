use std::collections::VecDeque;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};

/// Stream of text fragments produced by a streaming completion.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Opaque text-completion service.
///
/// Both calls are fallible and never retried here; callers that want a retry
/// (the emotion analyzer) implement it themselves.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, messages: Vec<Message>, temperature: f32) -> Result<String>;

    async fn stream(&self, messages: Vec<Message>, temperature: f32) -> Result<FragmentStream>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

/// OpenAI-compatible `/chat/completions` client.
#[derive(Clone)]
pub struct LlmClient {
    api_url: String,
    api_key: Option<String>,
    model: String,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_url: String, api_key: Option<String>, model: String) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model,
            client: reqwest::Client::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn send(&self, messages: &[Message], temperature: f32, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.api_url);

        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature,
            stream,
            max_tokens: Some(1200),
        };

        let mut req = self.client.post(&url).json(&request);

        // Local models usually run without a key
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req.send().await.context("Failed to send LLM request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("LLM API returned error {}: {}", status, body);
        }

        Ok(response)
    }
}

#[async_trait]
impl CompletionService for LlmClient {
    async fn complete(&self, messages: Vec<Message>, temperature: f32) -> Result<String> {
        let response = self.send(&messages, temperature, false).await?;

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }

    async fn stream(&self, messages: Vec<Message>, temperature: f32) -> Result<FragmentStream> {
        let response = self.send(&messages, temperature, true).await?;

        let state = SseState {
            response,
            buffer: Vec::new(),
            pending: VecDeque::new(),
            done: false,
        };

        let fragments = stream::unfold(state, |mut st| async move {
            loop {
                if let Some(fragment) = st.pending.pop_front() {
                    return Some((Ok(fragment), st));
                }
                if st.done {
                    return None;
                }
                match st.response.chunk().await {
                    Ok(Some(bytes)) => {
                        st.buffer.extend_from_slice(&bytes);
                        match drain_sse_lines(&mut st.buffer, &mut st.pending) {
                            Ok(saw_done) => st.done = saw_done,
                            Err(e) => {
                                st.done = true;
                                return Some((Err(e), st));
                            }
                        }
                    }
                    Ok(None) => st.done = true,
                    Err(e) => {
                        st.done = true;
                        let err = anyhow::Error::new(e).context("Failed reading streaming chunk");
                        return Some((Err(err), st));
                    }
                }
            }
        });

        Ok(Box::pin(fragments))
    }
}

struct SseState {
    response: reqwest::Response,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

/// Consume every complete line in `buffer`, pushing delta contents onto `out`.
///
/// Returns `true` once the `[DONE]` sentinel is seen. Partial trailing lines
/// stay in the buffer for the next chunk.
fn drain_sse_lines(buffer: &mut Vec<u8>, out: &mut VecDeque<String>) -> Result<bool> {
    while let Some(newline_idx) = buffer.iter().position(|b| *b == b'\n') {
        let line_bytes: Vec<u8> = buffer.drain(..=newline_idx).collect();
        let line = String::from_utf8_lossy(&line_bytes);
        let line = line.trim();

        if line.is_empty() || line.starts_with(':') || !line.starts_with("data:") {
            continue;
        }

        let payload = line[5..].trim();
        if payload == "[DONE]" {
            return Ok(true);
        }

        let chunk_json: serde_json::Value = serde_json::from_str(payload)
            .with_context(|| format!("Failed to parse stream payload: {}", payload))?;

        if let Some(content) = chunk_json["choices"][0]["delta"]["content"].as_str() {
            if !content.is_empty() {
                out.push_back(content.to_string());
            }
        }
    }
    Ok(false)
}

/// Locate the JSON object inside a model reply.
///
/// Handles bare JSON, ```json fences, `</think>` preambles and prose around a
/// single object.
pub fn extract_json_block(response: &str) -> Option<&str> {
    let cleaned = match response.rfind("</think>") {
        Some(think_end) => &response[think_end + 8..],
        None => response,
    };

    let fenced = match cleaned.find("```json") {
        Some(start) => {
            let after_start = &cleaned[start + 7..];
            match after_start.find("```") {
                Some(end) => &after_start[..end],
                None => after_start,
            }
        }
        None => cleaned,
    };

    let start = fenced.find('{')?;
    let end = fenced.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(fenced[start..=end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_from_fence() {
        let raw = "Sure!\n```json\n{\"a\": 1}\n```\nbye";
        assert_eq!(extract_json_block(raw), Some("{\"a\": 1}"));
    }

    #[test]
    fn extract_json_after_think_block() {
        let raw = "<think>{\"ignored\": true}</think>\n{\"b\": 2}";
        assert_eq!(extract_json_block(raw), Some("{\"b\": 2}"));
    }

    #[test]
    fn extract_json_missing_object() {
        assert_eq!(extract_json_block("not json at all"), None);
        assert_eq!(extract_json_block("} backwards {"), None);
    }

    #[test]
    fn sse_lines_collect_deltas_until_done() {
        let mut buffer = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n: keepalive\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\ndata: [DONE]\n".to_vec();
        let mut out = VecDeque::new();
        let done = drain_sse_lines(&mut buffer, &mut out).unwrap();
        assert!(done);
        assert_eq!(out, VecDeque::from(vec!["Hel".to_string(), "lo".to_string()]));
    }

    #[test]
    fn sse_partial_line_waits_for_more_bytes() {
        let mut buffer = b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\ndata: {\"cho".to_vec();
        let mut out = VecDeque::new();
        let done = drain_sse_lines(&mut buffer, &mut out).unwrap();
        assert!(!done);
        assert_eq!(out.len(), 1);
        assert_eq!(buffer, b"data: {\"cho".to_vec());
    }

    #[test]
    fn sse_malformed_payload_is_an_error() {
        let mut buffer = b"data: {not json}\n".to_vec();
        let mut out = VecDeque::new();
        assert!(drain_sse_lines(&mut buffer, &mut out).is_err());
    }

    #[test]
    fn client_drops_blank_api_key() {
        let client = LlmClient::new(
            "http://localhost:11434/v1/".to_string(),
            Some("  ".to_string()),
            "llama3.2".to_string(),
        );
        assert!(client.api_key.is_none());
        assert_eq!(client.api_url, "http://localhost:11434/v1");
        assert_eq!(client.model(), "llama3.2");
    }
}
