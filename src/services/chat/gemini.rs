//! Streaming client for the Gemini `streamGenerateContent` endpoint.

use std::{collections::VecDeque, fmt::Display};

use async_trait::async_trait;
use futures::{stream::BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{config::Config, models::ChatRole};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("model API returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("model API error: {0}")]
    Api(String),
    #[error("could not decode model response: {0}")]
    Decode(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelTurn {
    pub role: ChatRole,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_prompt: String,
    pub history:       Vec<ModelTurn>,
    pub message:       String,
}

pub type ChunkStream = BoxStream<'static, Result<String, ModelError>>;

/// Text in, text chunks out.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn stream(&self, request: ModelRequest, cancel: CancellationToken) -> Result<ChunkStream, ModelError>;
}

// ── Wire types ───────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    system_instruction: WireContent<'a>,
    contents:           Vec<WireContent<'a>>,
}

#[derive(Serialize)]
struct WireContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role:  Option<&'static str>,
    parts: Vec<WirePart<'a>>,
}

#[derive(Serialize)]
struct WirePart<'a> {
    text: &'a str,
}

impl<'a> GenerateContentRequest<'a> {
    fn from_request(req: &'a ModelRequest) -> Self {
        let turn = |role: ChatRole, text: &'a str| WireContent {
            role:  Some(match role {
                ChatRole::User      => "user",
                ChatRole::Assistant => "model",
            }),
            parts: vec![WirePart { text }],
        };

        let mut contents: Vec<WireContent<'a>> =
            req.history.iter().map(|t| turn(t.role, t.text.as_str())).collect();
        contents.push(turn(ChatRole::User, req.message.as_str()));

        Self {
            system_instruction: WireContent {
                role:  None,
                parts: vec![WirePart { text: req.system_prompt.as_str() }],
            },
            contents,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    error:      Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// Text carried by one SSE `data:` payload, `None` when it carries none.
pub fn parse_chunk(payload: &str) -> Result<Option<String>, ModelError> {
    let response: GenerateContentResponse =
        serde_json::from_str(payload).map_err(|e| ModelError::Decode(e.to_string()))?;

    if let Some(err) = response.error {
        return Err(ModelError::Api(err.message));
    }

    let text: String = response
        .candidates
        .into_iter()
        .filter_map(|c| c.content)
        .flat_map(|c| c.parts)
        .filter_map(|p| p.text)
        .collect();

    Ok((!text.is_empty()).then_some(text))
}

// ── SSE decoding ─────────────────────────────────────────────

/// Splits a byte stream into server-sent events. Buffering happens on bytes,
/// so multi-byte characters split across network chunks survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes; returns the `data` payload of every completed event.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some((end, sep)) = find_boundary(&self.buf) {
            let raw: Vec<u8> = self.buf.drain(..end + sep).collect();
            if let Some(data) = event_data(&raw[..end]) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let raw = std::mem::take(&mut self.buf);
        event_data(&raw)
    }
}

fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn event_data(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let lines: Vec<&str> = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

struct DecodeState {
    body:    BoxStream<'static, Result<Vec<u8>, ModelError>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    cancel:  CancellationToken,
    done:    bool,
}

enum Step {
    Cancelled,
    Body(Option<Result<Vec<u8>, ModelError>>),
}

impl DecodeState {
    /// Queue the text of each payload; the first undecodable one ends the stream.
    fn absorb(&mut self, payloads: impl IntoIterator<Item = String>) -> Result<(), ModelError> {
        for payload in payloads {
            if let Some(text) = parse_chunk(&payload)? {
                self.pending.push_back(text);
            }
        }
        Ok(())
    }
}

/// Turn a raw SSE byte stream into text chunks. Stops with
/// [`ModelError::Cancelled`] once `cancel` fires.
pub fn decode_stream<S, B, E>(body: S, cancel: CancellationToken) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]>,
    E: Display,
{
    let body = body
        .map(|item| {
            item.map(|bytes| bytes.as_ref().to_vec())
                .map_err(|e| ModelError::Transport(e.to_string()))
        })
        .boxed();

    let state = DecodeState {
        body,
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        cancel,
        done: false,
    };

    futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(text) = st.pending.pop_front() {
                return Some((Ok(text), st));
            }
            if st.done {
                return None;
            }

            let step = tokio::select! {
                biased;
                _ = st.cancel.cancelled() => Step::Cancelled,
                next = st.body.next() => Step::Body(next),
            };

            match step {
                Step::Cancelled => {
                    st.done = true;
                    st.pending.clear();
                    return Some((Err(ModelError::Cancelled), st));
                }
                Step::Body(Some(Ok(bytes))) => {
                    let payloads = st.decoder.push(&bytes);
                    if let Err(err) = st.absorb(payloads) {
                        st.done = true;
                        return Some((Err(err), st));
                    }
                }
                Step::Body(Some(Err(err))) => {
                    st.done = true;
                    return Some((Err(err), st));
                }
                Step::Body(None) => {
                    st.done = true;
                    let tail = st.decoder.finish();
                    if let Err(err) = st.absorb(tail) {
                        return Some((Err(err), st));
                    }
                }
            }
        }
    })
    .boxed()
}

// ── Client ───────────────────────────────────────────────────

pub struct GeminiClient {
    http:     reqwest::Client,
    api_base: String,
    model:    String,
    api_key:  String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, api_base: impl Into<String>) -> Self {
        Self {
            http:     reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            model:    model.into(),
            api_key:  api_key.into(),
        }
    }

    /// `None` when no API key is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .gemini_api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .map(|key| Self::new(key, &config.gemini_model, &config.gemini_api_base))
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:streamGenerateContent?alt=sse", self.api_base, self.model)
    }
}

#[async_trait]
impl ChatModel for GeminiClient {
    async fn stream(&self, request: ModelRequest, cancel: CancellationToken) -> Result<ChunkStream, ModelError> {
        let body = GenerateContentRequest::from_request(&request);
        let send = self
            .http
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ModelError::Cancelled),
            res = send => res.map_err(|e| ModelError::Transport(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            text.truncate(500);
            return Err(ModelError::Status { status: status.as_u16(), body: text });
        }

        Ok(decode_stream(response.bytes_stream(), cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sse(text: &str) -> String {
        format!(
            "data: {}\r\n\r\n",
            serde_json::json!({ "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }] })
        )
    }

    #[test]
    fn decoder_handles_split_events() {
        let mut decoder = SseDecoder::new();
        let frame = sse("Hello");
        let (a, b) = frame.split_at(10);

        assert!(decoder.push(a.as_bytes()).is_empty());
        let payloads = decoder.push(b.as_bytes());
        assert_eq!(payloads.len(), 1);
        assert_eq!(parse_chunk(&payloads[0]).unwrap().as_deref(), Some("Hello"));
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_keeps_multibyte_characters_intact() {
        let mut decoder = SseDecoder::new();
        let frame = sse("Zażółć");
        let bytes = frame.as_bytes();
        let cut = frame.find('ż').unwrap() + 1;

        assert!(decoder.push(&bytes[..cut]).is_empty());
        let payloads = decoder.push(&bytes[cut..]);
        assert_eq!(parse_chunk(&payloads[0]).unwrap().as_deref(), Some("Zażółć"));
    }

    #[test]
    fn api_errors_and_empty_payloads() {
        assert!(matches!(
            parse_chunk(r#"{"error":{"code":429,"message":"quota"}}"#),
            Err(ModelError::Api(m)) if m == "quota"
        ));
        assert_eq!(parse_chunk(r#"{"candidates":[{"finishReason":"STOP"}]}"#).unwrap(), None);
        assert!(matches!(parse_chunk("not json"), Err(ModelError::Decode(_))));
    }

    #[test]
    fn request_maps_roles_to_wire_names() {
        let req = ModelRequest {
            system_prompt: "be nice".into(),
            history:       vec![
                ModelTurn { role: ChatRole::User, text: "hi".into() },
                ModelTurn { role: ChatRole::Assistant, text: "hello".into() },
            ],
            message:       "courses?".into(),
        };
        let json = serde_json::to_value(GenerateContentRequest::from_request(&req)).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "be nice");
        assert!(json["systemInstruction"].get("role").is_none());
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][2]["parts"][0]["text"], "courses?");
    }

    #[tokio::test]
    async fn decode_stream_yields_text_chunks() {
        let frames = format!("{}{}", sse("Hel"), sse("lo"));
        let (a, b) = frames.split_at(7);
        let body = futures::stream::iter(vec![
            Ok::<_, std::io::Error>(a.as_bytes().to_vec()),
            Ok(b.as_bytes().to_vec()),
        ]);

        let chunks: Vec<String> = decode_stream(body, CancellationToken::new())
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(chunks, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn decode_stream_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        let body = futures::stream::pending::<Result<Vec<u8>, std::io::Error>>();
        let mut stream = decode_stream(body, cancel.clone());

        cancel.cancel();
        assert!(matches!(stream.next().await, Some(Err(ModelError::Cancelled))));
        assert!(stream.next().await.is_none());
    }
}
