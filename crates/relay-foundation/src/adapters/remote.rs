//! Remote HTTP adapter for OpenAI-compatible chat completion servers.
//!
//! Requests go to `POST {endpoint}/v1/chat/completions`. Streaming models
//! consume the server-sent event stream; the rest read one JSON body and
//! yield it as a single chunk.
//!
//! Failure classification:
//!
//! | Cause | Error |
//! |-------|-------|
//! | connect failure, timeout, stalled stream, broken body | transient |
//! | HTTP 408, 429, 5xx | transient |
//! | other HTTP 4xx, malformed payload | fatal |
//!
//! Descriptor settings: `model` (name sent upstream, defaults to the model
//! id), `api_key_env` (environment variable holding a bearer token) and
//! `timeout_secs`. For non-streaming models that bounds the whole request;
//! for streaming ones it bounds the wait for response headers and the idle
//! gap between two events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use relay_kernel::{
    AdapterChunk, AdapterError, AdapterFactory, Capability, CapabilitySet, ChunkStream,
    FinishReason, GenerationRequest, ModelAdapter, ModelDescriptor, ModelFamily, ModelId,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const CONNECT_TIMEOUT_SECS: u64 = 10;
const STREAM_CHANNEL_CAPACITY: usize = 32;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    temperature: f64,
    top_p: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop: &'a [String],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    influences: &'a BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

fn map_finish(reason: &str) -> FinishReason {
    match reason {
        "length" | "max_tokens" => FinishReason::Length,
        _ => FinishReason::Stop,
    }
}

fn map_error(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::transient(format!("request timed out: {err}"))
    } else if err.is_connect() || err.is_request() || err.is_body() {
        AdapterError::transient(format!("network error: {err}"))
    } else {
        AdapterError::fatal(err.to_string())
    }
}

fn timed_out(timeout: Duration) -> AdapterError {
    AdapterError::transient(format!("request timed out after {}s", timeout.as_secs_f64()))
}

fn map_status(status: StatusCode, body: &str) -> AdapterError {
    let message = format!("HTTP {}: {}", status.as_u16(), body.trim());
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        AdapterError::transient(message)
    } else {
        AdapterError::fatal(message)
    }
}

// ============================================================================
// Adapter
// ============================================================================

pub struct RemoteHttpAdapter {
    model_id: ModelId,
    url: String,
    upstream_model: String,
    api_key: Option<String>,
    timeout: Duration,
    client: reqwest::Client,
    capabilities: CapabilitySet,
}

impl RemoteHttpAdapter {
    pub fn new(descriptor: &ModelDescriptor, client: reqwest::Client) -> Result<Self, AdapterError> {
        let endpoint = descriptor.endpoint.as_deref().ok_or_else(|| {
            AdapterError::fatal(format!("model '{}' has no endpoint", descriptor.id))
        })?;
        let api_key = descriptor
            .setting("api_key_env")
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty());
        let timeout = descriptor
            .setting("timeout_secs")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            model_id: descriptor.id.clone(),
            url: format!("{}/v1/chat/completions", endpoint.trim_end_matches('/')),
            upstream_model: descriptor
                .setting("model")
                .unwrap_or(descriptor.id.as_str())
                .to_string(),
            api_key,
            timeout: Duration::from_secs(timeout),
            client,
            capabilities: descriptor.capabilities.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn read_single(
        &self,
        response: reqwest::Response,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, AdapterError> {
        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(AdapterError::Cancelled),
            body = response.text() => body.map_err(map_error)?,
        };
        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .map_err(|e| AdapterError::fatal(format!("malformed completion payload: {e}")))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AdapterError::fatal("completion payload has no choices"))?;

        let finish = choice
            .finish_reason
            .as_deref()
            .map(map_finish)
            .unwrap_or(FinishReason::Stop);
        let mut chunks: Vec<Result<AdapterChunk, AdapterError>> = Vec::with_capacity(2);
        if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
            chunks.push(Ok(AdapterChunk::text(0, text)));
        }
        chunks.push(Ok(AdapterChunk::finish(chunks.len() as u64, finish)));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn relay_events(
        &self,
        response: reqwest::Response,
        cancel: CancellationToken,
    ) -> ChunkStream {
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let model_id = self.model_id.clone();
        let idle_timeout = self.timeout;

        tokio::spawn(async move {
            debug!(model = %model_id, "event stream task started");
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            let mut sequence = 0u64;
            let mut finish: Option<FinishReason> = None;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Ok(AdapterChunk::finish(sequence, FinishReason::Cancelled))).await;
                        return;
                    }
                    _ = tx.closed() => return,
                    next = tokio::time::timeout(idle_timeout, stream.next()) => match next {
                        Ok(next) => next,
                        Err(_) => {
                            error!(model = %model_id, timeout_secs = idle_timeout.as_secs_f64(), "event stream stalled");
                            let _ = tx.send(Err(timed_out(idle_timeout))).await;
                            return;
                        }
                    },
                };

                match next {
                    Some(Ok(bytes)) => {
                        buffer.extend_from_slice(&bytes);
                        while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                            let line_bytes: Vec<u8> = buffer.drain(..=newline).collect();
                            let line = String::from_utf8_lossy(&line_bytes);
                            let Some(data) = line.trim().strip_prefix("data:") else {
                                continue;
                            };
                            let data = data.trim();

                            if data == "[DONE]" {
                                let reason = finish.unwrap_or(FinishReason::Stop);
                                let _ = tx.send(Ok(AdapterChunk::finish(sequence, reason))).await;
                                return;
                            }

                            let event: StreamEvent = match serde_json::from_str(data) {
                                Ok(event) => event,
                                Err(e) => {
                                    error!(model = %model_id, error = %e, "malformed stream event");
                                    let _ = tx
                                        .send(Err(AdapterError::fatal(format!(
                                            "malformed stream event: {e}"
                                        ))))
                                        .await;
                                    return;
                                }
                            };
                            for choice in event.choices {
                                if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                                    if tx.send(Ok(AdapterChunk::text(sequence, text))).await.is_err() {
                                        return;
                                    }
                                    sequence += 1;
                                }
                                if let Some(reason) = choice.finish_reason.as_deref() {
                                    finish = Some(map_finish(reason));
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(map_error(e))).await;
                        return;
                    }
                    None => {
                        let item = match finish {
                            Some(reason) => Ok(AdapterChunk::finish(sequence, reason)),
                            None => Err(AdapterError::transient(
                                "event stream closed before completion",
                            )),
                        };
                        let _ = tx.send(item).await;
                        return;
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }
}

#[async_trait]
impl ModelAdapter for RemoteHttpAdapter {
    fn name(&self) -> &str {
        "remote-http"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<ChunkStream, AdapterError> {
        if request.cancel.is_cancelled() {
            return Err(AdapterError::Cancelled);
        }
        let streaming = self.supports_streaming();
        let messages = request
            .messages
            .iter()
            .map(|t| WireMessage {
                role: t.role.as_str(),
                content: &t.text,
            })
            .collect();
        let body = ChatCompletionRequest {
            model: &self.upstream_model,
            messages,
            stream: streaming,
            temperature: request.params.temperature,
            top_p: request.params.top_p,
            max_tokens: request.params.max_output_tokens,
            stop: &request.params.stop,
            influences: &request.params.influences,
        };

        let mut builder = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        if !streaming {
            builder = builder.timeout(self.timeout);
        }

        debug!(model = %self.model_id, url = %self.url, streaming, "sending completion request");
        let response = tokio::select! {
            _ = request.cancel.cancelled() => return Err(AdapterError::Cancelled),
            sent = tokio::time::timeout(self.timeout, builder.send()) => match sent {
                Ok(sent) => sent.map_err(map_error)?,
                Err(_) => return Err(timed_out(self.timeout)),
            },
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        if streaming {
            Ok(self.relay_events(response, request.cancel))
        } else {
            self.read_single(response, &request.cancel).await
        }
    }

    fn supports_streaming(&self) -> bool {
        self.capabilities.has(&Capability::Streaming)
    }

    fn describe_capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Builds [`RemoteHttpAdapter`]s. Loading only constructs the HTTP client;
/// the server is first contacted on generation.
#[derive(Debug, Clone)]
pub struct RemoteHttpFactory {
    connect_timeout: Duration,
}

impl Default for RemoteHttpFactory {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }
}

impl RemoteHttpFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl AdapterFactory for RemoteHttpFactory {
    fn family(&self) -> ModelFamily {
        ModelFamily::RemoteHttp
    }

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
    ) -> Result<Arc<dyn ModelAdapter>, AdapterError> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| AdapterError::fatal(format!("failed to build HTTP client: {e}")))?;
        let adapter = RemoteHttpAdapter::new(descriptor, client)?;
        info!(model = %descriptor.id, url = %adapter.url(), "remote adapter ready");
        Ok(Arc::new(adapter))
    }
}
