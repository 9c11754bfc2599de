//! Forwarding to the upstream and per-exchange orchestration.
//!
//! A [`Gateway`] takes one parsed client request through the whole exchange:
//! it opens a ledger entry, translates and forwards the request, translates the
//! answer (single-shot or streamed) and finally prices and closes the entry.

use crate::cost::{CostAccountant, UsageData};
use crate::error::{ProxyError, Result};
use crate::ledger::{headers_to_json, new_request_id, EntryId, NewEntry, RequestLedger, ResponseRecord};
use crate::logging::{LogLevel, SharedLogger};
use crate::tokens::{RequestSchema, TokenCounter};
use crate::translate::anthropic_types::{ErrorResponse, MessagesRequest, MessagesResponse, StreamEvent};
use crate::translate::openai_types::{ChatCompletionRequest, ChatCompletionResponse};
use crate::translate::request::anthropic_to_openai;
use crate::translate::response::openai_to_anthropic;
use crate::translate::streaming::{SseLineBuffer, StreamTranslator};

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const STREAM_CHANNEL_CAPACITY: usize = 64;
const STREAMING_PLACEHOLDER: &str = "Streaming response";

/// SSE frames for the client, already encoded.
pub type FrameStream = ReceiverStream<std::result::Result<Bytes, std::io::Error>>;

/// Sends translated requests to the upstream `chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    chat_url: String,
    fallback_api_key: Option<String>,
}

impl Forwarder {
    pub fn new(client: reqwest::Client, target_url: &str, fallback_api_key: Option<String>) -> Self {
        Self {
            client,
            chat_url: format!("{}/chat/completions", target_url.trim_end_matches('/')),
            fallback_api_key,
        }
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    /// One POST per request. The client's `x-api-key` becomes a bearer token.
    pub async fn send(
        &self,
        req: &ChatCompletionRequest,
        inbound: &HeaderMap,
    ) -> Result<reqwest::Response> {
        let body = serde_json::to_vec(req)?;
        let mut builder = self
            .client
            .post(&self.chat_url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body);

        let api_key = inbound
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .filter(|k| !k.is_empty())
            .or(self.fallback_api_key.as_deref());
        if let Some(key) = api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }

        builder
            .send()
            .await
            .map_err(|e| ProxyError::provider(format!("Request to {} failed: {e}", self.chat_url)))
    }
}

/// One inbound `/v1/messages` call, already decoded.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub client_addr: String,
    pub headers: HeaderMap,
    pub raw_body: String,
    pub request: MessagesRequest,
}

/// What the client gets back.
#[derive(Debug)]
pub enum ProxyOutcome {
    /// Translated single-shot answer.
    Message(MessagesResponse),
    /// Upstream answer relayed untouched (non-2xx, or a body we could not parse).
    Passthrough {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    /// Translated event stream.
    Stream(FrameStream),
    /// The gateway itself could not complete the exchange.
    Failed {
        status: StatusCode,
        error: ErrorResponse,
    },
}

/// Everything an exchange needs, cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct Gateway {
    forwarder: Arc<Forwarder>,
    ledger: Arc<dyn RequestLedger>,
    accountant: CostAccountant,
    tokens: Arc<TokenCounter>,
    logger: SharedLogger,
}

/// Ledger context carried from arrival to finalisation.
#[derive(Debug, Clone)]
struct EntryContext {
    request_id: String,
    entry: Option<EntryId>,
    model: String,
    started: Instant,
}

impl EntryContext {
    fn elapsed_ms(&self) -> i64 {
        i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX)
    }
}

impl Gateway {
    pub fn new(
        forwarder: Forwarder,
        ledger: Arc<dyn RequestLedger>,
        accountant: CostAccountant,
        tokens: Arc<TokenCounter>,
        logger: SharedLogger,
    ) -> Self {
        Self {
            forwarder: Arc::new(forwarder),
            ledger,
            accountant,
            tokens,
            logger,
        }
    }

    /// Run one exchange end to end.
    pub async fn handle(&self, exchange: Exchange) -> ProxyOutcome {
        let request_id = new_request_id();
        let entry = self.open_entry(&request_id, &exchange).await;

        let target = anthropic_to_openai(&exchange.request);
        self.logger.request_event(
            LogLevel::Info,
            &request_id,
            "proxy",
            format!(
                "POST {} model={} streaming={} messages={}",
                self.forwarder.chat_url(),
                target.model,
                target.stream,
                target.messages.len()
            ),
            None,
        );

        let ctx = EntryContext {
            request_id,
            entry,
            model: exchange.request.model.clone(),
            started: Instant::now(),
        };

        let response = match self.forwarder.send(&target, &exchange.headers).await {
            Ok(r) => r,
            Err(e) => return self.upstream_unreachable(&ctx, e).await,
        };

        if target.stream {
            self.relay_stream(ctx, &target.model, &exchange.raw_body, response)
                .await
        } else {
            self.relay_message(&ctx, response).await
        }
    }

    async fn open_entry(&self, request_id: &str, exchange: &Exchange) -> Option<EntryId> {
        let req = &exchange.request;
        let additional_params = json!({
            "temperature": req.temperature,
            "top_p": req.top_p,
            "top_k": req.top_k,
            "stop_sequences": req.stop_sequences,
            "presence_penalty": req.presence_penalty,
            "frequency_penalty": req.frequency_penalty,
        });

        let new_entry = NewEntry {
            request_id: request_id.to_string(),
            client_addr: exchange.client_addr.clone(),
            request_headers: headers_to_json(&exchange.headers),
            request_body: exchange.raw_body.clone(),
            request_type: "anthropic".to_string(),
            model: req.model.clone(),
            is_streaming: req.stream,
            additional_params: additional_params.to_string(),
        };

        match self.ledger.create(new_entry).await {
            Ok(id) => Some(id),
            Err(e) => {
                self.logger.request_event(
                    LogLevel::Error,
                    request_id,
                    "ledger",
                    format!("Error logging request: {e}"),
                    None,
                );
                None
            }
        }
    }

    /// Price the record (when it carries usage) and write it to the entry.
    async fn finalize(&self, ctx: &EntryContext, mut record: ResponseRecord) {
        let Some(id) = ctx.entry else {
            return;
        };

        if let Some(usage) = record.usage.as_deref() {
            record.cost = match self.accountant.calculate_cost(&ctx.model, usage).await {
                Ok(cost) => Some(cost),
                Err(e) => {
                    self.logger.request_event(
                        LogLevel::Warn,
                        &ctx.request_id,
                        "ledger",
                        format!("Error calculating cost: {e}"),
                        None,
                    );
                    Some(0.0)
                }
            };
        }

        if let Err(e) = self.ledger.update(id, record).await {
            self.logger.request_event(
                LogLevel::Error,
                &ctx.request_id,
                "ledger",
                format!("Error updating ledger entry {id}: {e}"),
                None,
            );
        }
    }

    async fn upstream_unreachable(&self, ctx: &EntryContext, err: ProxyError) -> ProxyOutcome {
        let status = StatusCode::BAD_GATEWAY;
        self.logger.request_event(
            LogLevel::Error,
            &ctx.request_id,
            "proxy",
            err.to_string(),
            Some(json!({"status": status.as_u16()})),
        );
        self.finalize(
            ctx,
            ResponseRecord {
                status: status.as_u16(),
                headers: headers_to_json(&HeaderMap::new()),
                body: err.to_string(),
                elapsed_ms: ctx.elapsed_ms(),
                ..ResponseRecord::default()
            },
        )
        .await;

        ProxyOutcome::Failed {
            status,
            error: ErrorResponse::api_error(err.to_string()),
        }
    }

    async fn unreadable_body(
        &self,
        ctx: &EntryContext,
        upstream_headers: &HeaderMap,
        err: reqwest::Error,
    ) -> ProxyOutcome {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        let message = format!("Error reading response body: {err}");
        self.logger
            .request_event(LogLevel::Error, &ctx.request_id, "proxy", message.clone(), None);
        self.finalize(
            ctx,
            ResponseRecord {
                status: status.as_u16(),
                headers: headers_to_json(upstream_headers),
                body: message.clone(),
                elapsed_ms: ctx.elapsed_ms(),
                ..ResponseRecord::default()
            },
        )
        .await;

        ProxyOutcome::Failed {
            status,
            error: ErrorResponse::api_error(message),
        }
    }

    async fn passthrough(
        &self,
        ctx: &EntryContext,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    ) -> ProxyOutcome {
        self.finalize(
            ctx,
            ResponseRecord {
                status: status.as_u16(),
                headers: headers_to_json(&headers),
                body: String::from_utf8_lossy(&body).into_owned(),
                elapsed_ms: ctx.elapsed_ms(),
                ..ResponseRecord::default()
            },
        )
        .await;

        ProxyOutcome::Passthrough {
            status,
            headers: relayable_headers(headers),
            body,
        }
    }

    async fn relay_message(&self, ctx: &EntryContext, response: reqwest::Response) -> ProxyOutcome {
        let status = response.status();
        let headers = response.headers().clone();
        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return self.unreadable_body(ctx, &headers, e).await,
        };

        if !status.is_success() {
            self.logger.request_event(
                LogLevel::Warn,
                &ctx.request_id,
                "proxy",
                format!("Upstream returned status {status}, passing through"),
                Some(json!({"status": status.as_u16(), "body_len": body.len()})),
            );
            return self.passthrough(ctx, status, headers, body).await;
        }

        let parsed: ChatCompletionResponse = match serde_json::from_slice(&body) {
            Ok(r) => r,
            Err(e) => {
                self.logger.request_event(
                    LogLevel::Warn,
                    &ctx.request_id,
                    "proxy",
                    format!("Error parsing upstream response: {e}"),
                    None,
                );
                return self.passthrough(ctx, status, headers, body).await;
            }
        };

        let translated = openai_to_anthropic(&parsed);
        let usage = (parsed.usage.total_tokens > 0)
            .then(|| UsageData {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
                ..UsageData::default()
            })
            .and_then(|u| u.to_json().ok());

        let response_body = serde_json::to_string(&translated).unwrap_or_default();
        self.logger.request_event(
            LogLevel::Info,
            &ctx.request_id,
            "proxy",
            format!(
                "Completed: in={} out={} tokens",
                translated.usage.input_tokens, translated.usage.output_tokens
            ),
            None,
        );
        self.finalize(
            ctx,
            ResponseRecord {
                status: status.as_u16(),
                headers: headers_to_json(&headers),
                body: response_body,
                elapsed_ms: ctx.elapsed_ms(),
                usage,
                cost: None,
            },
        )
        .await;

        ProxyOutcome::Message(translated)
    }

    async fn relay_stream(
        &self,
        ctx: EntryContext,
        target_model: &str,
        raw_body: &str,
        response: reqwest::Response,
    ) -> ProxyOutcome {
        let status = response.status();
        let headers = response.headers().clone();

        if let Some(id) = ctx.entry {
            let placeholder = ResponseRecord {
                status: status.as_u16(),
                headers: headers_to_json(&headers),
                body: STREAMING_PLACEHOLDER.to_string(),
                elapsed_ms: 0,
                ..ResponseRecord::default()
            };
            if let Err(e) = self.ledger.update(id, placeholder).await {
                self.logger.request_event(
                    LogLevel::Error,
                    &ctx.request_id,
                    "ledger",
                    format!("Error updating ledger entry {id}: {e}"),
                    None,
                );
            }
        }

        if !status.is_success() {
            let body = match response.bytes().await {
                Ok(b) => b,
                Err(e) => return self.unreadable_body(&ctx, &headers, e).await,
            };
            self.logger.request_event(
                LogLevel::Warn,
                &ctx.request_id,
                "stream",
                format!("Upstream returned status {status}, passing through"),
                None,
            );
            return self.passthrough(&ctx, status, headers, body).await;
        }

        let input_tokens = match self
            .tokens
            .count_tokens_in_request(raw_body, RequestSchema::Source)
        {
            Ok(n) => Some(n),
            Err(e) => {
                self.logger.request_event(
                    LogLevel::Warn,
                    &ctx.request_id,
                    "tokens",
                    format!("Error counting tokens in request: {e}"),
                    None,
                );
                None
            }
        };

        let translator = StreamTranslator::new(target_model, input_tokens, Arc::clone(&self.tokens));
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway
                .pump_stream(ctx, status, headers, response, translator, tx)
                .await;
        });

        ProxyOutcome::Stream(ReceiverStream::new(rx))
    }

    /// Read the upstream stream to its end, forwarding translated frames, then
    /// close the ledger entry. Stops early if the client goes away.
    async fn pump_stream(
        &self,
        ctx: EntryContext,
        status: StatusCode,
        upstream_headers: HeaderMap,
        response: reqwest::Response,
        mut translator: StreamTranslator,
        tx: mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
    ) {
        let mut upstream = response.bytes_stream();
        let mut lines = SseLineBuffer::default();
        let mut read_error = None;

        let mut client_connected = forward_events(&tx, translator.begin()).await;
        'read: while client_connected {
            match upstream.next().await {
                None => break,
                Some(Err(e)) => {
                    read_error = Some(e);
                    break;
                }
                Some(Ok(chunk)) => {
                    lines.push(&chunk);
                    while let Some(line) = lines.next_line() {
                        if !forward_events(&tx, translator.process_line(&line)).await {
                            client_connected = false;
                            break 'read;
                        }
                    }
                }
            }
        }

        if client_connected && read_error.is_none() {
            if let Some(rest) = lines.take_remainder() {
                forward_events(&tx, translator.process_line(&rest)).await;
            }
        }
        drop(tx);

        let record = match read_error {
            Some(e) => {
                let message = format!("Error reading from response: {e}");
                self.logger
                    .request_event(LogLevel::Error, &ctx.request_id, "stream", message.clone(), None);
                ResponseRecord {
                    status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    headers: headers_to_json(&HeaderMap::new()),
                    body: message,
                    elapsed_ms: ctx.elapsed_ms(),
                    ..ResponseRecord::default()
                }
            }
            None => {
                let level = if client_connected { LogLevel::Info } else { LogLevel::Warn };
                let message = match (client_connected, translator.is_stopped()) {
                    (false, _) => "Client disconnected, finalising with accumulated text",
                    (true, true) => "Completed streaming response",
                    (true, false) => "Upstream ended without [DONE], finalising with accumulated text",
                };
                self.logger.request_event(
                    level,
                    &ctx.request_id,
                    "stream",
                    message,
                    Some(json!({"text_len": translator.text().len()})),
                );
                ResponseRecord {
                    status: status.as_u16(),
                    headers: headers_to_json(&upstream_headers),
                    body: translator.text().to_string(),
                    elapsed_ms: ctx.elapsed_ms(),
                    usage: translator.final_usage().and_then(|u| u.to_json().ok()),
                    cost: None,
                }
            }
        };

        self.finalize(&ctx, record).await;
    }
}

/// Send each event as one SSE frame. Returns `false` once the client is gone.
async fn forward_events(
    tx: &mpsc::Sender<std::result::Result<Bytes, std::io::Error>>,
    events: Vec<StreamEvent>,
) -> bool {
    for event in events {
        let frame = match event.to_sse_frame() {
            Ok(f) => f,
            Err(e) => {
                tracing::error!("Error encoding {} event: {e}", event.event_name());
                continue;
            }
        };
        if tx.send(Ok(Bytes::from(frame))).await.is_err() {
            return false;
        }
    }
    true
}

/// Drop framing headers that no longer describe the body we send.
fn relayable_headers(mut headers: HeaderMap) -> HeaderMap {
    for name in [header::CONNECTION, header::TRANSFER_ENCODING, header::CONTENT_LENGTH] {
        headers.remove(name);
    }
    headers
}

/// Headers for a translated event stream.
pub fn stream_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ChatCompletionRequest {
        anthropic_to_openai(
            &serde_json::from_value(json!({
                "model": "gpt-4",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "hi"}],
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_forwarder_maps_api_key_to_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header_eq("authorization", "Bearer sk-client"))
            .and(header_eq("content-type", "application/json"))
            .and(body_partial_json(json!({"model": "openai/gpt-4", "max_tokens": 16})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = Forwarder::new(
            reqwest::Client::new(),
            &format!("{}/v1/", server.uri()),
            Some("sk-fallback".to_string()),
        );
        let mut inbound = HeaderMap::new();
        inbound.insert("x-api-key", HeaderValue::from_static("sk-client"));

        let response = forwarder.send(&request(), &inbound).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_forwarder_uses_fallback_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header_eq("authorization", "Bearer sk-fallback"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let forwarder = Forwarder::new(
            reqwest::Client::new(),
            &server.uri(),
            Some("sk-fallback".to_string()),
        );
        tokio_test::assert_ok!(forwarder.send(&request(), &HeaderMap::new()).await);
    }

    #[tokio::test]
    async fn test_forwarder_connection_failure_is_provider_error() {
        let forwarder = Forwarder::new(reqwest::Client::new(), "http://127.0.0.1:1", None);
        let err = forwarder
            .send(&request(), &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Provider { .. }));
    }

    #[test]
    fn test_relayable_headers_drop_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("x-request-id", HeaderValue::from_static("abc"));

        let kept = relayable_headers(headers);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept["x-request-id"], "abc");
    }
}
