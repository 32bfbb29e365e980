//! The relay cycle: decode the client request, pick channels, call the
//! provider, convert the answer back and record a relay log.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::client::{ByteStream, Upstream};
use crate::error::AppError;
use crate::models::channel::Channel;
use crate::models::group::GroupItem;
use crate::models::relay_log::RelayLog;
use crate::services::balancer::Balancer;
use crate::services::channel_service::ChannelService;
use crate::services::group_service::GroupService;
use crate::services::price_service::PriceCache;
use crate::services::relay_log::RelayLogService;
use crate::tasks::{BackgroundTask, TaskQueue};
use crate::transformer::model::{InternalRequest, Usage};
use crate::transformer::sse::SseDecoder;
use crate::transformer::{self, Inbound, InboundType, Outbound};

/// Frames buffered between the pump task and the client body.
const STREAM_BUFFER: usize = 32;

/// Values taken from the URL instead of the body (Gemini routes).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub model: Option<String>,
    pub stream: Option<bool>,
}

pub struct Relay {
    pub channels: Arc<ChannelService>,
    pub groups: Arc<GroupService>,
    pub prices: Arc<PriceCache>,
    pub logs: Arc<RelayLogService>,
    pub tasks: TaskQueue,
    pub upstream: Arc<dyn Upstream>,
}

/// Outcome of one successful provider call.
enum Attempt {
    Complete { body: Vec<u8>, usage: Option<Usage> },
    Streaming(Box<StreamPump>),
}

impl Relay {
    /// Group items for a model whose channel exists and is enabled.
    fn candidates(&self, model: &str) -> Vec<GroupItem> {
        self.groups
            .items_for_model(model)
            .into_iter()
            .filter(|item| {
                self.channels
                    .get(item.channel_id)
                    .map(|c| c.enabled)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub async fn handle(
        self: Arc<Self>,
        kind: InboundType,
        body: &[u8],
        overrides: Overrides,
    ) -> Result<Response, AppError> {
        let mut request = new_inbound(kind)?.decode_request(body)?;
        if let Some(model) = overrides.model {
            request.model = model;
        }
        if let Some(stream) = overrides.stream {
            request.stream = stream;
        }
        if request.model.trim().is_empty() {
            return Err(AppError::InvalidFormat("model is required".into()));
        }

        let mut log = PendingLog::new(self.clone(), &request);
        let mut balancer = Balancer::new(self.candidates(&request.model));
        let mut failures: Vec<String> = Vec::new();

        while let Some(item) = balancer.next_item() {
            let Ok(channel) = self.channels.get(item.channel_id) else {
                balancer.mark_failed(item.channel_id);
                continue;
            };
            log.attempt(&channel, &item.model_name);

            let mut inbound = match new_inbound(kind) {
                Ok(inbound) => inbound,
                Err(e) => {
                    log.commit(Err(e.to_string())).await;
                    return Err(e);
                }
            };
            match self.attempt(&channel, &item.model_name, &request, inbound.as_mut()).await {
                Ok(Attempt::Complete { body, usage }) => {
                    log.commit(Ok(usage)).await;
                    return Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response());
                }
                Ok(Attempt::Streaming(pump)) => {
                    return Ok(stream_response(inbound, *pump, log));
                }
                Err(e) => {
                    failures.push(format!("{}: {}", channel.name, e));
                    balancer.mark_failed(channel.id);
                    tracing::warn!(
                        "Relay of {} via channel {} failed ({} candidates left): {}",
                        request.model,
                        channel.name,
                        balancer.remaining(),
                        e
                    );
                }
            }
        }

        let reason = if failures.is_empty() {
            format!("no channel serves model {}", request.model)
        } else {
            format!("{} ({})", request.model, failures.join("; "))
        };
        log.commit(Err(reason.clone())).await;
        Err(AppError::NoChannelAvailable(reason))
    }

    /// One provider call. For streams this returns once the first client
    /// frame exists; anything failing before that is still a failed attempt.
    async fn attempt(
        &self,
        channel: &Channel,
        model: &str,
        request: &InternalRequest,
        inbound: &mut dyn Inbound,
    ) -> Result<Attempt, AppError> {
        let mut outbound = transformer::outbound(channel.channel_type).ok_or_else(|| {
            AppError::Internal(format!("no outbound transformer for {}", channel.channel_type.as_str()))
        })?;

        let mut request = request.clone();
        request.model = model.to_string();
        let provider_request = outbound.encode_request(channel, &request)?;
        let mut upstream = self.upstream.send(channel, provider_request).await?;

        if !request.stream {
            let mut body = Vec::new();
            while let Some(chunk) = upstream.next().await {
                body.extend_from_slice(&chunk?);
            }
            let response = outbound.decode_response(&body)?;
            let encoded = inbound.encode_response(&response)?;
            return Ok(Attempt::Complete {
                body: encoded,
                usage: response.usage,
            });
        }

        let mut pump = StreamPump {
            outbound,
            upstream,
            decoder: SseDecoder::new(),
            events: VecDeque::new(),
            upstream_done: false,
            usage: None,
            chunks: 0,
            first: None,
        };
        match pump.next_frame(inbound).await? {
            Some(frame) => pump.first = Some(frame),
            None if pump.chunks == 0 => {
                return Err(AppError::Upstream("upstream returned an empty stream".into()))
            }
            None => {}
        }
        Ok(Attempt::Streaming(Box::new(pump)))
    }

    /// Price lookup plus backfill of unknown model names.
    fn cost(&self, model: &str, usage: &Usage) -> f64 {
        if !self.prices.contains(model) {
            self.tasks.submit(BackgroundTask::PriceBackfill {
                names: vec![model.to_string()],
            });
        }
        self.prices.cost(model, usage)
    }
}

fn new_inbound(kind: InboundType) -> Result<Box<dyn Inbound>, AppError> {
    transformer::inbound(kind)
        .ok_or_else(|| AppError::Internal(format!("no inbound transformer for {}", kind.as_str())))
}

// ── Streaming ──

/// Pulls upstream bytes through the SSE decoder and both transformers.
struct StreamPump {
    outbound: Box<dyn Outbound>,
    upstream: ByteStream,
    decoder: SseDecoder,
    /// Decoded event payloads not yet converted, oldest first.
    events: VecDeque<Vec<u8>>,
    upstream_done: bool,
    usage: Option<Usage>,
    /// Internal chunks seen so far.
    chunks: usize,
    /// Frame produced while the attempt was still open to failover.
    first: Option<Vec<u8>>,
}

impl StreamPump {
    /// Next non-empty client frame, `None` once upstream is exhausted.
    async fn next_frame(&mut self, inbound: &mut dyn Inbound) -> Result<Option<Vec<u8>>, AppError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                let Some(chunk) = self.outbound.decode_chunk(&event)? else {
                    continue;
                };
                self.chunks += 1;
                if chunk.usage.is_some() {
                    self.usage = chunk.usage;
                }
                let frame = inbound.encode_chunk(&chunk)?;
                if !frame.is_empty() {
                    return Ok(Some(frame));
                }
                continue;
            }
            if self.upstream_done {
                return Ok(None);
            }
            match self.upstream.next().await {
                Some(bytes) => {
                    let bytes = bytes?;
                    self.events.extend(self.decoder.feed(&bytes));
                }
                None => {
                    self.upstream_done = true;
                    self.events.extend(self.decoder.finish());
                }
            }
        }
    }
}

fn stream_response(mut inbound: Box<dyn Inbound>, mut pump: StreamPump, mut log: PendingLog) -> Response {
    let content_type = inbound.stream_content_type();
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(STREAM_BUFFER);
    log.first_token();

    tokio::spawn(async move {
        if let Some(first) = pump.first.take() {
            if tx.send(Ok(Bytes::from(first))).await.is_err() {
                // client gone; dropping `log` records the failure
                return;
            }
        }

        let outcome = loop {
            let next = tokio::select! {
                _ = tx.closed() => return,
                next = pump.next_frame(inbound.as_mut()) => next,
            };
            match next {
                Ok(Some(frame)) => {
                    log.usage_hint(pump.usage);
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let done = match inbound.encode_done() {
                        Ok(done) => done,
                        Err(e) => break Err(e.to_string()),
                    };
                    if tx.send(Ok(Bytes::from(done))).await.is_err() {
                        return;
                    }
                    break Ok(pump.usage);
                }
                Err(e) => {
                    tracing::warn!("Upstream stream broke after first byte: {}", e);
                    break Err(e.to_string());
                }
            }
        };
        log.usage_hint(pump.usage);
        log.commit(outcome).await;
        drop(tx);
    });

    (
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

// ── Relay log ──

/// The log entry of a relay in progress. Dropping it without `commit`
/// (client disconnect, aborted task) records a failure.
struct PendingLog {
    relay: Arc<Relay>,
    entry: Option<RelayLog>,
    started: Instant,
    usage: Option<Usage>,
}

impl PendingLog {
    fn new(relay: Arc<Relay>, request: &InternalRequest) -> Self {
        let entry = RelayLog {
            time: chrono::Utc::now().timestamp(),
            request_model: request.model.clone(),
            actual_model: request.model.clone(),
            is_stream: request.stream,
            ..Default::default()
        };
        Self {
            relay,
            entry: Some(entry),
            started: Instant::now(),
            usage: None,
        }
    }

    fn attempt(&mut self, channel: &Channel, model: &str) {
        if let Some(entry) = self.entry.as_mut() {
            entry.channel_id = Some(channel.id);
            entry.channel_name = Some(channel.name.clone());
            entry.actual_model = model.to_string();
        }
    }

    fn first_token(&mut self) {
        let elapsed = self.started.elapsed().as_millis() as i64;
        if let Some(entry) = self.entry.as_mut() {
            entry.first_token_ms = Some(elapsed);
        }
    }

    fn usage_hint(&mut self, usage: Option<Usage>) {
        if usage.is_some() {
            self.usage = usage;
        }
    }

    /// Finalise the entry with its outcome and usage.
    fn finish(&mut self, outcome: Result<Option<Usage>, String>) -> Option<RelayLog> {
        let mut entry = self.entry.take()?;
        entry.use_time_ms = self.started.elapsed().as_millis() as i64;
        let usage = match outcome {
            Ok(usage) => {
                entry.success = true;
                usage.or(self.usage)
            }
            Err(message) => {
                entry.error = Some(message);
                self.usage
            }
        };
        if let Some(usage) = usage {
            entry.input_tokens = usage.prompt_tokens;
            entry.output_tokens = usage.completion_tokens;
            entry.cache_read_tokens = usage.cached_tokens;
            entry.cache_write_tokens = usage.cache_write_tokens;
            entry.cost = self.relay.cost(&entry.actual_model, &usage);
        }
        Some(entry)
    }

    async fn commit(mut self, outcome: Result<Option<Usage>, String>) {
        if let Some(entry) = self.finish(outcome) {
            self.relay.logs.add(entry).await;
        }
    }
}

impl Drop for PendingLog {
    fn drop(&mut self) {
        let Some(entry) = self.finish(Err("client disconnected".into())) else {
            return;
        };
        let logs = self.relay.logs.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { logs.add(entry).await });
            }
            Err(_) => tracing::warn!("Dropped relay log {} outside the runtime", entry.request_model),
        }
    }
}
