//! Wire-format conversion.
//!
//! Each supported format provides an [`Inbound`] (client-facing) and an
//! [`Outbound`] (provider-facing) implementation. Both convert through the
//! internal representation in [`model`], so a new format needs one pair of
//! implementations, not one converter per other format.
//!
//! Instances are created fresh per relay because streaming conversion keeps
//! per-stream state (open content blocks, accumulated text, usage).

pub mod anthropic;
pub mod gemini;
pub mod model;
pub mod openai_chat;
pub mod openai_response;
pub mod sse;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::channel::{Channel, ChannelType};
use model::{InternalRequest, InternalResponse};

/// Client-facing wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundType {
    OpenaiChat,
    OpenaiResponse,
    Anthropic,
    Gemini,
}

impl InboundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboundType::OpenaiChat => "openai_chat",
            InboundType::OpenaiResponse => "openai_response",
            InboundType::Anthropic => "anthropic",
            InboundType::Gemini => "gemini",
        }
    }
}

/// Client-facing conversion.
pub trait Inbound: Send {
    /// Parse a client request body. Malformed input is `InvalidFormat`.
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest, AppError>;

    /// Serialize a complete, non-streamed response.
    fn encode_response(&mut self, response: &InternalResponse) -> Result<Vec<u8>, AppError>;

    /// Serialize one streamed unit, already framed for the transport.
    /// May return an empty buffer when the unit produces no client event.
    fn encode_chunk(&mut self, chunk: &InternalResponse) -> Result<Vec<u8>, AppError>;

    /// Terminal frame(s), emitted once after the last chunk.
    fn encode_done(&mut self) -> Result<Vec<u8>, AppError>;

    /// Content type of streamed responses.
    fn stream_content_type(&self) -> &'static str {
        "text/event-stream"
    }
}

/// A request ready to be sent to a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stream: bool,
}

/// Provider-facing conversion.
pub trait Outbound: Send {
    fn encode_request(
        &mut self,
        channel: &Channel,
        request: &InternalRequest,
    ) -> Result<ProviderRequest, AppError>;

    fn decode_response(&mut self, body: &[u8]) -> Result<InternalResponse, AppError>;

    /// Decode the data payload of one upstream stream event. `None` for
    /// events that carry nothing the client needs (pings, sentinels).
    fn decode_chunk(&mut self, data: &[u8]) -> Result<Option<InternalResponse>, AppError>;
}

type InboundFactory = fn() -> Box<dyn Inbound>;
type OutboundFactory = fn() -> Box<dyn Outbound>;

const INBOUND_FACTORIES: &[(InboundType, InboundFactory)] = &[
    (InboundType::OpenaiChat, openai_chat::ChatInbound::boxed),
    (InboundType::OpenaiResponse, openai_response::ResponseInbound::boxed),
    (InboundType::Anthropic, anthropic::MessagesInbound::boxed),
    (InboundType::Gemini, gemini::GeminiInbound::boxed),
];

const OUTBOUND_FACTORIES: &[(ChannelType, OutboundFactory)] = &[
    (ChannelType::OpenaiChat, openai_chat::ChatOutbound::boxed),
    (ChannelType::OpenaiResponse, openai_response::ResponseOutbound::boxed),
    (ChannelType::Anthropic, anthropic::MessagesOutbound::boxed),
    (ChannelType::Gemini, gemini::GeminiOutbound::boxed),
];

/// Fresh inbound transformer, or `None` if the format is not registered.
pub fn inbound(kind: InboundType) -> Option<Box<dyn Inbound>> {
    INBOUND_FACTORIES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, factory)| factory())
}

/// Fresh outbound transformer, or `None` if the format is not registered.
pub fn outbound(kind: ChannelType) -> Option<Box<dyn Outbound>> {
    OUTBOUND_FACTORIES
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, factory)| factory())
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path.trim_start_matches('/'))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, AppError> {
    serde_json::to_vec(value).map_err(|e| AppError::Internal(format!("JSON serialization error: {e}")))
}

pub(crate) fn from_json<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, AppError> {
    serde_json::from_slice(body).map_err(AppError::invalid_format)
}
