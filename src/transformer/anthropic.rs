//! Anthropic Messages API (`/v1/messages`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::model::{
    generate_id, now_unix, part_from_url, Choice, FinishReason, InternalRequest, InternalResponse,
    Message, Part, Reasoning, Role, Tool, ToolCall, ToolChoice, Usage,
};
use super::{from_json, join_url, sse, to_json, Inbound, Outbound, ProviderRequest};
use crate::error::AppError;
use crate::models::channel::Channel;

pub const API_VERSION: &str = "2023-06-01";

/// Anthropic requires `max_tokens`; used when the client sent none.
const DEFAULT_MAX_TOKENS: i64 = 8192;

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    pub messages: Vec<AnthropicMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<AnthropicTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<Value>),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicMessage {
    pub role: String,
    pub content: AnthropicContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnthropicContent {
    Text(String),
    Blocks(Vec<Block>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        #[serde(default)]
        signature: String,
    },
    RedactedThinking {
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnthropicTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub content: Vec<Block>,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: AnthropicUsage,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct AnthropicUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cache_creation_input_tokens: i64,
    #[serde(default)]
    pub cache_read_input_tokens: i64,
}

impl AnthropicUsage {
    /// Anthropic reports uncached input only; fold the cache counters back in.
    fn to_internal(self) -> Usage {
        let prompt = self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens;
        Usage {
            prompt_tokens: prompt,
            completion_tokens: self.output_tokens,
            total_tokens: prompt + self.output_tokens,
            cached_tokens: self.cache_read_input_tokens,
            cache_write_tokens: self.cache_creation_input_tokens,
            reasoning_tokens: 0,
        }
    }

    fn from_internal(u: &Usage) -> Self {
        Self {
            input_tokens: (u.prompt_tokens - u.cached_tokens - u.cache_write_tokens).max(0),
            output_tokens: u.completion_tokens,
            cache_creation_input_tokens: u.cache_write_tokens,
            cache_read_input_tokens: u.cached_tokens,
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────

fn stop_reason_to_internal(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" | "pause_turn" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

fn stop_reason_from_internal(reason: Option<&FinishReason>) -> String {
    match reason {
        None | Some(FinishReason::Stop) => "end_turn".into(),
        Some(FinishReason::Length) => "max_tokens".into(),
        Some(FinishReason::ToolCalls) => "tool_use".into(),
        Some(FinishReason::ContentFilter) => "refusal".into(),
        Some(FinishReason::Other(s)) => s.clone(),
    }
}

fn tool_result_text(content: Option<Value>) -> String {
    match content {
        Some(Value::String(s)) => s,
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn parse_arguments(arguments: &str) -> Value {
    if arguments.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(arguments).unwrap_or_else(|_| json!({}))
}

/// One Anthropic message may become several internal ones: tool results
/// are split out into `Role::Tool` messages.
fn messages_from_anthropic(m: AnthropicMessage) -> Result<Vec<Message>, AppError> {
    let role = match m.role.as_str() {
        "user" => Role::User,
        "assistant" => Role::Assistant,
        other => return Err(AppError::invalid_format(format!("unknown role: {other}"))),
    };
    let blocks = match m.content {
        AnthropicContent::Text(text) => return Ok(vec![Message::text(role, text)]),
        AnthropicContent::Blocks(blocks) => blocks,
    };

    let mut out = Vec::new();
    let mut msg = Message::new(role);
    for block in blocks {
        match block {
            Block::Text { text } => msg.parts.push(Part::Text(text)),
            Block::Image { source } => msg.parts.push(match source {
                ImageSource::Base64 { media_type, data } => Part::Blob {
                    mime_type: media_type,
                    data,
                },
                ImageSource::Url { url } => part_from_url(&url),
            }),
            Block::ToolUse { id, name, input } => {
                let index = msg.tool_calls.len() as u32;
                msg.tool_calls.push(ToolCall {
                    index,
                    id,
                    name,
                    arguments: input.to_string(),
                });
            }
            Block::ToolResult { tool_use_id, content, .. } => {
                let mut result = Message::text(Role::Tool, tool_result_text(content));
                result.tool_call_id = Some(tool_use_id);
                out.push(result);
            }
            Block::Thinking { thinking, signature } => msg.parts.push(Part::Thinking {
                text: thinking,
                signature: (!signature.is_empty()).then_some(signature),
            }),
            Block::RedactedThinking { .. } => {}
        }
    }
    if !msg.is_empty() {
        out.push(msg);
    }
    Ok(out)
}

fn blocks_from_message(m: &Message) -> Vec<Block> {
    let mut blocks = Vec::new();
    for part in &m.parts {
        match part {
            // unsigned thinking cannot be replayed to Anthropic
            Part::Thinking { text, signature: Some(signature) } => blocks.push(Block::Thinking {
                thinking: text.clone(),
                signature: signature.clone(),
            }),
            Part::Thinking { .. } => {}
            Part::Text(text) if !text.is_empty() => blocks.push(Block::Text { text: text.clone() }),
            Part::Text(_) => {}
            Part::Blob { mime_type, data } => blocks.push(Block::Image {
                source: ImageSource::Base64 {
                    media_type: mime_type.clone(),
                    data: data.clone(),
                },
            }),
            Part::FileRef { uri, .. } => blocks.push(Block::Image {
                source: ImageSource::Url { url: uri.clone() },
            }),
        }
    }
    for call in &m.tool_calls {
        blocks.push(Block::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: parse_arguments(&call.arguments),
        });
    }
    blocks
}

fn effort_budget(effort: &str) -> i64 {
    match effort {
        "low" | "minimal" => 1024,
        "high" => 16384,
        _ => 4096,
    }
}

pub fn request_to_internal(req: MessagesRequest) -> Result<InternalRequest, AppError> {
    let mut messages = Vec::new();
    match req.system {
        Some(SystemPrompt::Text(text)) if !text.is_empty() => {
            messages.push(Message::text(Role::System, text))
        }
        Some(SystemPrompt::Blocks(blocks)) => {
            let text: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            if !text.is_empty() {
                messages.push(Message::text(Role::System, text.join("\n")));
            }
        }
        _ => {}
    }
    for m in req.messages {
        messages.extend(messages_from_anthropic(m)?);
    }

    let tool_choice = req.tool_choice.as_ref().and_then(|c| {
        match c.get("type").and_then(Value::as_str)? {
            "auto" => Some(ToolChoice::Auto),
            "any" => Some(ToolChoice::Required),
            "none" => Some(ToolChoice::None),
            "tool" => c.get("name").and_then(Value::as_str).map(|n| ToolChoice::Function(n.to_string())),
            _ => None,
        }
    });

    let reasoning = req.thinking.as_ref().and_then(|t| {
        (t.get("type").and_then(Value::as_str) == Some("enabled")).then(|| Reasoning {
            budget_tokens: t.get("budget_tokens").and_then(Value::as_i64),
            effort: None,
        })
    });

    Ok(InternalRequest {
        model: req.model,
        messages,
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        max_tokens: Some(req.max_tokens),
        stop: req.stop_sequences,
        tools: req
            .tools
            .into_iter()
            .map(|t| Tool {
                name: t.name,
                description: t.description,
                parameters: t.input_schema,
            })
            .collect(),
        tool_choice,
        response_format: None,
        reasoning,
        user: req
            .metadata
            .as_ref()
            .and_then(|m| m.get("user_id"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

pub fn request_from_internal(req: &InternalRequest) -> MessagesRequest {
    let mut messages: Vec<AnthropicMessage> = Vec::new();
    for m in req.messages.iter().filter(|m| m.role != Role::System) {
        let (role, blocks) = match m.role {
            Role::Tool => (
                "user",
                vec![Block::ToolResult {
                    tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                    content: Some(Value::String(m.text_content())),
                    is_error: None,
                }],
            ),
            Role::Assistant => ("assistant", blocks_from_message(m)),
            _ => ("user", blocks_from_message(m)),
        };
        if blocks.is_empty() {
            continue;
        }
        // roles must alternate: merge into the previous turn when they repeat
        match messages.last_mut() {
            Some(AnthropicMessage {
                role: last_role,
                content: AnthropicContent::Blocks(existing),
            }) if last_role.as_str() == role => existing.extend(blocks),
            _ => messages.push(AnthropicMessage {
                role: role.to_string(),
                content: AnthropicContent::Blocks(blocks),
            }),
        }
    }

    let thinking = req.reasoning.as_ref().and_then(|r| {
        let budget = r
            .budget_tokens
            .or_else(|| r.effort.as_deref().map(effort_budget))?;
        Some(json!({ "type": "enabled", "budget_tokens": budget }))
    });

    MessagesRequest {
        model: req.model.clone(),
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        system: req.system_text().map(SystemPrompt::Text),
        messages,
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        stop_sequences: req.stop.clone(),
        tools: req
            .tools
            .iter()
            .map(|t| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect(),
        tool_choice: req.tool_choice.as_ref().map(|c| match c {
            ToolChoice::Auto => json!({ "type": "auto" }),
            ToolChoice::None => json!({ "type": "none" }),
            ToolChoice::Required => json!({ "type": "any" }),
            ToolChoice::Function(name) => json!({ "type": "tool", "name": name }),
        }),
        thinking,
        metadata: req.user.as_ref().map(|u| json!({ "user_id": u })),
    }
}

pub fn response_to_internal(resp: MessagesResponse) -> Result<InternalResponse, AppError> {
    let mut messages = messages_from_anthropic(AnthropicMessage {
        role: "assistant".into(),
        content: AnthropicContent::Blocks(resp.content),
    })?;
    let message = messages.pop().unwrap_or_else(|| Message::new(Role::Assistant));
    let mut choice = Choice::new(0, message);
    choice.finish_reason = resp.stop_reason.as_deref().map(stop_reason_to_internal);

    Ok(InternalResponse {
        id: resp.id,
        model: resp.model,
        created: now_unix(),
        choices: vec![choice],
        usage: Some(resp.usage.to_internal()),
        prompt_block_reason: None,
    })
}

pub fn response_from_internal(resp: &InternalResponse) -> MessagesResponse {
    let choice = resp.first_choice();
    MessagesResponse {
        id: if resp.id.is_empty() { generate_id("msg_") } else { resp.id.clone() },
        kind: "message".into(),
        role: "assistant".into(),
        model: resp.model.clone(),
        content: choice.map(|c| blocks_from_response(&c.message)).unwrap_or_default(),
        stop_reason: Some(stop_reason_from_internal(choice.and_then(|c| c.finish_reason.as_ref()))),
        stop_sequence: None,
        usage: resp.usage.as_ref().map(AnthropicUsage::from_internal).unwrap_or_default(),
    }
}

/// Like `blocks_from_message`, but keeps unsigned thinking: clients may
/// display it even though it cannot be replayed.
fn blocks_from_response(m: &Message) -> Vec<Block> {
    let mut blocks: Vec<Block> = m
        .parts
        .iter()
        .filter_map(|p| match p {
            Part::Thinking { text, signature } => Some(Block::Thinking {
                thinking: text.clone(),
                signature: signature.clone().unwrap_or_default(),
            }),
            _ => None,
        })
        .collect();
    let mut rest = m.clone();
    rest.parts.retain(|p| !matches!(p, Part::Thinking { .. }));
    blocks.extend(blocks_from_message(&rest));
    blocks
}

// ── Inbound ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text,
    Thinking,
    Tool(u32),
}

/// Re-frames internal deltas as Anthropic's block-structured event stream.
#[derive(Debug, Default)]
pub struct MessagesInbound {
    started: bool,
    open: Option<(usize, OpenBlock)>,
    next_index: usize,
    finish: Option<FinishReason>,
    usage: Option<Usage>,
}

impl MessagesInbound {
    pub fn boxed() -> Box<dyn Inbound> {
        Box::new(Self::default())
    }

    fn emit(out: &mut Vec<u8>, kind: &str, mut payload: Value) -> Result<(), AppError> {
        if let Value::Object(map) = &mut payload {
            map.insert("type".into(), json!(kind));
        }
        out.extend_from_slice(&sse::event(kind, &to_json(&payload)?));
        Ok(())
    }

    fn close_block(&mut self, out: &mut Vec<u8>) -> Result<(), AppError> {
        if let Some((index, _)) = self.open.take() {
            Self::emit(out, "content_block_stop", json!({ "index": index }))?;
        }
        Ok(())
    }

    /// Make `kind` the open block, closing any other. Returns its index.
    fn ensure_block(&mut self, out: &mut Vec<u8>, kind: OpenBlock, start: Value) -> Result<usize, AppError> {
        if let Some((index, open)) = self.open {
            if open == kind {
                return Ok(index);
            }
        }
        self.close_block(out)?;
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some((index, kind));
        Self::emit(out, "content_block_start", json!({ "index": index, "content_block": start }))?;
        Ok(index)
    }
}

impl Inbound for MessagesInbound {
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest, AppError> {
        request_to_internal(from_json(body)?)
    }

    fn encode_response(&mut self, response: &InternalResponse) -> Result<Vec<u8>, AppError> {
        to_json(&response_from_internal(response))
    }

    fn encode_chunk(&mut self, chunk: &InternalResponse) -> Result<Vec<u8>, AppError> {
        let mut out = Vec::new();
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }
        if !self.started {
            self.started = true;
            let usage = chunk.usage.as_ref().map(AnthropicUsage::from_internal).unwrap_or_default();
            let message = json!({
                "id": if chunk.id.is_empty() { generate_id("msg_") } else { chunk.id.clone() },
                "type": "message",
                "role": "assistant",
                "model": chunk.model,
                "content": [],
                "stop_reason": null,
                "stop_sequence": null,
                "usage": { "input_tokens": usage.input_tokens, "output_tokens": 0 },
            });
            Self::emit(&mut out, "message_start", json!({ "message": message }))?;
        }

        let Some(choice) = chunk.first_choice() else {
            return Ok(out);
        };
        if let Some(reason) = &choice.finish_reason {
            self.finish = Some(reason.clone());
        }

        for part in &choice.message.parts {
            match part {
                Part::Thinking { text, signature } => {
                    let index = self.ensure_block(
                        &mut out,
                        OpenBlock::Thinking,
                        json!({ "type": "thinking", "thinking": "" }),
                    )?;
                    if !text.is_empty() {
                        let delta = json!({ "type": "thinking_delta", "thinking": text });
                        Self::emit(&mut out, "content_block_delta", json!({ "index": index, "delta": delta }))?;
                    }
                    if let Some(signature) = signature {
                        let delta = json!({ "type": "signature_delta", "signature": signature });
                        Self::emit(&mut out, "content_block_delta", json!({ "index": index, "delta": delta }))?;
                    }
                }
                Part::Text(text) if !text.is_empty() => {
                    let index = self.ensure_block(
                        &mut out,
                        OpenBlock::Text,
                        json!({ "type": "text", "text": "" }),
                    )?;
                    let delta = json!({ "type": "text_delta", "text": text });
                    Self::emit(&mut out, "content_block_delta", json!({ "index": index, "delta": delta }))?;
                }
                _ => {}
            }
        }

        for call in &choice.message.tool_calls {
            let start = json!({ "type": "tool_use", "id": call.id, "name": call.name, "input": {} });
            let index = self.ensure_block(&mut out, OpenBlock::Tool(call.index), start)?;
            if !call.arguments.is_empty() {
                let delta = json!({ "type": "input_json_delta", "partial_json": call.arguments });
                Self::emit(&mut out, "content_block_delta", json!({ "index": index, "delta": delta }))?;
            }
        }
        Ok(out)
    }

    fn encode_done(&mut self) -> Result<Vec<u8>, AppError> {
        let mut out = Vec::new();
        self.close_block(&mut out)?;
        let usage = self.usage.as_ref().map(AnthropicUsage::from_internal).unwrap_or_default();
        Self::emit(
            &mut out,
            "message_delta",
            json!({
                "delta": {
                    "stop_reason": stop_reason_from_internal(self.finish.as_ref()),
                    "stop_sequence": null,
                },
                "usage": usage,
            }),
        )?;
        Self::emit(&mut out, "message_stop", json!({}))?;
        Ok(out)
    }
}

// ── Outbound ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct MessagesOutbound {
    id: String,
    model: String,
    created: i64,
    usage: AnthropicUsage,
    /// (content block index, tool call index) for open tool_use blocks.
    tool_blocks: Vec<(u64, u32)>,
}

impl MessagesOutbound {
    pub fn boxed() -> Box<dyn Outbound> {
        Box::new(Self::default())
    }

    fn chunk(&self, message: Message) -> InternalResponse {
        InternalResponse {
            id: self.id.clone(),
            model: self.model.clone(),
            created: self.created,
            choices: vec![Choice::new(0, message)],
            usage: None,
            prompt_block_reason: None,
        }
    }
}

impl Outbound for MessagesOutbound {
    fn encode_request(
        &mut self,
        channel: &Channel,
        request: &InternalRequest,
    ) -> Result<ProviderRequest, AppError> {
        Ok(ProviderRequest {
            url: join_url(&channel.base_url, "messages"),
            headers: vec![
                ("x-api-key".into(), channel.key.clone()),
                ("anthropic-version".into(), API_VERSION.into()),
                ("content-type".into(), "application/json".into()),
            ],
            body: to_json(&request_from_internal(request))?,
            stream: request.stream,
        })
    }

    fn decode_response(&mut self, body: &[u8]) -> Result<InternalResponse, AppError> {
        response_to_internal(from_json(body)?)
    }

    fn decode_chunk(&mut self, data: &[u8]) -> Result<Option<InternalResponse>, AppError> {
        let event: Value = from_json(data)?;
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
        let index = event.get("index").and_then(Value::as_u64).unwrap_or(0);

        match kind {
            "message_start" => {
                let message: MessagesResponse = serde_json::from_value(event["message"].clone())
                    .map_err(AppError::invalid_format)?;
                self.id = message.id;
                self.model = message.model;
                self.created = now_unix();
                self.usage = message.usage;
                Ok(None)
            }
            "content_block_start" => {
                let block: Block = serde_json::from_value(event["content_block"].clone())
                    .map_err(AppError::invalid_format)?;
                let mut message = Message::new(Role::Assistant);
                match block {
                    Block::ToolUse { id, name, .. } => {
                        let call_index = self.tool_blocks.len() as u32;
                        self.tool_blocks.push((index, call_index));
                        message.tool_calls.push(ToolCall {
                            index: call_index,
                            id,
                            name,
                            arguments: String::new(),
                        });
                    }
                    Block::Text { text } if !text.is_empty() => message.parts.push(Part::Text(text)),
                    _ => return Ok(None),
                }
                Ok(Some(self.chunk(message)))
            }
            "content_block_delta" => {
                let delta = &event["delta"];
                let text = |field: &str| delta.get(field).and_then(Value::as_str).unwrap_or_default().to_string();
                let mut message = Message::new(Role::Assistant);
                match delta.get("type").and_then(Value::as_str).unwrap_or_default() {
                    "text_delta" => message.parts.push(Part::Text(text("text"))),
                    "thinking_delta" => message.parts.push(Part::Thinking {
                        text: text("thinking"),
                        signature: None,
                    }),
                    "signature_delta" => message.parts.push(Part::Thinking {
                        text: String::new(),
                        signature: Some(text("signature")),
                    }),
                    "input_json_delta" => {
                        let Some((_, call_index)) = self.tool_blocks.iter().find(|(b, _)| *b == index) else {
                            return Ok(None);
                        };
                        message.tool_calls.push(ToolCall {
                            index: *call_index,
                            arguments: text("partial_json"),
                            ..Default::default()
                        });
                    }
                    _ => return Ok(None),
                }
                Ok(Some(self.chunk(message)))
            }
            "message_delta" => {
                if let Some(u) = event.get("usage") {
                    let field = |name: &str| u.get(name).and_then(Value::as_i64);
                    if let Some(output) = field("output_tokens") {
                        self.usage.output_tokens = output;
                    }
                    if let Some(input) = field("input_tokens") {
                        self.usage.input_tokens = input;
                    }
                    if let Some(read) = field("cache_read_input_tokens") {
                        self.usage.cache_read_input_tokens = read;
                    }
                    if let Some(write) = field("cache_creation_input_tokens") {
                        self.usage.cache_creation_input_tokens = write;
                    }
                }
                let mut chunk = self.chunk(Message::new(Role::Assistant));
                chunk.choices[0].finish_reason = event
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                    .map(stop_reason_to_internal);
                chunk.usage = Some(self.usage.to_internal());
                Ok(Some(chunk))
            }
            "error" => {
                let message = event
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream stream error");
                Err(AppError::Upstream(message.to_string()))
            }
            // ping, content_block_stop, message_stop
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{test_channel, ChannelType};
    use pretty_assertions::assert_eq;

    #[test]
    fn tool_results_split_into_tool_messages() {
        let body = r#"{
            "model": "claude-sonnet-4",
            "max_tokens": 512,
            "system": [{"type": "text", "text": "you are helpful"}],
            "messages": [
                {"role": "user", "content": "weather in Paris?"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "checking"},
                    {"type": "tool_use", "id": "toolu_1", "name": "weather", "input": {"city": "Paris"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": [{"type": "text", "text": "18C"}]},
                    {"type": "text", "text": "thanks"}
                ]}
            ],
            "tool_choice": {"type": "any"},
            "thinking": {"type": "enabled", "budget_tokens": 2048}
        }"#;
        let req = MessagesInbound::default().decode_request(body.as_bytes()).unwrap();
        let roles: Vec<Role> = req.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::Tool, Role::User]);
        assert_eq!(req.messages[2].tool_calls[0].arguments, r#"{"city":"Paris"}"#);
        assert_eq!(req.messages[3].text_content(), "18C");
        assert_eq!(req.tool_choice, Some(ToolChoice::Required));
        assert_eq!(req.reasoning.unwrap().budget_tokens, Some(2048));
        assert_eq!(req.max_tokens, Some(512));
    }

    #[test]
    fn outbound_merges_consecutive_tool_results() {
        let mut assistant = Message::new(Role::Assistant);
        for (i, id) in ["a", "b"].iter().enumerate() {
            assistant.tool_calls.push(ToolCall {
                index: i as u32,
                id: id.to_string(),
                name: "f".into(),
                arguments: "{}".into(),
            });
        }
        let mut ra = Message::text(Role::Tool, "1");
        ra.tool_call_id = Some("a".into());
        let mut rb = Message::text(Role::Tool, "2");
        rb.tool_call_id = Some("b".into());
        let req = InternalRequest {
            model: "claude".into(),
            messages: vec![
                Message::text(Role::System, "sys"),
                Message::text(Role::User, "go"),
                assistant,
                ra,
                rb,
            ],
            ..Default::default()
        };

        let channel = test_channel(1, ChannelType::Anthropic);
        let out = MessagesOutbound::default().encode_request(&channel, &req).unwrap();
        assert_eq!(out.url, "https://upstream.test/v1/messages");
        assert!(out.headers.contains(&("x-api-key".to_string(), "sk-test-0000".to_string())));
        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["system"], json!("sys"));
        assert_eq!(body["max_tokens"], json!(DEFAULT_MAX_TOKENS));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[2]["role"], json!("user"));
        assert_eq!(messages[2]["content"].as_array().unwrap().len(), 2);
        assert_eq!(messages[1]["content"][0]["input"], json!({}));
    }

    #[test]
    fn usage_folds_cache_into_prompt() {
        let body = r#"{
            "id": "msg_1", "type": "message", "role": "assistant", "model": "claude",
            "content": [{"type": "text", "text": "hi"}],
            "stop_reason": "max_tokens", "stop_sequence": null,
            "usage": {"input_tokens": 10, "output_tokens": 5,
                      "cache_read_input_tokens": 100, "cache_creation_input_tokens": 20}
        }"#;
        let resp = MessagesOutbound::default().decode_response(body.as_bytes()).unwrap();
        let usage = resp.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 130);
        assert_eq!(usage.cached_tokens, 100);
        assert_eq!(usage.cache_write_tokens, 20);
        assert_eq!(usage.total_tokens, 135);
        assert_eq!(resp.finish_reason(), Some(&FinishReason::Length));

        let encoded: Value =
            serde_json::from_slice(&MessagesInbound::default().encode_response(&resp).unwrap()).unwrap();
        assert_eq!(encoded["usage"]["input_tokens"], json!(10));
        assert_eq!(encoded["stop_reason"], json!("max_tokens"));
    }

    #[test]
    fn outbound_stream_maps_tool_blocks() {
        let mut out = MessagesOutbound::default();
        let events: [&[u8]; 6] = [
            br#"{"type":"message_start","message":{"id":"msg_1","model":"claude","content":[],"stop_reason":null,"stop_sequence":null,"usage":{"input_tokens":7,"output_tokens":1}}}"#,
            br#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            br#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"ok"}}"#,
            br#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"f","input":{}}}"#,
            br#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"x\":1}"}}"#,
            br#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
        ];
        let chunks: Vec<InternalResponse> = events
            .iter()
            .filter_map(|e| out.decode_chunk(e).unwrap())
            .collect();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].choices[0].message.text_content(), "ok");
        assert_eq!(chunks[1].choices[0].message.tool_calls[0].id, "toolu_1");
        assert_eq!(chunks[2].choices[0].message.tool_calls[0].arguments, "{\"x\":1}");
        let last = &chunks[3];
        assert_eq!(last.finish_reason(), Some(&FinishReason::ToolCalls));
        assert_eq!(last.usage, Some(Usage::new(7, 9)));
        assert_eq!(last.id, "msg_1");
    }

    #[test]
    fn inbound_stream_opens_and_closes_blocks() {
        let mut inbound = MessagesInbound::default();
        let mut text = InternalResponse {
            model: "m".into(),
            choices: vec![Choice::new(0, Message::text(Role::Assistant, "hi"))],
            ..Default::default()
        };
        let mut call = Message::new(Role::Assistant);
        call.tool_calls.push(ToolCall {
            index: 0,
            id: "t1".into(),
            name: "f".into(),
            arguments: "{}".into(),
        });

        let mut stream = inbound.encode_chunk(&text).unwrap();
        text.choices[0] = Choice::new(0, call);
        text.choices[0].finish_reason = Some(FinishReason::ToolCalls);
        stream.extend(inbound.encode_chunk(&text).unwrap());
        stream.extend(inbound.encode_done().unwrap());

        let names: Vec<String> = String::from_utf8(stream)
            .unwrap()
            .lines()
            .filter_map(|l| l.strip_prefix("event: ").map(str::to_string))
            .collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }
}
