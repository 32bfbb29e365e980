//! OpenAI chat completions (`/v1/chat/completions`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::model::{
    blob_to_data_url, generate_id, now_unix, part_from_url, Choice, FinishReason, InternalRequest,
    InternalResponse, Message, Part, Reasoning, ResponseFormat, Role, Tool, ToolCall, ToolChoice,
    Usage,
};
use super::{from_json, join_url, sse, to_json, Inbound, Outbound, ProviderRequest};
use crate::error::AppError;
use crate::models::channel::Channel;

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ChatContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ChatContentPart>),
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<ImageUrl>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_audio: Option<InputAudio>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<ChatFile>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InputAudio {
    /// Base64 audio bytes.
    pub data: String,
    /// Container name such as `wav` or `mp3`.
    pub format: String,
}

/// Either inline `file_data` (a data URL) or a previously uploaded `file_id`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: ChatFunctionCall,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatFunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ChatFunctionDef,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatFunctionDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChatChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChatMessage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ChatUsage {
    #[serde(default)]
    pub prompt_tokens: i64,
    #[serde(default)]
    pub completion_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: i64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub reasoning_tokens: i64,
}

// ── Conversions ───────────────────────────────────────────────────────

fn parse_role(role: Option<&str>) -> Result<Role, AppError> {
    match role.unwrap_or("assistant") {
        "system" | "developer" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        "tool" | "function" => Ok(Role::Tool),
        other => Err(AppError::invalid_format(format!("unknown role: {other}"))),
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

pub(crate) fn parse_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

pub(crate) fn finish_reason_str(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Stop => "stop".into(),
        FinishReason::Length => "length".into(),
        FinishReason::ToolCalls => "tool_calls".into(),
        FinishReason::ContentFilter => "content_filter".into(),
        FinishReason::Other(s) => s.clone(),
    }
}

fn part_from_chat(p: ChatContentPart) -> Result<Part, AppError> {
    match p.kind.as_str() {
        "text" => {
            if let Some(text) = p.text {
                return Ok(Part::Text(text));
            }
        }
        "image_url" => {
            if let Some(image) = p.image_url {
                return Ok(part_from_url(&image.url));
            }
        }
        "input_audio" => {
            if let Some(audio) = p.input_audio {
                return Ok(Part::Blob {
                    mime_type: format!("audio/{}", audio.format),
                    data: audio.data,
                });
            }
        }
        "file" => match p.file {
            Some(ChatFile {
                file_data: Some(data),
                ..
            }) => return Ok(part_from_url(&data)),
            Some(ChatFile {
                file_id: Some(id), ..
            }) => {
                return Ok(Part::FileRef {
                    mime_type: None,
                    uri: id,
                })
            }
            _ => {}
        },
        _ => {}
    }
    Err(AppError::invalid_format(format!(
        "unsupported content part: {}",
        p.kind
    )))
}

fn part_to_chat(p: &Part) -> Option<ChatContentPart> {
    match p {
        Part::Text(t) => Some(ChatContentPart {
            kind: "text".into(),
            text: Some(t.clone()),
            ..Default::default()
        }),
        Part::Blob { mime_type, data } if mime_type.starts_with("image/") => Some(ChatContentPart {
            kind: "image_url".into(),
            image_url: Some(ImageUrl {
                url: blob_to_data_url(mime_type, data),
            }),
            ..Default::default()
        }),
        Part::Blob { mime_type, data } => match mime_type.strip_prefix("audio/") {
            Some(format) => Some(ChatContentPart {
                kind: "input_audio".into(),
                input_audio: Some(InputAudio {
                    data: data.clone(),
                    format: format.to_string(),
                }),
                ..Default::default()
            }),
            None => Some(ChatContentPart {
                kind: "file".into(),
                file: Some(ChatFile {
                    file_data: Some(blob_to_data_url(mime_type, data)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
        },
        // anything that is not a URL is an uploaded file id
        Part::FileRef { uri, .. } if !uri.contains("://") => Some(ChatContentPart {
            kind: "file".into(),
            file: Some(ChatFile {
                file_id: Some(uri.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        Part::FileRef { uri, .. } => Some(ChatContentPart {
            kind: "image_url".into(),
            image_url: Some(ImageUrl { url: uri.clone() }),
            ..Default::default()
        }),
        Part::Thinking { .. } => None,
    }
}

fn message_from_chat(m: ChatMessage) -> Result<Message, AppError> {
    let mut msg = Message::new(parse_role(m.role.as_deref())?);
    msg.tool_call_id = m.tool_call_id;
    msg.name = m.name;

    if let Some(reasoning) = m.reasoning_content.filter(|r| !r.is_empty()) {
        msg.parts.push(Part::Thinking {
            text: reasoning,
            signature: None,
        });
    }
    match m.content {
        Some(ChatContent::Text(text)) => msg.parts.push(Part::Text(text)),
        Some(ChatContent::Parts(parts)) => {
            for p in parts {
                msg.parts.push(part_from_chat(p)?);
            }
        }
        None => {}
    }
    for (i, c) in m.tool_calls.unwrap_or_default().into_iter().enumerate() {
        msg.tool_calls.push(ToolCall {
            index: c.index.unwrap_or(i as u32),
            id: c.id.unwrap_or_default(),
            name: c.function.name.unwrap_or_default(),
            arguments: c.function.arguments.unwrap_or_default(),
        });
    }
    Ok(msg)
}

fn message_to_chat(m: &Message, streaming: bool) -> ChatMessage {
    let text_only = m.parts.iter().all(|p| matches!(p, Part::Text(_) | Part::Thinking { .. }));
    let content = if text_only {
        let text = m.text_content();
        // A streamed delta or a pure tool-call turn carries no content field.
        if text.is_empty() && (streaming || !m.tool_calls.is_empty()) {
            None
        } else {
            Some(ChatContent::Text(text))
        }
    } else {
        Some(ChatContent::Parts(
            m.parts.iter().filter_map(part_to_chat).collect(),
        ))
    };

    let tool_calls = (!m.tool_calls.is_empty()).then(|| {
        m.tool_calls
            .iter()
            .map(|c| ChatToolCall {
                index: streaming.then_some(c.index),
                id: (!c.id.is_empty()).then(|| c.id.clone()),
                kind: (!c.id.is_empty() || !streaming).then(|| "function".to_string()),
                function: ChatFunctionCall {
                    name: (!c.name.is_empty()).then(|| c.name.clone()),
                    arguments: Some(c.arguments.clone()),
                },
            })
            .collect()
    });

    ChatMessage {
        role: Some(role_str(m.role).to_string()),
        content,
        reasoning_content: m.thinking_content(),
        tool_calls,
        tool_call_id: m.tool_call_id.clone(),
        name: m.name.clone(),
    }
}

fn tool_choice_from_value(v: Value) -> Option<ToolChoice> {
    match v {
        Value::String(s) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "none" => Some(ToolChoice::None),
            "required" => Some(ToolChoice::Required),
            _ => None,
        },
        Value::Object(o) => o
            .get("function")
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .map(|n| ToolChoice::Function(n.to_string())),
        _ => None,
    }
}

fn tool_choice_to_value(c: &ToolChoice) -> Value {
    match c {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!("required"),
        ToolChoice::Function(name) => json!({ "type": "function", "function": { "name": name } }),
    }
}

pub(crate) fn response_format_from_value(v: &Value) -> Option<ResponseFormat> {
    match v.get("type").and_then(Value::as_str)? {
        "text" => Some(ResponseFormat::Text),
        "json_object" => Some(ResponseFormat::JsonObject),
        "json_schema" => {
            // chat nests the schema under `json_schema`, responses inlines it
            let spec = v.get("json_schema").unwrap_or(v);
            Some(ResponseFormat::JsonSchema {
                name: spec.get("name").and_then(Value::as_str).unwrap_or("response").to_string(),
                schema: spec.get("schema").cloned().unwrap_or(Value::Null),
                strict: spec.get("strict").and_then(Value::as_bool),
            })
        }
        _ => None,
    }
}

fn response_format_to_value(f: &ResponseFormat) -> Value {
    match f {
        ResponseFormat::Text => json!({ "type": "text" }),
        ResponseFormat::JsonObject => json!({ "type": "json_object" }),
        ResponseFormat::JsonSchema { name, schema, strict } => json!({
            "type": "json_schema",
            "json_schema": { "name": name, "schema": schema, "strict": strict },
        }),
    }
}

pub fn request_to_internal(req: ChatRequest) -> Result<InternalRequest, AppError> {
    let messages = req
        .messages
        .into_iter()
        .map(message_from_chat)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(InternalRequest {
        model: req.model,
        messages,
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        max_tokens: req.max_completion_tokens.or(req.max_tokens),
        stop: match req.stop {
            Some(StopSequences::One(s)) => vec![s],
            Some(StopSequences::Many(v)) => v,
            None => Vec::new(),
        },
        tools: req
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|t| Tool {
                name: t.function.name,
                description: t.function.description,
                parameters: t.function.parameters.unwrap_or_else(|| json!({ "type": "object" })),
            })
            .collect(),
        tool_choice: req.tool_choice.and_then(tool_choice_from_value),
        response_format: req.response_format.as_ref().and_then(response_format_from_value),
        reasoning: req.reasoning_effort.map(|effort| Reasoning {
            budget_tokens: None,
            effort: Some(effort),
        }),
        user: req.user,
    })
}

pub fn request_from_internal(req: &InternalRequest) -> ChatRequest {
    ChatRequest {
        model: req.model.clone(),
        messages: req.messages.iter().map(|m| message_to_chat(m, false)).collect(),
        stream: req.stream,
        stream_options: req.stream.then(|| json!({ "include_usage": true })),
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        max_completion_tokens: None,
        stop: (!req.stop.is_empty()).then(|| StopSequences::Many(req.stop.clone())),
        tools: (!req.tools.is_empty()).then(|| {
            req.tools
                .iter()
                .map(|t| ChatTool {
                    kind: "function".into(),
                    function: ChatFunctionDef {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.parameters.clone()),
                    },
                })
                .collect()
        }),
        tool_choice: req.tool_choice.as_ref().map(tool_choice_to_value),
        response_format: req.response_format.as_ref().map(response_format_to_value),
        reasoning_effort: req.reasoning.as_ref().and_then(|r| r.effort.clone()),
        user: req.user.clone(),
    }
}

fn usage_from_chat(u: ChatUsage) -> Usage {
    Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
        cached_tokens: u.prompt_tokens_details.map(|d| d.cached_tokens).unwrap_or(0),
        cache_write_tokens: 0,
        reasoning_tokens: u.completion_tokens_details.map(|d| d.reasoning_tokens).unwrap_or(0),
    }
    .normalized()
}

fn usage_to_chat(u: &Usage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
        prompt_tokens_details: (u.cached_tokens > 0).then(|| PromptTokensDetails {
            cached_tokens: u.cached_tokens,
        }),
        completion_tokens_details: (u.reasoning_tokens > 0).then(|| CompletionTokensDetails {
            reasoning_tokens: u.reasoning_tokens,
        }),
    }
}

pub fn response_to_internal(resp: ChatCompletion) -> Result<InternalResponse, AppError> {
    let choices = resp
        .choices
        .into_iter()
        .map(|c| {
            let message = match c.message.or(c.delta) {
                Some(m) => message_from_chat(m)?,
                None => Message::new(Role::Assistant),
            };
            let mut choice = Choice::new(c.index, message);
            choice.finish_reason = c.finish_reason.as_deref().map(parse_finish_reason);
            Ok(choice)
        })
        .collect::<Result<Vec<_>, AppError>>()?;

    Ok(InternalResponse {
        id: resp.id,
        model: resp.model,
        created: resp.created,
        choices,
        usage: resp.usage.map(usage_from_chat),
        prompt_block_reason: None,
    })
}

pub fn response_from_internal(resp: &InternalResponse, streaming: bool) -> ChatCompletion {
    ChatCompletion {
        id: if resp.id.is_empty() { generate_id("chatcmpl-") } else { resp.id.clone() },
        object: if streaming { "chat.completion.chunk" } else { "chat.completion" }.into(),
        created: if resp.created == 0 { now_unix() } else { resp.created },
        model: resp.model.clone(),
        choices: resp
            .choices
            .iter()
            .map(|c| {
                let m = message_to_chat(&c.message, streaming);
                let (message, delta) = if streaming { (None, Some(m)) } else { (Some(m), None) };
                ChatChoice {
                    index: c.index,
                    message,
                    delta,
                    finish_reason: c.finish_reason.as_ref().map(finish_reason_str),
                }
            })
            .collect(),
        usage: resp.usage.as_ref().map(usage_to_chat),
    }
}

// ── Transformers ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ChatInbound;

impl ChatInbound {
    pub fn boxed() -> Box<dyn Inbound> {
        Box::new(Self)
    }
}

impl Inbound for ChatInbound {
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest, AppError> {
        request_to_internal(from_json(body)?)
    }

    fn encode_response(&mut self, response: &InternalResponse) -> Result<Vec<u8>, AppError> {
        to_json(&response_from_internal(response, false))
    }

    fn encode_chunk(&mut self, chunk: &InternalResponse) -> Result<Vec<u8>, AppError> {
        Ok(sse::data(&to_json(&response_from_internal(chunk, true))?))
    }

    fn encode_done(&mut self) -> Result<Vec<u8>, AppError> {
        Ok(sse::data(b"[DONE]"))
    }
}

#[derive(Debug, Default)]
pub struct ChatOutbound;

impl ChatOutbound {
    pub fn boxed() -> Box<dyn Outbound> {
        Box::new(Self)
    }
}

impl Outbound for ChatOutbound {
    fn encode_request(
        &mut self,
        channel: &Channel,
        request: &InternalRequest,
    ) -> Result<ProviderRequest, AppError> {
        Ok(ProviderRequest {
            url: join_url(&channel.base_url, "chat/completions"),
            headers: vec![
                ("authorization".into(), format!("Bearer {}", channel.key)),
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
        if data.trim_ascii() == b"[DONE]" {
            return Ok(None);
        }
        response_to_internal(from_json(data)?).map(Some)
    }
}
