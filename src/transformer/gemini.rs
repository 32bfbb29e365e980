//! Google Gemini `generateContent` / `streamGenerateContent`.
//!
//! The request body carries no model or stream flag; the route handler
//! fills both in from the URL after decoding.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::model::{
    generate_id, now_unix, Choice, FinishReason, InternalRequest, InternalResponse, Message, Part,
    Reasoning, ResponseFormat, Role, SafetyRating, Tool, ToolCall, ToolChoice, Usage,
};
use super::{from_json, join_url, sse, to_json, Inbound, Outbound, ProviderRequest};
use crate::error::AppError;
use crate::models::channel::Channel;

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    #[serde(default)]
    pub contents: Vec<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<GeminiTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_settings: Vec<Value>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<GeminiPart>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<InlineData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<FileData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_response: Option<FunctionResponse>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub thought: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub file_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub response: Value,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiTool {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_json_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<ThinkingConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThinkingConfig {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub include_thoughts: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_level: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_feedback: Option<PromptFeedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_ratings: Vec<GeminiSafetyRating>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GeminiSafetyRating {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub probability: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub blocked: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub safety_ratings: Vec<GeminiSafetyRating>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: i64,
    #[serde(default)]
    pub candidates_token_count: i64,
    #[serde(default)]
    pub total_token_count: i64,
    #[serde(default)]
    pub cached_content_token_count: i64,
    #[serde(default)]
    pub thoughts_token_count: i64,
}

impl UsageMetadata {
    fn to_internal(self) -> Usage {
        // thoughts are billed as output but reported apart from candidates
        let completion = self.candidates_token_count + self.thoughts_token_count;
        Usage {
            prompt_tokens: self.prompt_token_count,
            completion_tokens: completion,
            total_tokens: self.prompt_token_count + completion,
            cached_tokens: self.cached_content_token_count,
            cache_write_tokens: 0,
            reasoning_tokens: self.thoughts_token_count,
        }
    }

    fn from_internal(u: &Usage) -> Self {
        Self {
            prompt_token_count: u.prompt_tokens,
            candidates_token_count: u.completion_tokens - u.reasoning_tokens,
            total_token_count: u.total_tokens,
            cached_content_token_count: u.cached_tokens,
            thoughts_token_count: u.reasoning_tokens,
        }
    }
}

// ── Conversions ───────────────────────────────────────────────────────

fn finish_reason_to_internal(reason: &str, has_calls: bool) -> FinishReason {
    match reason {
        "STOP" if has_calls => FinishReason::ToolCalls,
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" | "IMAGE_SAFETY" => {
            FinishReason::ContentFilter
        }
        other => FinishReason::Other(other.to_lowercase()),
    }
}

fn finish_reason_from_internal(reason: &FinishReason) -> String {
    match reason {
        FinishReason::Stop | FinishReason::ToolCalls => "STOP".into(),
        FinishReason::Length => "MAX_TOKENS".into(),
        FinishReason::ContentFilter => "SAFETY".into(),
        FinishReason::Other(s) => s.to_uppercase(),
    }
}

fn parse_arguments(arguments: &str) -> Value {
    serde_json::from_str::<Value>(arguments)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({}))
}

/// Gemini expects an object as function response; wrap anything else.
fn function_response_body(text: &str) -> Value {
    match serde_json::from_str::<Value>(text) {
        Ok(v @ Value::Object(_)) => v,
        _ => json!({ "content": text }),
    }
}

fn text_of(content: &Content) -> String {
    content.parts.iter().filter_map(|p| p.text.as_deref()).collect()
}

pub fn request_to_internal(req: GenerateContentRequest) -> Result<InternalRequest, AppError> {
    let mut messages = Vec::new();
    if let Some(system) = &req.system_instruction {
        let text = text_of(system);
        if !text.is_empty() {
            messages.push(Message::text(Role::System, text));
        }
    }

    // (id, name, answered) of calls seen so far, for responses without ids
    let mut calls: Vec<(String, String, bool)> = Vec::new();
    for content in req.contents {
        let role = match content.role.as_deref().unwrap_or("user") {
            "user" | "function" => Role::User,
            "model" => Role::Assistant,
            other => return Err(AppError::invalid_format(format!("unknown role: {other}"))),
        };
        let mut msg = Message::new(role);
        let mut results = Vec::new();
        for part in content.parts {
            if let Some(call) = part.function_call {
                let id = call.id.unwrap_or_else(|| format!("call_{}_{}", call.name, calls.len()));
                calls.push((id.clone(), call.name.clone(), false));
                msg.tool_calls.push(ToolCall {
                    index: msg.tool_calls.len() as u32,
                    id,
                    name: call.name,
                    arguments: call.args.to_string(),
                });
            } else if let Some(resp) = part.function_response {
                let pending = calls
                    .iter_mut()
                    .find(|(id, name, answered)| match &resp.id {
                        Some(rid) => id == rid,
                        None => !*answered && *name == resp.name,
                    });
                let id = match pending {
                    Some(entry) => {
                        entry.2 = true;
                        entry.0.clone()
                    }
                    None => resp.id.clone().unwrap_or_else(|| format!("call_{}", resp.name)),
                };
                let mut result = Message::text(Role::Tool, resp.response.to_string());
                result.tool_call_id = Some(id);
                result.name = Some(resp.name);
                results.push(result);
            } else if let Some(text) = part.text {
                msg.parts.push(if part.thought {
                    Part::Thinking {
                        text,
                        signature: part.thought_signature,
                    }
                } else {
                    Part::Text(text)
                });
            } else if let Some(blob) = part.inline_data {
                msg.parts.push(Part::Blob {
                    mime_type: blob.mime_type,
                    data: blob.data,
                });
            } else if let Some(file) = part.file_data {
                msg.parts.push(Part::FileRef {
                    mime_type: file.mime_type,
                    uri: file.file_uri,
                });
            }
        }
        messages.extend(results);
        if !msg.is_empty() {
            messages.push(msg);
        }
    }

    let tool_choice = req.tool_config.as_ref().and_then(|c| {
        let config = c.get("functionCallingConfig")?;
        let allowed = config
            .get("allowedFunctionNames")
            .and_then(Value::as_array)
            .and_then(|names| names.first())
            .and_then(Value::as_str);
        match (config.get("mode").and_then(Value::as_str)?, allowed) {
            ("ANY", Some(name)) => Some(ToolChoice::Function(name.to_string())),
            ("ANY", None) => Some(ToolChoice::Required),
            ("NONE", _) => Some(ToolChoice::None),
            ("AUTO", _) => Some(ToolChoice::Auto),
            _ => None,
        }
    });

    let config = req.generation_config.unwrap_or_default();
    let response_format = match config.response_mime_type.as_deref() {
        Some("application/json") => Some(
            match config.response_json_schema.or(config.response_schema) {
                Some(schema) => ResponseFormat::JsonSchema {
                    name: "response".into(),
                    schema,
                    strict: None,
                },
                None => ResponseFormat::JsonObject,
            },
        ),
        _ => None,
    };
    let reasoning = config.thinking_config.map(|t| Reasoning {
        budget_tokens: t.thinking_budget,
        effort: t.thinking_level,
    });

    Ok(InternalRequest {
        model: String::new(),
        messages,
        stream: false,
        temperature: config.temperature,
        top_p: config.top_p,
        top_k: config.top_k,
        max_tokens: config.max_output_tokens,
        stop: config.stop_sequences,
        tools: req
            .tools
            .into_iter()
            .flat_map(|t| t.function_declarations)
            .map(|f| Tool {
                name: f.name,
                description: f.description,
                parameters: f.parameters.unwrap_or_else(|| json!({ "type": "object" })),
            })
            .collect(),
        tool_choice,
        response_format,
        reasoning,
        user: None,
    })
}

fn parts_from_message(m: &Message, include_thoughts: bool) -> Vec<GeminiPart> {
    let mut parts = Vec::new();
    for part in &m.parts {
        match part {
            Part::Text(text) if !text.is_empty() => parts.push(GeminiPart {
                text: Some(text.clone()),
                ..Default::default()
            }),
            Part::Thinking { text, signature } if include_thoughts => parts.push(GeminiPart {
                text: Some(text.clone()),
                thought: true,
                thought_signature: signature.clone(),
                ..Default::default()
            }),
            Part::Blob { mime_type, data } => parts.push(GeminiPart {
                inline_data: Some(InlineData {
                    mime_type: mime_type.clone(),
                    data: data.clone(),
                }),
                ..Default::default()
            }),
            Part::FileRef { mime_type, uri } => parts.push(GeminiPart {
                file_data: Some(FileData {
                    mime_type: mime_type.clone(),
                    file_uri: uri.clone(),
                }),
                ..Default::default()
            }),
            _ => {}
        }
    }
    for call in &m.tool_calls {
        parts.push(GeminiPart {
            function_call: Some(FunctionCall {
                id: (!call.id.is_empty()).then(|| call.id.clone()),
                name: call.name.clone(),
                args: parse_arguments(&call.arguments),
            }),
            ..Default::default()
        });
    }
    parts
}

pub fn request_from_internal(req: &InternalRequest) -> GenerateContentRequest {
    let mut contents: Vec<Content> = Vec::new();
    for m in req.messages.iter().filter(|m| m.role != Role::System) {
        let (role, parts) = match m.role {
            Role::Tool => {
                let call_id = m.tool_call_id.as_deref().unwrap_or_default();
                let name = req
                    .tool_name_for(call_id)
                    .map(str::to_string)
                    .or_else(|| m.name.clone())
                    .unwrap_or_default();
                let part = GeminiPart {
                    function_response: Some(FunctionResponse {
                        id: None,
                        name,
                        response: function_response_body(&m.text_content()),
                    }),
                    ..Default::default()
                };
                ("user", vec![part])
            }
            Role::Assistant => ("model", parts_from_message(m, false)),
            _ => ("user", parts_from_message(m, false)),
        };
        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let (response_mime_type, response_json_schema) = match &req.response_format {
        Some(ResponseFormat::JsonObject) => (Some("application/json".to_string()), None),
        Some(ResponseFormat::JsonSchema { schema, .. }) => {
            (Some("application/json".to_string()), Some(schema.clone()))
        }
        _ => (None, None),
    };

    GenerateContentRequest {
        contents,
        system_instruction: req.system_text().map(|text| Content {
            role: None,
            parts: vec![GeminiPart {
                text: Some(text),
                ..Default::default()
            }],
        }),
        tools: if req.tools.is_empty() {
            Vec::new()
        } else {
            vec![GeminiTool {
                function_declarations: req
                    .tools
                    .iter()
                    .map(|t| FunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: Some(t.parameters.clone()),
                    })
                    .collect(),
            }]
        },
        tool_config: req.tool_choice.as_ref().map(|c| {
            let config = match c {
                ToolChoice::Auto => json!({ "mode": "AUTO" }),
                ToolChoice::None => json!({ "mode": "NONE" }),
                ToolChoice::Required => json!({ "mode": "ANY" }),
                ToolChoice::Function(name) => json!({ "mode": "ANY", "allowedFunctionNames": [name] }),
            };
            json!({ "functionCallingConfig": config })
        }),
        generation_config: Some(GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: req.top_k,
            max_output_tokens: req.max_tokens,
            stop_sequences: req.stop.clone(),
            response_mime_type,
            response_schema: None,
            response_json_schema,
            thinking_config: req.reasoning.as_ref().map(|r| ThinkingConfig {
                include_thoughts: true,
                thinking_budget: r.budget_tokens,
                thinking_level: if r.budget_tokens.is_some() { None } else { r.effort.clone() },
            }),
        }),
        safety_settings: Vec::new(),
    }
}

/// Convert one (possibly partial) response. `next_call` numbers tool calls
/// across stream chunks; `saw_calls` records whether any arrived so a later
/// `STOP` maps to `ToolCalls`.
fn response_to_internal(
    resp: GenerateContentResponse,
    next_call: &mut u32,
    saw_calls: &mut bool,
) -> InternalResponse {
    let mut choices = Vec::new();
    for candidate in resp.candidates {
        let mut message = Message::new(Role::Assistant);
        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(call) = part.function_call {
                *saw_calls = true;
                message.tool_calls.push(ToolCall {
                    index: *next_call,
                    id: call.id.unwrap_or_else(|| generate_id("call_")),
                    name: call.name,
                    arguments: call.args.to_string(),
                });
                *next_call += 1;
            } else if let Some(text) = part.text {
                message.parts.push(if part.thought {
                    Part::Thinking {
                        text,
                        signature: part.thought_signature,
                    }
                } else {
                    Part::Text(text)
                });
            } else if let Some(blob) = part.inline_data {
                message.parts.push(Part::Blob {
                    mime_type: blob.mime_type,
                    data: blob.data,
                });
            }
        }
        let mut choice = Choice::new(candidate.index, message);
        choice.finish_reason = candidate
            .finish_reason
            .as_deref()
            .map(|r| finish_reason_to_internal(r, *saw_calls));
        choice.safety_ratings = candidate
            .safety_ratings
            .into_iter()
            .map(|r| SafetyRating {
                category: r.category,
                probability: r.probability,
                blocked: r.blocked,
            })
            .collect();
        choices.push(choice);
    }

    let prompt_block_reason = resp.prompt_feedback.and_then(|f| f.block_reason);
    if choices.is_empty() && prompt_block_reason.is_some() {
        let mut choice = Choice::new(0, Message::new(Role::Assistant));
        choice.finish_reason = Some(FinishReason::ContentFilter);
        choices.push(choice);
    }

    InternalResponse {
        id: resp.response_id.unwrap_or_default(),
        model: resp.model_version.unwrap_or_default(),
        created: now_unix(),
        choices,
        usage: resp.usage_metadata.map(UsageMetadata::to_internal),
        prompt_block_reason,
    }
}

fn response_from_internal(resp: &InternalResponse) -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: resp
            .choices
            .iter()
            .map(|c| Candidate {
                content: Some(Content {
                    role: Some("model".into()),
                    parts: parts_from_message(&c.message, true),
                }),
                finish_reason: c.finish_reason.as_ref().map(finish_reason_from_internal),
                index: c.index,
                safety_ratings: c
                    .safety_ratings
                    .iter()
                    .map(|r| GeminiSafetyRating {
                        category: r.category.clone(),
                        probability: r.probability.clone(),
                        blocked: r.blocked,
                    })
                    .collect(),
            })
            .collect(),
        prompt_feedback: resp.prompt_block_reason.as_ref().map(|reason| PromptFeedback {
            block_reason: Some(reason.clone()),
            safety_ratings: Vec::new(),
        }),
        usage_metadata: resp.usage.as_ref().map(UsageMetadata::from_internal),
        model_version: (!resp.model.is_empty()).then(|| resp.model.clone()),
        response_id: (!resp.id.is_empty()).then(|| resp.id.clone()),
    }
}

// ── Inbound ───────────────────────────────────────────────────────────

/// Gemini clients expect whole function calls, so streamed tool-call
/// fragments are held back until the finishing chunk.
#[derive(Debug, Default)]
pub struct GeminiInbound {
    pending_calls: Vec<ToolCall>,
}

impl GeminiInbound {
    pub fn boxed() -> Box<dyn Inbound> {
        Box::new(Self::default())
    }

    fn buffer_calls(&mut self, calls: &[ToolCall]) {
        for call in calls {
            match self.pending_calls.iter_mut().find(|c| c.index == call.index) {
                Some(existing) => {
                    if existing.id.is_empty() {
                        existing.id = call.id.clone();
                    }
                    if existing.name.is_empty() {
                        existing.name = call.name.clone();
                    }
                    existing.arguments.push_str(&call.arguments);
                }
                None => self.pending_calls.push(call.clone()),
            }
        }
    }
}

impl Inbound for GeminiInbound {
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest, AppError> {
        request_to_internal(from_json(body)?)
    }

    fn encode_response(&mut self, response: &InternalResponse) -> Result<Vec<u8>, AppError> {
        to_json(&response_from_internal(response))
    }

    fn encode_chunk(&mut self, chunk: &InternalResponse) -> Result<Vec<u8>, AppError> {
        let mut out = chunk.clone();
        for choice in &mut out.choices {
            let calls = std::mem::take(&mut choice.message.tool_calls);
            self.buffer_calls(&calls);
            if choice.finish_reason.is_some() {
                choice.message.tool_calls = std::mem::take(&mut self.pending_calls);
            }
        }
        out.choices
            .retain(|c| !c.message.is_empty() || c.finish_reason.is_some());
        if out.choices.is_empty() && out.usage.is_none() {
            return Ok(Vec::new());
        }
        Ok(sse::data(&to_json(&response_from_internal(&out))?))
    }

    fn encode_done(&mut self) -> Result<Vec<u8>, AppError> {
        if self.pending_calls.is_empty() {
            return Ok(Vec::new());
        }
        let mut message = Message::new(Role::Assistant);
        message.tool_calls = std::mem::take(&mut self.pending_calls);
        let mut choice = Choice::new(0, message);
        choice.finish_reason = Some(FinishReason::ToolCalls);
        let flush = InternalResponse {
            choices: vec![choice],
            ..Default::default()
        };
        Ok(sse::data(&to_json(&response_from_internal(&flush))?))
    }
}

// ── Outbound ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct GeminiOutbound {
    next_call: u32,
    saw_calls: bool,
    id: String,
}

impl GeminiOutbound {
    pub fn boxed() -> Box<dyn Outbound> {
        Box::new(Self::default())
    }
}

impl Outbound for GeminiOutbound {
    fn encode_request(
        &mut self,
        channel: &Channel,
        request: &InternalRequest,
    ) -> Result<ProviderRequest, AppError> {
        let action = if request.stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        Ok(ProviderRequest {
            url: join_url(&channel.base_url, &format!("models/{}:{action}", request.model)),
            headers: vec![
                ("x-goog-api-key".into(), channel.key.clone()),
                ("content-type".into(), "application/json".into()),
            ],
            body: to_json(&request_from_internal(request))?,
            stream: request.stream,
        })
    }

    fn decode_response(&mut self, body: &[u8]) -> Result<InternalResponse, AppError> {
        let mut resp = response_to_internal(from_json(body)?, &mut self.next_call, &mut self.saw_calls);
        if resp.id.is_empty() {
            resp.id = generate_id("gen-");
        }
        Ok(resp)
    }

    fn decode_chunk(&mut self, data: &[u8]) -> Result<Option<InternalResponse>, AppError> {
        let mut chunk = response_to_internal(from_json(data)?, &mut self.next_call, &mut self.saw_calls);
        // one id for the whole stream
        if self.id.is_empty() {
            self.id = if chunk.id.is_empty() { generate_id("gen-") } else { chunk.id.clone() };
        }
        chunk.id = self.id.clone();
        // usage is cumulative in every chunk; keep it only on the last one
        if chunk.finish_reason().is_none() && !chunk.choices.is_empty() {
            chunk.usage = None;
        }
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::channel::{test_channel, ChannelType};
    use crate::transformer::openai_chat::{ChatInbound, ChatOutbound};
    use pretty_assertions::assert_eq;

    #[test]
    fn function_responses_pair_with_calls() {
        let body = r#"{
            "systemInstruction": {"parts": [{"text": "sys"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "weather?"}]},
                {"role": "model", "parts": [{"functionCall": {"name": "weather", "args": {"city": "Oslo"}}}]},
                {"role": "user", "parts": [{"functionResponse": {"name": "weather", "response": {"temp": 3}}}]}
            ],
            "generationConfig": {"maxOutputTokens": 100, "responseMimeType": "application/json",
                                 "thinkingConfig": {"thinkingBudget": 512}},
            "toolConfig": {"functionCallingConfig": {"mode": "ANY", "allowedFunctionNames": ["weather"]}}
        }"#;
        let req = GeminiInbound::default().decode_request(body.as_bytes()).unwrap();
        assert_eq!(req.messages.len(), 4);
        let call_id = req.messages[2].tool_calls[0].id.clone();
        assert_eq!(req.messages[3].tool_call_id.as_deref(), Some(call_id.as_str()));
        assert_eq!(req.tool_name_for(&call_id), Some("weather"));
        assert_eq!(req.response_format, Some(ResponseFormat::JsonObject));
        assert_eq!(req.tool_choice, Some(ToolChoice::Function("weather".into())));
        assert_eq!(req.reasoning.unwrap().budget_tokens, Some(512));
    }

    #[test]
    fn outbound_url_and_tool_result_names() {
        let mut assistant = Message::new(Role::Assistant);
        assistant.tool_calls.push(ToolCall {
            index: 0,
            id: "call_1".into(),
            name: "lookup".into(),
            arguments: r#"{"q":"x"}"#.into(),
        });
        let mut result = Message::text(Role::Tool, "plain text");
        result.tool_call_id = Some("call_1".into());
        let req = InternalRequest {
            model: "gemini-2.5-pro".into(),
            stream: true,
            messages: vec![Message::text(Role::User, "hi"), assistant, result],
            ..Default::default()
        };

        let channel = test_channel(2, ChannelType::Gemini);
        let out = GeminiOutbound::default().encode_request(&channel, &req).unwrap();
        assert_eq!(
            out.url,
            "https://upstream.test/v1/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["contents"][1]["role"], json!("model"));
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["args"], json!({ "q": "x" }));
        let response = &body["contents"][2]["parts"][0]["functionResponse"];
        assert_eq!(response["name"], json!("lookup"));
        assert_eq!(response["response"], json!({ "content": "plain text" }));
    }

    #[test]
    fn finish_and_usage_mapping() {
        let body = r#"{
            "candidates": [{"index": 0, "finishReason": "STOP",
                "content": {"role": "model", "parts": [
                    {"text": "hmm", "thought": true},
                    {"functionCall": {"name": "f", "args": {}}}
                ]}}],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 5,
                              "thoughtsTokenCount": 7, "totalTokenCount": 24,
                              "cachedContentTokenCount": 4},
            "modelVersion": "gemini-2.5-flash"
        }"#;
        let resp = GeminiOutbound::default().decode_response(body.as_bytes()).unwrap();
        assert_eq!(resp.finish_reason(), Some(&FinishReason::ToolCalls));
        assert_eq!(resp.choices[0].message.thinking_content().as_deref(), Some("hmm"));
        assert!(resp.choices[0].message.tool_calls[0].id.starts_with("call_"));
        assert_eq!(
            resp.usage,
            Some(Usage {
                prompt_tokens: 12,
                completion_tokens: 12,
                total_tokens: 24,
                cached_tokens: 4,
                cache_write_tokens: 0,
                reasoning_tokens: 7,
            })
        );
    }

    #[test]
    fn blocked_prompt_yields_content_filter() {
        let resp = GeminiOutbound::default()
            .decode_response(br#"{"promptFeedback": {"blockReason": "SAFETY"}}"#)
            .unwrap();
        assert_eq!(resp.prompt_block_reason.as_deref(), Some("SAFETY"));
        assert_eq!(resp.finish_reason(), Some(&FinishReason::ContentFilter));
    }

    #[test]
    fn inbound_stream_holds_tool_fragments() {
        let mut inbound = GeminiInbound::default();
        let mut first = Message::new(Role::Assistant);
        first.tool_calls.push(ToolCall {
            index: 0,
            id: "call_1".into(),
            name: "f".into(),
            arguments: "{\"a\":".into(),
        });
        let mut second = Message::new(Role::Assistant);
        second.tool_calls.push(ToolCall {
            index: 0,
            arguments: "1}".into(),
            ..Default::default()
        });
        let chunk = |m: Message, finish: Option<FinishReason>| {
            let mut c = Choice::new(0, m);
            c.finish_reason = finish;
            InternalResponse {
                choices: vec![c],
                ..Default::default()
            }
        };

        assert!(inbound.encode_chunk(&chunk(first, None)).unwrap().is_empty());
        let frame = inbound
            .encode_chunk(&chunk(second, Some(FinishReason::ToolCalls)))
            .unwrap();
        let text = String::from_utf8(frame).unwrap();
        let payload: Value = serde_json::from_str(text.trim_start_matches("data: ").trim()).unwrap();
        let call = &payload["candidates"][0]["content"]["parts"][0]["functionCall"];
        assert_eq!(call["args"], json!({ "a": 1 }));
        assert_eq!(payload["candidates"][0]["finishReason"], json!("STOP"));
        assert!(inbound.encode_done().unwrap().is_empty());
    }

    #[test]
    fn chat_client_through_gemini_channel_conserves_usage() {
        let mut inbound = ChatInbound;
        let mut outbound = GeminiOutbound::default();
        let mut req = inbound
            .decode_request(br#"{"model":"gemini-2.5-flash","messages":[{"role":"user","content":"hi"}]}"#)
            .unwrap();
        req.model = "gemini-2.5-flash".into();
        let provider = outbound
            .encode_request(&test_channel(3, ChannelType::Gemini), &req)
            .unwrap();
        assert!(provider.url.ends_with(":generateContent"));

        let upstream = br#"{"candidates":[{"index":0,"finishReason":"STOP","content":{"role":"model","parts":[{"text":"hello"}]}}],
            "usageMetadata":{"promptTokenCount":3,"candidatesTokenCount":2,"totalTokenCount":5}}"#;
        let resp = outbound.decode_response(upstream).unwrap();
        let body: Value = serde_json::from_slice(&inbound.encode_response(&resp).unwrap()).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], json!("hello"));
        assert_eq!(body["choices"][0]["finish_reason"], json!("stop"));
        assert_eq!(body["usage"]["prompt_tokens"], json!(3));
        assert_eq!(body["usage"]["completion_tokens"], json!(2));
        assert_eq!(body["usage"]["total_tokens"], json!(5));

        // and back again: a chat upstream answering a Gemini client
        let mut gemini_client = GeminiInbound::default();
        let chat_resp = ChatOutbound
            .decode_response(br#"{"id":"x","model":"gpt","choices":[{"index":0,"message":{"role":"assistant","content":"yo"},"finish_reason":"length"}],"usage":{"prompt_tokens":4,"completion_tokens":6,"total_tokens":10}}"#)
            .unwrap();
        let body: Value = serde_json::from_slice(&gemini_client.encode_response(&chat_resp).unwrap()).unwrap();
        assert_eq!(body["candidates"][0]["finishReason"], json!("MAX_TOKENS"));
        assert_eq!(body["usageMetadata"]["totalTokenCount"], json!(10));
    }
}
