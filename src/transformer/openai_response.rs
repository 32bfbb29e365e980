//! OpenAI Responses API (`/v1/responses`).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::model::{
    blob_to_data_url, generate_id, now_unix, part_from_url, Choice, FinishReason, InternalRequest,
    InternalResponse, Message, Part, Reasoning, ResponseFormat, Role, Tool, ToolCall, ToolChoice,
    Usage,
};
use super::openai_chat::response_format_from_value;
use super::{from_json, join_url, sse, to_json, Inbound, Outbound, ProviderRequest};
use crate::error::AppError;
use crate::models::channel::Channel;

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    #[serde(default)]
    pub input: ResponsesInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsesInput {
    Text(String),
    Items(Vec<InputItem>),
}

impl Default for ResponsesInput {
    fn default() -> Self {
        ResponsesInput::Items(Vec::new())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InputItem {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ItemContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResponseObject {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created_at: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output: Vec<OutputItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incomplete_details: Option<IncompleteDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponsesUsage>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct IncompleteDetails {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<OutputContent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Vec<OutputContent>>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct OutputContent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Vec<Value>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResponsesUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub total_tokens: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens_details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens_details: Option<Value>,
}

// ── Conversions ───────────────────────────────────────────────────────

fn parse_role(role: &str) -> Result<Role, AppError> {
    match role {
        "system" | "developer" => Ok(Role::System),
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(AppError::invalid_format(format!("unknown role: {other}"))),
    }
}

fn parts_from_content(content: Option<ItemContent>) -> Vec<Part> {
    match content {
        Some(ItemContent::Text(text)) => vec![Part::Text(text)],
        Some(ItemContent::Parts(parts)) => parts
            .into_iter()
            .filter_map(|p| match p.kind.as_str() {
                "input_text" | "output_text" | "text" => p.text.map(Part::Text),
                "input_image" => p.image_url.as_deref().map(part_from_url),
                "input_file" => p.file_url.map(|uri| Part::FileRef { mime_type: None, uri }),
                _ => None,
            })
            .collect(),
        None => Vec::new(),
    }
}

fn output_text(value: Option<Value>) -> String {
    match value {
        Some(Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

pub fn request_to_internal(req: ResponsesRequest) -> Result<InternalRequest, AppError> {
    let mut messages: Vec<Message> = Vec::new();
    if let Some(instructions) = req.instructions.filter(|i| !i.is_empty()) {
        messages.push(Message::text(Role::System, instructions));
    }

    match req.input {
        ResponsesInput::Text(text) => messages.push(Message::text(Role::User, text)),
        ResponsesInput::Items(items) => {
            for item in items {
                match item.kind.as_deref().unwrap_or("message") {
                    "message" => {
                        let role = parse_role(item.role.as_deref().unwrap_or("user"))?;
                        let mut msg = Message::new(role);
                        msg.parts = parts_from_content(item.content);
                        messages.push(msg);
                    }
                    "function_call" => {
                        // consecutive calls belong to one assistant turn
                        let reuse = matches!(messages.last(), Some(m) if m.role == Role::Assistant);
                        if !reuse {
                            messages.push(Message::new(Role::Assistant));
                        }
                        if let Some(last) = messages.last_mut() {
                            last.tool_calls.push(ToolCall {
                                index: last.tool_calls.len() as u32,
                                id: item.call_id.unwrap_or_default(),
                                name: item.name.unwrap_or_default(),
                                arguments: item.arguments.unwrap_or_default(),
                            });
                        }
                    }
                    "function_call_output" => {
                        let mut msg = Message::text(Role::Tool, output_text(item.output));
                        msg.tool_call_id = item.call_id;
                        messages.push(msg);
                    }
                    // reasoning items replayed by clients carry nothing we forward
                    "reasoning" => {}
                    other => {
                        return Err(AppError::invalid_format(format!(
                            "unsupported input item: {other}"
                        )))
                    }
                }
            }
        }
    }

    let tools = req
        .tools
        .iter()
        .filter(|t| t.get("type").and_then(Value::as_str) == Some("function"))
        .filter_map(|t| {
            Some(Tool {
                name: t.get("name")?.as_str()?.to_string(),
                description: t.get("description").and_then(Value::as_str).map(str::to_string),
                parameters: t.get("parameters").cloned().unwrap_or_else(|| json!({ "type": "object" })),
            })
        })
        .collect();

    let tool_choice = match req.tool_choice {
        Some(Value::String(s)) => match s.as_str() {
            "auto" => Some(ToolChoice::Auto),
            "none" => Some(ToolChoice::None),
            "required" => Some(ToolChoice::Required),
            _ => None,
        },
        Some(Value::Object(o)) => o
            .get("name")
            .and_then(Value::as_str)
            .map(|n| ToolChoice::Function(n.to_string())),
        _ => None,
    };

    Ok(InternalRequest {
        model: req.model,
        messages,
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: None,
        max_tokens: req.max_output_tokens,
        stop: Vec::new(),
        tools,
        tool_choice,
        response_format: req
            .text
            .as_ref()
            .and_then(|t| t.get("format"))
            .and_then(response_format_from_value),
        reasoning: req
            .reasoning
            .as_ref()
            .and_then(|r| r.get("effort"))
            .and_then(Value::as_str)
            .map(|effort| Reasoning {
                budget_tokens: None,
                effort: Some(effort.to_string()),
            }),
        user: req.user,
    })
}

pub fn request_from_internal(req: &InternalRequest) -> ResponsesRequest {
    let mut items = Vec::new();
    for m in req.messages.iter().filter(|m| m.role != Role::System) {
        match m.role {
            Role::Tool => items.push(InputItem {
                kind: Some("function_call_output".into()),
                call_id: m.tool_call_id.clone(),
                output: Some(Value::String(m.text_content())),
                ..Default::default()
            }),
            role => {
                let text_kind = if role == Role::Assistant { "output_text" } else { "input_text" };
                let parts: Vec<ContentPart> = m
                    .parts
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text(t) => Some(ContentPart {
                            kind: text_kind.into(),
                            text: Some(t.clone()),
                            image_url: None,
                            file_url: None,
                        }),
                        Part::Blob { mime_type, data } => Some(ContentPart {
                            kind: "input_image".into(),
                            text: None,
                            image_url: Some(blob_to_data_url(mime_type, data)),
                            file_url: None,
                        }),
                        Part::FileRef { uri, .. } => Some(ContentPart {
                            kind: "input_image".into(),
                            text: None,
                            image_url: Some(uri.clone()),
                            file_url: None,
                        }),
                        Part::Thinking { .. } => None,
                    })
                    .collect();
                if !parts.is_empty() {
                    items.push(InputItem {
                        kind: Some("message".into()),
                        role: Some(if role == Role::Assistant { "assistant" } else { "user" }.into()),
                        content: Some(ItemContent::Parts(parts)),
                        ..Default::default()
                    });
                }
                for call in &m.tool_calls {
                    items.push(InputItem {
                        kind: Some("function_call".into()),
                        call_id: Some(call.id.clone()),
                        name: Some(call.name.clone()),
                        arguments: Some(call.arguments.clone()),
                        ..Default::default()
                    });
                }
            }
        }
    }

    ResponsesRequest {
        model: req.model.clone(),
        input: ResponsesInput::Items(items),
        instructions: req.system_text(),
        stream: req.stream,
        temperature: req.temperature,
        top_p: req.top_p,
        max_output_tokens: req.max_tokens,
        tools: req
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                })
            })
            .collect(),
        tool_choice: req.tool_choice.as_ref().map(|c| match c {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Function(name) => json!({ "type": "function", "name": name }),
        }),
        text: req.response_format.as_ref().map(|f| {
            let format = match f {
                ResponseFormat::Text => json!({ "type": "text" }),
                ResponseFormat::JsonObject => json!({ "type": "json_object" }),
                ResponseFormat::JsonSchema { name, schema, strict } => json!({
                    "type": "json_schema", "name": name, "schema": schema, "strict": strict,
                }),
            };
            json!({ "format": format })
        }),
        reasoning: req
            .reasoning
            .as_ref()
            .and_then(|r| r.effort.as_ref())
            .map(|effort| json!({ "effort": effort })),
        user: req.user.clone(),
    }
}

fn detail(value: &Option<Value>, field: &str) -> i64 {
    value
        .as_ref()
        .and_then(|v| v.get(field))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn usage_from_responses(u: &ResponsesUsage) -> Usage {
    Usage {
        prompt_tokens: u.input_tokens,
        completion_tokens: u.output_tokens,
        total_tokens: u.total_tokens,
        cached_tokens: detail(&u.input_tokens_details, "cached_tokens"),
        cache_write_tokens: 0,
        reasoning_tokens: detail(&u.output_tokens_details, "reasoning_tokens"),
    }
    .normalized()
}

fn usage_to_responses(u: &Usage) -> ResponsesUsage {
    ResponsesUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        total_tokens: u.total_tokens,
        input_tokens_details: Some(json!({ "cached_tokens": u.cached_tokens })),
        output_tokens_details: Some(json!({ "reasoning_tokens": u.reasoning_tokens })),
    }
}

fn finish_reason_for(resp: &ResponseObject) -> FinishReason {
    if resp.status == "incomplete" {
        return match resp.incomplete_details.as_ref().map(|d| d.reason.as_str()) {
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Length,
        };
    }
    if resp.output.iter().any(|o| o.kind == "function_call") {
        FinishReason::ToolCalls
    } else {
        FinishReason::Stop
    }
}

pub fn response_to_internal(resp: ResponseObject) -> InternalResponse {
    let finish = finish_reason_for(&resp);
    let mut message = Message::new(Role::Assistant);
    for item in &resp.output {
        match item.kind.as_str() {
            "message" => {
                for c in item.content.iter().flatten() {
                    if c.kind == "output_text" {
                        message.parts.push(Part::Text(c.text.clone()));
                    }
                }
            }
            "reasoning" => {
                let text: String = item.summary.iter().flatten().map(|s| s.text.as_str()).collect();
                if !text.is_empty() {
                    message.parts.insert(0, Part::Thinking { text, signature: None });
                }
            }
            "function_call" => message.tool_calls.push(ToolCall {
                index: message.tool_calls.len() as u32,
                id: item.call_id.clone().unwrap_or_default(),
                name: item.name.clone().unwrap_or_default(),
                arguments: item.arguments.clone().unwrap_or_default(),
            }),
            _ => {}
        }
    }

    let mut choice = Choice::new(0, message);
    choice.finish_reason = Some(finish);
    InternalResponse {
        id: resp.id,
        model: resp.model,
        created: resp.created_at,
        choices: vec![choice],
        usage: resp.usage.as_ref().map(usage_from_responses),
        prompt_block_reason: None,
    }
}

pub fn response_from_internal(resp: &InternalResponse) -> ResponseObject {
    let mut output = Vec::new();
    let choice = resp.first_choice();

    if let Some(message) = choice.map(|c| &c.message) {
        if let Some(thinking) = message.thinking_content() {
            output.push(OutputItem {
                kind: "reasoning".into(),
                id: Some(generate_id("rs_")),
                summary: Some(vec![OutputContent {
                    kind: "summary_text".into(),
                    text: thinking,
                    annotations: None,
                }]),
                ..Default::default()
            });
        }
        let text = message.text_content();
        if !text.is_empty() {
            output.push(message_item(generate_id("msg_"), text, "completed"));
        }
        for call in &message.tool_calls {
            output.push(function_call_item(
                format!("fc_{}", call.id),
                call.id.clone(),
                call.name.clone(),
                call.arguments.clone(),
                "completed",
            ));
        }
    }

    let length = matches!(choice.and_then(|c| c.finish_reason.as_ref()), Some(FinishReason::Length));
    ResponseObject {
        id: if resp.id.is_empty() { generate_id("resp_") } else { resp.id.clone() },
        object: "response".into(),
        created_at: if resp.created == 0 { now_unix() } else { resp.created },
        model: resp.model.clone(),
        status: if length { "incomplete" } else { "completed" }.into(),
        output,
        incomplete_details: length.then(|| IncompleteDetails {
            reason: "max_output_tokens".into(),
        }),
        usage: resp.usage.as_ref().map(usage_to_responses),
    }
}

fn message_item(id: String, text: String, status: &str) -> OutputItem {
    OutputItem {
        kind: "message".into(),
        id: Some(id),
        role: Some("assistant".into()),
        status: Some(status.into()),
        content: Some(vec![OutputContent {
            kind: "output_text".into(),
            text,
            annotations: Some(Vec::new()),
        }]),
        ..Default::default()
    }
}

fn function_call_item(id: String, call_id: String, name: String, arguments: String, status: &str) -> OutputItem {
    OutputItem {
        kind: "function_call".into(),
        id: Some(id),
        status: Some(status.into()),
        call_id: Some(call_id),
        name: Some(name),
        arguments: Some(arguments),
        ..Default::default()
    }
}

// ── Inbound ───────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StreamCall {
    index: u32,
    output_index: usize,
    item_id: String,
    call_id: String,
    name: String,
    arguments: String,
}

/// Streams as typed events: `response.created`, output item and delta
/// events per chunk, and `response.completed` with the aggregate from
/// `encode_done`.
#[derive(Debug, Default)]
pub struct ResponseInbound {
    started: bool,
    sequence: u64,
    id: String,
    model: String,
    created: i64,
    next_output_index: usize,
    message: Option<(usize, String)>,
    text: String,
    reasoning: String,
    calls: Vec<StreamCall>,
    usage: Option<Usage>,
    finish: Option<FinishReason>,
}

impl ResponseInbound {
    pub fn boxed() -> Box<dyn Inbound> {
        Box::new(Self::default())
    }

    fn emit(&mut self, out: &mut Vec<u8>, kind: &str, mut payload: Value) -> Result<(), AppError> {
        if let Value::Object(map) = &mut payload {
            map.insert("type".into(), json!(kind));
            map.insert("sequence_number".into(), json!(self.sequence));
        }
        self.sequence += 1;
        out.extend_from_slice(&sse::event(kind, &to_json(&payload)?));
        Ok(())
    }

    fn snapshot(&self, status: &str) -> ResponseObject {
        ResponseObject {
            id: self.id.clone(),
            object: "response".into(),
            created_at: self.created,
            model: self.model.clone(),
            status: status.into(),
            output: Vec::new(),
            incomplete_details: None,
            usage: None,
        }
    }

    fn aggregate(&self) -> InternalResponse {
        let mut message = Message::new(Role::Assistant);
        if !self.reasoning.is_empty() {
            message.parts.push(Part::Thinking {
                text: self.reasoning.clone(),
                signature: None,
            });
        }
        if !self.text.is_empty() {
            message.parts.push(Part::Text(self.text.clone()));
        }
        message.tool_calls = self
            .calls
            .iter()
            .map(|c| ToolCall {
                index: c.index,
                id: c.call_id.clone(),
                name: c.name.clone(),
                arguments: c.arguments.clone(),
            })
            .collect();
        let mut choice = Choice::new(0, message);
        choice.finish_reason = self.finish.clone();
        InternalResponse {
            id: self.id.clone(),
            model: self.model.clone(),
            created: self.created,
            choices: vec![choice],
            usage: self.usage,
            prompt_block_reason: None,
        }
    }
}

impl Inbound for ResponseInbound {
    fn decode_request(&mut self, body: &[u8]) -> Result<InternalRequest, AppError> {
        request_to_internal(from_json(body)?)
    }

    fn encode_response(&mut self, response: &InternalResponse) -> Result<Vec<u8>, AppError> {
        to_json(&response_from_internal(response))
    }

    fn encode_chunk(&mut self, chunk: &InternalResponse) -> Result<Vec<u8>, AppError> {
        let mut out = Vec::new();
        if !self.started {
            self.started = true;
            self.id = generate_id("resp_");
            self.model = chunk.model.clone();
            self.created = if chunk.created == 0 { now_unix() } else { chunk.created };
            let created = self.snapshot("in_progress");
            self.emit(&mut out, "response.created", json!({ "response": created }))?;
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        let Some(choice) = chunk.first_choice() else {
            return Ok(out);
        };
        if let Some(reason) = &choice.finish_reason {
            self.finish = Some(reason.clone());
        }

        if let Some(thinking) = choice.message.thinking_content() {
            self.reasoning.push_str(&thinking);
            self.emit(&mut out, "response.reasoning_summary_text.delta", json!({ "delta": thinking }))?;
        }

        let text = choice.message.text_content();
        if !text.is_empty() {
            let (output_index, item_id) = match self.message.clone() {
                Some(open) => open,
                None => {
                    let open = (self.next_output_index, generate_id("msg_"));
                    self.next_output_index += 1;
                    self.message = Some(open.clone());
                    let mut item = message_item(open.1.clone(), String::new(), "in_progress");
                    item.content = Some(Vec::new());
                    self.emit(&mut out, "response.output_item.added", json!({ "output_index": open.0, "item": item }))?;
                    self.emit(
                        &mut out,
                        "response.content_part.added",
                        json!({
                            "item_id": open.1, "output_index": open.0, "content_index": 0,
                            "part": { "type": "output_text", "text": "", "annotations": [] },
                        }),
                    )?;
                    open
                }
            };
            self.text.push_str(&text);
            self.emit(
                &mut out,
                "response.output_text.delta",
                json!({ "item_id": item_id, "output_index": output_index, "content_index": 0, "delta": text }),
            )?;
        }

        for call in &choice.message.tool_calls {
            let pos = match self.calls.iter().position(|c| c.index == call.index) {
                Some(pos) => pos,
                None => {
                    let state = StreamCall {
                        index: call.index,
                        output_index: self.next_output_index,
                        item_id: format!("fc_{}", call.id),
                        call_id: call.id.clone(),
                        name: call.name.clone(),
                        arguments: String::new(),
                    };
                    self.next_output_index += 1;
                    let item = function_call_item(
                        state.item_id.clone(),
                        state.call_id.clone(),
                        state.name.clone(),
                        String::new(),
                        "in_progress",
                    );
                    self.emit(
                        &mut out,
                        "response.output_item.added",
                        json!({ "output_index": state.output_index, "item": item }),
                    )?;
                    self.calls.push(state);
                    self.calls.len() - 1
                }
            };
            if !call.arguments.is_empty() {
                self.calls[pos].arguments.push_str(&call.arguments);
                let payload = json!({
                    "item_id": self.calls[pos].item_id,
                    "output_index": self.calls[pos].output_index,
                    "delta": call.arguments,
                });
                self.emit(&mut out, "response.function_call_arguments.delta", payload)?;
            }
        }
        Ok(out)
    }

    fn encode_done(&mut self) -> Result<Vec<u8>, AppError> {
        let mut out = Vec::new();
        if let Some((output_index, item_id)) = self.message.clone() {
            let text = self.text.clone();
            self.emit(
                &mut out,
                "response.output_text.done",
                json!({ "item_id": item_id, "output_index": output_index, "content_index": 0, "text": text }),
            )?;
            let item = message_item(item_id, text, "completed");
            self.emit(&mut out, "response.output_item.done", json!({ "output_index": output_index, "item": item }))?;
        }
        let done: Vec<(usize, OutputItem)> = self
            .calls
            .iter()
            .map(|c| {
                let item = function_call_item(
                    c.item_id.clone(),
                    c.call_id.clone(),
                    c.name.clone(),
                    c.arguments.clone(),
                    "completed",
                );
                (c.output_index, item)
            })
            .collect();
        for (output_index, item) in done {
            self.emit(&mut out, "response.output_item.done", json!({ "output_index": output_index, "item": item }))?;
        }

        let mut completed = response_from_internal(&self.aggregate());
        completed.id = self.id.clone();
        self.emit(&mut out, "response.completed", json!({ "response": completed }))?;
        Ok(out)
    }
}

// ── Outbound ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ResponseOutbound {
    id: String,
    model: String,
    created: i64,
    /// output_index of each function call item, in tool-call order.
    calls: Vec<u64>,
}

impl ResponseOutbound {
    pub fn boxed() -> Box<dyn Outbound> {
        Box::new(Self::default())
    }

    fn chunk(&self, message: Message, finish_reason: Option<FinishReason>, usage: Option<Usage>) -> InternalResponse {
        let mut choice = Choice::new(0, message);
        choice.finish_reason = finish_reason;
        InternalResponse {
            id: self.id.clone(),
            model: self.model.clone(),
            created: self.created,
            choices: vec![choice],
            usage,
            prompt_block_reason: None,
        }
    }

    fn call_index(&self, output_index: u64) -> Option<u32> {
        self.calls.iter().position(|o| *o == output_index).map(|p| p as u32)
    }
}

impl Outbound for ResponseOutbound {
    fn encode_request(
        &mut self,
        channel: &Channel,
        request: &InternalRequest,
    ) -> Result<ProviderRequest, AppError> {
        Ok(ProviderRequest {
            url: join_url(&channel.base_url, "responses"),
            headers: vec![
                ("authorization".into(), format!("Bearer {}", channel.key)),
                ("content-type".into(), "application/json".into()),
            ],
            body: to_json(&request_from_internal(request))?,
            stream: request.stream,
        })
    }

    fn decode_response(&mut self, body: &[u8]) -> Result<InternalResponse, AppError> {
        Ok(response_to_internal(from_json(body)?))
    }

    fn decode_chunk(&mut self, data: &[u8]) -> Result<Option<InternalResponse>, AppError> {
        let event: Value = from_json(data)?;
        let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
        let output_index = event.get("output_index").and_then(Value::as_u64).unwrap_or(0);
        let delta = event.get("delta").and_then(Value::as_str).unwrap_or_default().to_string();

        match kind {
            "response.created" => {
                let resp: ResponseObject = serde_json::from_value(event["response"].clone())
                    .map_err(AppError::invalid_format)?;
                self.id = resp.id;
                self.model = resp.model;
                self.created = resp.created_at;
                Ok(None)
            }
            "response.output_text.delta" => {
                Ok(Some(self.chunk(Message::text(Role::Assistant, delta), None, None)))
            }
            "response.reasoning_summary_text.delta" | "response.reasoning_text.delta" => {
                let mut message = Message::new(Role::Assistant);
                message.parts.push(Part::Thinking { text: delta, signature: None });
                Ok(Some(self.chunk(message, None, None)))
            }
            "response.output_item.added" => {
                let item: OutputItem = serde_json::from_value(event["item"].clone())
                    .map_err(AppError::invalid_format)?;
                if item.kind != "function_call" {
                    return Ok(None);
                }
                self.calls.push(output_index);
                let mut message = Message::new(Role::Assistant);
                message.tool_calls.push(ToolCall {
                    index: (self.calls.len() - 1) as u32,
                    id: item.call_id.unwrap_or_default(),
                    name: item.name.unwrap_or_default(),
                    arguments: item.arguments.unwrap_or_default(),
                });
                Ok(Some(self.chunk(message, None, None)))
            }
            "response.function_call_arguments.delta" => {
                let Some(index) = self.call_index(output_index) else {
                    return Ok(None);
                };
                let mut message = Message::new(Role::Assistant);
                message.tool_calls.push(ToolCall {
                    index,
                    arguments: delta,
                    ..Default::default()
                });
                Ok(Some(self.chunk(message, None, None)))
            }
            "response.completed" | "response.incomplete" => {
                let resp: ResponseObject = serde_json::from_value(event["response"].clone())
                    .map_err(AppError::invalid_format)?;
                let finish = finish_reason_for(&resp);
                let usage = resp.usage.as_ref().map(usage_from_responses);
                Ok(Some(self.chunk(Message::new(Role::Assistant), Some(finish), usage)))
            }
            "response.failed" | "error" => {
                let message = event
                    .pointer("/response/error/message")
                    .or_else(|| event.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("upstream stream failed");
                Err(AppError::Upstream(message.to_string()))
            }
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
    fn decodes_items_and_instructions() {
        let body = r#"{
            "model": "gpt-4.1",
            "instructions": "be terse",
            "input": [
                {"role": "user", "content": "weather?"},
                {"type": "function_call", "call_id": "call_9", "name": "weather", "arguments": "{}"},
                {"type": "function_call_output", "call_id": "call_9", "output": "sunny"}
            ],
            "tools": [{"type": "function", "name": "weather", "parameters": {"type": "object"}},
                      {"type": "web_search"}],
            "text": {"format": {"type": "json_schema", "name": "w", "schema": {"type": "object"}}},
            "reasoning": {"effort": "low"},
            "max_output_tokens": 64
        }"#;
        let req = ResponseInbound::default().decode_request(body.as_bytes()).unwrap();
        assert_eq!(req.system_text().as_deref(), Some("be terse"));
        assert_eq!(req.messages.len(), 4);
        assert_eq!(req.messages[2].tool_calls[0].id, "call_9");
        assert_eq!(req.messages[3].tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(req.tools.len(), 1);
        assert_eq!(req.max_tokens, Some(64));
        assert_eq!(req.reasoning.unwrap().effort.as_deref(), Some("low"));
        assert!(matches!(req.response_format, Some(ResponseFormat::JsonSchema { .. })));
    }

    #[test]
    fn string_input_is_one_user_message() {
        let req = ResponseInbound::default()
            .decode_request(br#"{"model":"m","input":"hello"}"#)
            .unwrap();
        assert_eq!(req.messages, vec![Message::text(Role::User, "hello")]);
    }

    #[test]
    fn outbound_moves_system_to_instructions() {
        let req = InternalRequest {
            model: "gpt-4.1".into(),
            messages: vec![Message::text(Role::System, "sys"), Message::text(Role::User, "hi")],
            ..Default::default()
        };
        let channel = test_channel(1, ChannelType::OpenaiResponse);
        let out = ResponseOutbound::default().encode_request(&channel, &req).unwrap();
        assert_eq!(out.url, "https://upstream.test/v1/responses");
        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body["instructions"], json!("sys"));
        assert_eq!(body["input"][0]["content"][0]["type"], json!("input_text"));
        assert_eq!(body["input"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn decodes_function_call_response() {
        let body = r#"{
            "id": "resp_1", "object": "response", "created_at": 5, "model": "gpt-4.1", "status": "completed",
            "output": [{"type": "function_call", "id": "fc_1", "call_id": "call_1", "name": "f", "arguments": "{}"}],
            "usage": {"input_tokens": 10, "output_tokens": 4, "total_tokens": 14,
                      "input_tokens_details": {"cached_tokens": 3}}
        }"#;
        let resp = ResponseOutbound::default().decode_response(body.as_bytes()).unwrap();
        assert_eq!(resp.finish_reason(), Some(&FinishReason::ToolCalls));
        assert_eq!(resp.choices[0].message.tool_calls[0].name, "f");
        let usage = resp.usage.unwrap();
        assert_eq!((usage.prompt_tokens, usage.cached_tokens, usage.total_tokens), (10, 3, 14));
    }

    #[test]
    fn outbound_stream_events() {
        let mut out = ResponseOutbound::default();
        assert!(out
            .decode_chunk(br#"{"type":"response.created","response":{"id":"resp_1","model":"m","created_at":1}}"#)
            .unwrap()
            .is_none());
        let text = out
            .decode_chunk(br#"{"type":"response.output_text.delta","output_index":0,"delta":"Hi"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(text.id, "resp_1");
        assert_eq!(text.choices[0].message.text_content(), "Hi");

        out.decode_chunk(br#"{"type":"response.output_item.added","output_index":1,"item":{"type":"function_call","call_id":"c1","name":"f"}}"#)
            .unwrap();
        let args = out
            .decode_chunk(br#"{"type":"response.function_call_arguments.delta","output_index":1,"delta":"{\"a\""}"#)
            .unwrap()
            .unwrap();
        assert_eq!(args.choices[0].message.tool_calls[0].index, 0);
        assert_eq!(args.choices[0].message.tool_calls[0].arguments, "{\"a\"");

        let done = out
            .decode_chunk(br#"{"type":"response.completed","response":{"status":"completed","output":[],"usage":{"input_tokens":2,"output_tokens":1}}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(done.usage.unwrap().total_tokens, 3);

        let err = out
            .decode_chunk(br#"{"type":"response.failed","response":{"error":{"message":"boom"}}}"#)
            .unwrap_err();
        assert!(matches!(err, AppError::Upstream(m) if m == "boom"));
    }

    #[test]
    fn inbound_stream_emits_lifecycle() {
        let mut inbound = ResponseInbound::default();
        let chunk = InternalResponse {
            model: "m".into(),
            choices: vec![Choice::new(0, Message::text(Role::Assistant, "Hel"))],
            ..Default::default()
        };
        let first = String::from_utf8(inbound.encode_chunk(&chunk).unwrap()).unwrap();
        assert!(first.starts_with("event: response.created\n"));
        assert!(first.contains("event: response.output_item.added\n"));
        assert!(first.contains("\"delta\":\"Hel\""));

        let second = String::from_utf8(inbound.encode_chunk(&chunk).unwrap()).unwrap();
        assert!(!second.contains("response.created"));
        assert!(!second.contains("output_item.added"));

        let mut last = chunk.clone();
        last.choices[0] = Choice::new(0, Message::new(Role::Assistant));
        last.choices[0].finish_reason = Some(FinishReason::Stop);
        last.usage = Some(Usage::new(3, 2));
        inbound.encode_chunk(&last).unwrap();

        let done = String::from_utf8(inbound.encode_done().unwrap()).unwrap();
        let completed = done
            .split("\n\n")
            .find(|e| e.starts_with("event: response.completed"))
            .unwrap();
        let payload: Value = serde_json::from_str(completed.split_once("data: ").unwrap().1).unwrap();
        assert_eq!(payload["response"]["status"], json!("completed"));
        assert_eq!(payload["response"]["output"][0]["content"][0]["text"], json!("HelHel"));
        assert_eq!(payload["response"]["usage"]["total_tokens"], json!(5));
    }
}
