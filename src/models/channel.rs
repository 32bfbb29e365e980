use serde::{Deserialize, Serialize};

/// Wire format a channel speaks. Also selects the outbound transformer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    OpenaiChat,
    OpenaiResponse,
    Anthropic,
    Gemini,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::OpenaiChat => "openai_chat",
            ChannelType::OpenaiResponse => "openai_response",
            ChannelType::Anthropic => "anthropic",
            ChannelType::Gemini => "gemini",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "openai_chat" | "openai" => Some(ChannelType::OpenaiChat),
            "openai_response" => Some(ChannelType::OpenaiResponse),
            "anthropic" => Some(ChannelType::Anthropic),
            "gemini" => Some(ChannelType::Gemini),
            _ => None,
        }
    }

    /// Default base URL for each channel type.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            ChannelType::OpenaiChat | ChannelType::OpenaiResponse => "https://api.openai.com/v1",
            ChannelType::Anthropic => "https://api.anthropic.com/v1",
            ChannelType::Gemini => "https://generativelanguage.googleapis.com/v1beta",
        }
    }
}

/// How a channel's declared models are matched against existing groups.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AutoGroupType {
    #[default]
    None,
    Exact,
    Fuzzy,
    Regex,
}

impl AutoGroupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoGroupType::None => "none",
            AutoGroupType::Exact => "exact",
            AutoGroupType::Fuzzy => "fuzzy",
            AutoGroupType::Regex => "regex",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "" => Some(AutoGroupType::None),
            "exact" => Some(AutoGroupType::Exact),
            "fuzzy" => Some(AutoGroupType::Fuzzy),
            "regex" => Some(AutoGroupType::Regex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub enabled: bool,
    pub base_url: String,
    pub key: String,
    /// Comma-separated models discovered from or declared for the provider.
    pub model: String,
    /// Comma-separated models added by hand.
    pub custom_model: String,
    pub proxy: Option<String>,
    pub auto_group: AutoGroupType,
}

impl Channel {
    /// Built-in and custom model lists, joined and split on commas.
    pub fn model_names(&self) -> Vec<String> {
        split_models(&self.model, &self.custom_model)
    }
}

pub fn split_models(model: &str, custom_model: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in format!("{model},{custom_model}").split(',') {
        let name = name.trim();
        if name.is_empty() || names.iter().any(|n| n == name) {
            continue;
        }
        names.push(name.to_string());
    }
    names
}

/// Fields accepted when creating a channel.
#[derive(Debug, Clone, Deserialize)]
pub struct NewChannel {
    pub name: String,
    pub channel_type: ChannelType,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub base_url: Option<String>,
    pub key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub custom_model: String,
    pub proxy: Option<String>,
    #[serde(default)]
    pub auto_group: AutoGroupType,
}

fn default_true() -> bool {
    true
}

/// Partial channel update. `proxy: Some("")` clears the proxy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelUpdate {
    pub name: Option<String>,
    pub channel_type: Option<ChannelType>,
    pub enabled: Option<bool>,
    pub base_url: Option<String>,
    pub key: Option<String>,
    pub model: Option<String>,
    pub custom_model: Option<String>,
    pub proxy: Option<String>,
    pub auto_group: Option<AutoGroupType>,
}

impl ChannelUpdate {
    pub fn apply(self, c: &mut Channel) {
        if let Some(name) = self.name {
            c.name = name;
        }
        if let Some(t) = self.channel_type {
            c.channel_type = t;
        }
        if let Some(enabled) = self.enabled {
            c.enabled = enabled;
        }
        if let Some(base_url) = self.base_url {
            c.base_url = base_url;
        }
        if let Some(key) = self.key {
            c.key = key;
        }
        if let Some(model) = self.model {
            c.model = model;
        }
        if let Some(custom_model) = self.custom_model {
            c.custom_model = custom_model;
        }
        if let Some(proxy) = self.proxy {
            c.proxy = (!proxy.is_empty()).then_some(proxy);
        }
        if let Some(mode) = self.auto_group {
            c.auto_group = mode;
        }
    }

    /// Whether applying this changes the declared model list.
    pub fn touches_models(&self) -> bool {
        self.model.is_some() || self.custom_model.is_some() || self.auto_group.is_some()
    }
}

#[cfg(test)]
pub fn test_channel(id: i64, channel_type: ChannelType) -> Channel {
    Channel {
        id,
        name: format!("channel-{id}"),
        channel_type,
        enabled: true,
        base_url: "https://upstream.test/v1".into(),
        key: "sk-test-0000".into(),
        model: String::new(),
        custom_model: String::new(),
        proxy: None,
        auto_group: AutoGroupType::None,
    }
}

/// Public info returned by list/get: never exposes the full key.
#[derive(Debug, Serialize)]
pub struct ChannelInfo {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub enabled: bool,
    pub base_url: String,
    pub key_preview: String,
    pub model: String,
    pub custom_model: String,
    pub proxy: Option<String>,
    pub auto_group: AutoGroupType,
    /// Last measured base URL latency.
    pub delay_ms: Option<u64>,
}

impl ChannelInfo {
    pub fn new(c: Channel, delay_ms: Option<u64>) -> Self {
        let chars: Vec<char> = c.key.chars().collect();
        let preview = if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{head}...{tail}")
        } else {
            "****".to_string()
        };
        Self {
            id: c.id,
            name: c.name,
            channel_type: c.channel_type,
            enabled: c.enabled,
            base_url: c.base_url,
            key_preview: preview,
            model: c.model,
            custom_model: c.custom_model,
            proxy: c.proxy,
            auto_group: c.auto_group,
            delay_ms,
        }
    }
}
