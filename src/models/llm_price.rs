use serde::{Deserialize, Serialize};

/// Cost per million tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmPrice {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmInfo {
    pub name: String,
    #[serde(flatten)]
    pub price: LlmPrice,
}

impl LlmInfo {
    pub fn zero(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            price: LlmPrice::default(),
        }
    }
}
