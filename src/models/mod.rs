pub mod api_key;
pub mod channel;
pub mod group;
pub mod llm_price;
pub mod relay_log;
