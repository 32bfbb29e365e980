pub mod balancer;
pub mod channel_service;
pub mod group_service;
pub mod key_service;
pub mod price_service;
pub mod relay_log;
