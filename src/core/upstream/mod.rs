//! Connection to the upstream conversational speech API.

pub mod adapter;
pub mod backoff;
pub mod messages;

pub use adapter::{AdapterEvent, AdapterMetrics, AdapterState, UpstreamConfig, UpstreamSpeechAdapter};
pub use backoff::ReconnectPolicy;
