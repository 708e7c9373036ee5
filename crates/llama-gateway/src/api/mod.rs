//! HTTP surfaces of the gateway.

pub mod ollama;
pub mod openai;
pub mod proxy;
