// llama-gateway/crates/llama-gateway/src/lib.rs

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod log_status;
pub mod metadata;
pub mod metrics;
pub mod server;
pub mod supervisor;
pub mod telemetry;
pub mod worker;

// Public API exports
pub use config::{Config, ConfigHandle, ModelSpec, RuntimeSpec};
pub use error::GatewayError;
pub use log_status::{LogTracker, StatusSnapshot};
pub use server::{run_gateway, GatewayState};
pub use supervisor::{Supervisor, WorkerEvent};
