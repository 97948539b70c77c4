//! GGUF Gateway: an OpenAI-compatible HTTP server for local GGUF models
//!
//! This library provides:
//! - One-time GGUF model loading onto a dedicated inference thread
//! - An OpenAI-compatible `/v1/chat/completions` endpoint
//! - A `/health` endpoint reporting the loaded model
//!
//! # Example
//!
//! ```no_run
//! use gguf_gateway::{server, AppState, GatewayConfig, ModelSession, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = GatewayConfig::from_env();
//!     let session = ModelSession::initialize(&config.model).await?;
//!     let state = AppState::new(session, &config);
//!     server::serve(state, config.port).await
//! }
//! ```

pub mod config;
pub mod engine;
pub mod server;

// Re-export main types for library users
pub use config::{GatewayConfig, ModelConfig};
pub use engine::{EngineError, GenerateParams, ModelSession, TextGenerator};
pub use server::{create_router, AppState, ChatCompletionRequest, STOP_SEQUENCES};

// Re-export common types
pub type Result<T> = std::result::Result<T, anyhow::Error>;
