//! Inference client: OpenAI-compatible API client for the coding model.
//!
//! This module handles all communication with the model endpoint:
//! - Streaming chat completions as typed units (text, reasoning, tool calls)
//! - SSE stream parsing
//! - Fallback chain management
//! - Model configuration loading from `_models/config.yaml`
//!
//! The orchestrator only sees the [`ModelClient`] trait, so the endpoint is
//! interchangeable via config and replaceable in tests.

pub mod client;
pub mod config;
pub mod errors;
pub mod streaming;
pub mod types;

pub use client::{InferenceClient, ModelClient, UnitStream};
pub use config::{ModelConfig, ModelsConfig};
pub use errors::InferenceError;
pub use types::{ChatMessage, ModelRequest, Role, StreamUnit, ToolCall, ToolDefinition};
