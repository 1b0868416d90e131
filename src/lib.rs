//! Stoker: supervision and streaming client for a local LLM runtime.
//!
//! This crate manages an Ollama-compatible inference server end to end:
//! it launches and health-checks the server process, manages the model
//! catalog, and streams completions.
//!
//! # Architecture
//!
//! Independent clients share one [`ServerSupervisor`]:
//! - **Supervisor**: Spawns the server binary, polls `/api/version`
//!   until healthy, and stops it gracefully with a force-kill fallback
//! - **Catalog**: Lists, deletes, and pulls models with retrying
//!   progress streams over NDJSON
//! - **Completions**: Streams chat tokens and tool calls, one request
//!   at a time, with browsing context woven into the conversation
//! - **Context**: Pure composition of page, history, and bookmark
//!   context into prompt text

pub mod catalog;
pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod ndjson;
pub mod retry;
pub mod server;

pub use catalog::{InstalledModel, ModelCatalog, PullProgress, PullStream};
pub use chat::{
    ChatEvent, ChatMessage, ChatRequest, ChatStream, CompletionClient, GenerateRequest, Role,
    TokenStream, ToolCall, encode_image,
};
pub use config::RuntimeConfig;
pub use context::{AiContext, PageContext, build_contextual_system_prompt};
pub use error::{Result, RuntimeError};
pub use server::{ServerState, ServerSupervisor};
