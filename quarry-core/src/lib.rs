//! # Quarry Core
//!
//! Core library for Quarry, a Model Context Protocol server that delegates
//! web-grounded research to Azure AI Foundry.
//! Provides configuration, credential resolution, the Foundry inference client,
//! long-running operation tracking, and response normalization.

pub mod client;
pub mod config;
pub mod context;
pub mod credential;
pub mod error;
pub mod normalize;
pub mod operation;
pub mod prompts;
pub mod retry;
pub mod sse;

// Re-export commonly used types at the crate root.
pub use client::{FoundryClient, ResearchBackend};
pub use config::{ServiceConfig, load_config};
pub use context::{NoProgress, OperationContext, ProgressSink, ProgressUpdate};
pub use credential::{AuthStrategy, Credential};
pub use error::{ConfigError, ResearchError, Result};
pub use normalize::{Citation, ResearchResult, TokenUsage};
pub use operation::{OperationStatus, RemoteOperation};
