//! # Eigen Runtime
//!
//! Orchestrates local inference: which model is loaded, which models are
//! on disk, and the one generation that may run at a time.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │    Front end    │ --> │     Runtime     │ --> │  llama-server   │
//! │   (commands)    │     │  (orchestrator) │     │  (subprocess)   │
//! └─────────────────┘     └─────────────────┘     └─────────────────┘
//!          ^                      │
//!          │                ┌─────┴─────┐
//!          └─── events ──── │ EventBus  │
//!                           └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use eigen_runtime::{NewTurn, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::builder(RuntimeConfig::from_env()).build()?;
//! let mut events = runtime.events();
//! runtime.boot().await?;
//! runtime.chat_stream("chat-1", NewTurn::text("Hello")).await?;
//! ```

mod config;
mod error;
pub mod prompt;
mod runtime;
mod selection;
mod session;
mod store;

pub use config::{RuntimeConfig, RuntimeConfigBuilder, DEFAULT_SYSTEM_PROMPT};
pub use error::RuntimeError;
pub use prompt::{
    build_prompt, Attachment, FormattedPrompt, ImagePayload, NewTurn, PromptWarning,
};
pub use runtime::{ChatStreamStarted, Runtime, RuntimeBuilder};
pub use selection::{ModelSelection, SelectionStore};
pub use session::{GenerationSession, GenerationSlot, SlotState, SwitchGuard};
pub use store::{
    ChatStore, ChatTurn, CompletedTurn, MemoryChatStore, StoreError, TurnOutcome, TurnRole,
};

// Re-export the backend types front ends need
pub use eigen_local::{
    paths, DownloadAccepted, EventBus, HealthState, ModelCapabilities, ModelCatalog,
    ModelDescriptor, ModelListing, ModelRuntimeState, RuntimeEvent, ServerCommand, ServerHandle,
    SwitchStatus, LOCAL_MODEL_ID,
};
