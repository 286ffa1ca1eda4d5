//! Local inference backend for Eigen using llama.cpp.
//!
//! This crate supervises a `llama-server` process, downloads GGUF models
//! from the catalog, and streams chat completions from the running server.
//! Every state change is published on an [`EventBus`].

pub mod catalog;
mod client;
pub mod download;
mod error;
pub mod events;
pub mod paths;
pub mod reasoning;
pub mod server;
mod stream;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use catalog::{
    LocalModel, ModelCapabilities, ModelCatalog, ModelDescriptor, ModelFile, ModelFiles,
    ModelListing, ModelPaths, ModelRuntimeState, LOCAL_MODEL_ID,
};
pub use client::{
    ChatCompletionRequest, ChatMessage, ContentPart, ImageUrl, LlamaCppClient, MessageContent,
    Role,
};
pub use download::{DownloadAccepted, DownloadJob, DownloadManager};
pub use error::{DownloadError, LocalError, StartError, StreamError};
pub use events::{EventBus, RuntimeEvent, SwitchStatus};
pub use reasoning::{Delta, ReasoningSplitter};
pub use server::{
    HealthState, LlamaServerCommand, ServerCommand, ServerHandle, ServerLaunch, ServerSupervisor,
};
pub use stream::TokenStream;
