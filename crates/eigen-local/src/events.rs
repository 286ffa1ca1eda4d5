//! One-way event channel from the runtime to its front end.
//!
//! Delivery is best-effort: publishing with no subscribers is not an error,
//! and a subscriber that falls behind by more than the channel capacity
//! observes a lag instead of blocking publishers.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Progress of a model switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchStatus {
    Stopping,
    Starting,
    Ready,
    Error,
}

/// Everything the runtime tells the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RuntimeEvent {
    ModelLoading {
        model_id: String,
    },
    ModelReady {
        model_id: String,
    },
    ModelError {
        model_id: String,
        message: String,
    },
    ModelStopped {
        model_id: String,
    },
    ModelNoModelAvailable,
    ModelSwitching {
        model_id: String,
        status: SwitchStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    DownloadProgress {
        model_id: String,
        bytes_downloaded: u64,
        total_bytes: u64,
        percent: f64,
        speed_bps: u64,
    },
    DownloadComplete {
        model_id: String,
    },
    DownloadError {
        model_id: String,
        message: String,
    },
    DownloadCancelled {
        model_id: String,
    },
    GenerationBegin {
        chat_id: String,
    },
    GenerationDelta {
        chat_id: String,
        content: String,
        reasoning: String,
    },
    GenerationEnd {
        chat_id: String,
        elapsed_ms: u64,
        content: String,
        reasoning: String,
    },
    GenerationError {
        chat_id: String,
        message: String,
        elapsed_ms: u64,
    },
}

impl RuntimeEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::ModelLoading { .. } => "model-loading",
            RuntimeEvent::ModelReady { .. } => "model-ready",
            RuntimeEvent::ModelError { .. } => "model-error",
            RuntimeEvent::ModelStopped { .. } => "model-stopped",
            RuntimeEvent::ModelNoModelAvailable => "model-no-model-available",
            RuntimeEvent::ModelSwitching { .. } => "model-switching",
            RuntimeEvent::DownloadProgress { .. } => "download-progress",
            RuntimeEvent::DownloadComplete { .. } => "download-complete",
            RuntimeEvent::DownloadError { .. } => "download-error",
            RuntimeEvent::DownloadCancelled { .. } => "download-cancelled",
            RuntimeEvent::GenerationBegin { .. } => "generation-begin",
            RuntimeEvent::GenerationDelta { .. } => "generation-delta",
            RuntimeEvent::GenerationEnd { .. } => "generation-end",
            RuntimeEvent::GenerationError { .. } => "generation-error",
        }
    }

    /// True for the events that close a generation session.
    pub fn is_generation_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeEvent::GenerationEnd { .. } | RuntimeEvent::GenerationError { .. }
        )
    }
}

/// Broadcast bus shared by every component that publishes events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: RuntimeEvent) {
        if let Err(broadcast::error::SendError(event)) = self.sender.send(event) {
            trace!("No subscribers for {}", event.name());
        }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
