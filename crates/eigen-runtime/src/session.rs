//! The single in-flight generation.
//!
//! [`GenerationSlot`] is the only owner of "what is generating right now".
//! It moves `Idle -> Active -> Idle` for chats and `Idle -> Switching ->
//! Idle` for model switches, so the two can never overlap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use eigen_local::Delta;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RuntimeError;

const GENERATING: &str = "a generation is in progress";
const SWITCHING: &str = "a model switch is in progress";

/// Public view of the slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Generating { chat_id: String },
    Switching,
}

#[derive(Debug)]
enum Slot {
    Idle,
    Active {
        id: u64,
        chat_id: String,
        cancel: CancellationToken,
    },
    Switching,
}

#[derive(Debug)]
pub struct GenerationSlot {
    slot: Mutex<Slot>,
    next_id: AtomicU64,
}

impl Default for GenerationSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationSlot {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Idle),
            next_id: AtomicU64::new(1),
        }
    }

    /// Claim the slot for a generation in `chat_id`.
    pub fn begin(&self, chat_id: &str) -> Result<GenerationSession, RuntimeError> {
        let mut slot = self.lock();
        match &*slot {
            Slot::Idle => {}
            Slot::Active { .. } => return Err(RuntimeError::Busy(GENERATING)),
            Slot::Switching => return Err(RuntimeError::Busy(SWITCHING)),
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        *slot = Slot::Active {
            id,
            chat_id: chat_id.to_string(),
            cancel: cancel.clone(),
        };
        debug!("Generation {} started for chat {}", id, chat_id);
        Ok(GenerationSession::new(id, chat_id.to_string(), cancel))
    }

    /// Signal the active generation. Returns false when idle.
    pub fn cancel(&self) -> bool {
        match &*self.lock() {
            Slot::Active { id, cancel, .. } => {
                debug!("Cancelling generation {}", id);
                cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Free the slot if `session` still owns it.
    pub fn release(&self, session: &GenerationSession) {
        let mut slot = self.lock();
        if matches!(&*slot, Slot::Active { id, .. } if *id == session.id) {
            *slot = Slot::Idle;
        }
    }

    /// Block generations until the returned guard is dropped.
    pub fn reserve_switch(&self) -> Result<SwitchGuard<'_>, RuntimeError> {
        let mut slot = self.lock();
        match &*slot {
            Slot::Idle => {
                *slot = Slot::Switching;
                Ok(SwitchGuard { slot: self })
            }
            Slot::Active { .. } => Err(RuntimeError::Busy(GENERATING)),
            Slot::Switching => Err(RuntimeError::Busy(SWITCHING)),
        }
    }

    pub fn state(&self) -> SlotState {
        match &*self.lock() {
            Slot::Idle => SlotState::Idle,
            Slot::Active { chat_id, .. } => SlotState::Generating {
                chat_id: chat_id.clone(),
            },
            Slot::Switching => SlotState::Switching,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        // Transitions never panic midway; a poisoned slot is still valid.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds the slot in `Switching`.
#[derive(Debug)]
pub struct SwitchGuard<'a> {
    slot: &'a GenerationSlot,
}

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Switching) {
            *slot = Slot::Idle;
        }
    }
}

/// Text accumulated by one generation.
#[derive(Debug)]
pub struct GenerationSession {
    id: u64,
    pub chat_id: String,
    pub content: String,
    pub reasoning: String,
    cancel: CancellationToken,
    started: Instant,
}

impl GenerationSession {
    fn new(id: u64, chat_id: String, cancel: CancellationToken) -> Self {
        Self {
            id,
            chat_id,
            content: String::new(),
            reasoning: String::new(),
            cancel,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn apply(&mut self, delta: &Delta) {
        self.content.push_str(&delta.content);
        self.reasoning.push_str(&delta.reasoning);
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
