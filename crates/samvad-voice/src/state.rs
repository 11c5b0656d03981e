//! Conversation states and the shared context that owns them.
//!
//! One explicit context object per conversation, shared by `Arc` with the
//! endpointer and the control handle; no process-wide globals. It owns
//! exactly two things: the current [`ConversationState`] and the stopped
//! flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::debug;

/// The four states of a voice conversation.
///
/// Exactly one is active at any instant. Every component action checks the
/// current state (and the stopped flag) and no-ops if the action is illegal
/// for that state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    /// No active device, no active timers. Entry point and resting point
    /// between turns.
    Idle,
    /// Device open, analyzer and endpointer running.
    Listening,
    /// Transcription and reply generation in flight; no device held.
    Thinking,
    /// Synthesized reply playing; interruptible.
    Speaking,
}

impl ConversationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        }
    }
}

/// Shared state for one conversation instance.
pub struct ConversationContext {
    state: RwLock<ConversationState>,
    stopped: AtomicBool,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(ConversationState::Idle),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> ConversationState {
        *self.state.read().expect("state lock poisoned")
    }

    pub fn set_state(&self, next: ConversationState) {
        let mut state = self.state.write().expect("state lock poisoned");
        if *state != next {
            debug!("state: {} -> {}", state.as_str(), next.as_str());
            *state = next;
        }
    }

    /// True once the conversation has been explicitly ended. Checked at
    /// every suspension point; once set, nothing re-arms and nothing mutates
    /// history until a new conversation begins.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Set by the end-conversation action only.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Clear the stopped flag when a (new or resumed) conversation starts.
    pub fn begin(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_idle_and_not_stopped() {
        let ctx = ConversationContext::new();
        assert_eq!(ctx.state(), ConversationState::Idle);
        assert!(!ctx.is_stopped());
    }

    #[test]
    fn stop_and_begin_round_trip() {
        let ctx = ConversationContext::new();
        ctx.stop();
        assert!(ctx.is_stopped());
        ctx.begin();
        assert!(!ctx.is_stopped());
    }

    #[test]
    fn state_transitions() {
        let ctx = ConversationContext::new();
        ctx.set_state(ConversationState::Listening);
        assert_eq!(ctx.state(), ConversationState::Listening);
        assert_eq!(ctx.state().as_str(), "listening");
    }
}
