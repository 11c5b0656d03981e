//! # Samvad Voice — real-time spoken conversation engine
//!
//! Turns a continuous microphone stream into a turn-taking spoken dialogue
//! with a remote speech service, using energy-based voice-activity detection
//! to decide when the user has finished speaking. No push-to-talk.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Voice Conversation                         │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐     │
//! │  │   Capture    │ → │    Energy    │ → │  Endpointer  │     │
//! │  │    (cpal)    │   │   Analyzer   │   │ (1.8s quiet) │     │
//! │  └──────────────┘   └──────────────┘   └──────────────┘     │
//! │         ↓ clip                                 ↓ end of turn │
//! │  ┌───────────────────────────────────────────────────┐      │
//! │  │ Turn Pipeline: transcribe → generate → synthesize │      │
//! │  └───────────────────────────────────────────────────┘      │
//! │         ↓                                                    │
//! │  ┌──────────────┐       interruption kill-switch            │
//! │  │   Playback   │ ←──────────────────────────────────────   │
//! │  │   (rodio)    │       then re-arm listening               │
//! │  └──────────────┘                                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The conversation is a single cooperative task; a cloneable
//! [`ConversationHandle`] carries the two UI actions (toggle, end) plus the
//! live sensitivity control and level meter. Every suspension point checks
//! the stop flag, so ending the conversation halts all in-flight work.

pub mod analyzer;
pub mod audio;
pub mod conversation;
pub mod endpointer;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod speech;
pub mod state;

pub use analyzer::{spawn_analyzer, AnalyzerConfig, EnergyAnalyzer};
pub use audio::{
    pcm_f32_to_wav, AudioChunk, AudioConfig, AudioInput, CaptureHandle, CpalInput, PlaybackSink,
    RecordingClip, RodioPlayback,
};
pub use conversation::{
    Command, ConversationConfig, ConversationEvent, ConversationHandle, VoiceConversation,
};
pub use endpointer::{run_endpointer, EndpointConfig, EndpointSignal, Endpointer};
pub use error::{VoiceError, VoiceResult};
pub use history::{ChatMessage, ConversationHistory, Role, Turn};
pub use pipeline::{TurnOutcome, TurnPipeline};
pub use speech::{HttpSpeechService, SpeechOptions, SpeechService, Transcription};
pub use state::{ConversationContext, ConversationState};
