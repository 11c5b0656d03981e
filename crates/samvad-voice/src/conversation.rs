//! The conversation loop: capture → endpoint → pipeline → resume, plus the
//! control handle the UI drives.
//!
//! One cooperative task owns everything turn-related. The handle exposes a
//! single-button surface: one toggle whose meaning depends on the current
//! state (start / manual stop / interrupt, ignored while thinking) and an
//! end-conversation action that halts all in-flight work.

use crate::analyzer::{spawn_analyzer, AnalyzerConfig};
use crate::audio::{AudioConfig, AudioInput, PlaybackSink, RecordingClip};
use crate::endpointer::{run_endpointer, EndpointConfig, EndpointSignal};
use crate::history::ConversationHistory;
use crate::pipeline::{TurnOutcome, TurnPipeline};
use crate::speech::{SpeechOptions, SpeechService};
use crate::state::{ConversationContext, ConversationState};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Control actions sent from the handle to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// The orb tap: start listening, manually stop listening, or interrupt
    /// playback, depending on the current state.
    Toggle,
    /// End the conversation and halt all in-flight work.
    End,
}

/// What the loop reports to the UI.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    StateChanged(ConversationState),
    /// First sound heard in the current listening span ("Hearing you...").
    SpeechDetected,
    UserTurn {
        text: String,
        timestamp: DateTime<Utc>,
    },
    AssistantTurn {
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Nothing intelligible was captured; listening re-arms by itself.
    NoSpeech,
    /// A turn failed; the loop is idle and will not re-arm on its own.
    Error(String),
    /// The conversation was ended; history is cleared.
    Ended,
}

/// Loop configuration.
#[derive(Debug, Clone)]
pub struct ConversationConfig {
    /// Capture parameters, handed to the [`AudioInput`] you construct.
    pub capture: AudioConfig,
    pub analyzer: AnalyzerConfig,
    pub endpoint: EndpointConfig,
    pub speech: SpeechOptions,

    /// Clips below this byte size are silence or a false start; they are
    /// discarded without touching the pipeline (default: 500).
    pub min_clip_bytes: usize,

    /// Pause before re-arming after a discarded clip or empty transcript
    /// (default: 600ms).
    pub no_speech_pause: Duration,

    /// Pause before re-arming after the reply finished playing
    /// (default: 500ms).
    pub resume_pause: Duration,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            capture: AudioConfig::default(),
            analyzer: AnalyzerConfig::default(),
            endpoint: EndpointConfig::default(),
            speech: SpeechOptions::default(),
            min_clip_bytes: 500,
            no_speech_pause: Duration::from_millis(600),
            resume_pause: Duration::from_millis(500),
        }
    }
}

/// Control surface for a running conversation loop. Cheap to clone.
#[derive(Clone)]
pub struct ConversationHandle {
    ctx: Arc<ConversationContext>,
    playback: Arc<dyn PlaybackSink>,
    level: Arc<AtomicU8>,
    silence_window_ms: Arc<AtomicU64>,
    commands: mpsc::UnboundedSender<Command>,
}

impl ConversationHandle {
    /// The orb tap. Meaning depends on state; illegal taps are ignored by
    /// the loop.
    pub fn toggle(&self) {
        if self.commands.send(Command::Toggle).is_err() {
            warn!("toggle after conversation loop exited");
        }
    }

    /// End the conversation. The stop flag is raised and any playing audio
    /// silenced synchronously here; the loop releases capture, clears
    /// history, and reports [`ConversationEvent::Ended`] at its next
    /// suspension point.
    pub fn end_conversation(&self) {
        self.ctx.stop();
        self.playback.stop();
        let _ = self.commands.send(Command::End);
    }

    /// Adjust the endpointer's silence window. Takes effect on the next
    /// detector poll, mid-listen included.
    pub fn set_sensitivity(&self, silence_window: Duration) {
        self.silence_window_ms
            .store(silence_window.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn state(&self) -> ConversationState {
        self.ctx.state()
    }

    /// Latest energy sample, for the level meter.
    pub fn input_level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn is_stopped(&self) -> bool {
        self.ctx.is_stopped()
    }
}

enum ListenOutcome {
    Clip(RecordingClip),
    Ended,
    Denied,
}

enum ListenExit {
    Commit,
    End,
}

/// The conversation loop. Construct with [`VoiceConversation::new`], then
/// drive `run()` on your runtime while the handle feeds it commands.
pub struct VoiceConversation {
    config: ConversationConfig,
    ctx: Arc<ConversationContext>,
    service: Arc<dyn SpeechService>,
    input: Arc<dyn AudioInput>,
    playback: Arc<dyn PlaybackSink>,
    history: ConversationHistory,
    level: Arc<AtomicU8>,
    silence_window_ms: Arc<AtomicU64>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConversationEvent>,
}

impl VoiceConversation {
    pub fn new(
        config: ConversationConfig,
        service: Arc<dyn SpeechService>,
        input: Arc<dyn AudioInput>,
        playback: Arc<dyn PlaybackSink>,
    ) -> (
        Self,
        ConversationHandle,
        mpsc::UnboundedReceiver<ConversationEvent>,
    ) {
        let ctx = Arc::new(ConversationContext::new());
        let level = Arc::new(AtomicU8::new(0));
        let silence_window_ms = Arc::new(AtomicU64::new(
            config.endpoint.silence_window.as_millis() as u64,
        ));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = ConversationHandle {
            ctx: Arc::clone(&ctx),
            playback: Arc::clone(&playback),
            level: Arc::clone(&level),
            silence_window_ms: Arc::clone(&silence_window_ms),
            commands: commands_tx,
        };

        let conversation = Self {
            config,
            ctx,
            service,
            input,
            playback,
            history: ConversationHistory::new(),
            level,
            silence_window_ms,
            commands: commands_rx,
            events: events_tx,
        };
        (conversation, handle, events_rx)
    }

    /// Run until every handle is dropped.
    pub async fn run(mut self) {
        info!("conversation loop ready");
        loop {
            let command = match self.commands.recv().await {
                Some(command) => command,
                None => break,
            };
            match command {
                Command::End => self.teardown(),
                Command::Toggle => {
                    self.ctx.begin();
                    self.converse().await;
                }
            }
        }
        debug!("conversation loop exited");
    }

    /// One active span: listen and run turns until the conversation ends,
    /// a turn fails, or the microphone is refused.
    async fn converse(&mut self) {
        loop {
            let clip = match self.listen().await {
                ListenOutcome::Clip(clip) => clip,
                ListenOutcome::Ended => {
                    self.teardown();
                    return;
                }
                ListenOutcome::Denied => return,
            };

            if clip.len() < self.config.min_clip_bytes {
                debug!("clip too small ({} bytes), discarding", clip.len());
                self.set_state(ConversationState::Idle);
                if !self.pause(self.config.no_speech_pause).await {
                    self.teardown();
                    return;
                }
                continue;
            }

            let outcome = TurnPipeline {
                ctx: &self.ctx,
                service: &self.service,
                playback: &self.playback,
                history: &mut self.history,
                opts: &self.config.speech,
                events: &self.events,
                commands: &mut self.commands,
            }
            .run(clip)
            .await;

            match outcome {
                TurnOutcome::Completed => {
                    if self.ctx.is_stopped() {
                        self.teardown();
                        return;
                    }
                    if self.ctx.state() == ConversationState::Speaking {
                        self.set_state(ConversationState::Idle);
                        if !self.pause(self.config.resume_pause).await {
                            self.teardown();
                            return;
                        }
                    } else {
                        self.set_state(ConversationState::Idle);
                        return;
                    }
                }
                TurnOutcome::NoSpeech => {
                    self.set_state(ConversationState::Idle);
                    if !self.pause(self.config.no_speech_pause).await {
                        self.teardown();
                        return;
                    }
                }
                TurnOutcome::Interrupted => {
                    // Straight back to listening, no idle hop, no pause.
                    debug!("playback interrupted, listening again");
                }
                TurnOutcome::Cancelled => {
                    self.teardown();
                    return;
                }
                TurnOutcome::Failed(message) => {
                    warn!("turn failed: {}", message);
                    let _ = self.events.send(ConversationEvent::Error(message));
                    self.set_state(ConversationState::Idle);
                    return;
                }
            }
        }
    }

    /// One listening span: open the device, run analyzer + endpointer, and
    /// wait for the end-of-turn signal (or a manual stop, or the end of the
    /// conversation). The device is released on every exit path.
    async fn listen(&mut self) -> ListenOutcome {
        if self.ctx.is_stopped() {
            return ListenOutcome::Ended;
        }

        let mut capture = match self.input.open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("capture open failed: {}", e);
                let _ = self
                    .events
                    .send(ConversationEvent::Error(e.user_message()));
                // Reported, no state transition, no retry.
                return ListenOutcome::Denied;
            }
        };
        let Some(frames) = capture.take_frames() else {
            let _ = self.events.send(ConversationEvent::Error(
                "capture produced no frame stream".to_string(),
            ));
            return ListenOutcome::Denied;
        };

        self.set_state(ConversationState::Listening);
        let listen_start = Instant::now();
        self.level.store(0, Ordering::Relaxed);

        let analyzer = spawn_analyzer(
            self.config.analyzer.clone(),
            frames,
            Arc::clone(&self.level),
        );
        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        let endpointer = tokio::spawn(run_endpointer(
            self.config.endpoint.clone(),
            listen_start,
            Arc::clone(&self.level),
            Arc::clone(&self.silence_window_ms),
            Arc::clone(&self.ctx),
            signal_tx,
        ));

        let mut signals_open = true;
        let exit = loop {
            tokio::select! {
                signal = signals.recv(), if signals_open => match signal {
                    Some(EndpointSignal::SpeechStarted) => {
                        let _ = self.events.send(ConversationEvent::SpeechDetected);
                    }
                    Some(EndpointSignal::EndOfTurn) => break ListenExit::Commit,
                    None => signals_open = false,
                },
                command = self.commands.recv() => match command {
                    Some(Command::Toggle) => {
                        debug!("manual stop while listening");
                        break ListenExit::Commit;
                    }
                    Some(Command::End) | None => break ListenExit::End,
                },
            }
        };

        // Tear the detector down and release the device on every path; the
        // analyzer ends itself once the frame channel closes.
        endpointer.abort();
        let clip = capture.stop();
        let _ = analyzer.await;

        match exit {
            ListenExit::End => ListenOutcome::Ended,
            ListenExit::Commit => match clip {
                Ok(clip) => ListenOutcome::Clip(clip),
                Err(e) => {
                    warn!("capture stop failed: {}", e);
                    let _ = self
                        .events
                        .send(ConversationEvent::Error(e.user_message()));
                    self.set_state(ConversationState::Idle);
                    ListenOutcome::Denied
                }
            },
        }
    }

    /// Sleep between turns. Returns false when the conversation ended during
    /// the pause; a toggle simply skips the rest of the wait.
    async fn pause(&mut self, duration: Duration) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return !self.ctx.is_stopped(),
                command = self.commands.recv() => match command {
                    Some(Command::Toggle) => return !self.ctx.is_stopped(),
                    Some(Command::End) | None => return false,
                },
            }
        }
    }

    /// Handle the end of a conversation: everything released, history gone,
    /// state back to idle. The handle already silenced playback; doing it
    /// again here is harmless and covers non-handle paths.
    fn teardown(&mut self) {
        self.ctx.stop();
        self.playback.stop();
        self.history.clear();
        self.level.store(0, Ordering::Relaxed);
        self.ctx.set_state(ConversationState::Idle);
        let _ = self
            .events
            .send(ConversationEvent::StateChanged(ConversationState::Idle));
        let _ = self.events.send(ConversationEvent::Ended);
        info!("conversation ended");
    }

    fn set_state(&self, state: ConversationState) {
        self.ctx.set_state(state);
        let _ = self.events.send(ConversationEvent::StateChanged(state));
    }
}
