//! The turn pipeline: one recording through transcribe → generate →
//! synthesize → play.
//!
//! Every step checks the stopped flag immediately before and after its
//! suspension point; once the conversation has been ended the turn is
//! abandoned silently: no history mutation, no further calls, no resume.
//! That stop-checking at every continuation point is the core correctness
//! property for cancellation.

use crate::audio::{PlaybackSink, RecordingClip};
use crate::conversation::{Command, ConversationEvent};
use crate::history::ConversationHistory;
use crate::speech::{SpeechOptions, SpeechService};
use crate::state::{ConversationContext, ConversationState};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How one turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Full cycle ran; the loop re-arms listening after a short pause.
    Completed,
    /// Nothing intelligible in the clip; discarded, history untouched, the
    /// loop quietly re-arms.
    NoSpeech,
    /// Playback (or synthesis) was interrupted by the user: jump straight
    /// back to listening without visiting idle.
    Interrupted,
    /// The conversation was ended mid-turn; abandoned silently.
    Cancelled,
    /// An upstream step failed; the message is surfaced and the loop does
    /// not re-arm.
    Failed(String),
}

/// One turn's worth of borrowed machinery.
pub struct TurnPipeline<'a> {
    pub ctx: &'a Arc<ConversationContext>,
    pub service: &'a Arc<dyn SpeechService>,
    pub playback: &'a Arc<dyn PlaybackSink>,
    pub history: &'a mut ConversationHistory,
    pub opts: &'a SpeechOptions,
    pub events: &'a mpsc::UnboundedSender<ConversationEvent>,
    pub commands: &'a mut mpsc::UnboundedReceiver<Command>,
}

/// Await a step while honoring commands that arrive mid-flight.
///
/// End-conversation (or a closed command channel, or the stopped flag seen
/// at either edge of the await) cancels the turn. A toggle is an
/// interruption only while `interruptible` (the speaking phase); while
/// thinking it is ignored, matching the UI's inert orb.
async fn supervised<T>(
    ctx: &ConversationContext,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    interruptible: bool,
    fut: impl Future<Output = T>,
) -> Result<T, TurnOutcome> {
    if ctx.is_stopped() {
        return Err(TurnOutcome::Cancelled);
    }
    tokio::pin!(fut);
    loop {
        // Commands are drained first so a tap is judged against the state it
        // arrived in, not the state a later await happens to be in.
        tokio::select! {
            biased;
            cmd = commands.recv() => match cmd {
                Some(Command::End) | None => return Err(TurnOutcome::Cancelled),
                Some(Command::Toggle) if interruptible => {
                    return Err(TurnOutcome::Interrupted);
                }
                Some(Command::Toggle) => {
                    debug!("pipeline: toggle ignored while thinking");
                }
            },
            out = &mut fut => {
                if ctx.is_stopped() {
                    return Err(TurnOutcome::Cancelled);
                }
                return Ok(out);
            }
        }
    }
}

impl<'a> TurnPipeline<'a> {
    /// Run one turn to completion (or abandonment).
    pub async fn run(self, clip: RecordingClip) -> TurnOutcome {
        let TurnPipeline {
            ctx,
            service,
            playback,
            history,
            opts,
            events,
            commands,
        } = self;

        if ctx.is_stopped() {
            return TurnOutcome::Cancelled;
        }
        ctx.set_state(ConversationState::Thinking);
        let _ = events.send(ConversationEvent::StateChanged(ConversationState::Thinking));

        // 1. Transcribe
        let transcription = match supervised(
            ctx,
            commands,
            false,
            service.transcribe(&clip, &opts.stt_model, &opts.language_code),
        )
        .await
        {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => return TurnOutcome::Failed(e.user_message()),
            Err(outcome) => return outcome,
        };

        let user_text = transcription.transcript.trim().to_string();
        if user_text.is_empty() {
            info!("pipeline: empty transcript, discarding turn");
            let _ = events.send(ConversationEvent::NoSpeech);
            return TurnOutcome::NoSpeech;
        }

        // 2. Append + generate
        history.push_user(user_text.clone());
        let _ = events.send(ConversationEvent::UserTurn {
            text: user_text,
            timestamp: Utc::now(),
        });

        let messages = history.as_messages(&opts.system_prompt(), opts.context_turns);
        let reply = match supervised(
            ctx,
            commands,
            false,
            service.generate_reply(&opts.chat_model, &messages, opts.temperature),
        )
        .await
        {
            Ok(Ok(reply)) => reply.unwrap_or_else(|| opts.fallback_reply.clone()),
            Ok(Err(e)) => return TurnOutcome::Failed(e.user_message()),
            Err(outcome) => return outcome,
        };

        history.push_assistant(reply.clone());
        let _ = events.send(ConversationEvent::AssistantTurn {
            text: reply.clone(),
            timestamp: Utc::now(),
        });

        // 3. Synthesize
        ctx.set_state(ConversationState::Speaking);
        let _ = events.send(ConversationEvent::StateChanged(ConversationState::Speaking));
        let audio = match supervised(
            ctx,
            commands,
            true,
            service.synthesize(
                &reply,
                &opts.language_code,
                &opts.speaker,
                opts.pace,
                &opts.tts_model,
            ),
        )
        .await
        {
            Ok(Ok(audio)) => audio,
            Ok(Err(e)) => return TurnOutcome::Failed(e.user_message()),
            Err(outcome) => return outcome,
        };

        // 4. Play, suspended until the audio ends or is pre-empted.
        if !audio.is_empty() {
            if let Err(e) = playback.play(audio) {
                warn!("pipeline: playback failed: {}", e);
                return TurnOutcome::Failed(e.user_message());
            }
            match supervised(ctx, commands, true, playback.wait_until_done()).await {
                Ok(()) => {}
                Err(outcome) => {
                    playback.stop();
                    return outcome;
                }
            }
        }

        if ctx.is_stopped() {
            return TurnOutcome::Cancelled;
        }
        TurnOutcome::Completed
    }
}
