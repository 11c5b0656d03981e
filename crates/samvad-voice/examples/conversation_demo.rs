//! Conversation demo — full voice loop against a real speech service.
//!
//! Talks to the service configured by `SPEECH_API_URL` / `SPEECH_API_KEY`
//! (see `.env`), captures from the default microphone, and plays replies on
//! the default output device. Speak, pause, and the assistant answers; talk
//! over it to interrupt; Ctrl+C ends the conversation.

use anyhow::Context;
use samvad_voice::{
    ConversationConfig, ConversationEvent, CpalInput, HttpSpeechService, RodioPlayback,
    VoiceConversation,
};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Samvad conversation demo — speak, pause, listen, interrupt at will.");
    info!("Set SPEECH_API_URL / SPEECH_API_KEY in .env for your speech service.");
    info!("Press Ctrl+C to end the conversation.\n");

    let config = ConversationConfig::default();
    let service = HttpSpeechService::from_env().context("speech service configuration")?;
    let input = CpalInput::new(config.capture.clone());
    let playback = RodioPlayback::new().context("audio output")?;

    let (conversation, handle, mut events) = VoiceConversation::new(
        config,
        Arc::new(service),
        Arc::new(input),
        Arc::new(playback),
    );
    let loop_task = tokio::spawn(conversation.run());

    handle.toggle();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                handle.end_conversation();
            }
            event = events.recv() => match event {
                Some(ConversationEvent::StateChanged(state)) => {
                    info!("[{}]", state.as_str());
                }
                Some(ConversationEvent::SpeechDetected) => info!("hearing you..."),
                Some(ConversationEvent::UserTurn { text, .. }) => info!("you: {}", text),
                Some(ConversationEvent::AssistantTurn { text, .. }) => info!("assistant: {}", text),
                Some(ConversationEvent::NoSpeech) => info!("could not hear clearly, listening again..."),
                Some(ConversationEvent::Error(message)) => info!("error: {}", message),
                Some(ConversationEvent::Ended) => {
                    info!("conversation ended");
                    break;
                }
                None => break,
            },
        }
    }

    drop(handle);
    loop_task.await?;
    Ok(())
}
