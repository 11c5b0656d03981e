//! Energy-threshold endpointing: deciding that the user finished speaking.
//!
//! The detector walks a fixed-interval poll over the analyzer's latest
//! energy sample. Any sound above the threshold cancels an accruing silence
//! window; once speech has been heard and the minimum speech duration has
//! elapsed, a contiguous run of quiet samples longer than the (live
//! adjustable) silence window fires end-of-turn exactly once.
//!
//! The poller is a cancellable periodic task, not a self-rescheduling timer:
//! every tick first checks the conversation state and stopped flag and exits
//! silently if either disqualifies continued detection.

use crate::state::{ConversationContext, ConversationState};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::debug;

/// Signals raised by the detector while listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSignal {
    /// First sample above the threshold in this listening span.
    SpeechStarted,
    /// Sustained silence after confirmed speech: the turn is over.
    EndOfTurn,
}

/// Endpointer tuning. Defaults match the behavior users already know:
/// quiet is anything at or below 12 energy units, endpointing arms only
/// after 600ms of listening, and 1.8s of unbroken quiet ends the turn.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Energy level at or below which a sample counts as silence.
    pub silence_threshold: u8,

    /// Minimum time since listening began before endpointing may trigger.
    pub min_speech: Duration,

    /// Silence required to confirm end-of-turn. The live value can be
    /// overridden per poll through the shared sensitivity control.
    pub silence_window: Duration,

    /// Poll cadence while listening.
    pub poll_interval: Duration,

    /// Grace delay before the first poll, to avoid false triggers right
    /// after the device opens.
    pub arm_delay: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 12,
            min_speech: Duration::from_millis(600),
            silence_window: Duration::from_millis(1800),
            poll_interval: Duration::from_millis(80),
            arm_delay: Duration::from_millis(500),
        }
    }
}

/// The pure detection state machine. Fed one sample per poll.
pub struct Endpointer {
    config: EndpointConfig,
    listen_start: Instant,
    has_spoken: bool,
    silence_start: Option<Instant>,
}

impl Endpointer {
    pub fn new(config: EndpointConfig, listen_start: Instant) -> Self {
        Self {
            config,
            listen_start,
            has_spoken: false,
            silence_start: None,
        }
    }

    /// Whether speech has been observed in this listening span.
    pub fn has_spoken(&self) -> bool {
        self.has_spoken
    }

    /// Observe one sample at `now` against the given silence window.
    ///
    /// Returns `SpeechStarted` the first time sound is heard, `EndOfTurn`
    /// when the silence window is exceeded, `None` otherwise. The invariant:
    /// `silence_start` is set only while the latest contiguous run of
    /// samples has been at or below the threshold; any louder sample resets
    /// it instantly.
    pub fn observe(
        &mut self,
        sample: u8,
        silence_window: Duration,
        now: Instant,
    ) -> Option<EndpointSignal> {
        if sample > self.config.silence_threshold {
            let first = !self.has_spoken;
            self.has_spoken = true;
            self.silence_start = None;
            return first.then_some(EndpointSignal::SpeechStarted);
        }

        if self.has_spoken && now.duration_since(self.listen_start) > self.config.min_speech {
            match self.silence_start {
                None => self.silence_start = Some(now),
                Some(since) if now.duration_since(since) > silence_window => {
                    return Some(EndpointSignal::EndOfTurn);
                }
                Some(_) => {}
            }
        }
        // No speech yet, or still inside the grace window: keep polling.
        None
    }
}

/// Run the detector until it fires or is disqualified.
///
/// `silence_window_ms` is the live sensitivity control: it is re-read on
/// every poll so a mid-listen adjustment takes effect immediately. The task
/// never fires once the state has left `Listening` or the conversation was
/// stopped; the caller additionally aborts it on every capture-stop path.
pub async fn run_endpointer(
    config: EndpointConfig,
    listen_start: Instant,
    level: Arc<AtomicU8>,
    silence_window_ms: Arc<AtomicU64>,
    ctx: Arc<ConversationContext>,
    signals: mpsc::UnboundedSender<EndpointSignal>,
) {
    sleep(config.arm_delay).await;

    let mut detector = Endpointer::new(config.clone(), listen_start);
    let mut ticker = interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if ctx.is_stopped() || ctx.state() != ConversationState::Listening {
            debug!("endpointer: disqualified, exiting");
            return;
        }
        let window = Duration::from_millis(silence_window_ms.load(Ordering::Relaxed));
        let sample = level.load(Ordering::Relaxed);
        match detector.observe(sample, window, Instant::now()) {
            Some(EndpointSignal::EndOfTurn) => {
                debug!("endpointer: end of turn");
                let _ = signals.send(EndpointSignal::EndOfTurn);
                return;
            }
            Some(signal) => {
                let _ = signals.send(signal);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(80);

    fn config() -> EndpointConfig {
        EndpointConfig::default()
    }

    /// Drive the detector with a sample sequence at the poll cadence,
    /// returning the offset at which it fired, if any.
    fn drive(detector: &mut Endpointer, start: Instant, samples: &[u8]) -> Option<Duration> {
        for (i, &sample) in samples.iter().enumerate() {
            let now = start + POLL * (i as u32 + 1);
            if detector.observe(sample, Duration::from_millis(1800), now)
                == Some(EndpointSignal::EndOfTurn)
            {
                return Some(now.duration_since(start));
            }
        }
        None
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_speech_then_sustained_silence() {
        let start = Instant::now();
        let mut detector = Endpointer::new(config(), start);

        // 400ms of speech (5 polls over threshold), then continuous quiet.
        let mut samples = vec![40u8; 5];
        samples.extend(vec![5u8; 40]);
        let fired_at = drive(&mut detector, start, &samples).expect("should fire");

        // Silence accrual starts at the first quiet poll past the 600ms
        // minimum (t=640ms) and the window must exceed 1800ms, so the turn
        // ends on the first poll after t=2440ms.
        assert_eq!(fired_at, Duration::from_millis(2480));
    }

    #[tokio::test(start_paused = true)]
    async fn never_fires_without_speech() {
        let start = Instant::now();
        let mut detector = Endpointer::new(config(), start);
        let samples = vec![0u8; 100]; // 8 seconds of quiet
        assert_eq!(drive(&mut detector, start, &samples), None);
        assert!(!detector.has_spoken());
    }

    #[tokio::test(start_paused = true)]
    async fn sound_resets_an_accruing_silence_window() {
        let start = Instant::now();
        let mut detector = Endpointer::new(config(), start);

        // Speech, 1.6s of quiet (not enough), a louder blip, then quiet.
        let mut samples = vec![40u8; 10]; // 800ms speech
        samples.extend(vec![5u8; 20]); // 1600ms quiet, window not reached
        samples.push(40); // blip resets silence_start
        samples.extend(vec![5u8; 40]);
        let fired_at = drive(&mut detector, start, &samples).expect("should fire");

        // The blip lands at t=2480ms; accrual restarts at t=2560ms and the
        // detector fires on the first poll after 2560+1800 = 4360ms.
        assert_eq!(fired_at, Duration::from_millis(4400));
    }

    #[tokio::test(start_paused = true)]
    async fn short_utterance_waits_for_minimum_speech() {
        let start = Instant::now();
        let mut detector = Endpointer::new(config(), start);

        // One quick 80ms blip then quiet: silence may only accrue after the
        // 600ms minimum, so the fire lands after 640+1800 ms, not 160+1800.
        let mut samples = vec![40u8];
        samples.extend(vec![0u8; 60]);
        let fired_at = drive(&mut detector, start, &samples).expect("should fire");
        assert_eq!(fired_at, Duration::from_millis(2480));
    }

    #[tokio::test(start_paused = true)]
    async fn sensitivity_override_applies_per_observation() {
        let start = Instant::now();
        let mut detector = Endpointer::new(config(), start);

        // Confirmed speech, then quiet judged against a 400ms window.
        let mut fired = None;
        let samples: Vec<u8> = std::iter::repeat(40)
            .take(10)
            .chain(std::iter::repeat(0).take(20))
            .collect();
        for (i, &sample) in samples.iter().enumerate() {
            let now = start + POLL * (i as u32 + 1);
            if detector.observe(sample, Duration::from_millis(400), now)
                == Some(EndpointSignal::EndOfTurn)
            {
                fired = Some(now.duration_since(start));
                break;
            }
        }
        // Accrual starts at t=880ms; 400ms window exceeded at t=1360ms.
        assert_eq!(fired, Some(Duration::from_millis(1360)));
    }

    #[tokio::test(start_paused = true)]
    async fn speech_started_signal_raised_once() {
        let start = Instant::now();
        let mut detector = Endpointer::new(config(), start);
        let window = Duration::from_millis(1800);
        assert_eq!(
            detector.observe(40, window, start + POLL),
            Some(EndpointSignal::SpeechStarted)
        );
        assert_eq!(detector.observe(40, window, start + POLL * 2), None);
        assert!(detector.has_spoken());
    }

    #[tokio::test(start_paused = true)]
    async fn task_exits_when_state_leaves_listening() {
        let ctx = Arc::new(ConversationContext::new());
        ctx.set_state(ConversationState::Listening);
        let level = Arc::new(AtomicU8::new(40));
        let window = Arc::new(AtomicU64::new(1800));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(run_endpointer(
            config(),
            Instant::now(),
            Arc::clone(&level),
            window,
            Arc::clone(&ctx),
            tx,
        ));

        // Let it hear some speech, then pull the state out from under it.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(rx.recv().await, Some(EndpointSignal::SpeechStarted));
        ctx.set_state(ConversationState::Idle);
        level.store(0, Ordering::Relaxed);
        task.await.unwrap();
        // Exited silently: no end-of-turn was ever sent.
        assert_eq!(rx.recv().await, None);
    }
}
