//! Frequency-domain energy analysis for the level meter and the endpointer.
//!
//! Uses the byte-frequency convention of Web Audio analyser nodes: a
//! 256-point FFT over the most recent samples of each frame, magnitudes
//! converted to dB and scaled into [0,255] across a [-100dB, -30dB] range.
//! One [`u8`] energy sample per frame = the arithmetic mean of the bins, a
//! cheap proxy for "is anyone talking". Samples are not retained; only the
//! latest value is published.

use crate::audio::AudioChunk;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Analyzer configuration.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// FFT size (default: 256, giving 128 frequency bins).
    pub fft_size: usize,
    /// Magnitudes at or below this level read as 0 (default: -100 dB).
    pub min_db: f32,
    /// Magnitudes at or above this level read as 255 (default: -30 dB).
    pub max_db: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            min_db: -100.0,
            max_db: -30.0,
        }
    }
}

/// Computes one energy sample per PCM frame.
pub struct EnergyAnalyzer {
    config: AnalyzerConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    window_sum: f32,
    scratch: Vec<Complex<f32>>,
}

impl EnergyAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        let fft = FftPlanner::new().plan_fft_forward(config.fft_size);
        let n = config.fft_size;
        // Blackman window, the analyser-node default.
        let window: Vec<f32> = (0..n)
            .map(|i| {
                let x = i as f32 / (n - 1) as f32;
                0.42 - 0.5 * (std::f32::consts::TAU * x).cos()
                    + 0.08 * (2.0 * std::f32::consts::TAU * x).cos()
            })
            .collect();
        let window_sum = window.iter().sum();
        let scratch = vec![Complex::new(0.0, 0.0); n];
        Self {
            config,
            fft,
            window,
            window_sum,
            scratch,
        }
    }

    /// Analyze one frame and return its energy sample in [0,255].
    ///
    /// Uses the most recent `fft_size` samples of the frame (zero-padded if
    /// the frame is shorter). Pure read-only tap: never touches capture
    /// state.
    pub fn feed(&mut self, frame: &[f32]) -> u8 {
        let n = self.config.fft_size;
        let tail = if frame.len() > n {
            &frame[frame.len() - n..]
        } else {
            frame
        };
        let pad = n - tail.len();
        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { tail[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft.process(&mut self.scratch);

        // Amplitude-correct normalization, then dB -> byte per bin.
        let norm = 2.0 / self.window_sum;
        let bins = n / 2;
        let span = self.config.max_db - self.config.min_db;
        let mut sum = 0u32;
        for bin in self.scratch.iter().take(bins) {
            let magnitude = bin.norm() * norm;
            let db = 20.0 * magnitude.log10();
            let scaled = (db - self.config.min_db) / span * 255.0;
            sum += scaled.clamp(0.0, 255.0) as u32;
        }
        (sum / bins as u32) as u8
    }
}

/// Consume live frames, publishing the latest energy sample into `level`.
///
/// The task ends as soon as the frame channel closes (capture stopped), so
/// no sampling outlives the device.
pub fn spawn_analyzer(
    config: AnalyzerConfig,
    mut frames: mpsc::UnboundedReceiver<AudioChunk>,
    level: Arc<AtomicU8>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut analyzer = EnergyAnalyzer::new(config);
        while let Some(chunk) = frames.recv().await {
            let sample = analyzer.feed(&chunk.samples);
            level.store(sample, Ordering::Relaxed);
        }
        debug!("analyzer: frame channel closed, sampling stopped");
    })
}
