//! Wake word engine.
//! Pipeline: audio blocks → energy-pattern score → two-stage confirmation → `on_wake`.
//! The detector is a lightweight stand-in for a keyword-spotting model; any
//! `WakeDetector` can be plugged in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::endpoint::compute_rms;
use super::AudioSource;
use crate::error::{Error, Result};

/// Wake word detector (platform/model adapter).
pub trait WakeDetector: Send {
    /// Score one block of PCM i16 samples in [0.0, 1.0]. Higher = more confident.
    fn detect(&mut self, samples: &[i16]) -> f32;

    /// Reset internal state between detections.
    fn reset(&mut self);
}

/// Scores sudden energy rises against a smoothed background level.
pub struct EnergyPatternDetector {
    prev_energy: f32,
    spike_ratio_threshold: f32,
    /// Background below this RMS is treated as too quiet to judge a spike.
    floor: f32,
}

impl EnergyPatternDetector {
    pub fn new(spike_ratio_threshold: f32) -> Self {
        Self {
            prev_energy: 0.0,
            spike_ratio_threshold,
            floor: 100.0,
        }
    }
}

impl Default for EnergyPatternDetector {
    fn default() -> Self {
        Self::new(3.0)
    }
}

impl WakeDetector for EnergyPatternDetector {
    fn detect(&mut self, samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let rms = compute_rms(samples);
        let spiked = rms > self.prev_energy * self.spike_ratio_threshold;
        let score = if self.prev_energy > self.floor && spiked {
            let ratio = rms / self.prev_energy;
            ((ratio - self.spike_ratio_threshold) / self.spike_ratio_threshold).clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.prev_energy = self.prev_energy * 0.9 + rms * 0.1;
        score
    }

    fn reset(&mut self) {
        self.prev_energy = 0.0;
    }
}

/// Two-stage wake confirmation.
/// Stage 1: a score at or above `th_low` opens a confirmation window.
/// Stage 2: within the window, at least `confirm_frames_needed` scores must reach `th_high`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WakeConfirmer {
    pub th_low: f32,
    pub th_high: f32,
    #[serde(with = "millis")]
    pub confirm_window: Duration,
    pub confirm_frames_needed: u32,
}

impl Default for WakeConfirmer {
    fn default() -> Self {
        Self {
            th_low: 0.02,
            th_high: 0.04,
            confirm_window: Duration::from_millis(150),
            confirm_frames_needed: 2,
        }
    }
}

impl WakeConfirmer {
    #[inline]
    pub fn should_trigger(&self, wake_score: f32) -> bool {
        wake_score >= self.th_low
    }

    /// `scores` are the wake scores collected during the confirmation window.
    pub fn is_confirmed(&self, scores: &[f32]) -> bool {
        let hits = scores.iter().filter(|&&s| s >= self.th_high).count() as u32;
        hits >= self.confirm_frames_needed
    }

    /// Blocks in the window, counting the trigger block.
    pub fn window_blocks(&self, block_duration: Duration) -> usize {
        if block_duration.is_zero() {
            return 1;
        }
        (self.confirm_window.as_secs_f64() / block_duration.as_secs_f64())
            .ceil()
            .max(1.0) as usize
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Listens on an audio source and fires a callback per confirmed wake.
pub struct WakeWordEngine {
    source: Arc<dyn AudioSource>,
    detector: Box<dyn WakeDetector>,
    confirmer: WakeConfirmer,
    block_size: usize,
    read_timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl WakeWordEngine {
    pub fn new(
        source: Arc<dyn AudioSource>,
        detector: Box<dyn WakeDetector>,
        confirmer: WakeConfirmer,
        block_size: usize,
    ) -> Self {
        Self {
            source,
            detector,
            confirmer,
            block_size: block_size.max(1),
            read_timeout: Duration::from_millis(500),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that ends `start` at the next block boundary when raised.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Run detection until stopped. `on_wake` is called synchronously on this
    /// thread; buffered input is discarded after it returns.
    /// Returns `Ok` when stopped, `Err` when the input device fails.
    pub fn start<F: FnMut()>(&mut self, mut on_wake: F) -> Result<()> {
        let sample_rate = f64::from(self.source.sample_rate().max(1));
        let block_duration = Duration::from_secs_f64(self.block_size as f64 / sample_rate);
        let window = self.confirmer.window_blocks(block_duration);
        info!(
            th_low = self.confirmer.th_low,
            th_high = self.confirmer.th_high,
            window_blocks = window,
            "wake engine listening"
        );

        while !self.stop.load(Ordering::SeqCst) {
            let Some(score) = self.next_score()? else {
                continue;
            };
            if !self.confirmer.should_trigger(score) {
                continue;
            }

            debug!(score, "wake stage 1 triggered");
            let mut scores = vec![score];
            while scores.len() < window && !self.stop.load(Ordering::SeqCst) {
                if let Some(s) = self.next_score()? {
                    scores.push(s);
                }
            }

            if !self.confirmer.is_confirmed(&scores) {
                debug!(?scores, "wake not confirmed");
                continue;
            }

            info!(?scores, "wake_detected");
            on_wake();
            self.source.discard_pending();
            self.detector.reset();
        }

        info!("wake engine stopped");
        Ok(())
    }

    /// Score the next block. `None` on a read timeout, so the stop flag is rechecked.
    fn next_score(&mut self) -> Result<Option<f32>> {
        match self.source.read_block(self.block_size, self.read_timeout) {
            Ok(block) => Ok(Some(self.detector.detect(block.samples()))),
            Err(Error::Timeout(_)) => Ok(None),
            Err(e) => {
                warn!(error = %e, class = e.class(), "wake engine input failed");
                Err(e)
            }
        }
    }
}
