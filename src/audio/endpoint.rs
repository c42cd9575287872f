//! Energy-based endpointing on raw i16 samples.
//! A block is quiet when its amplitude metric falls below the threshold; the
//! utterance ends once consecutive quiet audio covers the silence window, or
//! when the hard block limit is reached.

use std::time::Duration;

use serde::Deserialize;

/// Mean absolute amplitude in the raw sample domain.
#[inline]
pub fn mean_abs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: u64 = samples.iter().map(|&s| u64::from(s.unsigned_abs())).sum();
    (sum as f64 / samples.len() as f64) as f32
}

/// Peak absolute amplitude in the raw sample domain.
#[inline]
pub fn peak_abs(samples: &[i16]) -> f32 {
    samples
        .iter()
        .map(|&s| s.unsigned_abs())
        .max()
        .map(f32::from)
        .unwrap_or(0.0)
}

/// RMS energy over a block of PCM samples.
#[inline]
pub fn compute_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let f = f64::from(s);
            f * f
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Which amplitude statistic decides whether a block is quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmplitudeMetric {
    #[default]
    Mean,
    Peak,
    Rms,
}

impl AmplitudeMetric {
    #[inline]
    pub fn measure(self, samples: &[i16]) -> f32 {
        match self {
            AmplitudeMetric::Mean => mean_abs(samples),
            AmplitudeMetric::Peak => peak_abs(samples),
            AmplitudeMetric::Rms => compute_rms(samples),
        }
    }
}

/// Endpointing parameters for one recording.
#[derive(Debug, Clone, Copy)]
pub struct EndpointConfig {
    pub sample_rate: u32,
    pub block_size: usize,
    pub max_duration: Duration,
    /// Same units as the metric: raw i16 amplitude.
    pub silence_threshold: f32,
    pub silence_duration: Duration,
    pub metric: AmplitudeMetric,
}

impl EndpointConfig {
    /// Hard limit on blocks read, never less than one.
    pub fn max_blocks(&self) -> usize {
        let max_samples = (f64::from(self.sample_rate) * self.max_duration.as_secs_f64()) as usize;
        (max_samples / self.block_size.max(1)).max(1)
    }

    /// Consecutive quiet samples that end the utterance.
    pub fn silence_samples(&self) -> usize {
        (f64::from(self.sample_rate) * self.silence_duration.as_secs_f64()).round() as usize
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / f64::from(self.sample_rate.max(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDecision {
    Continue,
    /// The silence window was filled by consecutive quiet blocks.
    Silence,
    /// The block limit was reached.
    MaxDuration,
}

/// Consecutive-silence detector. One instance per recording.
pub struct Endpointer {
    config: EndpointConfig,
    silence_samples: usize,
    max_blocks: usize,
    quiet_samples: usize,
    blocks_seen: usize,
}

impl Endpointer {
    pub fn new(config: EndpointConfig) -> Self {
        Self {
            silence_samples: config.silence_samples(),
            max_blocks: config.max_blocks(),
            config,
            quiet_samples: 0,
            blocks_seen: 0,
        }
    }

    /// Feed the next block. The block that triggers a stop belongs to the utterance.
    pub fn push(&mut self, block: &[i16]) -> EndpointDecision {
        self.blocks_seen += 1;

        let level = self.config.metric.measure(block);
        if level < self.config.silence_threshold {
            self.quiet_samples += block.len();
            if self.quiet_samples >= self.silence_samples {
                return EndpointDecision::Silence;
            }
        } else {
            self.quiet_samples = 0;
        }

        if self.blocks_seen >= self.max_blocks {
            return EndpointDecision::MaxDuration;
        }
        EndpointDecision::Continue
    }

    pub fn quiet_samples(&self) -> usize {
        self.quiet_samples
    }

    pub fn blocks_seen(&self) -> usize {
        self.blocks_seen
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }
}
