//! Recorder: AudioSource + Endpointer.
//! `record` buffers a whole utterance; `record_stream` yields blocks lazily as
//! they are captured. Both stop on consecutive silence or the duration limit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as cb;
use tracing::{debug, info, warn};

use super::endpoint::{AmplitudeMetric, EndpointConfig, EndpointDecision, Endpointer};
use super::{AudioBlock, AudioSource, Utterance};

/// Composes a microphone with endpointing. Only one recording should read the
/// source at a time; concurrent recordings on one device are unsupported.
pub struct Recorder {
    source: Arc<dyn AudioSource>,
    block_size: usize,
    metric: AmplitudeMetric,
    read_timeout: Duration,
    diagnostics_path: Option<PathBuf>,
}

impl Recorder {
    pub fn new(source: Arc<dyn AudioSource>, block_size: usize) -> Self {
        Self {
            source,
            block_size: block_size.max(1),
            metric: AmplitudeMetric::default(),
            read_timeout: Duration::from_secs(2),
            diagnostics_path: None,
        }
    }

    pub fn with_metric(mut self, metric: AmplitudeMetric) -> Self {
        self.metric = metric;
        self
    }

    /// Per-block device read deadline; an expired read ends the recording.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Write every streamed recording to this WAV file (best effort).
    pub fn with_diagnostics(mut self, path: Option<PathBuf>) -> Self {
        self.diagnostics_path = path;
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.source.sample_rate()
    }

    fn endpoint_config(
        &self,
        max_duration_secs: f32,
        silence_threshold: f32,
        silence_duration_secs: f32,
    ) -> EndpointConfig {
        EndpointConfig {
            sample_rate: self.source.sample_rate(),
            block_size: self.block_size,
            max_duration: Duration::from_secs_f32(max_duration_secs.max(0.0)),
            silence_threshold,
            silence_duration: Duration::from_secs_f32(silence_duration_secs.max(0.0)),
            metric: self.metric,
        }
    }

    /// Record one utterance. `None` when not a single block could be captured.
    pub fn record(
        &self,
        max_duration_secs: f32,
        silence_threshold: f32,
        silence_duration_secs: f32,
    ) -> Option<Utterance> {
        let config =
            self.endpoint_config(max_duration_secs, silence_threshold, silence_duration_secs);
        let stream =
            RecordingStream::new(Arc::clone(&self.source), config, self.read_timeout, None);
        let blocks: Vec<AudioBlock> = stream.collect();

        match Utterance::from_blocks(&blocks, self.block_size) {
            Some(utterance) => {
                info!(
                    blocks = blocks.len(),
                    duration_ms = utterance.duration().as_millis() as u64,
                    "recording complete"
                );
                Some(utterance)
            }
            None => {
                warn!("recording captured no audio");
                None
            }
        }
    }

    /// Start a streaming recording. Each call is a new, single-use recording.
    pub fn record_stream(
        &self,
        max_duration_secs: f32,
        silence_threshold: f32,
        silence_duration_secs: f32,
    ) -> RecordingStream {
        let config =
            self.endpoint_config(max_duration_secs, silence_threshold, silence_duration_secs);
        let tap = self
            .diagnostics_path
            .as_deref()
            .and_then(|path| DiagnosticTap::start(path, config.sample_rate));
        RecordingStream::new(Arc::clone(&self.source), config, self.read_timeout, tap)
    }
}

/// Lazy, finite block sequence of one recording. Reads the device only when
/// the consumer asks for the next block.
pub struct RecordingStream {
    source: Arc<dyn AudioSource>,
    endpointer: Endpointer,
    read_timeout: Duration,
    tap: Option<DiagnosticTap>,
    finished: bool,
    recording_id: uuid::Uuid,
}

impl RecordingStream {
    fn new(
        source: Arc<dyn AudioSource>,
        config: EndpointConfig,
        read_timeout: Duration,
        tap: Option<DiagnosticTap>,
    ) -> Self {
        let recording_id = uuid::Uuid::new_v4();
        debug!(
            recording = %recording_id,
            max_blocks = config.max_blocks(),
            silence_samples = config.silence_samples(),
            threshold = config.silence_threshold,
            "recording started"
        );
        Self {
            source,
            endpointer: Endpointer::new(config),
            read_timeout,
            tap,
            finished: false,
            recording_id,
        }
    }

    pub fn recording_id(&self) -> uuid::Uuid {
        self.recording_id
    }

    pub fn block_duration(&self) -> Duration {
        self.endpointer.config().block_duration()
    }

    fn finish(&mut self) {
        self.finished = true;
        // Dropping the sender lets the writer thread finalize the file.
        self.tap = None;
    }
}

impl Iterator for RecordingStream {
    type Item = AudioBlock;

    fn next(&mut self) -> Option<AudioBlock> {
        if self.finished {
            return None;
        }

        let block_size = self.endpointer.config().block_size;
        let block = match self.source.read_block(block_size, self.read_timeout) {
            Ok(block) => block,
            Err(e) => {
                warn!(
                    recording = %self.recording_id,
                    error = %e,
                    "audio read failed, ending recording"
                );
                self.finish();
                return None;
            }
        };

        match self.endpointer.push(block.samples()) {
            EndpointDecision::Continue => {}
            EndpointDecision::Silence => {
                info!(
                    recording = %self.recording_id,
                    blocks = self.endpointer.blocks_seen(),
                    "silence detected, stopping recording"
                );
                self.finished = true;
            }
            EndpointDecision::MaxDuration => {
                info!(
                    recording = %self.recording_id,
                    blocks = self.endpointer.blocks_seen(),
                    "max recording duration reached"
                );
                self.finished = true;
            }
        }

        if let Some(tap) = &self.tap {
            tap.offer(&block);
        }
        if self.finished {
            self.tap = None;
        }
        Some(block)
    }
}

impl std::iter::FusedIterator for RecordingStream {}

/// Best-effort WAV writer fed from the yield path. Never blocks: blocks that
/// do not fit in the queue are dropped.
struct DiagnosticTap {
    tx: cb::Sender<AudioBlock>,
}

impl DiagnosticTap {
    fn start(path: &Path, sample_rate: u32) -> Option<Self> {
        let (tx, rx) = cb::bounded::<AudioBlock>(256);
        let path = path.to_path_buf();
        let spawned = std::thread::Builder::new()
            .name("recording-tap".into())
            .spawn(move || write_wav(&path, sample_rate, rx));
        match spawned {
            Ok(_) => Some(Self { tx }),
            Err(e) => {
                warn!(error = %e, "diagnostic tap unavailable");
                None
            }
        }
    }

    fn offer(&self, block: &AudioBlock) {
        if let Err(cb::TrySendError::Full(_)) = self.tx.try_send(block.clone()) {
            debug!("diagnostic tap queue full, block dropped");
        }
    }
}

fn write_wav(path: &Path, sample_rate: u32, rx: cb::Receiver<AudioBlock>) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = match hound::WavWriter::create(path, spec) {
        Ok(w) => w,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "diagnostic recording not written");
            // Drain so the producer never sees a full queue.
            for _ in rx.iter() {}
            return;
        }
    };

    let mut failed = false;
    for block in rx.iter() {
        if failed {
            continue;
        }
        for &sample in block.samples() {
            if let Err(e) = writer.write_sample(sample) {
                warn!(error = %e, "diagnostic recording write failed");
                failed = true;
                break;
            }
        }
    }
    if let Err(e) = writer.finalize() {
        warn!(error = %e, "diagnostic recording finalize failed");
    } else {
        debug!(path = %path.display(), "diagnostic recording saved");
    }
}
