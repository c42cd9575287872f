//! Single-flight playback arbiter.
//! Every audio-output operation in the process goes through one arbiter, which
//! holds one lock for the whole operation. Callers queue on the lock; nothing
//! is dropped. Errors abort the current operation, are logged, and always
//! release the device.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::resample::{adapt_block, PcmFormat};
use crate::error::{Error, Result};

/// Physical output device with a fixed format.
pub trait AudioSink: Send + Sync {
    /// Format the device accepts. Input is adapted to this before writing.
    fn format(&self) -> PcmFormat;

    /// Start an output stream. The stream lives on the calling thread.
    fn open(&self) -> Result<Box<dyn SinkStream + '_>>;
}

/// One open output stream.
pub trait SinkStream {
    /// Queue interleaved samples in the device format. May block on backpressure.
    fn write(&mut self, interleaved: &[i16]) -> Result<()>;

    /// Block until everything written has been played, then close.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Serializes playback against one sink and tracks whether it is idle.
pub struct PlaybackArbiter {
    sink: Arc<dyn AudioSink>,
    device: Mutex<()>,
    /// Running plus queued operations.
    pending: AtomicUsize,
    poll_interval: Duration,
}

/// Held for the whole of one playback operation. Dropping it releases the device.
struct PlaybackToken<'a> {
    _device: MutexGuard<'a, ()>,
}

/// Counts an operation as pending from entry until every exit path.
struct PendingGuard<'a>(&'a AtomicUsize);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PlaybackArbiter {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self {
            sink,
            device: Mutex::new(()),
            pending: AtomicUsize::new(0),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Play an audio file (wav, mp3, or raw 16kHz mono PCM). Blocks until done.
    pub fn play_file(&self, path: &Path) {
        let _pending = self.enter();
        let _token = self.acquire();
        let started = Instant::now();

        let result = decode_file(path).and_then(|decoded| {
            let format = decoded.format;
            let frames_per_block =
                (format.sample_rate as usize / 10).max(1) * usize::from(format.channels.max(1));
            let blocks = decoded.samples.chunks(frames_per_block).map(<[i16]>::to_vec);
            self.run_blocks(blocks, format)
        });

        match result {
            Ok(samples) => info!(
                path = %path.display(),
                samples,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "playback finished"
            ),
            Err(e) => {
                error!(path = %path.display(), error = %e, class = e.class(), "playback failed")
            }
        }
    }

    /// Play a lazy sequence of interleaved PCM blocks. Blocks until done.
    pub fn play_stream<I>(&self, blocks: I, sample_rate: u32, channels: u16)
    where
        I: IntoIterator<Item = Vec<i16>>,
    {
        let _pending = self.enter();
        let _token = self.acquire();
        let started = Instant::now();

        match self.run_blocks(blocks.into_iter(), PcmFormat::new(sample_rate, channels)) {
            Ok(samples) => info!(
                samples,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stream playback finished"
            ),
            Err(e) => error!(error = %e, class = e.class(), "stream playback failed"),
        }
    }

    /// True while any playback runs or waits for the device.
    pub fn is_busy(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    /// Poll until idle. Returns false if still busy at the deadline.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_busy() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "playback still busy at idle deadline"
                );
                return false;
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn enter(&self) -> PendingGuard<'_> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        PendingGuard(&self.pending)
    }

    fn acquire(&self) -> PlaybackToken<'_> {
        let guard = match self.device.try_lock() {
            Some(guard) => guard,
            None => {
                debug!("output device busy, queueing playback");
                self.device.lock()
            }
        };
        PlaybackToken { _device: guard }
    }

    /// Adapt and write every block, then drain. Returns device samples written.
    fn run_blocks<I>(&self, blocks: I, from: PcmFormat) -> Result<usize>
    where
        I: Iterator<Item = Vec<i16>>,
    {
        let to = self.sink.format();
        let mut stream = self.sink.open()?;
        let mut written = 0usize;
        for block in blocks {
            if block.is_empty() {
                continue;
            }
            let adapted = if from == to {
                block
            } else {
                adapt_block(&block, from, to)
            };
            stream.write(&adapted)?;
            written += adapted.len();
        }
        stream.finish()?;
        Ok(written)
    }
}

/// Decoded file contents as interleaved i16.
pub struct DecodedAudio {
    pub samples: Vec<i16>,
    pub format: PcmFormat,
}

/// Decode a wav/mp3 file, or read raw 16kHz mono little-endian PCM.
pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "wav" => decode_wav(path),
        "mp3" => decode_mp3(path),
        _ => {
            let bytes = std::fs::read(path)?;
            let samples = bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            Ok(DecodedAudio {
                samples,
                format: PcmFormat::new(super::SAMPLE_RATE, 1),
            })
        }
    }
}

fn decode_wav(path: &Path) -> Result<DecodedAudio> {
    let reader = hound::WavReader::open(path).map_err(|e| Error::Device(format!("wav open: {e}")))?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
            .into_samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Device(format!("wav decode: {e}")))?,
        hound::SampleFormat::Int => {
            let shift = u32::from(spec.bits_per_sample.saturating_sub(16));
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::Device(format!("wav decode: {e}")))?
        }
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map(|v| (v * 32767.0).clamp(-32768.0, 32767.0) as i16))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Device(format!("wav decode: {e}")))?,
    };
    Ok(DecodedAudio {
        samples,
        format: PcmFormat::new(spec.sample_rate, spec.channels),
    })
}

fn decode_mp3(path: &Path) -> Result<DecodedAudio> {
    let file = std::fs::File::open(path)?;
    let mut decoder = minimp3::Decoder::new(std::io::BufReader::new(file));
    let mut samples = Vec::new();
    let mut format: Option<PcmFormat> = None;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                let frame_format = PcmFormat::new(frame.sample_rate as u32, frame.channels as u16);
                match format {
                    None => format = Some(frame_format),
                    Some(f) if f != frame_format => {
                        // Synthesized prompts never mix formats; adapt to the first.
                        samples.extend(adapt_block(&frame.data, frame_format, f));
                        continue;
                    }
                    Some(_) => {}
                }
                samples.extend_from_slice(&frame.data);
            }
            Err(minimp3::Error::Eof) => break,
            Err(minimp3::Error::SkippedData) => continue,
            Err(e) => return Err(Error::Device(format!("mp3 decode: {e}"))),
        }
    }

    let format =
        format.ok_or_else(|| Error::Device(format!("no audio frames in {}", path.display())))?;
    Ok(DecodedAudio { samples, format })
}

/// Output through the default (or named) cpal device at its default config.
pub struct CpalSink {
    device_name: Option<String>,
    format: PcmFormat,
    /// Queued audio above which `write` waits for the device.
    max_queued: Duration,
}

impl CpalSink {
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        use cpal::traits::DeviceTrait;

        let host = cpal::default_host();
        let device = select_output_device(&host, device_name)?;
        let config = device
            .default_output_config()
            .map_err(|e| Error::Device(e.to_string()))?;
        let format = PcmFormat::new(config.sample_rate().0, config.channels());

        debug!(
            device = device.name().unwrap_or_default(),
            sample_rate = format.sample_rate,
            channels = format.channels,
            "audio playback initialized"
        );

        Ok(Self {
            device_name: device_name.map(str::to_owned),
            format,
            max_queued: Duration::from_millis(500),
        })
    }
}

impl AudioSink for CpalSink {
    fn format(&self) -> PcmFormat {
        self.format
    }

    fn open(&self) -> Result<Box<dyn SinkStream + '_>> {
        use cpal::traits::{DeviceTrait, StreamTrait};

        let host = cpal::default_host();
        let device = select_output_device(&host, self.device_name.as_deref())?;
        let supported = device
            .default_output_config()
            .map_err(|e| Error::Device(e.to_string()))?;
        let config = cpal::StreamConfig {
            channels: self.format.channels,
            sample_rate: cpal::SampleRate(self.format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let queue = Arc::new(Mutex::new(VecDeque::<i16>::new()));
        let failed = Arc::new(AtomicBool::new(false));

        let failed_cb = Arc::clone(&failed);
        let on_error = move |err: cpal::StreamError| {
            error!(error = %err, "audio playback error");
            failed_cb.store(true, Ordering::SeqCst);
        };

        let q = Arc::clone(&queue);
        let stream = match supported.sample_format() {
            cpal::SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let mut q = q.lock();
                    for out in data.iter_mut() {
                        *out = q.pop_front().unwrap_or(0);
                    }
                },
                on_error,
                None,
            ),
            _ => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut q = q.lock();
                    for out in data.iter_mut() {
                        *out = q.pop_front().map_or(0.0, |s| f32::from(s) / 32768.0);
                    }
                },
                on_error,
                None,
            ),
        }
        .map_err(|e| Error::Device(format!("failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| Error::Device(format!("failed to start output stream: {e}")))?;

        let samples_per_sec = self.format.sample_rate as usize * usize::from(self.format.channels);
        Ok(Box::new(CpalSinkStream {
            _stream: stream,
            queue,
            failed,
            samples_per_sec,
            max_queued: (samples_per_sec as f64 * self.max_queued.as_secs_f64()) as usize,
        }))
    }
}

struct CpalSinkStream {
    _stream: cpal::Stream,
    queue: Arc<Mutex<VecDeque<i16>>>,
    failed: Arc<AtomicBool>,
    samples_per_sec: usize,
    max_queued: usize,
}

impl CpalSinkStream {
    fn check_failed(&self) -> Result<()> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(Error::Device("output stream failed".into()));
        }
        Ok(())
    }

    fn queued_duration(&self) -> Duration {
        Duration::from_secs_f64(self.queue.lock().len() as f64 / self.samples_per_sec.max(1) as f64)
    }
}

impl SinkStream for CpalSinkStream {
    fn write(&mut self, interleaved: &[i16]) -> Result<()> {
        // A device that stops pulling must not hang the arbiter.
        let stall_limit = Instant::now() + self.queued_duration() + Duration::from_secs(2);
        while self.queue.lock().len() > self.max_queued {
            self.check_failed()?;
            if Instant::now() > stall_limit {
                return Err(Error::Device("output device stalled".into()));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.check_failed()?;
        self.queue.lock().extend(interleaved.iter().copied());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<()> {
        let deadline = Instant::now() + self.queued_duration() + Duration::from_secs(2);
        while !self.queue.lock().is_empty() {
            self.check_failed()?;
            if Instant::now() > deadline {
                return Err(Error::Device("output device did not drain".into()));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        // Let the device play out its own buffer.
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    }
}

fn select_output_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if let Some(wanted) = name {
        let devices = host
            .output_devices()
            .map_err(|e| Error::Device(e.to_string()))?;
        for device in devices {
            if device.name().map(|n| n.contains(wanted)).unwrap_or(false) {
                return Ok(device);
            }
        }
        warn!(device = wanted, "output device not found, using default");
    }
    host.default_output_device()
        .ok_or_else(|| Error::Device("no output device available".into()))
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory sink that records what was played and when.

    use super::*;

    #[derive(Debug, Clone)]
    pub struct Interval {
        pub start: Instant,
        pub end: Instant,
    }

    pub struct RecordingSink {
        format: PcmFormat,
        write_delay: Duration,
        fail_after_writes: Option<usize>,
        pub intervals: Mutex<Vec<Interval>>,
        pub samples: Mutex<Vec<i16>>,
        active: AtomicUsize,
        pub max_concurrent: AtomicUsize,
    }

    impl RecordingSink {
        pub fn new(format: PcmFormat) -> Self {
            Self {
                format,
                write_delay: Duration::ZERO,
                fail_after_writes: None,
                intervals: Mutex::new(Vec::new()),
                samples: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            }
        }

        pub fn with_write_delay(mut self, delay: Duration) -> Self {
            self.write_delay = delay;
            self
        }

        pub fn failing_after(mut self, writes: usize) -> Self {
            self.fail_after_writes = Some(writes);
            self
        }
    }

    struct RecordingStream<'a> {
        sink: &'a RecordingSink,
        start: Instant,
        writes: usize,
    }

    impl Drop for RecordingStream<'_> {
        fn drop(&mut self) {
            self.sink.active.fetch_sub(1, Ordering::SeqCst);
            self.sink.intervals.lock().push(Interval {
                start: self.start,
                end: Instant::now(),
            });
        }
    }

    impl AudioSink for RecordingSink {
        fn format(&self) -> PcmFormat {
            self.format
        }

        fn open(&self) -> Result<Box<dyn SinkStream + '_>> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now_active, Ordering::SeqCst);
            Ok(Box::new(RecordingStream {
                sink: self,
                start: Instant::now(),
                writes: 0,
            }))
        }
    }

    impl SinkStream for RecordingStream<'_> {
        fn write(&mut self, interleaved: &[i16]) -> Result<()> {
            if let Some(limit) = self.sink.fail_after_writes {
                if self.writes >= limit {
                    return Err(Error::Device("injected write failure".into()));
                }
            }
            self.writes += 1;
            std::thread::sleep(self.sink.write_delay);
            self.sink.samples.lock().extend_from_slice(interleaved);
            Ok(())
        }

        fn finish(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }
}
