//! Audio capture and output.
//! Capture: cpal device callback → ring buffer → blocking block reader.
//! The callback runs on cpal's thread; the stream itself is owned by a
//! dedicated `audio-capture` thread for its whole lifetime.

pub mod endpoint;
pub mod playback;
pub mod recorder;
pub mod resample;
pub mod ring_buffer;
pub mod wake;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use ring_buffer::RingBuffer;

/// Capture sample rate (16kHz mono speech).
pub const SAMPLE_RATE: u32 = 16_000;
/// Samples per block: 640 samples = 1280 bytes = 40ms at 16kHz.
pub const BLOCK_SIZE: usize = 640;

/// Fixed-size slice of mono i16 PCM. Immutable once produced; clones share storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBlock {
    samples: Arc<[i16]>,
    sample_rate: u32,
}

impl AudioBlock {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate.max(1)))
    }

    /// Little-endian PCM16 bytes, the wire representation of a frame payload.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

/// Ordered concatenation of the blocks of one recording.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    samples: Vec<i16>,
    sample_rate: u32,
    block_size: usize,
}

impl Utterance {
    pub fn from_blocks(blocks: &[AudioBlock], block_size: usize) -> Option<Self> {
        let first = blocks.first()?;
        let mut samples = Vec::with_capacity(blocks.len() * block_size);
        for block in blocks {
            samples.extend_from_slice(block.samples());
        }
        Some(Self {
            samples,
            sample_rate: first.sample_rate(),
            block_size,
        })
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate.max(1)))
    }

    /// Re-split into blocks of the recording's block size, in capture order.
    pub fn blocks(&self) -> Vec<AudioBlock> {
        self.samples
            .chunks(self.block_size.max(1))
            .map(|chunk| AudioBlock::new(chunk.to_vec(), self.sample_rate))
            .collect()
    }
}

/// Pull-based microphone abstraction.
pub trait AudioSource: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Block until `block_size` samples are available or `timeout` expires.
    fn read_block(&self, block_size: usize, timeout: Duration) -> Result<AudioBlock>;

    /// Drop any buffered, unread audio.
    fn discard_pending(&self);
}

/// Microphone capture through cpal.
pub struct CpalSource {
    ring: Arc<Mutex<RingBuffer>>,
    sample_rate: u32,
    stop_flag: Arc<AtomicBool>,
    capture_thread: Option<std::thread::JoinHandle<()>>,
    poll_interval: Duration,
}

impl CpalSource {
    /// Open the input device (by name substring, or the default) and start capturing.
    pub fn open(device_name: Option<&str>, sample_rate: u32, buffer_secs: f32) -> Result<Self> {
        let ring = Arc::new(Mutex::new(RingBuffer::new(sample_rate, buffer_secs)));
        let stop_flag = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);

        let ring_cb = Arc::clone(&ring);
        let stop = Arc::clone(&stop_flag);
        let device_name = device_name.map(str::to_owned);

        // cpal streams are not Send: build and hold the stream on its own thread.
        let capture_thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let built = build_input_stream(device_name.as_deref(), sample_rate, ring_cb);
                let stream = match built {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
                debug!("audio capture stream closed");
            })
            .map_err(|e| Error::Device(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = capture_thread.join();
                return Err(e);
            }
            Err(_) => {
                stop_flag.store(true, Ordering::SeqCst);
                return Err(Error::Device("input stream did not start".into()));
            }
        }

        info!(sample_rate, "audio capture stream started");

        Ok(Self {
            ring,
            sample_rate,
            stop_flag,
            capture_thread: Some(capture_thread),
            poll_interval: Duration::from_millis(10),
        })
    }
}

impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read_block(&self, block_size: usize, timeout: Duration) -> Result<AudioBlock> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut rb = self.ring.lock();
                if rb.available() >= block_size {
                    let mut block = vec![0i16; block_size];
                    rb.read(&mut block);
                    return Ok(AudioBlock::new(block, self.sample_rate));
                }
            }
            if self.stop_flag.load(Ordering::Relaxed) {
                return Err(Error::Device("capture stopped".into()));
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(timeout));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    fn discard_pending(&self) {
        let mut rb = self.ring.lock();
        if rb.overruns() > 0 {
            debug!(overruns = rb.overruns(), "capture buffer overran since start");
        }
        rb.reset_read();
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
    }
}

/// Find an input device by name substring, falling back to the default device.
fn select_input_device(host: &cpal::Host, name: Option<&str>) -> Result<cpal::Device> {
    use cpal::traits::{DeviceTrait, HostTrait};

    if let Some(wanted) = name {
        let devices = host
            .input_devices()
            .map_err(|e| Error::Device(e.to_string()))?;
        for device in devices {
            if device.name().map(|n| n.contains(wanted)).unwrap_or(false) {
                return Ok(device);
            }
        }
        warn!(device = wanted, "input device not found, using default");
    }
    host.default_input_device()
        .ok_or_else(|| Error::Device("no audio input device available".into()))
}

fn build_input_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    ring: Arc<Mutex<RingBuffer>>,
) -> Result<cpal::Stream> {
    use cpal::traits::{DeviceTrait, StreamTrait};

    let host = cpal::default_host();
    let device = select_input_device(&host, device_name)?;
    let sample_format = device
        .default_input_config()
        .map(|c| c.sample_format())
        .unwrap_or(cpal::SampleFormat::I16);

    let stream_config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let on_error = |err: cpal::StreamError| error!(error = %err, "audio capture error");

    let stream = match sample_format {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut rb = ring.lock();
                for &s in data {
                    rb.write(&[(s * 32767.0).clamp(-32768.0, 32767.0) as i16]);
                }
            },
            on_error,
            None,
        ),
        _ => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                ring.lock().write(data);
            },
            on_error,
            None,
        ),
    }
    .map_err(|e| Error::Device(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| Error::Device(format!("failed to start input stream: {e}")))?;

    debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        ?sample_format,
        "audio input opened"
    );
    Ok(stream)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_bytes_are_little_endian() {
        let block = AudioBlock::new(vec![1, -2], SAMPLE_RATE);
        assert_eq!(block.to_le_bytes(), vec![0x01, 0x00, 0xFE, 0xFF]);
        assert_eq!(block.duration(), Duration::from_secs_f64(2.0 / 16_000.0));
    }

    #[test]
    fn test_utterance_preserves_block_order() {
        let blocks = vec![
            AudioBlock::new(vec![1, 2], SAMPLE_RATE),
            AudioBlock::new(vec![3, 4], SAMPLE_RATE),
            AudioBlock::new(vec![5], SAMPLE_RATE),
        ];
        let utt = Utterance::from_blocks(&blocks, 2).unwrap();
        assert_eq!(utt.samples(), &[1, 2, 3, 4, 5]);
        assert_eq!(utt.blocks(), blocks);
        assert!(Utterance::from_blocks(&[], 2).is_none());
    }
}
