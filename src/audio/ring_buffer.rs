//! Capture ring buffer: fixed pre-allocated circular buffer for PCM samples.
//! The device callback writes, the block reader drains. Oldest audio is
//! overwritten when the reader falls behind.

/// Fixed-size ring buffer for mono i16 PCM. Pre-allocated, never grows.
pub struct RingBuffer {
    buffer: Box<[i16]>,
    write_pos: usize,
    read_pos: usize,
    /// Unread sample count, so a full buffer is distinguishable from an empty one.
    len: usize,
    capacity: usize,
    sample_rate: u32,
    overruns: u64,
}

impl RingBuffer {
    /// Create a ring buffer sized for `duration_secs` at `sample_rate` Hz, mono.
    pub fn new(sample_rate: u32, duration_secs: f32) -> Self {
        let capacity = ((sample_rate as f32 * duration_secs) as usize).max(1);
        Self {
            buffer: vec![0i16; capacity].into_boxed_slice(),
            write_pos: 0,
            read_pos: 0,
            len: 0,
            capacity,
            sample_rate,
            overruns: 0,
        }
    }

    /// Write samples. Overwrites oldest unread data if full.
    /// Called from the audio callback: no allocation.
    #[inline]
    pub fn write(&mut self, samples: &[i16]) {
        for &s in samples {
            self.buffer[self.write_pos] = s;
            self.write_pos = (self.write_pos + 1) % self.capacity;
            if self.len == self.capacity {
                self.read_pos = (self.read_pos + 1) % self.capacity;
                self.overruns += 1;
            } else {
                self.len += 1;
            }
        }
    }

    /// Read available samples into `output`. Returns the number read.
    #[inline]
    pub fn read(&mut self, output: &mut [i16]) -> usize {
        let to_read = output.len().min(self.len);
        for slot in output.iter_mut().take(to_read) {
            *slot = self.buffer[self.read_pos];
            self.read_pos = (self.read_pos + 1) % self.capacity;
        }
        self.len -= to_read;
        to_read
    }

    /// Number of unread samples available.
    #[inline]
    pub fn available(&self) -> usize {
        self.len
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples dropped because the reader fell behind.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Discard unread data (catch the read position up to the write position).
    pub fn reset_read(&mut self) {
        self.read_pos = self.write_pos;
        self.len = 0;
    }
}
