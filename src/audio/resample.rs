//! Format adaptation for the output device: channel mapping, then per-block
//! linear-interpolation rate conversion. Output frame count per block is
//! `round(in_frames * out_rate / in_rate)`, so block boundaries never drift
//! from the requested length.

/// Target or source layout of interleaved i16 PCM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }
}

/// Number of output frames for a block of `in_frames`.
#[inline]
pub fn output_frames(in_frames: usize, in_rate: u32, out_rate: u32) -> usize {
    if in_rate == 0 {
        return 0;
    }
    (in_frames as f64 * f64::from(out_rate) / f64::from(in_rate)).round() as usize
}

/// Remap interleaved channels: mono is duplicated, many-to-mono is averaged,
/// otherwise output channel `i` takes input channel `i % in_channels`.
pub fn remap_channels(samples: &[i16], in_channels: u16, out_channels: u16) -> Vec<i16> {
    let in_ch = usize::from(in_channels.max(1));
    let out_ch = usize::from(out_channels.max(1));
    if in_ch == out_ch {
        return samples.to_vec();
    }

    let frames = samples.len() / in_ch;
    let mut out = Vec::with_capacity(frames * out_ch);
    for frame in samples.chunks_exact(in_ch) {
        if out_ch == 1 {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            out.push((sum / in_ch as i32) as i16);
        } else {
            for i in 0..out_ch {
                out.push(frame[i % in_ch]);
            }
        }
    }
    out
}

/// Resample interleaved PCM with linear interpolation, per channel.
pub fn resample_linear(samples: &[i16], channels: u16, in_rate: u32, out_rate: u32) -> Vec<i16> {
    let ch = usize::from(channels.max(1));
    if in_rate == out_rate {
        return samples.to_vec();
    }
    let in_frames = samples.len() / ch;
    let out_len = output_frames(in_frames, in_rate, out_rate);
    if in_frames == 0 || out_len == 0 {
        return Vec::new();
    }

    let step = in_frames as f64 / out_len as f64;
    let mut out = Vec::with_capacity(out_len * ch);
    for n in 0..out_len {
        let pos = n as f64 * step;
        let idx = pos.floor() as usize;
        let frac = pos - idx as f64;
        let next = (idx + 1).min(in_frames - 1);
        for c in 0..ch {
            let a = f64::from(samples[idx * ch + c]);
            let b = f64::from(samples[next * ch + c]);
            let v = a + (b - a) * frac;
            out.push(v.round().clamp(-32768.0, 32767.0) as i16);
        }
    }
    out
}

/// Adapt one block from `from` to `to`: channels first, then rate.
pub fn adapt_block(samples: &[i16], from: PcmFormat, to: PcmFormat) -> Vec<i16> {
    let remapped = remap_channels(samples, from.channels, to.channels);
    resample_linear(&remapped, to.channels, from.sample_rate, to.sample_rate)
}
