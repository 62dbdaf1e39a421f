//! PCM framing helpers.
//!
//! Audio frames are opaque to the bridge. The only thing it needs from them is
//! how long they take to play, which follows from the byte count and the
//! negotiated format.

use bytes::{Bytes, BytesMut};
use std::time::Duration;

/// Sample rate used by the realtime endpoint for PCM16 input and output.
pub const REALTIME_PCM16_SAMPLE_RATE: u32 = 24_000;

/// Speaking rate used when a turn's audio was never measured.
const ESTIMATED_WORDS_PER_SECOND: f64 = 2.5;
const MIN_ESTIMATED_SPEECH: Duration = Duration::from_secs(5);
const MAX_ESTIMATED_SPEECH: Duration = Duration::from_secs(30);

/// Fixed framing contract of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bytes_per_sample: u16,
}

impl AudioFormat {
    /// 16-bit little-endian mono PCM at 24 kHz (48 000 bytes per second).
    pub const PCM16_24K_MONO: Self = Self {
        sample_rate: REALTIME_PCM16_SAMPLE_RATE,
        channels: 1,
        bytes_per_sample: 2,
    };

    /// Size of one interleaved sample frame in bytes.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.bytes_per_sample as usize
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.frame_size() as u64
    }

    /// Wall-clock time needed to play `bytes` of audio in this format.
    ///
    /// Computed in integer nanoseconds so that exact ratios (for example
    /// 96 000 bytes at 48 000 B/s) come out exact.
    pub fn playable_duration(&self, bytes: u64) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        let nanos = bytes as u128 * 1_000_000_000 / bps as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::PCM16_24K_MONO
    }
}

/// Pads a frame with zero bytes up to the next whole sample frame.
///
/// The realtime endpoint occasionally splits a sample across two deltas.
pub fn pad_to_frame_boundary(frame: Bytes, format: &AudioFormat) -> Bytes {
    let frame_size = format.frame_size();
    if frame_size <= 1 || frame.len() % frame_size == 0 {
        return frame;
    }
    let missing = frame_size - frame.len() % frame_size;
    let mut padded = BytesMut::with_capacity(frame.len() + missing);
    padded.extend_from_slice(&frame);
    padded.resize(frame.len() + missing, 0);
    padded.freeze()
}

/// Delay to insert after a content-complete signal before the next turn.
///
/// `max(floor, playable) + margin`, where `playable` is derived from the bytes
/// that were actually received for the turn.
pub fn drain_delay(bytes: u64, format: &AudioFormat, floor: Duration, margin: Duration) -> Duration {
    format.playable_duration(bytes).max(floor) + margin
}

/// Fallback speech duration for a turn whose audio bytes are unknown.
pub fn estimate_speech_duration(text: &str, margin: Duration) -> Duration {
    let words = text.split_whitespace().count() as f64;
    let estimate = Duration::from_secs_f64(words / ESTIMATED_WORDS_PER_SECOND) + margin;
    estimate.clamp(MIN_ESTIMATED_SPEECH, MAX_ESTIMATED_SPEECH)
}
