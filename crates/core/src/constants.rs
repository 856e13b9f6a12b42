//! Shared constants for talkback audio processing.

/// Capture (microphone) sample rate (16kHz)
pub const CAPTURE_RATE: u32 = 16000;

/// Playback (synthesized far-end) sample rate (24kHz)
pub const PLAYBACK_RATE: u32 = 24000;

/// Processing block length in samples (FFT size of the mask stage)
pub const BLOCK_LEN: usize = 512;

/// Block shift (hop) in samples, 8ms at 16kHz
pub const BLOCK_SHIFT: usize = 128;

/// Longest acoustic round trip the reference buffer covers
pub const MAX_DELAY_MS: u32 = 500;

/// Reference tail kept once a far-end response finishes playing
pub const RESIDUAL_KEEP_MS: u32 = 128;

/// Mean absolute level (i16 scale) above which a chunk counts as speech energy
pub const SPEECH_ENERGY_THRESHOLD: f32 = 130.0;

/// Mean absolute reference level below which a chunk is treated as far-end silence
pub const REFERENCE_ACTIVE_LEVEL: f32 = 500.0;

/// Normalisation divisor for i16 -> [-1, 1]
pub const I16_SCALE_IN: f32 = 32768.0;

/// Scale for [-1, 1] -> i16
pub const I16_SCALE_OUT: f32 = 32767.0;

/// Converts a duration to a sample count at `rate`.
pub const fn ms_to_samples(ms: u32, rate: u32) -> usize {
    (rate as usize * ms as usize) / 1000
}

/// Rounds and clips a float on the i16 scale to a device sample.
#[inline]
pub fn to_i16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    sample.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
