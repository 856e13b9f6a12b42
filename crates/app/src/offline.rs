//! File-based processing: replays a far-end recording against a microphone
//! recording, the same way the live engine interleaves playback and capture.
//!
//! Files are raw mono signed 16-bit little-endian PCM.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use talkback_core::StreamingAecProcessor;

pub fn read_pcm(path: &Path) -> Result<Vec<i16>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if bytes.len() % 2 != 0 {
        bail!("{}: odd byte count, not 16-bit PCM", path.display());
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

pub fn write_pcm(path: &Path, samples: &[i16]) -> Result<()> {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    fs::write(path, bytes).with_context(|| format!("Failed to write {}", path.display()))
}

/// Runs `mic` (capture rate) through `processor` while playing `far_end`
/// (playback rate) into its reference, one chunk of each per step.
pub fn process_recording(
    processor: &mut StreamingAecProcessor,
    mic: &[i16],
    far_end: &[i16],
    chunk: usize,
) -> Vec<i16> {
    let config = processor.config();
    let play_chunk = chunk * config.playback_rate as usize / config.capture_rate as usize;
    let mut tap = processor.playback_tap();

    let mut cleaned = Vec::with_capacity(mic.len());
    let mut far_chunks = far_end.chunks(play_chunk.max(1));
    let mut playing = !far_end.is_empty();

    for mic_chunk in mic.chunks(chunk) {
        // Playback is recorded before the matching capture is processed
        match far_chunks.next() {
            Some(played) => tap.notify_played(played),
            None if playing => {
                tap.playback_finished();
                playing = false;
            }
            None => {}
        }
        cleaned.extend(processor.suppress(mic_chunk));
    }
    cleaned
}
