use crate::config::AecConfig;
use crate::constants::{to_i16, REFERENCE_ACTIVE_LEVEL};
use crate::echo_cancel::{build_canceller, AdaptiveCanceller};
use crate::frame_adapter::BlockReframer;
use crate::reference::{PlaybackTap, ReferenceDelayBuffer};
use crate::resample::ReferenceResampler;
use anyhow::Result;
use crossbeam_channel::Sender;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Lifecycle of a processor's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AecState {
    /// No audio seen yet
    Uninitialized,
    /// Filling the pipeline; `suppress` returns silence
    Warmup,
    /// Every chunk returns processed audio
    Steady,
}

/// Per-chunk levels reported while the far end is active.
///
/// Levels are mean absolute sample values on the i16 scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuppressionStats {
    pub mic_level: f32,
    pub reference_level: f32,
    pub output_level: f32,
    /// `20 * log10((mic + 1) / (output + 1))`
    pub suppression_db: f32,
    /// Whether the cleaned chunk still carries speech-level energy
    pub above_speech_threshold: bool,
}

fn mean_abs(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|&s| (s as f32).abs()).sum();
    sum / samples.len() as f32
}

/// Streaming echo suppressor for the capture thread.
///
/// Takes microphone chunks of any length and returns cleaned chunks of the
/// same length, pairing each with the far-end reference queued by a
/// [`PlaybackTap`].
pub struct StreamingAecProcessor {
    config: AecConfig,
    reframer: BlockReframer,
    reference: Arc<ReferenceDelayBuffer>,
    canceller: Box<dyn AdaptiveCanceller>,
    state: AecState,
    was_bypassed: bool,

    // Pre-allocated buffers (grow only for chunks larger than any seen before)
    output_queue: VecDeque<i16>,
    ref_chunk: Vec<i16>,
    hop_out: Vec<f32>,

    // Shared control interface
    pub bypass_enabled: Arc<AtomicBool>,
    pub stats_sender: Option<Sender<SuppressionStats>>,
}

impl StreamingAecProcessor {
    /// Builds a processor with the canceller selected by `config.canceller`.
    pub fn new(config: AecConfig) -> Result<Self> {
        config.validate()?;
        let canceller = build_canceller(&config)?;
        Self::with_canceller(config, canceller)
    }

    /// Builds a processor around an already constructed canceller.
    ///
    /// `config.canceller` is ignored; geometry, rates and buffers still come
    /// from `config`.
    pub fn with_canceller(config: AecConfig, canceller: Box<dyn AdaptiveCanceller>) -> Result<Self> {
        config.validate()?;
        let reframer = BlockReframer::new(config.block_len, config.block_shift)?;
        let reference = Arc::new(ReferenceDelayBuffer::new(config.max_delay_samples()));

        log::info!(
            "AEC processor ready: canceller={} block_len={} block_shift={} max_delay={} samples",
            canceller.name(),
            config.block_len,
            config.block_shift,
            reference.capacity()
        );

        Ok(Self {
            output_queue: VecDeque::with_capacity(config.block_len * 2),
            ref_chunk: Vec::with_capacity(config.block_len),
            hop_out: vec![0.0; config.block_shift],
            config,
            reframer,
            reference,
            canceller,
            state: AecState::Uninitialized,
            was_bypassed: false,
            bypass_enabled: Arc::new(AtomicBool::new(false)),
            stats_sender: None,
        })
    }

    pub fn config(&self) -> &AecConfig {
        &self.config
    }

    pub fn state(&self) -> AecState {
        self.state
    }

    pub fn canceller_name(&self) -> &'static str {
        self.canceller.name()
    }

    /// Worst-case delay between a mic sample entering and its cleaned copy
    /// leaving, excluding the chunk size chosen by the caller.
    pub fn latency_samples(&self) -> usize {
        self.canceller.latency_samples() + self.config.block_shift
    }

    /// The delay buffer shared with the playback side.
    pub fn reference_buffer(&self) -> &Arc<ReferenceDelayBuffer> {
        &self.reference
    }

    /// Creates a playback-thread handle feeding this processor's reference.
    pub fn playback_tap(&self) -> PlaybackTap {
        let resampler = ReferenceResampler::new(
            self.config.playback_rate,
            self.config.capture_rate,
            self.config.resample,
        );
        PlaybackTap::new(
            Arc::clone(&self.reference),
            resampler,
            self.config.residual_keep_samples(),
        )
    }

    /// Cleans one microphone chunk. The result always has `mic.len()` samples.
    pub fn suppress(&mut self, mic: &[i16]) -> Vec<i16> {
        let mut out = vec![0i16; mic.len()];
        self.suppress_into(mic, &mut out);
        out
    }

    /// Allocation-free form of [`suppress`](Self::suppress).
    ///
    /// `out` must be as long as `mic`; otherwise it is filled with silence.
    pub fn suppress_into(&mut self, mic: &[i16], out: &mut [i16]) {
        if mic.len() != out.len() {
            // Mismatch: output silence rather than crashing the capture thread
            log::error!(
                "Chunk length mismatch: mic={} output={}",
                mic.len(),
                out.len()
            );
            out.fill(0);
            return;
        }
        let n = mic.len();
        if n == 0 {
            return;
        }

        if self.state == AecState::Uninitialized {
            log::debug!("AEC warm-up started");
            self.state = AecState::Warmup;
        }

        // The reference is drained even in bypass to keep both streams aligned
        self.ref_chunk.clear();
        self.ref_chunk.resize(n, 0);
        self.reference.read_into(&mut self.ref_chunk);

        if self.bypass_enabled.load(Ordering::Relaxed) {
            out.copy_from_slice(mic);
            self.was_bypassed = true;
            return;
        }
        if self.was_bypassed {
            // Queued output and windows predate the bypass; start over
            self.was_bypassed = false;
            self.clear_pipeline();
            log::debug!("AEC resumed after bypass, warming up again");
        }

        let canceller = &mut self.canceller;
        let hop_out = &mut self.hop_out;
        let queue = &mut self.output_queue;
        let pushed = self.reframer.push(mic, &self.ref_chunk, |block| {
            canceller.process_block(&block, hop_out);
            queue.extend(hop_out.iter().map(|&s| to_i16(s)));
        });
        if let Err(e) = pushed {
            log::error!("Reframer rejected chunk: {:#}", e);
            out.fill(0);
            return;
        }

        if self.output_queue.len() >= n {
            for (dst, s) in out.iter_mut().zip(self.output_queue.drain(..n)) {
                *dst = s;
            }
            if self.state == AecState::Warmup {
                log::debug!(
                    "AEC warm-up finished, {} samples queued",
                    self.output_queue.len()
                );
                self.state = AecState::Steady;
            }
        } else {
            out.fill(0);
        }

        self.report_stats(mic, out);
    }

    fn report_stats(&mut self, mic: &[i16], out: &[i16]) {
        let Some(sender) = &self.stats_sender else {
            return;
        };

        let reference_level = mean_abs(&self.ref_chunk);
        let mic_level = mean_abs(mic);
        if reference_level <= REFERENCE_ACTIVE_LEVEL || mic_level <= 1.0 {
            return;
        }
        let output_level = mean_abs(out);
        let stats = SuppressionStats {
            mic_level,
            reference_level,
            output_level,
            suppression_db: 20.0 * ((mic_level + 1.0) / (output_level + 1.0)).log10(),
            above_speech_threshold: output_level > self.config.speech_energy_threshold,
        };

        if !sender.is_full() {
            if let Err(crossbeam_channel::TrySendError::Disconnected(_)) = sender.try_send(stats) {
                log::warn!("Stats receiver disconnected, disabling sender");
                self.stats_sender = None;
            }
        }
    }

    /// Drops all buffered audio and adaptive state, returning to warm-up.
    pub fn reset(&mut self) {
        self.clear_pipeline();
        self.reference.clear();
        self.was_bypassed = false;
        log::debug!("AEC processor reset");
    }

    /// Drops queued output and adaptive state; the reference is left aligned.
    fn clear_pipeline(&mut self) {
        self.reframer.reset();
        self.canceller.reset();
        self.output_queue.clear();
        self.state = AecState::Warmup;
    }
}
