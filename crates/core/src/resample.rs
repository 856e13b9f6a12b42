//! Far-end reference resampling (playback rate -> capture rate).
//!
//! Each played chunk is resampled on its own, so the output length is always
//! `floor(n * to / from)` regardless of the method used.

use crate::constants::to_i16;
use anyhow::Result;
use realfft::RealFftPlanner;
use serde::{Deserialize, Serialize};

/// Resampling method for the reference path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResampleQuality {
    /// Fourier-domain resampling of the whole chunk. Falls back to
    /// [`ResampleQuality::Decimate`] if the transform fails.
    #[default]
    BandLimited,
    /// Nearest-index pick at the fixed rate ratio. Aliases, but is cheap.
    Decimate,
}

pub struct ReferenceResampler {
    from_rate: u32,
    to_rate: u32,
    quality: ResampleQuality,
    planner: RealFftPlanner<f32>,
}

impl ReferenceResampler {
    pub fn new(from_rate: u32, to_rate: u32, quality: ResampleQuality) -> Self {
        Self {
            from_rate,
            to_rate,
            quality,
            planner: RealFftPlanner::<f32>::new(),
        }
    }

    pub fn quality(&self) -> ResampleQuality {
        self.quality
    }

    /// Number of output samples produced for `input_len` input samples.
    pub fn output_len(&self, input_len: usize) -> usize {
        if self.from_rate == self.to_rate {
            return input_len;
        }
        (input_len as u64 * self.to_rate as u64 / self.from_rate as u64) as usize
    }

    /// Resamples one played chunk.
    pub fn process(&mut self, input: &[i16]) -> Vec<i16> {
        let out_len = self.output_len(input.len());
        if self.from_rate == self.to_rate {
            return input.to_vec();
        }
        if input.is_empty() || out_len == 0 {
            return Vec::new();
        }

        match self.quality {
            ResampleQuality::BandLimited => match self.band_limited(input, out_len) {
                Ok(out) => out,
                Err(e) => {
                    log::warn!("Band-limited resampling failed, decimating instead: {}", e);
                    self.decimate(input, out_len)
                }
            },
            ResampleQuality::Decimate => self.decimate(input, out_len),
        }
    }

    fn band_limited(&mut self, input: &[i16], out_len: usize) -> Result<Vec<i16>> {
        let in_len = input.len();
        let forward = self.planner.plan_fft_forward(in_len);
        let inverse = self.planner.plan_fft_inverse(out_len);

        let mut time: Vec<f32> = input.iter().map(|&s| s as f32).collect();
        let mut spectrum = forward.make_output_vec();
        forward.process(&mut time, &mut spectrum)?;

        // Keep the bins both lengths share; the rest stays zero (truncate or pad).
        let mut resized = inverse.make_input_vec();
        let common = in_len.min(out_len);
        let shared_bins = common / 2 + 1;
        resized[..shared_bins].copy_from_slice(&spectrum[..shared_bins]);

        // The bin at common/2 stands for both +/- frequencies when common is even.
        if common % 2 == 0 {
            if out_len < in_len {
                resized[common / 2] *= 2.0;
            } else if out_len > in_len {
                resized[common / 2] *= 0.5;
            }
        }
        resized[0].im = 0.0;
        if out_len % 2 == 0 {
            let last = resized.len() - 1;
            resized[last].im = 0.0;
        }

        let mut out = inverse.make_output_vec();
        inverse.process(&mut resized, &mut out)?;

        let scale = 1.0 / in_len as f32;
        Ok(out.into_iter().map(|s| to_i16(s * scale)).collect())
    }

    fn decimate(&self, input: &[i16], out_len: usize) -> Vec<i16> {
        let last = input.len() - 1;
        (0..out_len)
            .map(|i| {
                let src = (i as u64 * self.from_rate as u64 / self.to_rate as u64) as usize;
                input[src.min(last)]
            })
            .collect()
    }
}
