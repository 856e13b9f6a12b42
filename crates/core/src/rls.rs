//! Recursive least squares echo canceller with Geigel double-talk gating.
//!
//! Works sample by sample on the i16 scale. Converges far faster than NLMS at
//! O(taps^2) per sample, which is affordable for a few hundred taps.

use crate::config::RlsConfig;
use crate::echo_cancel::AdaptiveCanceller;
use crate::frame_adapter::BlockPair;
use anyhow::Result;

const SAMPLE_MIN: f64 = i16::MIN as f64;
const SAMPLE_MAX: f64 = i16::MAX as f64;

#[inline]
fn clip(sample: f64) -> f64 {
    if sample.is_nan() {
        0.0
    } else {
        sample.clamp(SAMPLE_MIN, SAMPLE_MAX)
    }
}

/// Tracks the peak absolute reference over a sliding window.
struct GeigelDetector {
    window: Vec<f64>,
    pos: usize,
    ratio: f64,
    epsilon: f64,
}

impl GeigelDetector {
    fn new(len: usize, ratio: f64, epsilon: f64) -> Self {
        Self {
            window: vec![0.0; len],
            pos: 0,
            ratio,
            epsilon,
        }
    }

    /// Records `reference` and reports whether `mic` looks like near-end speech.
    fn update(&mut self, mic: f64, reference: f64) -> bool {
        self.window[self.pos] = reference.abs();
        self.pos = (self.pos + 1) % self.window.len();

        let max_ref = self.window.iter().copied().fold(0.0f64, f64::max) + self.epsilon;
        mic.abs() > self.ratio * max_ref
    }

    fn reset(&mut self) {
        self.window.fill(0.0);
        self.pos = 0;
    }
}

pub struct RlsCanceller {
    taps: usize,
    lambda: f64,
    reg_param: f64,
    epsilon: f64,
    weights: Vec<f64>,
    /// Inverse correlation matrix, row-major taps x taps
    p: Vec<f64>,
    /// Reference history, newest first
    history: Vec<f64>,
    geigel: GeigelDetector,
    double_talk: bool,
    // Scratch: P*u (then the gain vector) and u^T*P
    p_u: Vec<f64>,
    u_p: Vec<f64>,
}

impl RlsCanceller {
    pub fn new(config: &RlsConfig) -> Result<Self> {
        config.validate()?;
        let taps = config.taps;
        let mut canceller = Self {
            taps,
            lambda: config.forgetting_factor,
            reg_param: config.reg_param,
            epsilon: config.epsilon,
            weights: vec![0.0; taps],
            p: vec![0.0; taps * taps],
            history: vec![0.0; taps],
            geigel: GeigelDetector::new(
                config.double_talk_window,
                config.double_talk_ratio,
                config.epsilon,
            ),
            double_talk: false,
            p_u: vec![0.0; taps],
            u_p: vec![0.0; taps],
        };
        canceller.reset_filter();
        Ok(canceller)
    }

    pub fn taps(&self) -> usize {
        self.taps
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Whether the most recent sample was classified as double-talk.
    pub fn is_double_talk(&self) -> bool {
        self.double_talk
    }

    /// Cancels one sample and returns the error (the cleaned sample).
    pub fn process(&mut self, mic_sample: f64, ref_sample: f64) -> f64 {
        let mic = clip(mic_sample);
        let reference = clip(ref_sample);

        self.history.copy_within(0..self.taps - 1, 1);
        self.history[0] = reference;

        let predicted: f64 = self
            .weights
            .iter()
            .zip(&self.history)
            .map(|(w, u)| w * u)
            .sum();
        let error = mic - predicted;

        self.double_talk = self.geigel.update(mic, reference);
        if !self.double_talk {
            self.adapt(error);
        }

        error
    }

    fn adapt(&mut self, error: f64) {
        let n = self.taps;
        let u = &self.history;

        // With no reference energy the recursion only scales P by 1/lambda.
        if u.iter().all(|&x| x == 0.0) {
            return;
        }

        for (i, row) in self.p.chunks_exact(n).enumerate() {
            self.p_u[i] = row.iter().zip(u).map(|(p, x)| p * x).sum();
        }
        let u_p_u: f64 = u.iter().zip(&self.p_u).map(|(x, pu)| x * pu).sum();
        let denominator = self.lambda + u_p_u + self.epsilon;
        if !denominator.is_finite() || denominator == 0.0 {
            return;
        }

        // u^T * P, taken before P changes
        self.u_p.fill(0.0);
        for (x, row) in u.iter().zip(self.p.chunks_exact(n)) {
            for (acc, p) in self.u_p.iter_mut().zip(row) {
                *acc += x * p;
            }
        }

        // p_u becomes the gain vector k
        for k in self.p_u.iter_mut() {
            *k /= denominator;
        }

        for (w, k) in self.weights.iter_mut().zip(&self.p_u) {
            *w += k * error;
        }

        let inv_lambda = 1.0 / self.lambda;
        for (k, row) in self.p_u.iter().zip(self.p.chunks_exact_mut(n)) {
            for (p, up) in row.iter_mut().zip(&self.u_p) {
                *p = (*p - k * up) * inv_lambda;
            }
        }
    }

    fn reset_filter(&mut self) {
        let n = self.taps;
        self.weights.fill(0.0);
        self.history.fill(0.0);
        self.p.fill(0.0);
        let diag = 1.0 / self.reg_param;
        for i in 0..n {
            self.p[i * n + i] = diag;
        }
        self.geigel.reset();
        self.double_talk = false;
    }
}

impl AdaptiveCanceller for RlsCanceller {
    fn name(&self) -> &'static str {
        "rls"
    }

    fn process_block(&mut self, block: &BlockPair<'_>, output: &mut [f32]) -> bool {
        for ((out, &mic), &reference) in output.iter_mut().zip(block.mic_hop).zip(block.ref_hop) {
            *out = self.process(mic as f64, reference as f64) as f32;
        }
        true
    }

    fn latency_samples(&self) -> usize {
        0
    }

    fn reset(&mut self) {
        self.reset_filter();
    }
}
