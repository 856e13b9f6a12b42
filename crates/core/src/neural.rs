//! Two-stage neural echo canceller (DTLN-aec).
//!
//! Stage 1 estimates a spectral mask from the magnitude spectra of the mic and
//! reference windows; the masked mic spectrum is transformed back to the time
//! domain. Stage 2 refines that estimate against the reference window. Both
//! stages carry their own recurrent state. Refined blocks are overlap-added
//! into an accumulator whose first hop is emitted per step.

use crate::config::NeuralConfig;
use crate::constants::{I16_SCALE_IN, I16_SCALE_OUT};
use crate::echo_cancel::AdaptiveCanceller;
use crate::frame_adapter::BlockPair;
use crate::model::{RecurrentState, StageModel, StageOutput};
use anyhow::{bail, Result};
use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::sync::Arc;

// Inference failures are logged on the first occurrence and then once per this many.
const FAILURE_LOG_INTERVAL: u64 = 500;

pub struct NeuralMaskCanceller {
    block_len: usize,
    block_shift: usize,
    bins: usize,
    mask_model: Box<dyn StageModel>,
    refine_model: Box<dyn StageModel>,
    mask_state: RecurrentState,
    refine_state: RecurrentState,

    fft_forward: Arc<dyn RealToComplex<f32>>,
    fft_inverse: Arc<dyn ComplexToReal<f32>>,
    fft_scratch: Vec<Complex<f32>>,
    fft_input: Vec<f32>,
    mic_spectrum: Vec<Complex<f32>>,
    ref_spectrum: Vec<Complex<f32>>,
    mic_mag: Vec<f32>,
    ref_mag: Vec<f32>,
    ref_norm: Vec<f32>,
    estimate: Vec<f32>,
    accumulator: Vec<f32>,
    failures: u64,
}

impl NeuralMaskCanceller {
    /// Creates a canceller around two stage models.
    pub fn new(
        block_len: usize,
        block_shift: usize,
        mask_model: Box<dyn StageModel>,
        refine_model: Box<dyn StageModel>,
    ) -> Result<Self> {
        if block_shift == 0 || block_len < block_shift || block_len % 2 != 0 {
            bail!(
                "Invalid neural block geometry: block_len={} block_shift={}",
                block_len,
                block_shift
            );
        }

        let mut planner = RealFftPlanner::<f32>::new();
        let fft_forward = planner.plan_fft_forward(block_len);
        let fft_inverse = planner.plan_fft_inverse(block_len);
        let scratch_len = fft_forward
            .get_scratch_len()
            .max(fft_inverse.get_scratch_len());
        let bins = block_len / 2 + 1;

        let mask_state = RecurrentState::zeros(mask_model.state_shape());
        let refine_state = RecurrentState::zeros(refine_model.state_shape());

        Ok(Self {
            block_len,
            block_shift,
            bins,
            mask_model,
            refine_model,
            mask_state,
            refine_state,
            fft_forward,
            fft_inverse,
            fft_scratch: vec![Complex::new(0.0, 0.0); scratch_len],
            fft_input: vec![0.0; block_len],
            mic_spectrum: vec![Complex::new(0.0, 0.0); bins],
            ref_spectrum: vec![Complex::new(0.0, 0.0); bins],
            mic_mag: vec![0.0; bins],
            ref_mag: vec![0.0; bins],
            ref_norm: vec![0.0; block_len],
            estimate: vec![0.0; block_len],
            accumulator: vec![0.0; block_len],
            failures: 0,
        })
    }

    /// Loads the DTLN-aec stage models named by `config`.
    #[cfg(feature = "onnx")]
    pub fn from_config(block_len: usize, block_shift: usize, config: &NeuralConfig) -> Result<Self> {
        use crate::model::OnnxStage;
        use anyhow::Context;

        let model_dir = config
            .model_dir
            .as_ref()
            .context("Neural canceller needs a model_dir")?;
        let (mask_file, refine_file) = config.variant.model_files();
        let shape = config.variant.state_shape();
        let mask = OnnxStage::load(&model_dir.join(mask_file), &shape)?;
        let refine = OnnxStage::load(&model_dir.join(refine_file), &shape)?;
        Self::new(block_len, block_shift, Box::new(mask), Box::new(refine))
    }

    /// Without an inference runtime compiled in, only injected models work.
    #[cfg(not(feature = "onnx"))]
    pub fn from_config(_block_len: usize, _block_shift: usize, config: &NeuralConfig) -> Result<Self> {
        bail!(
            "Neural canceller ({:?}) requires the `onnx` feature; build with it or pass stage models to NeuralMaskCanceller::new",
            config.variant
        )
    }

    pub fn mask_state(&self) -> &RecurrentState {
        &self.mask_state
    }

    pub fn refine_state(&self) -> &RecurrentState {
        &self.refine_state
    }

    /// Blocks that fell back to passthrough since construction.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Runs both stages on one window pair and returns the refined block.
    /// States are committed only when both stages succeed.
    fn run_stages(&mut self, mic_window: &[f32], ref_window: &[f32]) -> Result<Vec<f32>> {
        for (dst, &src) in self.fft_input.iter_mut().zip(mic_window) {
            *dst = src / I16_SCALE_IN;
        }
        self.fft_forward.process_with_scratch(
            &mut self.fft_input,
            &mut self.mic_spectrum,
            &mut self.fft_scratch,
        )?;

        for (dst, &src) in self.ref_norm.iter_mut().zip(ref_window) {
            *dst = src / I16_SCALE_IN;
        }
        self.fft_input.copy_from_slice(&self.ref_norm);
        self.fft_forward.process_with_scratch(
            &mut self.fft_input,
            &mut self.ref_spectrum,
            &mut self.fft_scratch,
        )?;

        for (mag, bin) in self.mic_mag.iter_mut().zip(&self.mic_spectrum) {
            *mag = bin.norm();
        }
        for (mag, bin) in self.ref_mag.iter_mut().zip(&self.ref_spectrum) {
            *mag = bin.norm();
        }

        // Stage 1: spectral mask
        let masked = self
            .mask_model
            .run(&self.mic_mag, &self.ref_mag, &self.mask_state)?;
        check_stage("mask", &masked, self.bins, self.mask_state.shape())?;

        for (bin, &gain) in self.mic_spectrum.iter_mut().zip(&masked.data) {
            *bin *= gain;
        }
        self.mic_spectrum[0].im = 0.0;
        self.mic_spectrum[self.bins - 1].im = 0.0;
        self.fft_inverse.process_with_scratch(
            &mut self.mic_spectrum,
            &mut self.estimate,
            &mut self.fft_scratch,
        )?;
        let norm = 1.0 / self.block_len as f32;
        for s in self.estimate.iter_mut() {
            *s *= norm;
        }

        // Stage 2: time-domain refinement
        let refined = self
            .refine_model
            .run(&self.estimate, &self.ref_norm, &self.refine_state)?;
        check_stage("refinement", &refined, self.block_len, self.refine_state.shape())?;

        self.mask_state = masked.state;
        self.refine_state = refined.state;
        Ok(refined.data)
    }

    /// Shifts the accumulator by one hop and adds `block` if there is one.
    fn overlap_add(&mut self, block: Option<&[f32]>) {
        let keep = self.block_len - self.block_shift;
        self.accumulator.copy_within(self.block_shift.., 0);
        self.accumulator[keep..].fill(0.0);
        if let Some(block) = block {
            for (acc, &s) in self.accumulator.iter_mut().zip(block) {
                *acc += s;
            }
        }
    }
}

fn check_stage(stage: &str, output: &StageOutput, expected_len: usize, state_shape: &[usize]) -> Result<()> {
    if output.data.len() != expected_len {
        bail!(
            "{} stage returned {} values, expected {}",
            stage,
            output.data.len(),
            expected_len
        );
    }
    if output.state.shape() != state_shape {
        bail!(
            "{} stage returned state shape {:?}, expected {:?}",
            stage,
            output.state.shape(),
            state_shape
        );
    }
    if !output.data.iter().all(|v| v.is_finite()) {
        bail!("{} stage returned non-finite values", stage);
    }
    Ok(())
}

impl AdaptiveCanceller for NeuralMaskCanceller {
    fn name(&self) -> &'static str {
        "neural"
    }

    fn process_block(&mut self, block: &BlockPair<'_>, output: &mut [f32]) -> bool {
        match self.run_stages(block.mic_window, block.ref_window) {
            Ok(refined) => {
                self.overlap_add(Some(&refined));
                for (out, &acc) in output.iter_mut().zip(&self.accumulator[..self.block_shift]) {
                    *out = (acc.clamp(-1.0, 1.0) * I16_SCALE_OUT).round();
                }
                true
            }
            Err(e) => {
                if self.failures % FAILURE_LOG_INTERVAL == 0 {
                    log::warn!(
                        "Neural AEC inference failed, passing mic through ({} failures so far): {:#}",
                        self.failures + 1,
                        e
                    );
                }
                self.failures += 1;
                self.overlap_add(None);
                // Oldest hop of the window lines up with the accumulator output
                output.copy_from_slice(&block.mic_window[..self.block_shift]);
                false
            }
        }
    }

    fn latency_samples(&self) -> usize {
        self.block_len - self.block_shift
    }

    fn reset(&mut self) {
        self.mask_state = RecurrentState::zeros(self.mask_model.state_shape());
        self.refine_state = RecurrentState::zeros(self.refine_model.state_shape());
        self.accumulator.fill(0.0);
    }
}

/// Deterministic stage models for exercising the canceller without a runtime.
#[cfg(test)]
pub(crate) mod fakes {
    use super::*;

    pub const STATE_SHAPE: [usize; 4] = [1, 2, 4, 2];

    /// Mask of `1 / (1 + decay * state[0])`; the state counts calls.
    pub struct CountingMask {
        pub decay: f32,
    }

    impl StageModel for CountingMask {
        fn state_shape(&self) -> &[usize] {
            &STATE_SHAPE
        }

        fn run(&mut self, primary: &[f32], _reference: &[f32], state: &RecurrentState) -> Result<StageOutput> {
            let count = state.data()[0];
            let gain = 1.0 / (1.0 + self.decay * count);
            let (shape, mut data) = state.clone().into_parts();
            data.iter_mut().for_each(|v| *v += 1.0);
            Ok(StageOutput {
                data: vec![gain; primary.len()],
                state: RecurrentState::from_parts(shape, data).unwrap(),
            })
        }
    }

    /// Scales the estimate; `gain = shift / len` makes overlap-add an identity.
    pub struct ScaleRefine {
        pub gain: f32,
    }

    impl StageModel for ScaleRefine {
        fn state_shape(&self) -> &[usize] {
            &STATE_SHAPE
        }

        fn run(&mut self, primary: &[f32], _reference: &[f32], state: &RecurrentState) -> Result<StageOutput> {
            Ok(StageOutput {
                data: primary.iter().map(|s| s * self.gain).collect(),
                state: state.clone(),
            })
        }
    }

    pub struct FailingStage;

    impl StageModel for FailingStage {
        fn state_shape(&self) -> &[usize] {
            &STATE_SHAPE
        }

        fn run(&mut self, _primary: &[f32], _reference: &[f32], _state: &RecurrentState) -> Result<StageOutput> {
            bail!("interpreter exploded")
        }
    }

    /// Returns a block of the wrong length.
    pub struct TruncatingStage;

    impl StageModel for TruncatingStage {
        fn state_shape(&self) -> &[usize] {
            &STATE_SHAPE
        }

        fn run(&mut self, primary: &[f32], _reference: &[f32], state: &RecurrentState) -> Result<StageOutput> {
            Ok(StageOutput {
                data: primary[..primary.len() / 2].to_vec(),
                state: state.clone(),
            })
        }
    }

    /// Returns a state of a different shape than it declares.
    pub struct MisshapedState;

    impl StageModel for MisshapedState {
        fn state_shape(&self) -> &[usize] {
            &STATE_SHAPE
        }

        fn run(&mut self, primary: &[f32], _reference: &[f32], _state: &RecurrentState) -> Result<StageOutput> {
            Ok(StageOutput {
                data: primary.to_vec(),
                state: RecurrentState::zeros(&[1, 2, 8, 2]),
            })
        }
    }

    /// Emits a NaN in an otherwise unit mask and advances its state.
    pub struct NanMask;

    impl StageModel for NanMask {
        fn state_shape(&self) -> &[usize] {
            &STATE_SHAPE
        }

        fn run(&mut self, primary: &[f32], _reference: &[f32], state: &RecurrentState) -> Result<StageOutput> {
            let mut data = vec![1.0; primary.len()];
            data[1] = f32::NAN;
            let (shape, mut values) = state.clone().into_parts();
            values.iter_mut().for_each(|v| *v += 1.0);
            Ok(StageOutput {
                data,
                state: RecurrentState::from_parts(shape, values).unwrap(),
            })
        }
    }

    pub fn identity_canceller(block_len: usize, block_shift: usize) -> NeuralMaskCanceller {
        NeuralMaskCanceller::new(
            block_len,
            block_shift,
            Box::new(CountingMask { decay: 0.0 }),
            Box::new(ScaleRefine {
                gain: block_shift as f32 / block_len as f32,
            }),
        )
        .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use crate::frame_adapter::BlockReframer;

    fn speech_like(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f32 / 16000.0;
                (6000.0 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()
                    + 2000.0 * (2.0 * std::f32::consts::PI * 1330.0 * t).sin()) as i16
            })
            .collect()
    }

    /// Streams `mic` (with silent reference) through `canceller` hop by hop.
    fn run(canceller: &mut NeuralMaskCanceller, mic: &[i16], block_len: usize, shift: usize) -> Vec<f32> {
        let mut reframer = BlockReframer::new(block_len, shift).unwrap();
        let reference = vec![0i16; mic.len()];
        let mut out = Vec::new();
        let mut hop = vec![0.0f32; shift];
        reframer
            .push(mic, &reference, |block| {
                canceller.process_block(&block, &mut hop);
                out.extend_from_slice(&hop);
            })
            .unwrap();
        out
    }

    #[test]
    fn test_identity_models_reconstruct_delayed_input() {
        let mut canceller = identity_canceller(512, 128);
        assert_eq!(canceller.latency_samples(), 384);

        let mic = speech_like(4096);
        let out = run(&mut canceller, &mic, 512, 128);
        assert_eq!(out.len(), 4096);

        for (i, &s) in out.iter().enumerate().take(384) {
            assert_eq!(s, 0.0, "startup sample {} must be silent", i);
        }
        for i in 384..4096 {
            let expected = mic[i - 384] as f32;
            assert!(
                (out[i] - expected).abs() <= 1.0,
                "sample {}: expected {} got {}",
                i,
                expected,
                out[i]
            );
        }
    }

    #[test]
    fn test_recurrent_state_is_fed_back() {
        let mut canceller = NeuralMaskCanceller::new(
            64,
            16,
            Box::new(CountingMask { decay: 0.5 }),
            Box::new(ScaleRefine { gain: 0.25 }),
        )
        .unwrap();
        let mic = speech_like(160);
        run(&mut canceller, &mic, 64, 16);
        assert!(
            canceller.mask_state().data().iter().all(|&v| v == 10.0),
            "ten blocks advance the counting state ten times"
        );
    }

    #[test]
    fn test_reset_makes_processing_deterministic() {
        let mut canceller = NeuralMaskCanceller::new(
            64,
            16,
            Box::new(CountingMask { decay: 0.1 }),
            Box::new(ScaleRefine { gain: 0.25 }),
        )
        .unwrap();
        let mic = speech_like(640);

        let first = run(&mut canceller, &mic, 64, 16);
        let carried = run(&mut canceller, &mic, 64, 16);
        assert_ne!(first, carried, "state carried over changes the output");

        canceller.reset();
        let again = run(&mut canceller, &mic, 64, 16);
        assert_eq!(first, again, "reset must restore identical behaviour");
    }

    #[test]
    fn test_zero_input_after_reset_gives_zero_output() {
        let mut canceller = identity_canceller(512, 128);
        run(&mut canceller, &speech_like(2000), 512, 128);
        canceller.reset();
        let out = run(&mut canceller, &vec![0i16; 1024], 512, 128);
        assert!(out.iter().all(|&s| s == 0.0), "no residual state leakage");
    }

    #[test]
    fn test_failed_stage_passes_mic_through() {
        let mut canceller = NeuralMaskCanceller::new(
            64,
            16,
            Box::new(CountingMask { decay: 0.0 }),
            Box::new(FailingStage),
        )
        .unwrap();
        let mic: Vec<f32> = (0..64).map(|i| i as f32 * 10.0).collect();
        let reference = vec![0.0f32; 64];
        let block = BlockPair {
            mic_hop: &mic[48..],
            ref_hop: &reference[48..],
            mic_window: &mic,
            ref_window: &reference,
        };
        let mut out = [0.0f32; 16];

        assert!(!canceller.process_block(&block, &mut out));
        assert_eq!(&out[..], &mic[..16]);
        assert_eq!(canceller.failures(), 1);
        assert!(
            canceller.mask_state().data().iter().all(|&v| v == 0.0),
            "stage-1 state is not committed when stage 2 fails"
        );
    }

    #[test]
    fn test_wrong_output_length_passes_through() {
        let mut canceller = NeuralMaskCanceller::new(
            64,
            16,
            Box::new(TruncatingStage),
            Box::new(ScaleRefine { gain: 0.25 }),
        )
        .unwrap();
        let mic = speech_like(128);
        let out = run(&mut canceller, &mic, 64, 16);
        assert_eq!(canceller.failures(), 8);
        // Passthrough is aligned with the accumulator, i.e. delayed by 48 samples
        for i in 48..128 {
            assert_eq!(out[i], mic[i - 48] as f32);
        }
    }

    fn assert_passthrough_without_commit(mut canceller: NeuralMaskCanceller) {
        let mic: Vec<f32> = (0..64).map(|i| (i as f32 - 32.0) * 50.0).collect();
        let reference = vec![0.0f32; 64];
        let block = BlockPair {
            mic_hop: &mic[48..],
            ref_hop: &reference[48..],
            mic_window: &mic,
            ref_window: &reference,
        };
        let mut out = [0.0f32; 16];

        for round in 1..=3 {
            assert!(!canceller.process_block(&block, &mut out));
            assert_eq!(&out[..], &mic[..16], "round {} passes the mic through", round);
            assert_eq!(canceller.failures(), round);
        }
        assert!(
            canceller.mask_state().data().iter().all(|&v| v == 0.0),
            "mask state must stay uncommitted"
        );
        assert!(
            canceller.refine_state().data().iter().all(|&v| v == 0.0),
            "refinement state must stay uncommitted"
        );
        assert_eq!(canceller.mask_state().shape(), &STATE_SHAPE);
        assert_eq!(canceller.refine_state().shape(), &STATE_SHAPE);
    }

    #[test]
    fn test_wrong_state_shape_passes_through() {
        let canceller = NeuralMaskCanceller::new(
            64,
            16,
            Box::new(CountingMask { decay: 0.0 }),
            Box::new(MisshapedState),
        )
        .unwrap();
        assert_passthrough_without_commit(canceller);
    }

    #[test]
    fn test_non_finite_mask_passes_through() {
        let canceller = NeuralMaskCanceller::new(
            64,
            16,
            Box::new(NanMask),
            Box::new(ScaleRefine { gain: 0.25 }),
        )
        .unwrap();
        assert_passthrough_without_commit(canceller);
    }

    #[test]
    fn test_output_is_clipped_to_i16_range() {
        let mut canceller = NeuralMaskCanceller::new(
            64,
            16,
            Box::new(CountingMask { decay: 0.0 }),
            Box::new(ScaleRefine { gain: 4.0 }),
        )
        .unwrap();
        let mic = vec![i16::MAX; 256];
        let out = run(&mut canceller, &mic, 64, 16);
        assert!(out.iter().all(|&s| s.abs() <= I16_SCALE_OUT));
        assert_eq!(*out.last().unwrap(), I16_SCALE_OUT);
    }

    #[test]
    fn test_invalid_geometry_rejected() {
        let make = |len, shift| {
            NeuralMaskCanceller::new(
                len,
                shift,
                Box::new(CountingMask { decay: 0.0 }),
                Box::new(ScaleRefine { gain: 1.0 }),
            )
        };
        assert!(make(64, 0).is_err());
        assert!(make(63, 16).is_err());
        assert!(make(16, 64).is_err());
    }
}
