//! Inference boundary of the neural canceller.
//!
//! The two DTLN-aec stages are reached through [`StageModel`]: a fixed
//! tensor-in/tensor-out contract with one recurrent state tensor fed back on
//! every call. The actual runtime lives behind the trait (ONNX Runtime with
//! the `onnx` feature, or anything else a host plugs in).

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Fixed-shape recurrent state of one stage, carried from call to call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecurrentState {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl RecurrentState {
    pub fn zeros(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
        }
    }

    /// Wraps raw tensor data. Returns `None` if `data` does not fill `shape`.
    pub fn from_parts(shape: Vec<usize>, data: Vec<f32>) -> Option<Self> {
        (shape.iter().product::<usize>() == data.len()).then_some(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_parts(self) -> (Vec<usize>, Vec<f32>) {
        (self.shape, self.data)
    }
}

/// Result of one stage invocation.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// Mask (stage 1) or refined time-domain block (stage 2)
    pub data: Vec<f32>,
    pub state: RecurrentState,
}

/// One stateful inference stage.
///
/// Stage 1 receives mic and reference magnitude spectra (`block_len / 2 + 1`
/// bins each) and returns a mask of the same length. Stage 2 receives the
/// masked time-domain estimate and the reference window (`block_len` samples
/// each) and returns the refined block.
pub trait StageModel: Send {
    /// Shape of the state tensor this stage consumes and produces.
    fn state_shape(&self) -> &[usize];

    fn run(&mut self, primary: &[f32], reference: &[f32], state: &RecurrentState) -> Result<StageOutput>;
}

/// DTLN-aec model size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// 128 LSTM units, fastest
    #[default]
    Small,
    /// 256 units
    Medium,
    /// 512 units, best quality
    Large,
}

impl ModelVariant {
    pub fn units(&self) -> usize {
        match self {
            ModelVariant::Small => 128,
            ModelVariant::Medium => 256,
            ModelVariant::Large => 512,
        }
    }

    /// Recurrent state shape shared by both stages: two LSTM layers, (h, c).
    pub fn state_shape(&self) -> [usize; 4] {
        [1, 2, self.units(), 2]
    }

    /// File names of the mask and refinement models.
    pub fn model_files(&self) -> (String, String) {
        let base = format!("dtln_aec_{}", self.units());
        (format!("{}_1.onnx", base), format!("{}_2.onnx", base))
    }
}

#[cfg(feature = "onnx")]
pub use onnx::OnnxStage;

#[cfg(feature = "onnx")]
mod onnx {
    use super::{RecurrentState, StageModel, StageOutput};
    use anyhow::{bail, Context, Result};
    use ort::session::{builder::GraphOptimizationLevel, Session};
    use ort::value::Tensor;
    use std::path::Path;

    /// [`StageModel`] backed by an ONNX Runtime session.
    ///
    /// Inputs are taken in DTLN-aec order: primary signal, state, reference.
    /// Outputs: stage result, new state.
    pub struct OnnxStage {
        session: Session,
        input_names: [String; 3],
        output_names: [String; 2],
        state_shape: Vec<usize>,
    }

    impl OnnxStage {
        pub fn load(path: &Path, state_shape: &[usize]) -> Result<Self> {
            let session = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                // One intra-op thread keeps per-block latency steady
                .with_intra_threads(1)?
                .commit_from_file(path)
                .with_context(|| format!("Failed to load model {}", path.display()))?;

            let inputs: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
            let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
            if inputs.len() != 3 || outputs.len() != 2 {
                bail!(
                    "{}: expected 3 inputs and 2 outputs, found {} and {}",
                    path.display(),
                    inputs.len(),
                    outputs.len()
                );
            }
            log::info!("Loaded stage model {} (inputs {:?})", path.display(), inputs);

            Ok(Self {
                session,
                input_names: [inputs[0].clone(), inputs[1].clone(), inputs[2].clone()],
                output_names: [outputs[0].clone(), outputs[1].clone()],
                state_shape: state_shape.to_vec(),
            })
        }
    }

    impl StageModel for OnnxStage {
        fn state_shape(&self) -> &[usize] {
            &self.state_shape
        }

        fn run(&mut self, primary: &[f32], reference: &[f32], state: &RecurrentState) -> Result<StageOutput> {
            let primary_tensor = Tensor::from_array(([1usize, 1, primary.len()], primary.to_vec()))?;
            let reference_tensor = Tensor::from_array(([1usize, 1, reference.len()], reference.to_vec()))?;
            let state_tensor = Tensor::from_array((state.shape().to_vec(), state.data().to_vec()))?;

            let outputs = self.session.run(ort::inputs![
                self.input_names[0].as_str() => primary_tensor,
                self.input_names[1].as_str() => state_tensor,
                self.input_names[2].as_str() => reference_tensor,
            ])?;

            let (_shape, data) = outputs[self.output_names[0].as_str()].try_extract_tensor::<f32>()?;
            let data = data.to_vec();
            let (_shape, state_data) = outputs[self.output_names[1].as_str()].try_extract_tensor::<f32>()?;
            let state = RecurrentState::from_parts(self.state_shape.clone(), state_data.to_vec())
                .context("State output does not match the expected shape")?;

            Ok(StageOutput { data, state })
        }
    }
}
