pub mod config;
pub mod constants;
pub mod echo_cancel;
pub mod frame_adapter;
pub mod model;
pub mod neural;
pub mod processor;
pub mod reference;
pub mod resample;
pub mod rls;

pub use config::{AecConfig, CancellerConfig, NeuralConfig, RlsConfig};
pub use echo_cancel::AdaptiveCanceller;
pub use frame_adapter::BlockReframer;
pub use model::{ModelVariant, RecurrentState, StageModel, StageOutput};
pub use neural::NeuralMaskCanceller;
pub use processor::{AecState, StreamingAecProcessor, SuppressionStats};
pub use reference::{PlaybackTap, ReferenceDelayBuffer};
pub use resample::{ReferenceResampler, ResampleQuality};
pub use rls::RlsCanceller;
