//! Inference backends.
//!
//! The session manager only sees [`InferenceBackend`] and [`BackendSession`];
//! ONNX Runtime is one implementation of them, enabled with the `onnx`
//! feature. Ending a session is dropping it.

use ndarray::ArrayView2;

use super::config::RvcModelParams;

#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[cfg(feature = "onnx")]
    #[error("ONNX runtime error: {0}")]
    Ort(#[from] ort::Error),
    #[error("Invalid model: {0}")]
    InvalidModel(String),
    #[error("Inference failed: {0}")]
    Run(String),
    #[error("No usable execution provider: {0}")]
    ProviderUnavailable(String),
}

/// Creates inference sessions from model bytes.
pub trait InferenceBackend: Send + Sync {
    /// Build a session from raw model weights, trying
    /// `params.execution_providers` in order.
    fn create_session(
        &self,
        model: &[u8],
        params: &RvcModelParams,
    ) -> Result<Box<dyn BackendSession>, BackendError>;
}

/// A loaded, ready-to-run model.
pub trait BackendSession: Send {
    /// Run one `[1, N]` frame and return the flattened first output.
    fn run(&mut self, input: ArrayView2<'_, f32>) -> Result<Vec<f32>, BackendError>;
}

#[cfg(feature = "onnx")]
pub use self::onnx::OrtBackend;

#[cfg(feature = "onnx")]
mod onnx {
    use ndarray::ArrayView2;
    use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
    use ort::inputs;
    use ort::session::builder::GraphOptimizationLevel;
    use ort::session::Session;
    use ort::value::TensorRef;

    use super::{BackendError, BackendSession, InferenceBackend};
    use crate::engines::rvc::config::{ExecutionPreference, RvcModelParams};

    /// ONNX Runtime backend.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct OrtBackend;

    impl OrtBackend {
        pub fn new() -> Self {
            Self
        }
    }

    impl InferenceBackend for OrtBackend {
        fn create_session(
            &self,
            model: &[u8],
            params: &RvcModelParams,
        ) -> Result<Box<dyn BackendSession>, BackendError> {
            let providers = providers(&params.execution_providers)?;

            let mut builder = Session::builder()?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_execution_providers(providers)?;

            if let Some(threads) = params.num_threads {
                builder = builder
                    .with_intra_threads(threads)?
                    .with_inter_threads(threads)?;
            }

            let session = builder.commit_from_memory(model)?;

            let input_name = detect_audio_input(&session)
                .ok_or_else(|| BackendError::InvalidModel("model has no inputs".to_string()))?;
            if session.outputs().is_empty() {
                return Err(BackendError::InvalidModel("model has no outputs".to_string()));
            }

            log::info!("Detected: audio_input='{input_name}'");

            Ok(Box::new(OrtSession {
                session,
                input_name,
            }))
        }
    }

    struct OrtSession {
        session: Session,
        input_name: String,
    }

    impl BackendSession for OrtSession {
        fn run(&mut self, input: ArrayView2<'_, f32>) -> Result<Vec<f32>, BackendError> {
            let inputs = inputs![
                self.input_name.as_str() => TensorRef::from_array_view(input)?,
            ];
            let output = self.session.run(inputs)?;

            let first_output = output
                .iter()
                .next()
                .ok_or_else(|| BackendError::Run("No output from model".to_string()))?;
            let waveform = first_output.1.try_extract_array::<f32>()?;

            Ok(waveform.iter().copied().collect())
        }
    }

    fn providers(
        order: &[ExecutionPreference],
    ) -> Result<Vec<ExecutionProviderDispatch>, BackendError> {
        let mut providers = Vec::with_capacity(order.len());
        for preference in order {
            match preference {
                #[cfg(feature = "cuda")]
                ExecutionPreference::Cuda => {
                    use ort::execution_providers::CUDAExecutionProvider;
                    providers.push(CUDAExecutionProvider::default().build());
                }
                #[cfg(not(feature = "cuda"))]
                ExecutionPreference::Cuda => {
                    log::debug!("CUDA requested but the `cuda` feature is disabled, skipping");
                }
                ExecutionPreference::Cpu => {
                    providers.push(CPUExecutionProvider::default().build());
                }
            }
        }
        if providers.is_empty() {
            return Err(BackendError::ProviderUnavailable(format!("{order:?}")));
        }
        Ok(providers)
    }

    /// Prefer an input called "input", fall back to the first one.
    fn detect_audio_input(session: &Session) -> Option<String> {
        let inputs = session.inputs();
        inputs
            .iter()
            .find(|input| input.name() == "input")
            .or_else(|| inputs.first())
            .map(|input| input.name().to_string())
    }
}
