use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array2;

use super::backend::{BackendError, BackendSession, InferenceBackend};
use super::config::RvcModelParams;
use super::normalize::normalize;

#[derive(thiserror::Error, Debug)]
pub enum RvcError {
    #[error("Invalid processor config: {0}")]
    ConfigValidation(String),
    #[error("Failed to load model {}: {source}", path.display())]
    ModelLoad {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Model not loaded. Call load() first.")]
    SessionNotReady,
    #[error("Audio processing error: {0}")]
    Inference(#[source] BackendError),
    #[error("Transform process error: {0}")]
    TransformProcess(String),
    #[error(
        "ffmpeg not found. Install: Linux: `sudo apt-get install ffmpeg`, \
         macOS: `brew install ffmpeg`, Windows: https://ffmpeg.org/download.html"
    )]
    FfmpegNotFound,
    #[error("Audio frame is empty")]
    EmptyInput,
    #[error("A stream is already being processed by this processor")]
    StreamActive,
    #[error("No voice model is active")]
    NoActiveModel,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

/// Lifecycle of an [`RvcSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
}

/// Owns one inference session and its state machine:
/// `Unloaded -> Loading -> Ready -> Unloaded`, with a failed load going
/// straight back to `Unloaded`.
pub struct RvcSession {
    backend: Arc<dyn InferenceBackend>,
    params: RvcModelParams,
    session: Option<Box<dyn BackendSession>>,
    state: SessionState,
}

impl RvcSession {
    pub fn new(backend: Arc<dyn InferenceBackend>, params: RvcModelParams) -> Self {
        Self {
            backend,
            params,
            session: None,
            state: SessionState::Unloaded,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SessionState::Ready
    }

    /// Read the model at `model_path` and create a session from it.
    ///
    /// Any session already held is released first. On failure the state is
    /// `Unloaded` and the error carries the underlying cause.
    pub async fn load(&mut self, model_path: &Path) -> Result<(), RvcError> {
        self.unload();
        self.state = SessionState::Loading;
        log::info!("Loading RVC model from {}", model_path.display());

        let created = match tokio::fs::read(model_path).await {
            Ok(bytes) => self.create(&bytes),
            Err(e) => Err(e.into()),
        };

        match created {
            Ok(session) => {
                self.session = Some(session);
                self.state = SessionState::Ready;
                log::info!("RVC model ready: {}", model_path.display());
                Ok(())
            }
            Err(source) => {
                self.state = SessionState::Unloaded;
                log::error!("Failed to load model {}: {source}", model_path.display());
                Err(RvcError::ModelLoad {
                    path: model_path.to_path_buf(),
                    source,
                })
            }
        }
    }

    fn create(
        &self,
        bytes: &[u8],
    ) -> Result<Box<dyn BackendSession>, Box<dyn std::error::Error + Send + Sync>> {
        if bytes.is_empty() {
            return Err(BackendError::InvalidModel("model file is empty".to_string()).into());
        }
        Ok(self.backend.create_session(bytes, &self.params)?)
    }

    /// Release the session. No-op when already unloaded.
    pub fn unload(&mut self) {
        if self.session.take().is_some() {
            log::debug!("RVC session released");
        }
        self.state = SessionState::Unloaded;
    }

    /// Normalize one frame and run it through the model.
    pub fn run(&mut self, frame: &[f32]) -> Result<Vec<f32>, RvcError> {
        let session = match (self.state, self.session.as_mut()) {
            (SessionState::Ready, Some(session)) => session,
            _ => return Err(RvcError::SessionNotReady),
        };

        let normalized = normalize(frame)?;
        let tensor = Array2::from_shape_vec((1, normalized.len()), normalized)?;
        session.run(tensor.view()).map_err(RvcError::Inference)
    }
}

impl Drop for RvcSession {
    fn drop(&mut self) {
        self.unload();
    }
}
