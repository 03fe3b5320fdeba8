use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use super::backend::InferenceBackend;
use super::config::{validate_pitch, validate_resample_rate, ProcessorConfig, RvcModelParams};
use super::model::RvcError;
use super::processor::{ProcessingStats, ProcessorEvent, RvcProcessor};
use super::transform::{FfmpegTransducer, StreamTransducer};

/// Single point of control for the active voice model.
///
/// Owns at most one [`RvcProcessor`]. Switching models fully releases the
/// previous processor (session, stream and subscribers) before the next one
/// is created, so two sessions never compete for the same device.
///
/// # Quick Start
///
/// ```ignore
/// use std::sync::Arc;
/// use voice_filter_rs::engines::rvc::{ModelManager, OrtBackend, ProcessorConfig};
///
/// # async fn run() -> Result<(), voice_filter_rs::engines::rvc::RvcError> {
/// let mut manager = ModelManager::new(Arc::new(OrtBackend::new()));
/// manager
///     .switch_model(ProcessorConfig::new("discord_voice_filters/reyna.onnx"))
///     .await?;
/// manager.change_pitch(4)?;
/// manager.cleanup().await;
/// # Ok(())
/// # }
/// ```
pub struct ModelManager {
    backend: Arc<dyn InferenceBackend>,
    transducer: Arc<dyn StreamTransducer>,
    params: RvcModelParams,
    processor: Option<RvcProcessor>,
}

impl ModelManager {
    /// Create an empty manager that streams through `ffmpeg` from PATH.
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self::with_transducer(backend, Arc::new(FfmpegTransducer::new()))
    }

    pub fn with_transducer(
        backend: Arc<dyn InferenceBackend>,
        transducer: Arc<dyn StreamTransducer>,
    ) -> Self {
        Self {
            backend,
            transducer,
            params: RvcModelParams::default(),
            processor: None,
        }
    }

    /// Session parameters applied to every processor created from now on.
    pub fn set_model_params(&mut self, params: RvcModelParams) {
        self.params = params;
    }

    pub fn processor(&self) -> Option<&RvcProcessor> {
        self.processor.as_ref()
    }

    pub fn processor_mut(&mut self) -> Option<&mut RvcProcessor> {
        self.processor.as_mut()
    }

    /// Load `model_path` into the active processor's session.
    ///
    /// No-op without an active processor. The path must match the one the
    /// processor was configured with; use [`switch_model`](Self::switch_model)
    /// to change models.
    pub async fn load_model(&mut self, model_path: &Path) -> Result<(), RvcError> {
        let Some(processor) = self.processor.as_mut() else {
            log::debug!("load_model ignored: no active processor");
            return Ok(());
        };
        if processor.config().model_path != model_path {
            return Err(RvcError::ConfigValidation(format!(
                "processor is configured for {}, use switch_model to load {}",
                processor.config().model_path.display(),
                model_path.display()
            )));
        }
        processor.load().await
    }

    /// Replace the active processor with a fresh one for `config` and load
    /// its model.
    ///
    /// `config` is validated before the current processor is touched. The
    /// new processor starts with zeroed stats. If loading fails it stays
    /// installed, unloaded, and the error is returned.
    pub async fn switch_model(&mut self, config: ProcessorConfig) -> Result<(), RvcError> {
        config.validate()?;

        if let Some(mut previous) = self.processor.take() {
            log::info!(
                "Switching model {} -> {}",
                previous.config().model_path.display(),
                config.model_path.display()
            );
            previous.cleanup().await;
        }

        let processor = RvcProcessor::with_params(
            config,
            self.params.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.transducer),
        )?;
        self.processor.insert(processor).load().await
    }

    /// Change the pitch on the live processor without reloading its session.
    /// Bounds are checked even when nothing is active.
    pub fn change_pitch(&mut self, semitones: i32) -> Result<(), RvcError> {
        validate_pitch(semitones)?;
        match self.processor.as_mut() {
            Some(processor) => processor.set_pitch(semitones),
            None => Ok(()),
        }
    }

    /// Change the resample rate on the live processor without reloading its
    /// session. Bounds are checked even when nothing is active.
    pub fn change_resample_rate(&mut self, rate_hz: u32) -> Result<(), RvcError> {
        validate_resample_rate(rate_hz)?;
        match self.processor.as_mut() {
            Some(processor) => processor.set_resample_rate(rate_hz),
            None => Ok(()),
        }
    }

    /// Start streaming through the active processor.
    pub fn process_stream<R, W>(&mut self, input: R, output: W) -> Result<(), RvcError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.processor
            .as_mut()
            .ok_or(RvcError::NoActiveModel)?
            .process_stream(input, output)
    }

    pub fn subscribe(&self) -> Option<mpsc::UnboundedReceiver<ProcessorEvent>> {
        self.processor.as_ref().map(RvcProcessor::subscribe)
    }

    /// `None` when no processor is active.
    pub fn get_stats(&self) -> Option<ProcessingStats> {
        self.processor.as_ref().map(RvcProcessor::get_stats)
    }

    pub fn is_model_loaded(&self) -> bool {
        self.processor.as_ref().is_some_and(RvcProcessor::is_loaded)
    }

    /// Clean up and drop the active processor. Safe to call repeatedly.
    pub async fn cleanup(&mut self) {
        if let Some(mut processor) = self.processor.take() {
            processor.cleanup().await;
        }
    }
}
