//! Composition root tying the catalog, the model cache and the engine
//! together.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogError, KeyValueStore, ModelCache, VoiceCatalog};
use crate::engines::rvc::config::{
    validate_pitch, validate_resample_rate, PITCH_RANGE, RESAMPLE_RANGE_HZ, RESAMPLE_STEP_HZ,
};
use crate::engines::rvc::{InferenceBackend, ModelManager, ProcessorConfig, RvcError};

#[derive(thiserror::Error, Debug)]
pub enum VoiceFilterError {
    #[error(transparent)]
    Engine(#[from] RvcError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// User-facing slider settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceFilterSettings {
    /// Pitch shift in semitones.
    pub pitch: i32,
    /// Output sample rate in Hz.
    pub frequency: u32,
}

impl Default for VoiceFilterSettings {
    fn default() -> Self {
        Self {
            pitch: 0,
            frequency: 24000,
        }
    }
}

impl VoiceFilterSettings {
    pub fn pitch_markers() -> Vec<i32> {
        (PITCH_RANGE.0..=PITCH_RANGE.1).collect()
    }

    /// Slider stops for the output rate. Every stop is an accepted rate.
    pub fn frequency_markers() -> Vec<u32> {
        (RESAMPLE_RANGE_HZ.0..=RESAMPLE_RANGE_HZ.1)
            .step_by(RESAMPLE_STEP_HZ as usize)
            .collect()
    }

    pub fn validate(&self) -> Result<(), RvcError> {
        validate_pitch(self.pitch)?;
        validate_resample_rate(self.frequency)
    }
}

/// Everything a host needs to offer custom voice filters, with no global
/// state: construct one and pass it where it is needed.
pub struct VoiceFilterContext {
    catalog: VoiceCatalog,
    models: ModelCache,
    manager: ModelManager,
    settings: VoiceFilterSettings,
}

impl VoiceFilterContext {
    pub fn new(catalog: VoiceCatalog, models: ModelCache, manager: ModelManager) -> Self {
        Self {
            catalog,
            models,
            manager,
            settings: VoiceFilterSettings::default(),
        }
    }

    /// Catalog from `kv`, models under `<module_path>/discord_voice_filters`,
    /// streams through ffmpeg.
    pub fn open(
        module_path: &Path,
        kv: Arc<dyn KeyValueStore>,
        backend: Arc<dyn InferenceBackend>,
    ) -> Result<Self, VoiceFilterError> {
        Ok(Self::new(
            VoiceCatalog::open(kv)?,
            ModelCache::on_disk(module_path),
            ModelManager::new(backend),
        ))
    }

    pub fn catalog(&self) -> &VoiceCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut VoiceCatalog {
        &mut self.catalog
    }

    pub fn models(&self) -> &ModelCache {
        &self.models
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut ModelManager {
        &mut self.manager
    }

    pub fn settings(&self) -> VoiceFilterSettings {
        self.settings
    }

    /// Make voice `id` the active filter: fetch its weights if needed, then
    /// switch the manager to a processor built from the current settings.
    pub async fn activate(&mut self, id: &str) -> Result<PathBuf, VoiceFilterError> {
        let filter = self
            .catalog
            .get(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        let path = self.models.ensure(&filter.id, &filter.onnx_file_url).await?;

        let config = ProcessorConfig::builder()
            .model_path(path.clone())
            .pitch_semitones(self.settings.pitch)
            .resample_rate_hz(self.settings.frequency)
            .build()?;
        self.manager.switch_model(config).await?;
        log::info!("Voice filter {id} active");
        Ok(path)
    }

    /// Apply new slider settings to the live processor without reloading.
    /// Nothing changes if either value is out of range.
    pub fn apply_settings(&mut self, settings: VoiceFilterSettings) -> Result<(), VoiceFilterError> {
        settings.validate()?;
        self.manager.change_pitch(settings.pitch)?;
        self.manager.change_resample_rate(settings.frequency)?;
        self.settings = settings;
        Ok(())
    }

    /// Remove a voice from the catalog along with its cached weights.
    pub async fn remove_voice(&mut self, id: &str) -> Result<(), VoiceFilterError> {
        self.catalog.delete_by_id(id)?;
        match self.models.delete(id).await {
            Ok(()) | Err(CatalogError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the active processor. Safe to call repeatedly.
    pub async fn shutdown(&mut self) {
        self.manager.cleanup().await;
    }
}
