use std::path::{Path, PathBuf};

use derive_builder::Builder;

use super::model::RvcError;

/// Smallest and largest pitch shift, in semitones.
pub const PITCH_RANGE: (i32, i32) = (-12, 12);

/// Resample rates on the regular grid are multiples of this step.
pub const RESAMPLE_STEP_HZ: u32 = 4000;

/// Inclusive bounds for resample rates on the regular grid.
pub const RESAMPLE_RANGE_HZ: (u32, u32) = (4000, 48000);

/// CD rate, accepted in addition to the 4 kHz grid.
pub const CD_SAMPLE_RATE_HZ: u32 = 44100;

/// Inclusive bounds for the streaming chunk size, in frames.
pub const BUFFER_SIZE_RANGE: (usize, usize) = (256, 16384);

/// Inclusive bounds for the rate of samples arriving on the input stream.
pub const INPUT_RATE_RANGE_HZ: (u32, u32) = (4000, 192000);

pub const DEFAULT_RESAMPLE_RATE_HZ: u32 = 48000;
pub const DEFAULT_BUFFER_SIZE_FRAMES: usize = 8192;
pub const DEFAULT_INPUT_SAMPLE_RATE_HZ: u32 = 48000;

/// Configuration for one [`RvcProcessor`](super::processor::RvcProcessor).
///
/// Validated before any resource is acquired. Build it with
/// [`ProcessorConfig::builder`] or start from [`ProcessorConfig::new`] and
/// call [`ProcessorConfig::validate`].
///
/// ```rust
/// use voice_filter_rs::engines::rvc::ProcessorConfig;
///
/// let config = ProcessorConfig::builder()
///     .model_path("models/reyna.onnx")
///     .pitch_semitones(3)
///     .resample_rate_hz(24000)
///     .build()?;
/// assert_eq!(config.buffer_size_frames, 8192);
/// # Ok::<(), voice_filter_rs::engines::rvc::RvcError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
#[builder(build_fn(validate = "Self::validate", error = "RvcError"))]
pub struct ProcessorConfig {
    /// Path to the `.onnx` voice model. Required, non-empty.
    #[builder(setter(into))]
    pub model_path: PathBuf,
    /// Pitch shift in semitones, within [-12, 12].
    #[builder(default = "0")]
    pub pitch_semitones: i32,
    /// Output sample rate of the stream transform.
    #[builder(default = "DEFAULT_RESAMPLE_RATE_HZ")]
    pub resample_rate_hz: u32,
    /// Number of samples per normalized chunk on the streaming path.
    #[builder(default = "DEFAULT_BUFFER_SIZE_FRAMES")]
    pub buffer_size_frames: usize,
    /// Rate of the raw f32le mono samples arriving on the input stream.
    #[builder(default = "DEFAULT_INPUT_SAMPLE_RATE_HZ")]
    pub input_sample_rate_hz: u32,
}

impl ProcessorConfig {
    /// Start a builder with every optional field at its default.
    pub fn builder() -> ProcessorConfigBuilder {
        ProcessorConfigBuilder::default()
    }

    /// Config with default pitch, rates and buffer size for `model_path`.
    ///
    /// Not validated; call [`ProcessorConfig::validate`] before use.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            pitch_semitones: 0,
            resample_rate_hz: DEFAULT_RESAMPLE_RATE_HZ,
            buffer_size_frames: DEFAULT_BUFFER_SIZE_FRAMES,
            input_sample_rate_hz: DEFAULT_INPUT_SAMPLE_RATE_HZ,
        }
    }

    pub fn validate(&self) -> Result<(), RvcError> {
        validate_model_path(&self.model_path)?;
        validate_pitch(self.pitch_semitones)?;
        validate_resample_rate(self.resample_rate_hz)?;
        validate_buffer_size(self.buffer_size_frames)?;
        validate_input_rate(self.input_sample_rate_hz)?;
        Ok(())
    }
}

impl ProcessorConfigBuilder {
    fn validate(&self) -> Result<(), RvcError> {
        if let Some(path) = &self.model_path {
            validate_model_path(path)?;
        }
        if let Some(pitch) = self.pitch_semitones {
            validate_pitch(pitch)?;
        }
        if let Some(rate) = self.resample_rate_hz {
            validate_resample_rate(rate)?;
        }
        if let Some(size) = self.buffer_size_frames {
            validate_buffer_size(size)?;
        }
        if let Some(rate) = self.input_sample_rate_hz {
            validate_input_rate(rate)?;
        }
        Ok(())
    }
}

impl From<derive_builder::UninitializedFieldError> for RvcError {
    fn from(e: derive_builder::UninitializedFieldError) -> Self {
        RvcError::ConfigValidation(format!("missing required field `{}`", e.field_name()))
    }
}

pub fn validate_model_path(path: &Path) -> Result<(), RvcError> {
    if path.as_os_str().is_empty() {
        return Err(RvcError::ConfigValidation(
            "Model path is required".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_pitch(pitch: i32) -> Result<(), RvcError> {
    let (min, max) = PITCH_RANGE;
    if !(min..=max).contains(&pitch) {
        return Err(RvcError::ConfigValidation(format!(
            "Pitch must be between {min} and {max} semitones, got {pitch}"
        )));
    }
    Ok(())
}

/// Every multiple of 4000 Hz in [4000, 48000], plus 44100 Hz.
pub fn validate_resample_rate(rate: u32) -> Result<(), RvcError> {
    if is_allowed_resample_rate(rate) {
        return Ok(());
    }
    let allowed = allowed_resample_rates()
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(RvcError::ConfigValidation(format!(
        "Invalid resample rate {rate}. Must be one of: {allowed}"
    )))
}

pub fn validate_buffer_size(size: usize) -> Result<(), RvcError> {
    let (min, max) = BUFFER_SIZE_RANGE;
    if !(min..=max).contains(&size) {
        return Err(RvcError::ConfigValidation(format!(
            "Buffer size must be between {min} and {max}, got {size}"
        )));
    }
    Ok(())
}

pub fn validate_input_rate(rate: u32) -> Result<(), RvcError> {
    let (min, max) = INPUT_RATE_RANGE_HZ;
    if !(min..=max).contains(&rate) {
        return Err(RvcError::ConfigValidation(format!(
            "Input sample rate must be between {min} and {max} Hz, got {rate}"
        )));
    }
    Ok(())
}

pub fn is_allowed_resample_rate(rate: u32) -> bool {
    let (min, max) = RESAMPLE_RANGE_HZ;
    rate == CD_SAMPLE_RATE_HZ || ((min..=max).contains(&rate) && rate % RESAMPLE_STEP_HZ == 0)
}

/// All accepted resample rates in ascending order.
pub fn allowed_resample_rates() -> Vec<u32> {
    let (min, max) = RESAMPLE_RANGE_HZ;
    let mut rates: Vec<u32> = (min..=max).step_by(RESAMPLE_STEP_HZ as usize).collect();
    rates.push(CD_SAMPLE_RATE_HZ);
    rates.sort_unstable();
    rates
}

/// Execution providers, tried in the order given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionPreference {
    Cuda,
    Cpu,
}

/// Parameters for creating an inference session.
#[derive(Debug, Clone)]
pub struct RvcModelParams {
    /// Providers in priority order; hardware-accelerated first.
    pub execution_providers: Vec<ExecutionPreference>,
    /// Number of CPU threads to use for inference.
    /// `None` uses the backend default.
    pub num_threads: Option<usize>,
}

impl Default for RvcModelParams {
    fn default() -> Self {
        Self {
            execution_providers: vec![ExecutionPreference::Cuda, ExecutionPreference::Cpu],
            num_threads: None,
        }
    }
}
