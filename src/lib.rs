//! # voice-filter-rs
//!
//! A Rust library for real-time voice conversion behind custom voice filters.
//!
//! ## Features
//!
//! - **RVC voice conversion**: Run a speaker's audio through an RVC model with ONNX Runtime
//! - **Streaming pitch shift**: Semitone pitch shift and resampling over raw f32 streams
//! - **Hot-swappable models**: One active model at a time, switched without leaking sessions
//! - **Voice catalog**: Download, import and export voice packs; cache model weights on disk
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! voice-filter-rs = { version = "2026.10", features = ["onnx"] }
//! ```
//!
//! ```ignore
//! use std::path::Path;
//! use std::sync::Arc;
//! use voice_filter_rs::engines::rvc::{OrtBackend, ProcessorConfig, RvcProcessor, FfmpegTransducer};
//! use voice_filter_rs::AudioClip;
//!
//! let mut processor = RvcProcessor::new(
//!     ProcessorConfig::new("discord_voice_filters/reyna.onnx"),
//!     Arc::new(OrtBackend::new()),
//!     Arc::new(FfmpegTransducer::new()),
//! )?;
//! processor.load().await?;
//!
//! let clip = AudioClip::read_wav(Path::new("input.wav"))?;
//! processor.convert_clip(&clip)?.write_wav(Path::new("output.wav"))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod catalog;
pub mod context;
pub mod engines;

use std::path::Path;

pub use catalog::{CatalogError, ModelCache, VoiceCatalog, VoiceFilter};
pub use context::{VoiceFilterContext, VoiceFilterError, VoiceFilterSettings};
pub use engines::rvc::{ModelManager, ProcessorConfig, RvcError, RvcProcessor};

/// A block of mono audio.
///
/// Contains raw f32 samples and the sample rate they were captured at.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Raw audio samples as f32 values
    pub samples: Vec<f32>,
    /// Sample rate of the audio
    pub sample_rate: u32,
}

impl AudioClip {
    /// Read a WAV file, downmixing to mono.
    ///
    /// Integer formats are scaled to [-1, 1].
    pub fn read_wav(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let mut reader = hound::WavReader::open(path)?;
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
        };

        let samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
        })
    }

    /// Write the audio to a 32-bit float WAV file.
    pub fn write_wav(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for &sample in &self.samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        Ok(())
    }

    /// Duration of the audio in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::AudioClip;

    #[test]
    fn wav_round_trip_keeps_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.wav");
        let clip = AudioClip {
            samples: vec![0.0, 0.25, -0.5, 1.0],
            sample_rate: 16000,
        };
        clip.write_wav(&path).unwrap();

        let read = AudioClip::read_wav(&path).unwrap();
        assert_eq!(read, clip);
        assert!((read.duration_secs() - 0.00025).abs() < 1e-9);
    }

    #[test]
    fn stereo_int_wav_is_downmixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for sample in [16384i16, 0, -16384, -16384] {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();

        let clip = AudioClip::read_wav(&path).unwrap();
        assert_eq!(clip.sample_rate, 8000);
        assert_eq!(clip.samples, vec![0.25, -0.5]);
    }
}
