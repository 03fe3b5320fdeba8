//! RVC (Retrieval-based Voice Conversion) engine.
//!
//! Swaps a speaker's voice through a neural voice-conversion model and
//! shifts pitch/sample rate with a stream transducer before the audio
//! reaches the call pipeline.
//!
//! # Components
//!
//! | Item | Role |
//! |---|---|
//! | [`normalize`] | DC-offset removal and peak normalization of a frame |
//! | [`RvcSession`] | Inference session lifecycle: load, run one frame, unload |
//! | [`TransformSpec`], [`StreamTransducer`] | Pitch shift + resample of a continuous stream |
//! | [`RvcProcessor`] | Wires input through normalization and the transducer, emits events, counts stats |
//! | [`ModelManager`] | Owns at most one processor; hot-swaps models |
//!
//! # System Requirements
//!
//! Streaming uses **ffmpeg** by default:
//! - **Linux**: `sudo apt-get install ffmpeg`
//! - **macOS**: `brew install ffmpeg`
//! - **Windows**: Download from <https://ffmpeg.org/download.html>
//!
//! Inference with ONNX Runtime needs the `onnx` feature (`cuda` adds the
//! CUDA execution provider).
//!
//! # Examples
//!
//! ## One frame through the model
//!
//! ```ignore
//! use std::sync::Arc;
//! use voice_filter_rs::engines::rvc::{FfmpegTransducer, OrtBackend, ProcessorConfig, RvcProcessor};
//!
//! let config = ProcessorConfig::builder()
//!     .model_path("discord_voice_filters/reyna.onnx")
//!     .build()?;
//! let mut processor = RvcProcessor::new(
//!     config,
//!     Arc::new(OrtBackend::new()),
//!     Arc::new(FfmpegTransducer::new()),
//! )?;
//! processor.load().await?;
//! let converted = processor.run_one_frame(&vec![0.0; 8192])?;
//! processor.cleanup().await;
//! ```
//!
//! ## Streaming with events
//!
//! ```ignore
//! let mut events = processor.subscribe();
//! processor.process_stream(microphone, speaker)?;
//! while let Some(event) = events.recv().await {
//!     if let ProcessorEvent::ProcessingComplete(stats) = event {
//!         println!("{} samples out", stats.output_sample_count);
//!         break;
//!     }
//! }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod model;
pub mod normalize;
pub mod processor;
pub mod transform;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(feature = "onnx")]
pub use backend::OrtBackend;
pub use backend::{BackendError, BackendSession, InferenceBackend};
pub use config::{ExecutionPreference, ProcessorConfig, ProcessorConfigBuilder, RvcModelParams};
pub use engine::ModelManager;
pub use model::{RvcError, RvcSession, SessionState};
pub use normalize::{normalize, normalize_in_place};
pub use processor::{ProcessingStats, ProcessorEvent, RvcProcessor};
pub use transform::{
    pitch_factor, FfmpegTransducer, StreamTransducer, TransducerChild, TransducerProcess,
    TransformSpec,
};
