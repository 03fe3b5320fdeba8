//! Voice conversion engines.
//!
//! # Available Engines
//!
//! - `rvc` - RVC voice conversion (ONNX Runtime behind the `onnx` feature)

pub mod rvc;
