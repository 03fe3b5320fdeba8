//! Voice catalog and model weight cache.
//!
//! - [`VoiceCatalog`] keeps the user's voice packs keyed by id and persists
//!   them through a [`KeyValueStore`].
//! - [`ModelCache`] makes sure a voice's ONNX weights are on disk before a
//!   session is created, downloading them on a miss.

pub mod kv;
pub mod models;
pub mod store;

pub use kv::{FileKv, KeyValueStore, MemoryKv};
pub use models::{FileModelStore, ModelCache, ModelState, ModelStore, MODELS_DIR};
pub use store::{template_voicepack, VoiceCatalog, VoiceFilter, REQUIRED_FIELDS, STORAGE_KEY};

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("Invalid URL: must use HTTPS protocol: {0}")]
    InsecureUrl(String),
    #[error("Invalid model URL (expected an https .onnx file): {0}")]
    InvalidModelUrl(String),
    #[error("Invalid voice filter id: {0:?}")]
    InvalidId(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to fetch {url}: HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("Invalid voice data for {id:?}. Missing fields: {}", missing.join(", "))]
    ImportValidation { id: String, missing: Vec<String> },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Voice filter not found: {0}")]
    NotFound(String),
    #[error("Voice filter {0} was not downloaded from a URL and cannot be updated")]
    NoDownloadUrl(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
