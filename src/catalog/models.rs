//! On-disk model weights, keyed by voice filter id.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::CatalogError;

/// Directory under the module path that holds `<id>.onnx` files.
pub const MODELS_DIR: &str = "discord_voice_filters";

const MODEL_EXTENSION: &str = "onnx";

/// Flat blob store for model weights.
#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn exists(&self, id: &str) -> Result<bool, CatalogError>;
    async fn read(&self, id: &str) -> Result<Vec<u8>, CatalogError>;
    async fn write(&self, id: &str, bytes: &[u8]) -> Result<(), CatalogError>;
    async fn delete(&self, id: &str) -> Result<(), CatalogError>;
    async fn delete_all(&self) -> Result<(), CatalogError>;
    async fn list(&self) -> Result<Vec<String>, CatalogError>;

    /// Size in bytes, `None` when absent.
    async fn size(&self, id: &str) -> Result<Option<u64>, CatalogError>;

    /// Path a session can load the model from.
    fn local_path(&self, id: &str) -> Result<PathBuf, CatalogError>;
}

/// `<module_path>/discord_voice_filters/<id>.onnx`
#[derive(Debug, Clone)]
pub struct FileModelStore {
    root: PathBuf,
}

impl FileModelStore {
    pub fn new(module_path: &Path) -> Self {
        Self {
            root: module_path.join(MODELS_DIR),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn check_id(id: &str) -> Result<(), CatalogError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && !id.contains(['/', '\\', '\0'])
        && id != "..";
    if valid {
        Ok(())
    } else {
        Err(CatalogError::InvalidId(id.to_string()))
    }
}

#[async_trait]
impl ModelStore for FileModelStore {
    async fn exists(&self, id: &str) -> Result<bool, CatalogError> {
        Ok(tokio::fs::try_exists(self.local_path(id)?).await?)
    }

    async fn read(&self, id: &str) -> Result<Vec<u8>, CatalogError> {
        match tokio::fs::read(self.local_path(id)?).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CatalogError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, id: &str, bytes: &[u8]) -> Result<(), CatalogError> {
        let path = self.local_path(id)?;
        tokio::fs::create_dir_all(&self.root).await?;
        let tmp = path.with_extension("onnx.part");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        log::debug!("Stored model {id} ({} bytes)", bytes.len());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), CatalogError> {
        match tokio::fs::remove_file(self.local_path(id)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CatalogError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_all(&self) -> Result<(), CatalogError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CatalogError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MODEL_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn size(&self, id: &str) -> Result<Option<u64>, CatalogError> {
        match tokio::fs::metadata(self.local_path(id)?).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn local_path(&self, id: &str) -> Result<PathBuf, CatalogError> {
        check_id(id)?;
        Ok(self.root.join(format!("{id}.{MODEL_EXTENSION}")))
    }
}

/// Download state of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Downloaded { bytes: u64 },
    NotDownloaded,
}

/// Fetch-on-miss front for a [`ModelStore`].
pub struct ModelCache {
    store: Arc<dyn ModelStore>,
    client: reqwest::Client,
}

impl ModelCache {
    pub fn new(store: Arc<dyn ModelStore>) -> Self {
        Self::with_client(store, reqwest::Client::new())
    }

    pub fn with_client(store: Arc<dyn ModelStore>, client: reqwest::Client) -> Self {
        Self { store, client }
    }

    /// Cache rooted at `<module_path>/discord_voice_filters`.
    pub fn on_disk(module_path: &Path) -> Self {
        Self::new(Arc::new(FileModelStore::new(module_path)))
    }

    pub fn store(&self) -> &Arc<dyn ModelStore> {
        &self.store
    }

    /// Return the local path of model `id`, downloading it from `source_url`
    /// first when it is not cached.
    ///
    /// Present models are never re-downloaded. On a miss the URL must be
    /// HTTPS and name an `.onnx` file.
    pub async fn ensure(&self, id: &str, source_url: &str) -> Result<PathBuf, CatalogError> {
        let path = self.store.local_path(id)?;
        if self.store.exists(id).await? {
            log::debug!("Model {id} already cached at {}", path.display());
            return Ok(path);
        }

        let url = validate_model_url(source_url)?;
        log::info!("Downloading model {id} from {url}");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await?;
        self.store.write(id, &bytes).await?;
        log::info!("Model {id} downloaded ({} bytes)", bytes.len());
        Ok(path)
    }

    /// Store weights that were fetched by other means (e.g. a file picker).
    pub async fn import_model_bytes(&self, id: &str, bytes: &[u8]) -> Result<PathBuf, CatalogError> {
        self.store.write(id, bytes).await?;
        log::info!("Imported model {id} ({} bytes)", bytes.len());
        self.store.local_path(id)
    }

    pub async fn model_state(&self, id: &str) -> Result<ModelState, CatalogError> {
        Ok(match self.store.size(id).await? {
            Some(bytes) => ModelState::Downloaded { bytes },
            None => ModelState::NotDownloaded,
        })
    }

    /// Local path if the model is cached.
    pub async fn model_path(&self, id: &str) -> Result<Option<PathBuf>, CatalogError> {
        if self.store.exists(id).await? {
            Ok(Some(self.store.local_path(id)?))
        } else {
            Ok(None)
        }
    }

    pub async fn list(&self) -> Result<Vec<String>, CatalogError> {
        self.store.list().await
    }

    pub async fn delete(&self, id: &str) -> Result<(), CatalogError> {
        self.store.delete(id).await?;
        log::info!("Deleted model {id}");
        Ok(())
    }

    pub async fn delete_all(&self) -> Result<(), CatalogError> {
        self.store.delete_all().await?;
        log::info!("Deleted all models");
        Ok(())
    }
}

/// Model sources must be `https://…/<name>.onnx`.
pub fn validate_model_url(source_url: &str) -> Result<Url, CatalogError> {
    let url = Url::parse(source_url)
        .map_err(|_| CatalogError::InvalidModelUrl(source_url.to_string()))?;
    if url.scheme() != "https" {
        return Err(CatalogError::InsecureUrl(source_url.to_string()));
    }
    if !url.path().ends_with(".onnx") {
        return Err(CatalogError::InvalidModelUrl(source_url.to_string()));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::{validate_model_url, FileModelStore, ModelCache, ModelState, ModelStore};
    use crate::catalog::CatalogError;

    #[test]
    fn model_urls_must_be_https_onnx() {
        assert!(validate_model_url("https://example.com/voices/reyna.onnx").is_ok());
        assert!(validate_model_url("https://example.com/reyna.onnx?token=1").is_ok());
        assert!(matches!(
            validate_model_url("http://example.com/reyna.onnx"),
            Err(CatalogError::InsecureUrl(_))
        ));
        assert!(matches!(
            validate_model_url("ftp://example.com/reyna.onnx"),
            Err(CatalogError::InsecureUrl(_))
        ));
        assert!(matches!(
            validate_model_url("https://example.com/reyna.bin"),
            Err(CatalogError::InvalidModelUrl(_))
        ));
        assert!(matches!(
            validate_model_url("not a url"),
            Err(CatalogError::InvalidModelUrl(_))
        ));
    }

    #[tokio::test]
    async fn file_store_layout_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        assert!(store.list().await.unwrap().is_empty());

        store.write("b-voice", b"ONNX").await.unwrap();
        store.write("a-voice", b"ONNX!").await.unwrap();
        assert!(dir
            .path()
            .join("discord_voice_filters")
            .join("a-voice.onnx")
            .exists());
        assert_eq!(store.list().await.unwrap(), vec!["a-voice", "b-voice"]);
        assert_eq!(store.read("a-voice").await.unwrap(), b"ONNX!");
        assert_eq!(store.size("a-voice").await.unwrap(), Some(5));

        store.delete("a-voice").await.unwrap();
        assert!(matches!(
            store.delete("a-voice").await,
            Err(CatalogError::NotFound(_))
        ));
        store.delete_all().await.unwrap();
        store.delete_all().await.unwrap();
        assert!(!store.exists("b-voice").await.unwrap());
    }

    #[tokio::test]
    async fn ids_cannot_escape_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileModelStore::new(dir.path());
        for id in ["", "..", "../x", "a/b", "a\\b", ".hidden"] {
            assert!(
                matches!(store.write(id, b"x").await, Err(CatalogError::InvalidId(_))),
                "{id:?}"
            );
        }
    }

    #[tokio::test]
    async fn cached_model_is_not_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::on_disk(dir.path());
        let imported = cache.import_model_bytes("reyna", b"ONNX").await.unwrap();

        // The URL would be rejected if it were used.
        let path = cache.ensure("reyna", "http://insecure/x.bin").await.unwrap();
        assert_eq!(path, imported);
        assert_eq!(
            cache.model_state("reyna").await.unwrap(),
            ModelState::Downloaded { bytes: 4 }
        );
        assert_eq!(cache.model_path("reyna").await.unwrap(), Some(path));
    }

    #[tokio::test]
    async fn miss_with_insecure_url_fails_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ModelCache::on_disk(dir.path());

        let err = cache
            .ensure("reyna", "http://example.com/reyna.onnx")
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::InsecureUrl(_)));
        assert_eq!(
            cache.model_state("reyna").await.unwrap(),
            ModelState::NotDownloaded
        );
        assert_eq!(cache.model_path("reyna").await.unwrap(), None);
        assert!(cache.list().await.unwrap().is_empty());
    }
}
