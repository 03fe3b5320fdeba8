//! The user's voice catalog.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::kv::KeyValueStore;
use super::CatalogError;

/// Key the catalog is persisted under, shared with catalogs saved by the
/// voice filter plugin.
pub const STORAGE_KEY: &str = "vencordVoiceFilters";

/// Version stamp written next to the persisted state.
const STORAGE_VERSION: u32 = 0;

/// Fields every imported or downloaded entry must carry (JSON names).
pub const REQUIRED_FIELDS: [&str; 8] = [
    "name",
    "author",
    "onnxFileUrl",
    "iconURL",
    "id",
    "styleKey",
    "available",
    "temporarilyAvailable",
];

/// One selectable voice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceFilter {
    pub name: String,
    pub author: String,
    pub onnx_file_url: String,
    #[serde(rename = "iconURL")]
    pub icon_url: String,
    pub id: String,
    pub style_key: String,
    pub available: bool,
    pub temporarily_available: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub splash_gradient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_color: Option<String>,
    #[serde(
        rename = "previewSoundURLs",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub preview_sound_urls: Option<Vec<String>>,
    /// Where the voice pack was downloaded from, for [`VoiceCatalog::update_by_id`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

/// Example voice pack shown to users writing their own.
pub fn template_voicepack() -> String {
    let reyna = serde_json::json!({
        "name": "Reyna",
        "iconURL": "https://cdn.discordapp.com/emojis/1340353599858806785.webp?size=512",
        "splashGradient": "radial-gradient(circle, #d9a5a2 0%, rgba(0,0,0,0) 100%)",
        "baseColor": "#d9a5a2",
        "previewSoundURLs": [
            "https://cdn.discordapp.com/soundboard-sounds/1340357897451995146"
        ],
        "available": true,
        "styleKey": "",
        "temporarilyAvailable": false,
        "id": "724847846897221642-reyna",
        "author": "724847846897221642",
        "onnxFileUrl": "https://fox3000foxy.com/voices_models/reyna_simple.onnx"
    });
    serde_json::to_string_pretty(&reyna).unwrap_or_default()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState {
    #[serde(default)]
    voice_filters: BTreeMap<String, VoiceFilter>,
}

/// Stored as `{"state": {"voiceFilters": {...}}, "version": 0}`. A bare
/// `{"voiceFilters": {...}}` is accepted as well.
#[derive(Deserialize)]
#[serde(untagged)]
enum Persisted {
    Wrapped { state: PersistedState },
    Bare(PersistedState),
}

impl Persisted {
    fn into_filters(self) -> BTreeMap<String, VoiceFilter> {
        match self {
            Persisted::Wrapped { state } | Persisted::Bare(state) => state.voice_filters,
        }
    }
}

/// Voice filters keyed by id, persisted after every mutation.
pub struct VoiceCatalog {
    kv: Arc<dyn KeyValueStore>,
    filters: BTreeMap<String, VoiceFilter>,
    client: reqwest::Client,
}

impl VoiceCatalog {
    /// Open the catalog persisted in `kv`, or an empty one.
    pub fn open(kv: Arc<dyn KeyValueStore>) -> Result<Self, CatalogError> {
        Self::open_with_client(kv, reqwest::Client::new())
    }

    pub fn open_with_client(
        kv: Arc<dyn KeyValueStore>,
        client: reqwest::Client,
    ) -> Result<Self, CatalogError> {
        let filters = match kv.get(STORAGE_KEY)? {
            Some(bytes) => serde_json::from_slice::<Persisted>(&bytes)?.into_filters(),
            None => BTreeMap::new(),
        };
        log::debug!("Voice catalog opened with {} entries", filters.len());
        Ok(Self {
            kv,
            filters,
            client,
        })
    }

    pub fn get(&self, id: &str) -> Option<&VoiceFilter> {
        self.filters.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &VoiceFilter> {
        self.filters.values()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Add the voice pack(s) in `input`, which is either a JSON document
    /// (`{"…` or `[{…`) or a URL to fetch one from.
    ///
    /// `http:` URLs are upgraded to `https:`; any other scheme is rejected.
    /// Every entry must carry [`REQUIRED_FIELDS`] or nothing is added.
    /// Returns the ids that were added or replaced.
    pub async fn download_voicepack(&mut self, input: &str) -> Result<Vec<String>, CatalogError> {
        let input = input.trim();
        if input.starts_with("{\"") || input.starts_with("[{") {
            let doc: Value = serde_json::from_str(input)?;
            return self.insert_entries(entries_of(doc), None);
        }

        let url = cache_busted(voicepack_url(input)?);
        log::info!("Downloading voice pack from {url}");
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let doc: Value = response.json().await?;
        self.insert_entries(entries_of(doc), Some(input))
    }

    /// Re-download a voice pack from the URL it was originally fetched from.
    pub async fn update_by_id(&mut self, id: &str) -> Result<Vec<String>, CatalogError> {
        let filter = self
            .filters
            .get(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        let url = filter
            .download_url
            .clone()
            .ok_or_else(|| CatalogError::NoDownloadUrl(id.to_string()))?;
        log::info!("Updating voice filter {id}");
        self.download_voicepack(&url).await
    }

    pub fn delete_by_id(&mut self, id: &str) -> Result<VoiceFilter, CatalogError> {
        let mut next = self.filters.clone();
        let removed = next
            .remove(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        self.commit(next)?;
        log::info!("Deleted voice filter {id}");
        Ok(removed)
    }

    pub fn delete_all(&mut self) -> Result<(), CatalogError> {
        self.commit(BTreeMap::new())?;
        log::info!("Deleted all voice filters");
        Ok(())
    }

    /// Pretty JSON map of every entry keyed by id.
    pub fn export_all(&self) -> Result<String, CatalogError> {
        Ok(serde_json::to_string_pretty(&self.filters)?)
    }

    pub fn export_one(&self, id: &str) -> Result<String, CatalogError> {
        let filter = self
            .filters
            .get(id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        Ok(serde_json::to_string_pretty(filter)?)
    }

    /// Import an export document: a map keyed by id, an array, or a single
    /// entry. All-or-nothing, like [`download_voicepack`](Self::download_voicepack).
    pub fn import_json(&mut self, doc: &str) -> Result<Vec<String>, CatalogError> {
        let doc: Value = serde_json::from_str(doc)?;
        let entries = match doc {
            Value::Object(map) if !map.contains_key("id") => {
                map.into_iter().map(|(_, entry)| entry).collect()
            }
            other => entries_of(other),
        };
        self.insert_entries(entries, None)
    }

    /// Entries as shown to the host: numbered from 1 in catalog order, never
    /// temporarily available, and without preview sounds when unavailable.
    pub fn listing(&self) -> Vec<VoiceFilter> {
        self.filters
            .values()
            .enumerate()
            .map(|(i, filter)| {
                let mut shown = filter.clone();
                shown.id = (i + 1).to_string();
                shown.temporarily_available = false;
                if !shown.available {
                    shown.preview_sound_urls = Some(Vec::new());
                }
                shown
            })
            .collect()
    }

    fn insert_entries(
        &mut self,
        entries: Vec<Value>,
        download_url: Option<&str>,
    ) -> Result<Vec<String>, CatalogError> {
        let mut parsed = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            let missing = missing_fields(&entry);
            if !missing.is_empty() {
                let id = entry
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("entry #{}", index + 1));
                log::warn!("Rejecting voice pack: {id} is missing {}", missing.join(", "));
                return Err(CatalogError::ImportValidation { id, missing });
            }
            let mut filter: VoiceFilter = serde_json::from_value(entry)?;
            if let Some(url) = download_url {
                filter.download_url = Some(url.to_string());
            }
            parsed.push(filter);
        }

        let ids: Vec<String> = parsed.iter().map(|f| f.id.clone()).collect();
        let mut next = self.filters.clone();
        for filter in parsed {
            next.insert(filter.id.clone(), filter);
        }
        self.commit(next)?;
        log::info!("Added {} voice filter(s)", ids.len());
        Ok(ids)
    }

    /// Persist `next` and make it the live catalog. On failure the live
    /// catalog is left as it was.
    fn commit(&mut self, next: BTreeMap<String, VoiceFilter>) -> Result<(), CatalogError> {
        let doc = serde_json::json!({
            "state": { "voiceFilters": &next },
            "version": STORAGE_VERSION,
        });
        self.kv.set(STORAGE_KEY, &serde_json::to_vec(&doc)?)?;
        self.filters = next;
        Ok(())
    }
}

fn entries_of(doc: Value) -> Vec<Value> {
    match doc {
        Value::Array(entries) => entries,
        single => vec![single],
    }
}

fn missing_fields(entry: &Value) -> Vec<String> {
    REQUIRED_FIELDS
        .iter()
        .filter(|field| entry.get(**field).map_or(true, Value::is_null))
        .map(|field| field.to_string())
        .collect()
}

/// Upgrade `http:` to `https:` and reject every other scheme.
fn voicepack_url(input: &str) -> Result<Url, CatalogError> {
    let secure = match input.strip_prefix("http:") {
        Some(rest) => format!("https:{rest}"),
        None => input.to_string(),
    };
    if !secure.starts_with("https://") {
        return Err(CatalogError::InsecureUrl(input.to_string()));
    }
    Url::parse(&secure).map_err(|_| CatalogError::InsecureUrl(input.to_string()))
}

/// Append `v=<unix millis>` so caches never serve a stale pack.
fn cache_busted(mut url: Url) -> Url {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    url.query_pairs_mut().append_pair("v", &millis.to_string());
    url
}
