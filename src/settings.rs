//! User preferences and the API key, kept in a key-value store.
//!
//! The store itself is a collaborator: anything with async get/set/remove of JSON
//! values works. A sled database backs the binary; tests use the in-memory store.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

use crate::summary::SummaryType;

pub const API_KEY: &str = "apiKey";
pub const TTS_SETTINGS: &str = "ttsSettings";
pub const GENERAL_SETTINGS: &str = "generalSettings";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    DbError(#[from] sled::Error),
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// An API key. Only ever printed redacted.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into().trim().to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prefix/length heuristic for Gemini keys.
    pub fn looks_valid(&self) -> bool {
        self.0.len() >= 10
            && self.0.starts_with("AIza")
            && !self.0.chars().any(char::is_whitespace)
    }

    /// The raw key, for the request header only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// First and last four characters, e.g. `AIza...x9Qk`.
    pub fn redacted(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() < 8 {
            return "INVALID".to_string();
        }
        let first: String = chars[..4].iter().collect();
        let last: String = chars[chars.len() - 4..].iter().collect();
        format!("{first}...{last}")
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApiKey").field(&self.redacted()).finish()
    }
}

/// Speech preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsSettings {
    pub voice: String,
    pub speed: f32,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            voice: "en-us".to_string(),
            speed: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    Auto,
}

/// General preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneralSettings {
    pub enable_tooltip: bool,
    pub default_summary_type: SummaryType,
    pub theme: Theme,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            enable_tooltip: true,
            default_summary_type: SummaryType::Brief,
            theme: Theme::Auto,
        }
    }
}

/// Async key-value storage of JSON values
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;
}

/// Sled-based settings storage.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open or create storage at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

#[async_trait]
impl KeyValueStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        match self.db.get(key.as_bytes())? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&value)?;
        self.db.insert(key.as_bytes(), bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        let existed = self.db.remove(key.as_bytes())?.is_some();
        self.db.flush_async().await?;
        Ok(existed)
    }
}

/// Process-local store, used by tests and when no database is wanted.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.values.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.values.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.values.write().await.remove(key).is_some())
    }
}

/// Typed view over a [`KeyValueStore`].
#[derive(Clone)]
pub struct Settings {
    store: Arc<dyn KeyValueStore>,
}

impl Settings {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::default()))
    }

    /// Stored key, if any. An empty string counts as absent.
    pub async fn api_key(&self) -> Result<Option<ApiKey>, StoreError> {
        let key: Option<ApiKey> = self.get(API_KEY).await?;
        Ok(key.filter(|k| !k.is_empty()))
    }

    pub async fn set_api_key(&self, key: &ApiKey) -> Result<(), StoreError> {
        self.set(API_KEY, key).await
    }

    pub async fn clear_api_key(&self) -> Result<bool, StoreError> {
        self.store.remove(API_KEY).await
    }

    pub async fn tts(&self) -> TtsSettings {
        self.get_or_default(TTS_SETTINGS).await
    }

    pub async fn set_tts(&self, settings: &TtsSettings) -> Result<(), StoreError> {
        self.set(TTS_SETTINGS, settings).await
    }

    pub async fn general(&self) -> GeneralSettings {
        self.get_or_default(GENERAL_SETTINGS).await
    }

    pub async fn set_general(&self, settings: &GeneralSettings) -> Result<(), StoreError> {
        self.set(GENERAL_SETTINGS, settings).await
    }

    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.store.set(key, serde_json::to_value(value)?).await
    }

    // Preferences never block a flow: unreadable values fall back to defaults.
    async fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        match self.get(key).await {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(err) => {
                warn!(key, error = %err, "failed to load settings, using defaults");
                T::default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_key_is_redacted() {
        let key = ApiKey::new("AIzaSyD-secret-material-x9Qk");
        assert_eq!(key.redacted(), "AIza...x9Qk");
        assert_eq!(format!("{key:?}"), "ApiKey(\"AIza...x9Qk\")");
        assert_eq!(ApiKey::new("short").redacted(), "INVALID");
    }

    #[tokio::test]
    async fn defaults_when_absent_or_unreadable() {
        let store = Arc::new(MemoryStore::default());
        let settings = Settings::new(store.clone());
        assert_eq!(settings.tts().await, TtsSettings::default());

        store.set(GENERAL_SETTINGS, json!("garbage")).await.unwrap();
        assert_eq!(settings.general().await, GeneralSettings::default());
    }

    #[tokio::test]
    async fn general_settings_use_wire_names() {
        let store = Arc::new(MemoryStore::default());
        let settings = Settings::new(store.clone());
        store
            .set(
                GENERAL_SETTINGS,
                json!({"enableTooltip": false, "defaultSummaryType": "bullets", "theme": "dark"}),
            )
            .await
            .unwrap();

        let general = settings.general().await;
        assert!(!general.enable_tooltip);
        assert_eq!(general.default_summary_type, SummaryType::Bullets);
        assert_eq!(general.theme, Theme::Dark);
    }

    #[tokio::test]
    async fn sled_store_round_trips_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(Arc::new(SledStore::open(dir.path()).unwrap()));

        assert!(settings.api_key().await.unwrap().is_none());
        settings
            .set_api_key(&ApiKey::new("AIzaSyExample123456"))
            .await
            .unwrap();
        assert_eq!(
            settings.api_key().await.unwrap(),
            Some(ApiKey::new("AIzaSyExample123456"))
        );
        assert!(settings.clear_api_key().await.unwrap());
        assert!(settings.api_key().await.unwrap().is_none());
    }
}
