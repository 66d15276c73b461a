//! Per-translation embedding cache.
//!
//! One JSON file per translation, `{translation}_embeddings.json`:
//!
//! ```json
//! {
//!   "translation": "RVR1960",
//!   "created_at": "2026-01-01T00:00:00Z",
//!   "model_id": "<sha256 of model name>",
//!   "dimensions": 384,
//!   "entries": [{ "key": "Juan_3_16", "text_hash": "...", "embedding": [...] }]
//! }
//! ```
//!
//! The cache is an optimization only: missing, unreadable or incompatible
//! files are reported as a miss, never as an error.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::semantic::index::IndexedVerse;
use crate::storage::{BackendLocal, StorageManager};

const FILE_SUFFIX: &str = "_embeddings.json";

/// Errors that can occur while writing or removing cache files.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A cached vector together with the hash of the text it was computed from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEmbedding {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_hash: Option<String>,
    pub embedding: Vec<f32>,
}

/// On-disk cache record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheFile {
    pub translation: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub dimensions: Option<usize>,
    #[serde(default)]
    pub entries: Vec<CachedEmbedding>,
}

/// Summary of one cache file, for listing.
#[derive(Debug, Clone, Serialize)]
pub struct CacheSummary {
    pub translation: String,
    pub created_at: DateTime<Utc>,
    pub entries: usize,
}

/// Disk-backed embedding cache keyed by translation.
pub struct EmbeddingCache {
    store: BackendLocal,
    model_id: String,
    dimensions: usize,
}

impl EmbeddingCache {
    /// Open (and create) the cache directory.
    ///
    /// Files written by a different model or with a different dimension
    /// are treated as misses.
    pub fn new(dir: &Path, model_id: &str, dimensions: usize) -> Result<Self, CacheError> {
        Ok(Self {
            store: BackendLocal::new(dir)?,
            model_id: model_id.to_string(),
            dimensions,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.store.base_dir
    }

    /// Whether a cache file exists for the translation (compatible or not).
    pub fn exists(&self, translation: &str) -> bool {
        self.store.exists(&file_name(translation))
    }

    /// Load cached vectors for a translation, keyed by `{book}_{chapter}_{verse}`.
    pub fn load(&self, translation: &str) -> Option<HashMap<String, CachedEmbedding>> {
        let name = file_name(translation);
        if !self.store.exists(&name) {
            log::debug!("No embedding cache for {translation}");
            return None;
        }

        let file = match self.read_file(&name) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Ignoring unreadable embedding cache {name}: {e}");
                return None;
            }
        };

        if file.translation != translation {
            log::warn!(
                "Embedding cache {name} belongs to '{}', not '{translation}'",
                file.translation
            );
            return None;
        }

        if file.model_id.as_deref() != Some(self.model_id.as_str()) {
            log::warn!("Embedding cache {name} was built by a different model, ignoring");
            return None;
        }

        if file.dimensions != Some(self.dimensions) {
            log::warn!(
                "Embedding cache {name} has dimensions {:?}, expected {}",
                file.dimensions,
                self.dimensions
            );
            return None;
        }

        log::info!(
            "Loaded embedding cache {name} ({} verses, created {})",
            file.entries.len(),
            file.created_at
        );

        Some(
            file.entries
                .into_iter()
                .filter(|entry| entry.embedding.len() == self.dimensions)
                .map(|entry| (entry.key.clone(), entry))
                .collect(),
        )
    }

    /// Persist the vectors of a built index.
    pub fn save(&self, translation: &str, verses: &[IndexedVerse]) -> Result<(), CacheError> {
        let file = CacheFile {
            translation: translation.to_string(),
            created_at: Utc::now(),
            model_id: Some(self.model_id.clone()),
            dimensions: Some(self.dimensions),
            entries: verses
                .iter()
                .map(|verse| CachedEmbedding {
                    key: verse.key.cache_key(),
                    text_hash: Some(text_hash(&verse.text)),
                    embedding: verse.embedding.clone(),
                })
                .collect(),
        };

        let name = file_name(translation);
        let json = serde_json::to_vec(&file)?;
        self.store.write(&name, &json)?;

        log::info!("Saved embedding cache {name} ({} verses)", file.entries.len());
        Ok(())
    }

    /// Remove the cache of one translation, or every cache when `None`.
    pub fn invalidate(&self, translation: Option<&str>) -> Result<usize, CacheError> {
        let names = match translation {
            Some(translation) => vec![file_name(translation)],
            None => self.cache_files(),
        };

        let mut removed = 0;
        for name in names {
            if self.store.exists(&name) {
                self.store.delete(&name)?;
                log::info!("Removed embedding cache {name}");
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Summaries of every readable cache file, sorted by translation.
    pub fn list(&self) -> Vec<CacheSummary> {
        let mut summaries: Vec<CacheSummary> = self
            .cache_files()
            .into_iter()
            .filter_map(|name| match self.read_file(&name) {
                Ok(file) => Some(CacheSummary {
                    translation: file.translation,
                    created_at: file.created_at,
                    entries: file.entries.len(),
                }),
                Err(e) => {
                    log::warn!("Skipping unreadable embedding cache {name}: {e}");
                    None
                }
            })
            .collect();

        summaries.sort_by(|a, b| a.translation.cmp(&b.translation));
        summaries
    }

    fn cache_files(&self) -> Vec<String> {
        self.store
            .list()
            .into_iter()
            .filter(|name| name.ends_with(FILE_SUFFIX))
            .collect()
    }

    fn read_file(&self, name: &str) -> Result<CacheFile, CacheError> {
        let bytes = self.store.read(name)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// File name for a translation's cache, safe on every platform.
pub fn file_name(translation: &str) -> String {
    let safe: String = translation
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}{FILE_SUFFIX}")
}

/// SHA256 of verse text, hex encoded.
pub fn text_hash(text: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::index::VerseKey;

    fn verse(book: &str, chapter: u32, number: u32, text: &str, embedding: Vec<f32>) -> IndexedVerse {
        IndexedVerse {
            key: VerseKey::new("RVR", book, chapter, number),
            text: text.to_string(),
            embedding,
        }
    }

    fn sample() -> Vec<IndexedVerse> {
        vec![
            verse("Juan", 3, 16, "porque de tal manera", vec![0.6, 0.8, 0.0]),
            verse("Génesis", 1, 1, "en el principio", vec![0.0, 0.0, 1.0]),
        ]
    }

    #[test]
    fn test_file_name_is_sanitized() {
        assert_eq!(file_name("RVR1960"), "RVR1960_embeddings.json");
        assert_eq!(file_name("a/b:c d"), "a_b_c_d_embeddings.json");
        assert_eq!(file_name("NVI-2015.es"), "NVI-2015.es_embeddings.json");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path(), "model", 3).unwrap();
        let verses = sample();

        assert!(cache.load("RVR").is_none());
        cache.save("RVR", &verses).unwrap();
        assert!(cache.exists("RVR"));

        let loaded = cache.load("RVR").unwrap();
        assert_eq!(loaded.len(), 2);
        for verse in &verses {
            let cached = &loaded[&verse.key.cache_key()];
            assert_eq!(cached.embedding, verse.embedding);
            assert_eq!(cached.text_hash.as_deref(), Some(text_hash(&verse.text).as_str()));
        }
        assert!(loaded.contains_key("Juan_3_16"));
    }

    #[test]
    fn test_corrupt_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path(), "model", 3).unwrap();

        std::fs::write(dir.path().join(file_name("RVR")), b"{ not json").unwrap();
        assert!(cache.exists("RVR"));
        assert!(cache.load("RVR").is_none());
    }

    #[test]
    fn test_model_or_dimension_change_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        EmbeddingCache::new(dir.path(), "model-a", 3)
            .unwrap()
            .save("RVR", &sample())
            .unwrap();

        let other_model = EmbeddingCache::new(dir.path(), "model-b", 3).unwrap();
        assert!(other_model.load("RVR").is_none());

        let other_dims = EmbeddingCache::new(dir.path(), "model-a", 384).unwrap();
        assert!(other_dims.load("RVR").is_none());
    }

    #[test]
    fn test_tolerates_missing_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path(), "model", 2).unwrap();

        let json = r#"{
            "translation": "RVR",
            "created_at": "2025-01-01T00:00:00Z",
            "model_id": "model",
            "dimensions": 2,
            "entries": [
                {"key": "Juan_1_1", "embedding": [1.0, 0.0]},
                {"key": "Juan_1_2", "embedding": [1.0]}
            ]
        }"#;
        std::fs::write(dir.path().join(file_name("RVR")), json).unwrap();

        let loaded = cache.load("RVR").unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded["Juan_1_1"].text_hash.is_none());
    }

    #[test]
    fn test_invalidate_one_and_all() {
        let dir = tempfile::tempdir().unwrap();
        let cache = EmbeddingCache::new(dir.path(), "model", 3).unwrap();

        cache.save("RVR", &sample()).unwrap();
        cache.save("NVI", &sample()).unwrap();
        cache.save("LBLA", &sample()).unwrap();

        assert_eq!(cache.invalidate(Some("NVI")).unwrap(), 1);
        assert!(!cache.exists("NVI"));
        assert_eq!(cache.invalidate(Some("NVI")).unwrap(), 0);

        let listed: Vec<String> = cache.list().into_iter().map(|s| s.translation).collect();
        assert_eq!(listed, vec!["LBLA", "RVR"]);

        assert_eq!(cache.invalidate(None).unwrap(), 2);
        assert!(cache.list().is_empty());
    }
}
