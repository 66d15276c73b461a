//! In-memory verse index with cosine similarity ranking.
//!
//! Holds the records of exactly one translation. Search is a linear scan.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::semantic::embeddings::{cosine_similarity, l2_norm, EmbeddingError};

/// Identity of a verse within a translation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VerseKey {
    pub translation: String,
    pub book: String,
    pub chapter: u32,
    pub verse: u32,
}

impl VerseKey {
    pub fn new(translation: &str, book: &str, chapter: u32, verse: u32) -> Self {
        Self {
            translation: translation.to_string(),
            book: book.to_string(),
            chapter,
            verse,
        }
    }

    /// Compact key used in cache files: `{book}_{chapter}_{verse}`.
    pub fn cache_key(&self) -> String {
        format!("{}_{}_{}", self.book, self.chapter, self.verse)
    }
}

impl fmt::Display for VerseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} ({})",
            self.book, self.chapter, self.verse, self.translation
        )
    }
}

/// A verse with its embedding.
#[derive(Debug, Clone)]
pub struct IndexedVerse {
    pub key: VerseKey,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A ranked search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub translation: String,
    pub book: String,
    pub chapter: u32,
    pub verse: u32,
    pub text: String,
    /// Cosine similarity (-1.0 to 1.0)
    pub similarity: f32,
}

impl SearchResult {
    /// `"{book} {chapter}:{verse} ({translation})"`
    pub fn citation(&self) -> String {
        format!(
            "{} {}:{} ({})",
            self.book, self.chapter, self.verse, self.translation
        )
    }
}

/// Errors that can occur during index operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Verse {0} belongs to another translation")]
    TranslationMismatch(VerseKey),

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
}

/// Records of one translation, in insertion order.
pub struct VerseIndex {
    translation: String,
    dimensions: usize,
    verses: Vec<IndexedVerse>,
    /// Verse key -> position in `verses`
    positions: HashMap<VerseKey, usize>,
}

impl VerseIndex {
    pub fn new(translation: &str, dimensions: usize) -> Self {
        Self::with_capacity(translation, dimensions, 0)
    }

    pub fn with_capacity(translation: &str, dimensions: usize, capacity: usize) -> Self {
        Self {
            translation: translation.to_string(),
            dimensions,
            verses: Vec::with_capacity(capacity),
            positions: HashMap::with_capacity(capacity),
        }
    }

    pub fn translation(&self) -> &str {
        &self.translation
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.verses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verses.is_empty()
    }

    pub fn verses(&self) -> &[IndexedVerse] {
        &self.verses
    }

    /// Insert a verse, replacing an existing record with the same key in place.
    pub fn insert(&mut self, verse: IndexedVerse) -> Result<(), IndexError> {
        if verse.key.translation != self.translation {
            return Err(IndexError::TranslationMismatch(verse.key));
        }

        if verse.embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: verse.embedding.len(),
            });
        }

        if l2_norm(&verse.embedding) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        match self.positions.get(&verse.key) {
            Some(&pos) => {
                log::debug!("Replacing duplicate verse {}", verse.key);
                self.verses[pos] = verse;
            }
            None => {
                self.positions.insert(verse.key.clone(), self.verses.len());
                self.verses.push(verse);
            }
        }

        Ok(())
    }

    /// Rank every verse against `query` and return the best `top_k`.
    ///
    /// Sorting is stable, so equal scores keep insertion order.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<SearchResult>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        if l2_norm(query) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut scored = self
            .verses
            .iter()
            .map(|verse| cosine_similarity(query, &verse.embedding).map(|score| (verse, score)))
            .collect::<Result<Vec<_>, _>>()?;

        scored.sort_by(|a, b| rank_key(b.1).total_cmp(&rank_key(a.1)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(verse, similarity)| SearchResult {
                translation: verse.key.translation.clone(),
                book: verse.key.book.clone(),
                chapter: verse.key.chapter,
                verse: verse.key.verse,
                text: verse.text.clone(),
                similarity,
            })
            .collect())
    }
}

/// NaN scores rank below every real score.
fn rank_key(score: f32) -> f32 {
    if score.is_nan() {
        f32::NEG_INFINITY
    } else {
        score
    }
}
