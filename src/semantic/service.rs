//! Semantic search service for verse similarity search.
//!
//! Owns the index lifecycle for one translation at a time:
//! - `Empty -> Building -> Ready`, and back to `Empty` on clear
//! - Builds into a fresh index and swaps it in when complete, so searches
//!   never see a partially built index
//! - Hydrates from the embedding cache when possible
//! - Reports `(processed, total)` progress on an mpsc channel

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

use serde::Serialize;

use crate::bible::VerseSource;
use crate::semantic::cache::{text_hash, EmbeddingCache};
use crate::semantic::embeddings::{EmbeddingError, EmbeddingModel};
use crate::semantic::index::{IndexError, IndexedVerse, SearchResult, VerseIndex, VerseKey};

/// Errors that can occur during semantic search operations.
#[derive(Debug, thiserror::Error)]
pub enum SemanticSearchError {
    #[error("Index not ready: build an index before searching")]
    NotReady,

    #[error("A build of '{0}' is already in progress")]
    BuildInProgress(String),

    #[error("Index of '{0}' was cleared while it was being built")]
    BuildAbandoned(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Build progress notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexProgress {
    pub processed: usize,
    pub total: usize,
}

impl IndexProgress {
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            100
        } else {
            self.processed * 100 / self.total
        }
    }
}

/// Outcome of a build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub translation: String,
    /// Verses resident in the index after the build
    pub indexed: usize,
    /// Vectors taken from the cache
    pub reused: usize,
    /// Vectors computed by the model
    pub embedded: usize,
    /// Verses skipped for having no text
    pub empty: usize,
    /// Verses skipped because embedding or insertion failed
    pub failed: usize,
    pub from_cache: bool,
    /// The translation was already resident; nothing was done
    pub already_indexed: bool,
}

/// Externally visible index state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexStatus {
    Empty,
    Building(String),
    Ready(String),
}

enum IndexState {
    Empty,
    /// `generation` identifies the build that owns this state.
    Building { translation: String, generation: u64 },
    Ready(Arc<VerseIndex>),
}

/// A build running on a background thread.
pub struct BuildHandle {
    /// Progress notifications; closes when the build ends.
    pub progress: Receiver<IndexProgress>,
    handle: JoinHandle<Result<BuildReport, SemanticSearchError>>,
}

impl BuildHandle {
    /// Wait for the build to finish.
    pub fn join(self) -> Result<BuildReport, SemanticSearchError> {
        self.handle
            .join()
            .map_err(|_| SemanticSearchError::Internal("build thread panicked".to_string()))?
    }
}

/// Service for building and searching a translation's verse index.
///
/// One build may run at a time; a search while building returns
/// `NotReady`.
pub struct SemanticSearchService {
    model: Arc<EmbeddingModel>,
    cache: Option<EmbeddingCache>,
    progress_interval: usize,
    state: RwLock<IndexState>,
    generation: AtomicU64,
}

impl SemanticSearchService {
    /// Create a service in the `Empty` state.
    ///
    /// # Arguments
    /// * `model` - Embedding model used for verses and queries
    /// * `cache` - Embedding cache; `None` always embeds from scratch
    /// * `progress_interval` - Verses between progress notifications
    pub fn new(
        model: Arc<EmbeddingModel>,
        cache: Option<EmbeddingCache>,
        progress_interval: usize,
    ) -> Self {
        Self {
            model,
            cache,
            progress_interval: progress_interval.max(1),
            state: RwLock::new(IndexState::Empty),
            generation: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> IndexStatus {
        match self.state.read().as_deref() {
            Ok(IndexState::Building { translation, .. }) => IndexStatus::Building(translation.clone()),
            Ok(IndexState::Ready(index)) => IndexStatus::Ready(index.translation().to_string()),
            Ok(IndexState::Empty) | Err(_) => IndexStatus::Empty,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.status(), IndexStatus::Ready(_))
    }

    /// Translation of the resident index, if ready.
    pub fn current_translation(&self) -> Option<String> {
        match self.status() {
            IndexStatus::Ready(translation) => Some(translation),
            _ => None,
        }
    }

    /// Number of indexed verses; 0 unless ready.
    pub fn indexed_count(&self) -> usize {
        match self.state.read().as_deref() {
            Ok(IndexState::Ready(index)) => index.len(),
            _ => 0,
        }
    }

    /// Drop the resident index. Safe to call in any state.
    ///
    /// A build in flight keeps running but will discard its result.
    pub fn clear_index(&self) {
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        *state = IndexState::Empty;
    }

    /// Build (or hydrate) the index for `source`'s translation.
    ///
    /// No-op when that translation is already resident. A different
    /// resident translation is cleared first.
    pub fn build_index(
        &self,
        source: &dyn VerseSource,
        progress: Option<&Sender<IndexProgress>>,
    ) -> Result<BuildReport, SemanticSearchError> {
        let translation = source.translation().to_string();

        let generation = {
            let mut state = self.write_state()?;
            match &*state {
                IndexState::Ready(index) if index.translation() == translation => {
                    log::info!("{translation} is already indexed, using existing index");
                    return Ok(BuildReport {
                        translation,
                        indexed: index.len(),
                        already_indexed: true,
                        ..Default::default()
                    });
                }
                IndexState::Building {
                    translation: current,
                    ..
                } => {
                    return Err(SemanticSearchError::BuildInProgress(current.clone()));
                }
                IndexState::Ready(index) => {
                    log::info!(
                        "Clearing index of {} to load {translation}",
                        index.translation()
                    );
                }
                IndexState::Empty => {}
            }
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            *state = IndexState::Building {
                translation: translation.clone(),
                generation,
            };
            generation
        };

        let span = tracing::info_span!("build_index", translation = %translation);
        let result = span.in_scope(|| self.build_fresh(&translation, source, progress));

        let mut state = self.write_state()?;
        let still_building = matches!(
            &*state,
            IndexState::Building { generation: current, .. } if *current == generation
        );

        match result {
            Ok((index, report)) if still_building => {
                *state = IndexState::Ready(Arc::new(index));
                Ok(report)
            }
            Ok(_) => {
                log::warn!("Discarding index of {translation}: cleared during build");
                Err(SemanticSearchError::BuildAbandoned(translation))
            }
            Err(e) => {
                if still_building {
                    *state = IndexState::Empty;
                }
                Err(e)
            }
        }
    }

    /// Run `build_index` on a background thread.
    pub fn spawn_build(self: &Arc<Self>, source: Arc<dyn VerseSource>) -> BuildHandle {
        let (tx, rx) = mpsc::channel();
        let service = Arc::clone(self);

        let handle = std::thread::spawn(move || service.build_index(source.as_ref(), Some(&tx)));

        BuildHandle {
            progress: rx,
            handle,
        }
    }

    /// Rank the resident verses against `query`.
    ///
    /// An empty query returns no results without invoking the model.
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<SearchResult>, SemanticSearchError> {
        let index = match &*self.read_state()? {
            IndexState::Ready(index) => Arc::clone(index),
            _ => return Err(SemanticSearchError::NotReady),
        };

        if query.trim().is_empty() {
            return Ok(vec![]);
        }

        log::debug!("Searching {}: '{query}'", index.translation());
        let embedding = self.model.embed(query)?;
        let results = index.search(&embedding, top_k)?;

        for result in results.iter().take(3) {
            log::debug!("  {} ({:.3})", result.citation(), result.similarity);
        }

        Ok(results)
    }

    /// Build a fresh index without touching the shared state.
    fn build_fresh(
        &self,
        translation: &str,
        source: &dyn VerseSource,
        progress: Option<&Sender<IndexProgress>>,
    ) -> Result<(VerseIndex, BuildReport), SemanticSearchError> {
        let verses = source.verses();
        let total = verses.len();

        let mut cached = self.cache.as_ref().and_then(|cache| cache.load(translation));
        let from_cache = cached.is_some();
        if from_cache {
            log::info!("Using embedding cache for {translation}");
        } else {
            log::info!("No usable cache for {translation}, indexing {total} verses");
        }

        let mut index = VerseIndex::with_capacity(translation, self.model.dimensions(), total);
        let mut report = BuildReport {
            translation: translation.to_string(),
            from_cache,
            ..Default::default()
        };
        let mut reporter = ProgressReporter::new(progress, total, self.progress_interval);

        for verse in verses {
            if verse.text.trim().is_empty() {
                report.empty += 1;
                reporter.tick();
                continue;
            }

            let key = VerseKey::new(translation, &verse.book, verse.chapter, verse.number);

            // entries without a hash predate text hashing and are trusted
            let reusable = cached
                .as_mut()
                .and_then(|entries| entries.remove(&key.cache_key()))
                .filter(|entry| {
                    entry
                        .text_hash
                        .as_deref()
                        .map_or(true, |hash| hash == text_hash(&verse.text))
                });

            let embedding = match reusable {
                Some(entry) => {
                    report.reused += 1;
                    entry.embedding
                }
                None => match self.model.embed(&verse.text) {
                    Ok(embedding) => {
                        report.embedded += 1;
                        embedding
                    }
                    Err(e) if e.is_fatal() => {
                        log::error!("Aborting build of {translation} at {key}: {e}");
                        return Err(e.into());
                    }
                    Err(e) => {
                        log::warn!("Skipping {key}: {e}");
                        report.failed += 1;
                        reporter.tick();
                        continue;
                    }
                },
            };

            if let Err(e) = index.insert(IndexedVerse {
                key,
                text: verse.text,
                embedding,
            }) {
                log::warn!("Skipping verse: {e}");
                report.failed += 1;
            }

            reporter.tick();
        }

        reporter.finish();
        report.indexed = index.len();

        if report.embedded > 0 || !from_cache {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.save(translation, index.verses()) {
                    log::warn!("Failed to save embedding cache for {translation}: {e}");
                }
            }
        }

        log::info!(
            "Indexed {} verses of {translation} ({} cached, {} embedded, {} empty, {} failed)",
            report.indexed,
            report.reused,
            report.embedded,
            report.empty,
            report.failed
        );

        Ok((index, report))
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, IndexState>, SemanticSearchError> {
        self.state
            .read()
            .map_err(|e| SemanticSearchError::Internal(format!("Lock poisoned: {}", e)))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, IndexState>, SemanticSearchError> {
        self.state
            .write()
            .map_err(|e| SemanticSearchError::Internal(format!("Lock poisoned: {}", e)))
    }
}

/// Sends `(processed, total)` every `interval` verses and once at the end.
struct ProgressReporter<'a> {
    sender: Option<&'a Sender<IndexProgress>>,
    total: usize,
    interval: usize,
    processed: usize,
}

impl<'a> ProgressReporter<'a> {
    fn new(sender: Option<&'a Sender<IndexProgress>>, total: usize, interval: usize) -> Self {
        Self {
            sender,
            total,
            interval,
            processed: 0,
        }
    }

    fn tick(&mut self) {
        self.processed += 1;
        if self.processed % self.interval == 0 && self.processed < self.total {
            log::debug!("Progress: {}/{}", self.processed, self.total);
            self.send();
        }
    }

    fn finish(&mut self) {
        self.processed = self.total;
        self.send();
    }

    fn send(&self) {
        if let Some(sender) = self.sender {
            // receiver may have gone away; progress is advisory
            let _ = sender.send(IndexProgress {
                processed: self.processed,
                total: self.total,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::embeddings::tests::{gated_model, test_model, Gate};
    use crate::tests::VerseList;
    use std::sync::atomic::Ordering;

    const WORDS: &[&str] = &["dios", "amor", "luz", "tierra"];

    fn service(cache: Option<EmbeddingCache>) -> (SemanticSearchService, Arc<std::sync::atomic::AtomicUsize>) {
        let (model, calls) = test_model(WORDS, 16);
        (SemanticSearchService::new(Arc::new(model), cache, 2), calls)
    }

    fn source(translation: &str, count: u32) -> VerseList {
        let mut list = VerseList::new(translation);
        for i in 1..=count {
            list.push("Salmos", 1, i, &format!("dios luz {i}"));
        }
        list
    }

    #[test]
    fn test_initial_state_is_empty() {
        let (service, _) = service(None);

        assert_eq!(service.status(), IndexStatus::Empty);
        assert!(!service.is_ready());
        assert_eq!(service.indexed_count(), 0);
        assert!(matches!(
            service.search("dios", 5),
            Err(SemanticSearchError::NotReady)
        ));
    }

    #[test]
    fn test_build_makes_ready() {
        let (service, _) = service(None);
        let report = service.build_index(&source("RVR", 5), None).unwrap();

        assert_eq!(report.indexed, 5);
        assert_eq!(report.embedded, 5);
        assert!(!report.from_cache);
        assert_eq!(service.status(), IndexStatus::Ready("RVR".to_string()));
        assert_eq!(service.current_translation().as_deref(), Some("RVR"));
        assert_eq!(service.indexed_count(), 5);
    }

    #[test]
    fn test_empty_query_skips_model() {
        let (service, calls) = service(None);
        service.build_index(&source("RVR", 3), None).unwrap();
        let before = calls.load(Ordering::SeqCst);

        assert!(service.search("   ", 5).unwrap().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[test]
    fn test_switching_translation_replaces_index() {
        let (service, _) = service(None);
        service.build_index(&source("RVR", 3), None).unwrap();
        service.build_index(&source("NVI", 7), None).unwrap();

        assert_eq!(service.current_translation().as_deref(), Some("NVI"));
        assert_eq!(service.indexed_count(), 7);
        let results = service.search("dios", 10).unwrap();
        assert!(results.iter().all(|r| r.translation == "NVI"));
    }

    #[test]
    fn test_clear_is_safe_when_empty() {
        let (service, _) = service(None);
        service.clear_index();
        service.clear_index();
        assert_eq!(service.status(), IndexStatus::Empty);
    }

    #[test]
    fn test_progress_cadence() {
        let (service, _) = service(None);
        let (tx, rx) = mpsc::channel();

        service.build_index(&source("RVR", 5), Some(&tx)).unwrap();
        drop(tx);

        let updates: Vec<(usize, usize)> = rx.iter().map(|p| (p.processed, p.total)).collect();
        assert_eq!(updates, vec![(2, 5), (4, 5), (5, 5)]);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(IndexProgress { processed: 50, total: 200 }.percent(), 25);
        assert_eq!(IndexProgress { processed: 0, total: 0 }.percent(), 100);
    }

    #[test]
    fn test_spawn_build_reports_and_completes() {
        let (service, _) = service(None);
        let service = Arc::new(service);

        let handle = service.spawn_build(Arc::new(source("RVR", 4)));
        let last = handle.progress.iter().last().unwrap();
        let report = handle.join().unwrap();

        assert_eq!(last, IndexProgress { processed: 4, total: 4 });
        assert_eq!(report.indexed, 4);
        assert!(service.is_ready());
    }

    fn gated_service() -> (Arc<SemanticSearchService>, Gate) {
        let (model, gate) = gated_model(WORDS, 16);
        (
            Arc::new(SemanticSearchService::new(Arc::new(model), None, 2)),
            gate,
        )
    }

    #[test]
    fn test_second_build_while_building_is_rejected() {
        let (service, gate) = gated_service();
        let handle = service.spawn_build(Arc::new(source("RVR", 3)));
        gate.wait_entered();

        assert_eq!(service.status(), IndexStatus::Building("RVR".to_string()));
        assert!(!service.is_ready());
        assert!(matches!(
            service.search("dios", 5),
            Err(SemanticSearchError::NotReady)
        ));
        assert!(matches!(
            service.build_index(&source("NVI", 2), None),
            Err(SemanticSearchError::BuildInProgress(t)) if t == "RVR"
        ));

        gate.open();
        let report = handle.join().unwrap();

        assert_eq!(report.indexed, 3);
        assert_eq!(service.status(), IndexStatus::Ready("RVR".to_string()));
    }

    #[test]
    fn test_clear_during_build_abandons_it() {
        let (service, gate) = gated_service();
        let handle = service.spawn_build(Arc::new(source("RVR", 3)));
        gate.wait_entered();

        service.clear_index();
        assert_eq!(service.status(), IndexStatus::Empty);

        gate.open();
        assert!(matches!(
            handle.join(),
            Err(SemanticSearchError::BuildAbandoned(t)) if t == "RVR"
        ));
        assert_eq!(service.status(), IndexStatus::Empty);
        assert_eq!(service.indexed_count(), 0);
    }

    #[test]
    fn test_cleared_build_does_not_replace_newer_build() {
        let (service, gate) = gated_service();
        let stale = service.spawn_build(Arc::new(source("RVR", 1)));
        gate.wait_entered();

        service.clear_index();
        let report = service.build_index(&source("RVR", 3), None).unwrap();
        assert_eq!(report.indexed, 3);

        gate.open();
        assert!(matches!(
            stale.join(),
            Err(SemanticSearchError::BuildAbandoned(_))
        ));
        assert_eq!(service.status(), IndexStatus::Ready("RVR".to_string()));
        assert_eq!(service.indexed_count(), 3);
    }
}
