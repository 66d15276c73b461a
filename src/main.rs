use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

mod bible;
mod cli;
mod config;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;

use bible::{Bible, BibleLibrary};
use cli::{CacheCommand, Command};
use config::Config;
use semantic::embeddings::{self, EmbeddingModel, VOCAB_FILE};
use semantic::tokenizer::{Tokenizer, Vocabulary};
use semantic::{BuildReport, EmbeddingCache, SearchResult, SemanticSearchService};

const PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}";

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();

    let base_path = config::base_path()?;
    let config = Config::load_with(&base_path)
        .with_context(|| format!("failed to load config from {}", base_path.display()))?;

    match args.command {
        Command::List => list_bibles(&config),

        Command::Tokenize { text } => tokenize(&config, &text),

        Command::Index { bible } => {
            let bible = find_bible(&config, &bible)?;
            let service = open_service(&config)?;
            let report = build(&service, bible)?;

            if report.already_indexed {
                println!("{} already indexed", report.translation);
            } else {
                println!(
                    "Indexed {} verses of {} ({} from cache, {} embedded, {} empty, {} failed)",
                    report.indexed,
                    report.translation,
                    report.reused,
                    report.embedded,
                    report.empty,
                    report.failed
                );
            }
            Ok(())
        }

        Command::Search {
            bible,
            query,
            top_k,
            json,
        } => {
            let top_k = top_k.unwrap_or(config.index.default_top_k);
            let bible = find_bible(&config, &bible)?;
            let service = open_service(&config)?;
            build(&service, bible)?;

            let results = service.search(&query, top_k)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_results(&results);
            }
            Ok(())
        }

        Command::Cache { command } => {
            let cache = EmbeddingCache::new(
                &config.cache_dir(),
                &embeddings::model_id(&config.model.name),
                config.model.dimensions,
            )?;

            match command {
                CacheCommand::Status => {
                    let summaries = cache.list();
                    if summaries.is_empty() {
                        println!("No embedding caches in {}", cache.dir().display());
                    }
                    for summary in summaries {
                        println!(
                            "{:<16} {:>6} verses  {}",
                            summary.translation,
                            summary.entries,
                            summary.created_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
                CacheCommand::Clear { translation } => {
                    let removed = cache.invalidate(translation.as_deref())?;
                    println!("Removed {removed} cache file(s)");
                }
            }
            Ok(())
        }
    }
}

fn list_bibles(config: &Config) -> anyhow::Result<()> {
    let library = BibleLibrary::new(config.bibles_dir());
    let bibles = library.list()?;

    if bibles.is_empty() {
        println!("No bibles found in {}", library.dir().display());
        return Ok(());
    }

    for bible in bibles {
        println!("{:<16} {} [{}]", bible.file_code, bible.name, bible.language);
    }
    Ok(())
}

fn find_bible(config: &Config, query: &str) -> anyhow::Result<Bible> {
    Ok(BibleLibrary::new(config.bibles_dir()).find(query)?)
}

fn tokenize(config: &Config, text: &str) -> anyhow::Result<()> {
    let vocab_path = config.model_dir().join(VOCAB_FILE);
    let vocab = Vocabulary::load(&vocab_path)
        .with_context(|| format!("failed to load {}", vocab_path.display()))?;
    let tokenizer = Tokenizer::new(vocab, config.model.max_sequence_length)?;

    let encoded = tokenizer.encode(text);
    let tokens = tokenizer.tokenize(text);

    println!("tokens:    {}", tokens.join(" "));
    println!(
        "input_ids: {:?}",
        &encoded.input_ids[..encoded.real_len()]
    );
    println!("length:    {} of {}", encoded.real_len(), encoded.len());
    Ok(())
}

fn open_service(config: &Config) -> anyhow::Result<Arc<SemanticSearchService>> {
    let model_dir = config.model_dir();
    if !model_dir.is_dir() {
        bail!(
            "model directory {} does not exist; place model.onnx and vocab.txt there",
            model_dir.display()
        );
    }

    let model = EmbeddingModel::load(&config.model, &model_dir)?;
    let cache = open_cache(&config.cache_dir(), &model);

    Ok(Arc::new(SemanticSearchService::new(
        Arc::new(model),
        cache,
        config.index.progress_interval,
    )))
}

/// An unusable cache directory disables caching rather than failing.
fn open_cache(dir: &Path, model: &EmbeddingModel) -> Option<EmbeddingCache> {
    match EmbeddingCache::new(dir, &model.model_id(), model.dimensions()) {
        Ok(cache) => Some(cache),
        Err(e) => {
            log::warn!("Embedding cache disabled: {e}");
            None
        }
    }
}

fn build(service: &Arc<SemanticSearchService>, bible: Bible) -> anyhow::Result<BuildReport> {
    let name = bible.name.clone();
    let handle = service.spawn_build(Arc::new(bible));

    let pb = ProgressBar::new(0);
    pb.set_style(ProgressStyle::default_bar().template(PROGRESS_TEMPLATE)?);
    pb.set_message(name);

    for progress in handle.progress.iter() {
        pb.set_length(progress.total as u64);
        pb.set_position(progress.processed as u64);
    }
    pb.finish_and_clear();

    Ok(handle.join()?)
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results");
        return;
    }

    for (rank, result) in results.iter().enumerate() {
        println!(
            "{:>2}. {}  {:.3}",
            rank + 1,
            result.citation(),
            result.similarity
        );
        println!("    {}", result.text);
    }
}
