use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "Semantic verse search", long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// List available bible translations
    List,

    /// Build (or load from cache) the embedding index of a translation
    Index {
        /// Translation code or part of its name
        bible: String,
    },

    /// Search a translation for verses similar to a query
    Search {
        /// Translation code or part of its name
        bible: String,

        /// Free text query
        #[clap(allow_hyphen_values = true)]
        query: String,

        /// Number of results [default: index.default_top_k]
        #[clap(short = 'k', long)]
        top_k: Option<usize>,

        /// Print results as json
        #[clap(long, default_value = "false")]
        json: bool,
    },

    /// Show how text is split into model tokens
    Tokenize {
        text: String,
    },

    /// Manage embedding caches
    Cache {
        #[clap(subcommand)]
        command: CacheCommand,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheCommand {
    /// List cached translations
    Status,

    /// Delete the cache of one translation, or all caches
    Clear {
        translation: Option<String>,
    },
}
