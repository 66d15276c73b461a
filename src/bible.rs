//! Bible translations stored as JSON files, and the verse traversal the
//! semantic index consumes.
//!
//! File layout (`{bibles_dir}/{code}.json`):
//! testaments -> books -> chapters -> verses, where a verse is either a
//! string or an object holding the text.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A single verse with its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verse {
    pub book: String,
    pub chapter: u32,
    pub number: u32,
    pub text: String,
}

impl Verse {
    pub fn new(book: &str, chapter: u32, number: u32, text: &str) -> Self {
        Self {
            book: book.to_string(),
            chapter,
            number,
            text: text.to_string(),
        }
    }
}

/// Anything that can enumerate the verses of one translation.
///
/// Verses must come out in book -> chapter -> verse order.
pub trait VerseSource: Send + Sync {
    fn translation(&self) -> &str;
    fn verses(&self) -> Vec<Verse>;
}

#[derive(Debug, thiserror::Error)]
pub enum BibleError {
    #[error("I/O error reading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed bible file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Bible file {} has no testaments", .0.display())]
    Empty(PathBuf),

    #[error("No bible matches '{query}'. Available: {}", .available.join(", "))]
    NotFound {
        query: String,
        available: Vec<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Bible {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub order: String,
    /// File name without extension
    #[serde(skip)]
    pub file_code: String,
    #[serde(default)]
    pub testaments: BTreeMap<String, Testament>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Testament {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub books: BTreeMap<String, Book>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Book {
    #[serde(default, deserialize_with = "string_or_number")]
    pub number: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub chapters: BTreeMap<String, Chapter>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Chapter {
    #[serde(default, deserialize_with = "string_or_number")]
    pub number: String,
    #[serde(default)]
    pub verses: BTreeMap<String, Value>,
}

impl Bible {
    /// Load a bible from a JSON file; the file stem becomes the file code.
    pub fn load(path: &Path) -> Result<Self, BibleError> {
        let content = std::fs::read_to_string(path).map_err(|source| BibleError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut bible: Bible = serde_json::from_str(&content).map_err(|source| BibleError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if bible.testaments.is_empty() {
            return Err(BibleError::Empty(path.to_path_buf()));
        }

        let code = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if bible.version.is_empty() {
            bible.version = code.clone();
        }
        if bible.name.is_empty() {
            bible.name = code.clone();
        }
        bible.file_code = code;

        Ok(bible)
    }

    /// Display ordering; unparsable values sort last.
    pub fn order_rank(&self) -> u32 {
        self.order.trim().parse().unwrap_or(999)
    }
}

impl Chapter {
    /// Verse number -> text, in ascending verse order.
    pub fn verse_texts(&self) -> Vec<(u32, String)> {
        let mut texts: Vec<(u32, String)> = self
            .verses
            .iter()
            .map(|(key, value)| (parse_number(key), verse_text(value)))
            .collect();
        texts.sort_by_key(|(number, _)| *number);
        texts
    }
}

impl VerseSource for Bible {
    fn translation(&self) -> &str {
        if self.file_code.is_empty() {
            &self.name
        } else {
            &self.file_code
        }
    }

    fn verses(&self) -> Vec<Verse> {
        let mut books: Vec<(u32, &Book)> = self
            .testaments
            .values()
            .flat_map(|testament| testament.books.iter())
            .map(|(key, book)| {
                let number = if book.number.is_empty() {
                    key.as_str()
                } else {
                    book.number.as_str()
                };
                (parse_number(number), book)
            })
            .collect();
        books.sort_by_key(|(number, _)| *number);

        let mut verses = Vec::new();
        for (_, book) in books {
            let mut chapters: Vec<(u32, &Chapter)> = book
                .chapters
                .iter()
                .map(|(key, chapter)| {
                    let number = if chapter.number.is_empty() {
                        key.as_str()
                    } else {
                        chapter.number.as_str()
                    };
                    (parse_number(number), chapter)
                })
                .collect();
            chapters.sort_by_key(|(number, _)| *number);

            for (chapter_number, chapter) in chapters {
                for (number, text) in chapter.verse_texts() {
                    verses.push(Verse {
                        book: book.name.clone(),
                        chapter: chapter_number,
                        number,
                        text,
                    });
                }
            }
        }

        verses
    }
}

/// Directory of `*.json` bible files.
pub struct BibleLibrary {
    dir: PathBuf,
}

impl BibleLibrary {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load every readable bible, sorted by `order` then name.
    ///
    /// Unreadable files are logged and skipped.
    pub fn list(&self) -> Result<Vec<Bible>, BibleError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("Bibles directory {} does not exist", self.dir.display());
                return Ok(vec![]);
            }
            Err(source) => {
                return Err(BibleError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut bibles: Vec<Bible> = paths
            .iter()
            .filter_map(|path| match Bible::load(path) {
                Ok(bible) => Some(bible),
                Err(e) => {
                    log::warn!("Skipping bible: {e}");
                    None
                }
            })
            .collect();

        bibles.sort_by(|a, b| {
            a.order_rank()
                .cmp(&b.order_rank())
                .then_with(|| a.name.cmp(&b.name))
        });
        log::debug!("Found {} bibles in {}", bibles.len(), self.dir.display());

        Ok(bibles)
    }

    /// Resolve a bible by file code or name.
    ///
    /// An exact (case-insensitive) file code match wins; otherwise the first
    /// bible whose name or code contains `query`.
    pub fn find(&self, query: &str) -> Result<Bible, BibleError> {
        let mut bibles = self.list()?;
        let needle = query.to_lowercase();

        let exact = bibles
            .iter()
            .position(|b| b.file_code.to_lowercase() == needle);
        let fuzzy = || {
            bibles.iter().position(|b| {
                b.name.to_lowercase().contains(&needle)
                    || b.file_code.to_lowercase().contains(&needle)
            })
        };

        match exact.or_else(fuzzy) {
            Some(pos) => Ok(bibles.swap_remove(pos)),
            None => Err(BibleError::NotFound {
                query: query.to_string(),
                available: bibles
                    .iter()
                    .map(|b| format!("{} ({})", b.name, b.file_code))
                    .collect(),
            }),
        }
    }
}

/// Verse text from a string value, an object's `text` property, or its first
/// string property.
fn verse_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .or_else(|| map.values().find_map(Value::as_str))
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}

fn parse_number(value: &str) -> u32 {
    value.trim().parse().unwrap_or(0)
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}
