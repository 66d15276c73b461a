//! WordPiece tokenizer for BERT-style sentence-transformer models.
//!
//! Converts raw text into the three input arrays the model expects:
//! - Lowercases and strips diacritics (NFD, drop combining marks, NFC)
//! - Splits on whitespace and trims punctuation around each word
//! - Greedy longest-prefix WordPiece splitting with `##` continuations
//! - Frames with `[CLS]`/`[SEP]` and zero-pads to the sequence length

use std::collections::HashMap;
use std::path::Path;

use unicode_general_category::{get_general_category, GeneralCategory};
use unicode_normalization::UnicodeNormalization;

/// Reserved vocabulary entry for tokens that cannot be represented.
pub const UNKNOWN_TOKEN: &str = "[UNK]";
/// Reserved vocabulary entry that starts every sequence.
pub const SEQUENCE_START_TOKEN: &str = "[CLS]";
/// Reserved vocabulary entry that ends every sequence.
pub const SEQUENCE_SEPARATOR_TOKEN: &str = "[SEP]";
/// Prefix marking a subword that continues the previous piece.
pub const CONTINUATION_PREFIX: &str = "##";
/// Id written into padding positions.
pub const PADDING_ID: i64 = 0;
/// Longer words become a single unknown token without subword splitting.
pub const MAX_CHARS_PER_WORD: usize = 100;

/// Errors that can occur while loading a vocabulary or building a tokenizer.
#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("I/O error reading vocabulary: {0}")]
    Io(#[from] std::io::Error),

    #[error("Vocabulary is missing reserved token {0}")]
    MissingSpecialToken(&'static str),

    #[error("Maximum sequence length must be at least 2, got {0}")]
    SequenceTooShort(usize),
}

/// Subword vocabulary: one token per line, line index is the token id.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    ids: HashMap<String, i64>,
    unknown_id: i64,
    start_id: i64,
    separator_id: i64,
}

impl Vocabulary {
    /// Load a vocabulary from a `vocab.txt` file.
    pub fn load(path: &Path) -> Result<Self, TokenizerError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_lines(content.lines())
    }

    /// Build a vocabulary from an ordered list of tokens.
    ///
    /// Duplicate lines keep the id of their last occurrence.
    pub fn from_lines<I, S>(lines: I) -> Result<Self, TokenizerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: HashMap<String, i64> = lines
            .into_iter()
            .enumerate()
            .map(|(id, token)| (token.as_ref().to_string(), id as i64))
            .collect();

        let lookup = |token: &'static str| {
            ids.get(token)
                .copied()
                .ok_or(TokenizerError::MissingSpecialToken(token))
        };

        Ok(Self {
            unknown_id: lookup(UNKNOWN_TOKEN)?,
            start_id: lookup(SEQUENCE_START_TOKEN)?,
            separator_id: lookup(SEQUENCE_SEPARATOR_TOKEN)?,
            ids,
        })
    }

    pub fn get(&self, token: &str) -> Option<i64> {
        self.ids.get(token).copied()
    }

    pub fn contains(&self, token: &str) -> bool {
        self.ids.contains_key(token)
    }

    /// Id for a token, falling back to the unknown id.
    pub fn id_or_unknown(&self, token: &str) -> i64 {
        self.get(token).unwrap_or(self.unknown_id)
    }

    pub fn unknown_id(&self) -> i64 {
        self.unknown_id
    }

    pub fn start_id(&self) -> i64 {
        self.start_id
    }

    pub fn separator_id(&self) -> i64 {
        self.separator_id
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Model input for a single text, all arrays of the same length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedInput {
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub token_type_ids: Vec<i64>,
}

impl EncodedInput {
    /// Sequence length including padding.
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Number of positions marked real by the attention mask.
    pub fn real_len(&self) -> usize {
        self.attention_mask.iter().filter(|&&m| m == 1).count()
    }
}

/// Tokenizer bound to a vocabulary and a fixed sequence length.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: Vocabulary,
    max_sequence_length: usize,
}

impl Tokenizer {
    pub fn new(vocab: Vocabulary, max_sequence_length: usize) -> Result<Self, TokenizerError> {
        if max_sequence_length < 2 {
            return Err(TokenizerError::SequenceTooShort(max_sequence_length));
        }

        Ok(Self {
            vocab,
            max_sequence_length,
        })
    }

    /// Split text into subword token strings (no sentinels, no truncation).
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let normalized = normalize_text(text);
        let mut tokens = Vec::new();

        for word in normalized.split_whitespace() {
            let word = word.trim_matches(is_punctuation);
            if word.is_empty() {
                continue;
            }

            if self.vocab.contains(word) {
                tokens.push(word.to_string());
            } else {
                tokens.extend(self.wordpiece(word));
            }
        }

        tokens
    }

    /// Encode text into framed, padded model input.
    pub fn encode(&self, text: &str) -> EncodedInput {
        let capacity = self.max_sequence_length - 2;
        let ids = self
            .tokenize(text)
            .iter()
            .take(capacity)
            .map(|token| self.vocab.id_or_unknown(token))
            .collect::<Vec<_>>();

        let mut input_ids = Vec::with_capacity(self.max_sequence_length);
        input_ids.push(self.vocab.start_id());
        input_ids.extend(ids);
        input_ids.push(self.vocab.separator_id());

        let real_len = input_ids.len();
        input_ids.resize(self.max_sequence_length, PADDING_ID);

        let attention_mask = (0..self.max_sequence_length)
            .map(|i| if i < real_len { 1 } else { 0 })
            .collect();

        EncodedInput {
            input_ids,
            attention_mask,
            token_type_ids: vec![0; self.max_sequence_length],
        }
    }

    /// Greedy longest-match subword split of a single word.
    fn wordpiece(&self, word: &str) -> Vec<String> {
        if word.chars().nth(MAX_CHARS_PER_WORD).is_some() {
            return vec![UNKNOWN_TOKEN.to_string()];
        }

        // byte offsets of every char boundary, including the end
        let bounds: Vec<usize> = word
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(word.len()))
            .collect();
        let last = bounds.len() - 1;

        let mut pieces = Vec::new();
        let mut candidate = String::with_capacity(word.len() + CONTINUATION_PREFIX.len());
        let mut start = 0;

        while start < last {
            let mut end = last;
            let mut found = false;

            while start < end {
                candidate.clear();
                if start > 0 {
                    candidate.push_str(CONTINUATION_PREFIX);
                }
                candidate.push_str(&word[bounds[start]..bounds[end]]);

                if self.vocab.contains(&candidate) {
                    found = true;
                    break;
                }
                end -= 1;
            }

            if found {
                pieces.push(candidate.clone());
                start = end;
            } else {
                pieces.push(UNKNOWN_TOKEN.to_string());
                start += 1;
            }
        }

        pieces
    }
}

/// Lowercase and strip diacritics (non-spacing marks only).
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .nfd()
        .filter(|&c| get_general_category(c) != GeneralCategory::NonspacingMark)
        .nfc()
        .collect()
}

fn is_punctuation(c: char) -> bool {
    c.is_ascii_punctuation()
        || matches!(
            c,
            '¿' | '¡' | '«' | '»' | '“' | '”' | '‘' | '’' | '…' | '—' | '–'
        )
}
