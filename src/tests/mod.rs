
use crate::bible::{Verse, VerseSource};

/// In-memory verse source for tests.
pub struct VerseList {
    translation: String,
    verses: Vec<Verse>,
}

impl VerseList {
    pub fn new(translation: &str) -> Self {
        Self {
            translation: translation.to_string(),
            verses: Vec::new(),
        }
    }

    pub fn push(&mut self, book: &str, chapter: u32, number: u32, text: &str) {
        self.verses.push(Verse::new(book, chapter, number, text));
    }

    pub fn set_text(&mut self, book: &str, chapter: u32, number: u32, text: &str) {
        if let Some(verse) = self
            .verses
            .iter_mut()
            .find(|v| v.book == book && v.chapter == chapter && v.number == number)
        {
            verse.text = text.to_string();
        }
    }
}

impl VerseSource for VerseList {
    fn translation(&self) -> &str {
        &self.translation
    }

    fn verses(&self) -> Vec<Verse> {
        self.verses.clone()
    }
}
