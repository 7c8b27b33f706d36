//! Open-document store.
//!
//! Holds the live text of every document the client has opened, tracks whether
//! it has unsaved edits, and answers position queries in LSP (UTF-16) columns.

use lsp_types::{Position, Range, TextDocumentContentChangeEvent, Url};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Characters that end a word, besides whitespace.
const WORD_SEPARATORS: &str = "`~!@#$%^&*()-=+[{]}\\|;:'\",.<>/?";

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !WORD_SEPARATORS.contains(c)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub uri: Url,
    pub language_id: String,
    pub version: i32,
    pub text: String,
    /// True when the buffer differs from what was last saved.
    pub dirty: bool,
}

impl Document {
    pub fn new(uri: Url, language_id: &str, version: i32, text: String) -> Self {
        Self {
            uri,
            language_id: language_id.to_string(),
            version,
            text,
            dirty: false,
        }
    }

    /// Filesystem path for `file://` documents.
    pub fn path(&self) -> Option<PathBuf> {
        self.uri.to_file_path().ok()
    }

    /// Lines without their terminators; a trailing newline yields a final empty line.
    pub fn lines(&self) -> Vec<&str> {
        self.text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .collect()
    }

    pub fn line(&self, line: u32) -> Option<&str> {
        self.text
            .split('\n')
            .nth(line as usize)
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
    }

    pub fn line_count(&self) -> u32 {
        self.text.split('\n').count() as u32
    }

    /// Convert a character column on `line` into a UTF-16 column, clamped to the line end.
    pub fn utf16_column(&self, line: u32, char_col: u32) -> u32 {
        match self.line(line) {
            Some(text) => text
                .chars()
                .take(char_col as usize)
                .map(|c| c.len_utf16() as u32)
                .sum(),
            None => char_col,
        }
    }

    /// Inverse of [`Document::utf16_column`].
    pub fn char_column(&self, line: u32, utf16_col: u32) -> u32 {
        let Some(text) = self.line(line) else {
            return utf16_col;
        };
        let mut units = 0;
        let mut chars = 0;
        for c in text.chars() {
            if units >= utf16_col {
                break;
            }
            units += c.len_utf16() as u32;
            chars += 1;
        }
        chars
    }

    /// Word range around an LSP position.
    pub fn word_range_at_position(&self, position: Position) -> Option<Range> {
        self.word_range_at(position.line, self.char_column(position.line, position.character))
    }

    /// Position of a (line, character column) pair in UTF-16 units.
    pub fn position_at_char(&self, line: u32, char_col: u32) -> Position {
        Position::new(line, self.utf16_column(line, char_col))
    }

    /// Word range containing (or ending at) a character column, in UTF-16 units.
    pub fn word_range_at(&self, line: u32, char_col: u32) -> Option<Range> {
        let chars: Vec<char> = self.line(line)?.chars().collect();
        let col = char_col as usize;
        let anchor = if col < chars.len() && is_word_char(chars[col]) {
            col
        } else if col > 0 && col <= chars.len() && is_word_char(chars[col - 1]) {
            col - 1
        } else {
            return None;
        };

        let mut start = anchor;
        while start > 0 && is_word_char(chars[start - 1]) {
            start -= 1;
        }
        let mut end = anchor + 1;
        while end < chars.len() && is_word_char(chars[end]) {
            end += 1;
        }

        let width = |slice: &[char]| slice.iter().map(|c| c.len_utf16() as u32).sum::<u32>();
        Some(Range::new(
            Position::new(line, width(&chars[..start])),
            Position::new(line, width(&chars[..end])),
        ))
    }

    /// Byte offset of an LSP position, clamped to the document.
    pub fn offset_at(&self, position: Position) -> usize {
        let mut offset = 0;
        for (idx, line) in self.text.split_inclusive('\n').enumerate() {
            if idx == position.line as usize {
                let content = line.trim_end_matches(['\n', '\r']);
                let mut units = 0u32;
                for (byte_idx, c) in content.char_indices() {
                    if units >= position.character {
                        return offset + byte_idx;
                    }
                    units += c.len_utf16() as u32;
                }
                return offset + content.len();
            }
            offset += line.len();
        }
        self.text.len()
    }

    pub fn text_in_range(&self, range: Range) -> String {
        let start = self.offset_at(range.start);
        let end = self.offset_at(range.end).max(start);
        self.text[start..end].to_string()
    }

    /// Range covering the whole document.
    pub fn full_range(&self) -> Range {
        let last = self.line_count().saturating_sub(1);
        let width = self
            .line(last)
            .map(|l| l.chars().map(|c| c.len_utf16() as u32).sum())
            .unwrap_or(0);
        Range::new(Position::new(0, 0), Position::new(last, width))
    }

    /// Apply one content change (full replacement or ranged edit).
    pub fn apply_change(&mut self, change: &TextDocumentContentChangeEvent) {
        match change.range {
            Some(range) => {
                let start = self.offset_at(range.start);
                let end = self.offset_at(range.end).max(start);
                self.text.replace_range(start..end, &change.text);
            }
            None => self.text = change.text.clone(),
        }
    }
}

/// Thread-safe map of open documents keyed by URI.
#[derive(Debug, Default)]
pub struct DocumentStore {
    docs: Mutex<HashMap<Url, Document>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Url, Document>> {
        self.docs.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn open(&self, doc: Document) {
        self.lock().insert(doc.uri.clone(), doc);
    }

    pub fn change(&self, uri: &Url, version: i32, changes: &[TextDocumentContentChangeEvent]) {
        if let Some(doc) = self.lock().get_mut(uri) {
            for change in changes {
                doc.apply_change(change);
            }
            doc.version = version;
            doc.dirty = true;
        }
    }

    /// Mark saved; `text` replaces the buffer when the client includes it.
    pub fn save(&self, uri: &Url, text: Option<String>) {
        if let Some(doc) = self.lock().get_mut(uri) {
            if let Some(text) = text {
                doc.text = text;
            }
            doc.dirty = false;
        }
    }

    pub fn close(&self, uri: &Url) -> Option<Document> {
        self.lock().remove(uri)
    }

    pub fn get(&self, uri: &Url) -> Option<Document> {
        self.lock().get(uri).cloned()
    }

    /// Open document whose file path is `path`, if any.
    pub fn find_by_path(&self, path: &std::path::Path) -> Option<Document> {
        self.lock()
            .values()
            .find(|d| d.path().as_deref() == Some(path))
            .cloned()
    }

    pub fn all(&self) -> Vec<Document> {
        self.lock().values().cloned().collect()
    }
}
