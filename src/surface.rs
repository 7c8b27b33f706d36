//! Boundary between the lint/format core and whatever displays its results.

use lsp_types::{Diagnostic, MessageType, Url};
use std::collections::HashMap;
use std::sync::Mutex;

/// Sink for diagnostics and user-visible messages.
///
/// The LSP server implements this over JSON-RPC notifications; tests and the
/// one-shot CLI use [`RecordingSurface`].
pub trait EditorSurface: Send + Sync {
    /// Replace all diagnostics for `uri`.
    fn publish_diagnostics(&self, uri: &Url, diagnostics: Vec<Diagnostic>, version: Option<i32>);

    /// Transient notification to the user.
    fn show_message(&self, kind: MessageType, message: &str);

    fn clear_diagnostics(&self, uri: &Url) {
        self.publish_diagnostics(uri, Vec::new(), None);
    }

    fn show_error(&self, message: &str) {
        self.show_message(MessageType::ERROR, message);
    }
}

/// In-memory surface that remembers everything published to it.
#[derive(Debug, Default)]
pub struct RecordingSurface {
    diagnostics: Mutex<HashMap<Url, Vec<Diagnostic>>>,
    publish_count: Mutex<usize>,
    messages: Mutex<Vec<(MessageType, String)>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current diagnostics for a URI (None if never published).
    pub fn diagnostics(&self, uri: &Url) -> Option<Vec<Diagnostic>> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(uri)
            .cloned()
    }

    pub fn all_diagnostics(&self) -> HashMap<Url, Vec<Diagnostic>> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn publish_count(&self) -> usize {
        *self.publish_count.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn messages(&self) -> Vec<(MessageType, String)> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl EditorSurface for RecordingSurface {
    fn publish_diagnostics(&self, uri: &Url, diagnostics: Vec<Diagnostic>, _version: Option<i32>) {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(uri.clone(), diagnostics);
        *self.publish_count.lock().unwrap_or_else(|e| e.into_inner()) += 1;
    }

    fn show_message(&self, kind: MessageType, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind, message.to_string()));
    }
}
