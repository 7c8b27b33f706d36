//! Formatting through `sqlfluff fix`.
//!
//! Whole documents are either piped through stdin (default) or fixed in place on
//! disk and read back (terminal mode). Ranges are widened to whole lines and only
//! that slice is sent. Whatever path is taken, the outcome is at most one edit.

use log::{debug, info};
use lsp_types::{Position, Range, TextEdit, Url};
use std::sync::Arc;
use thiserror::Error;

use crate::constants::{
    millis_to_duration, EXECUTABLE_NOT_FOUND_MARKER, NO_SAFETY_MARKER, TEMPLATING_ERRORS_FOUND,
    TEMPLATING_ERRORS_REMAINING, TERMINAL_SETTLE_DELAY_MS,
};
use crate::documents::{Document, DocumentStore};
use crate::invoker::{CommandInvocation, CommandKind, Invoker};

#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Format not enabled in the settings. Skipping Format.")]
    Disabled,
    #[error("Unable to format a selection while sqlfluff.experimental.format.executeInTerminal is enabled. Skipping Format.")]
    RangeInTerminalMode,
    #[error("Document is not open: {0}")]
    UnknownDocument(Url),
    #[error("File path not found.")]
    NoPath,
    #[error("Unable to save the document before formatting: {0}")]
    SaveFailed(#[source] std::io::Error),
    #[error("Unable to read the fixed file: {0}")]
    ReadFailed(#[source] std::io::Error),
    #[error("SQLFluff Formatting Failed.")]
    CommandFailed,
    #[error("SQLFluff templating/parsing errors found.")]
    TemplatingErrors,
}

// ============================================================================
// Output Parsing
// ============================================================================

/// Classified `sqlfluff fix` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixOutput {
    /// Rewritten text, split into lines. `errors_remaining` is set when the tool
    /// fixed what it could but reported templating/parsing errors.
    Fixed {
        lines: Vec<String>,
        errors_remaining: bool,
    },
    TemplatingErrors,
    ExecutableNotFound,
}

impl FixOutput {
    /// Whether applying this output would change nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            FixOutput::Fixed { lines, .. } => {
                lines.iter().all(|line| line.is_empty())
            }
            _ => true,
        }
    }
}

/// Split on `\r\n`, `\r` or `\n`, keeping empty lines.
pub fn split_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                lines.push(std::mem::take(&mut current));
            }
            '\n' => lines.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    lines.push(current);
    lines
}

/// Interpret fix output. `strip_no_safety` is false for the remote backend.
pub fn parse_fix_output(output: &[String], strip_no_safety: bool) -> FixOutput {
    let blob = output.join("\n");
    let mut lines = split_lines(&blob);

    if strip_no_safety
        && lines
            .first()
            .is_some_and(|l| l.starts_with(NO_SAFETY_MARKER))
    {
        lines.drain(..lines.len().min(2));
    }

    let mut errors_remaining = false;
    if lines
        .first()
        .is_some_and(|l| l.contains(TEMPLATING_ERRORS_REMAINING))
    {
        lines.remove(0);
        errors_remaining = true;
    }

    match lines.first() {
        Some(first) if first.contains(EXECUTABLE_NOT_FOUND_MARKER) => FixOutput::ExecutableNotFound,
        Some(first) if first.contains(TEMPLATING_ERRORS_FOUND) => FixOutput::TemplatingErrors,
        _ => FixOutput::Fixed {
            lines,
            errors_remaining,
        },
    }
}

/// Re-indent non-blank lines with `indent` unless the output is already indented,
/// then drop a trailing empty line.
pub fn add_leading_whitespace(lines: Vec<String>, indent: &str, preserve: bool) -> Vec<String> {
    let already_indented = lines
        .first()
        .and_then(|l| l.chars().next())
        .is_some_and(char::is_whitespace);

    let mut result: Vec<String> = if preserve && !already_indented && !indent.is_empty() {
        lines
            .into_iter()
            .map(|line| {
                if line.trim().is_empty() {
                    line
                } else {
                    format!("{indent}{line}")
                }
            })
            .collect()
    } else {
        lines
    };

    if result.last().is_some_and(|l| l.is_empty()) {
        result.pop();
    }
    result
}

/// Widen `range` to whole lines, dropping a final line that is only whitespace.
pub fn extend_to_whole_lines(doc: &Document, range: Range) -> Range {
    let mut end_line = range.end.line.min(doc.line_count().saturating_sub(1));
    let start_line = range.start.line.min(end_line);
    if end_line > start_line && doc.line(end_line).is_some_and(|l| l.trim().is_empty()) {
        end_line -= 1;
    }
    let end_char = doc
        .line(end_line)
        .map(|l| l.chars().map(|c| c.len_utf16() as u32).sum())
        .unwrap_or(0);
    Range::new(Position::new(start_line, 0), Position::new(end_line, end_char))
}

fn leading_whitespace(line: &str) -> &str {
    let trimmed = line.trim_start();
    &line[..line.len() - trimmed.len()]
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct FormatOrchestrator {
    invoker: Arc<Invoker>,
    documents: Arc<DocumentStore>,
}

impl FormatOrchestrator {
    pub fn new(invoker: Arc<Invoker>, documents: Arc<DocumentStore>) -> Self {
        Self { invoker, documents }
    }

    fn notify(&self, message: &str) {
        if !self.invoker.config().settings.suppress_notifications {
            self.invoker.surface().show_error(message);
        }
    }

    /// Common checks; `None` means skip silently.
    fn prepare(&self, uri: &Url) -> Result<Option<Document>, FormatError> {
        let config = self.invoker.config();
        if config
            .working_directory()
            .is_some_and(|d| d.display().to_string().contains("${"))
        {
            debug!("working directory has unresolved variables; skipping format");
            return Ok(None);
        }
        if !config.settings.format.enabled {
            self.invoker
                .output()
                .append_line(&FormatError::Disabled.to_string());
            return Err(FormatError::Disabled);
        }
        self.documents
            .get(uri)
            .map(Some)
            .ok_or_else(|| FormatError::UnknownDocument(uri.clone()))
    }

    /// Convert parsed output into lines to insert, or `None` for no edit.
    fn reconcile(&self, output: FixOutput) -> Result<Option<Vec<String>>, FormatError> {
        match output {
            FixOutput::ExecutableNotFound => Ok(None),
            FixOutput::TemplatingErrors => Err(FormatError::TemplatingErrors),
            fixed @ FixOutput::Fixed { .. } if fixed.is_noop() => Ok(None),
            FixOutput::Fixed {
                lines,
                errors_remaining,
            } => {
                if errors_remaining {
                    self.notify("SQLFluff fixed what it could, but templating/parsing errors remain.");
                }
                Ok(Some(lines))
            }
        }
    }

    /// Format a whole document.
    pub fn format_document(&self, uri: &Url) -> Result<Vec<TextEdit>, FormatError> {
        let Some(doc) = self.prepare(uri)? else {
            return Ok(Vec::new());
        };
        let config = self.invoker.config();
        let path = doc.path().ok_or(FormatError::NoPath)?;
        self.invoker
            .output()
            .append_line(&format!("Format triggered for {}", path.display()));

        let remote = config.settings.dbt_interface.enabled;
        let args = config
            .settings
            .format_file_arguments(self.invoker.version().as_ref());

        let lines = if config.settings.experimental.format.execute_in_terminal && !remote {
            if doc.dirty {
                std::fs::write(&path, &doc.text).map_err(FormatError::SaveFailed)?;
                self.documents.save(uri, None);
            }
            let result = self
                .invoker
                .run(&CommandInvocation::for_file(CommandKind::Fix, args, path.clone()))
                .map_err(|_| FormatError::CommandFailed)?;
            std::thread::sleep(millis_to_duration(TERMINAL_SETTLE_DELAY_MS));
            if !result.succeeded {
                return Err(FormatError::CommandFailed);
            }
            let contents = std::fs::read_to_string(&path).map_err(FormatError::ReadFailed)?;
            self.reconcile(FixOutput::Fixed {
                lines: split_lines(&contents),
                errors_remaining: false,
            })?
        } else {
            let result = self
                .invoker
                .run(&CommandInvocation::for_buffer(
                    CommandKind::Fix,
                    args,
                    doc.text.clone(),
                    Some(path.clone()),
                ))
                .map_err(|_| FormatError::CommandFailed)?;
            if !result.succeeded {
                return Err(FormatError::CommandFailed);
            }
            self.reconcile(parse_fix_output(&result.lines, !remote))?
        };

        Ok(lines
            .map(|lines| {
                info!("formatted {}", uri);
                vec![TextEdit::new(doc.full_range(), lines.join("\n"))]
            })
            .unwrap_or_default())
    }

    /// Format the whole lines covered by `range`.
    pub fn format_range(&self, uri: &Url, range: Range) -> Result<Vec<TextEdit>, FormatError> {
        let Some(doc) = self.prepare(uri)? else {
            return Ok(Vec::new());
        };
        let config = self.invoker.config();
        if config.settings.experimental.format.execute_in_terminal {
            self.invoker
                .output()
                .append_line(&FormatError::RangeInTerminalMode.to_string());
            return Err(FormatError::RangeInTerminalMode);
        }
        let path = doc.path().ok_or(FormatError::NoPath)?;

        let range = extend_to_whole_lines(&doc, range);
        self.invoker.output().append_line(&format!(
            "Range (Lines {} to {}) Format triggered for {}",
            range.start.line,
            range.end.line,
            path.display()
        ));

        let slice = doc.text_in_range(range);
        if slice.trim().is_empty() {
            return Ok(Vec::new());
        }
        let indent = doc
            .line(range.start.line)
            .map(leading_whitespace)
            .unwrap_or("")
            .to_string();

        let remote = config.settings.dbt_interface.enabled;
        let args = config
            .settings
            .format_file_arguments(self.invoker.version().as_ref());
        let result = self
            .invoker
            .run(&CommandInvocation::for_buffer(CommandKind::Fix, args, slice, Some(path)))
            .map_err(|_| FormatError::CommandFailed)?;
        if !result.succeeded {
            return Err(FormatError::CommandFailed);
        }

        let Some(lines) = self.reconcile(parse_fix_output(&result.lines, !remote))? else {
            return Ok(Vec::new());
        };
        let preserve = config
            .settings
            .format_language(&doc.language_id)
            .is_some_and(|l| l.preserve_leading_whitespace);
        let lines = add_leading_whitespace(lines, &indent, preserve);

        Ok(vec![TextEdit::new(range, lines.join("\n"))])
    }
}

// ============================================================================
// Tests
// ============================================================================
