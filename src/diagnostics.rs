//! Mapping sqlfluff JSON reports to LSP diagnostics.
//!
//! Lint output is a stream of lines, each holding one or more JSON arrays of
//! file reports. Lines that don't parse are logged and skipped; the rest are
//! converted into diagnostics grouped per file. When a report belongs to the
//! document that is open in the editor, point locations are widened to the word
//! under them using the live buffer.

use log::warn;
use lsp_types::{CodeDescription, Diagnostic, NumberOrString, Position, Range, Url};
use serde::Deserialize;
use std::path::{Component, Path, PathBuf};

use crate::constants::{DIAGNOSTIC_SOURCE, RULE_DOCS_URL, STDIN_FILEPATH};
use crate::documents::Document;
use crate::settings::{normalize_path, Settings};

// ============================================================================
// Report Schema
// ============================================================================

/// One rule hit. Coordinates are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Violation {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub description: String,
    pub line_no: Option<i64>,
    pub line_pos: Option<i64>,
    pub start_line_no: Option<i64>,
    pub start_line_pos: Option<i64>,
    pub end_line_no: Option<i64>,
    pub end_line_pos: Option<i64>,
}

/// 0-based (line, char column) pair, clamped at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharPosition {
    pub line: u32,
    pub column: u32,
}

fn to_zero_based(value: Option<i64>) -> u32 {
    value.map_or(0, |v| v.saturating_sub(1).clamp(0, i64::from(u32::MAX)) as u32)
}

impl Violation {
    pub fn start(&self) -> CharPosition {
        CharPosition {
            line: to_zero_based(self.start_line_no.or(self.line_no)),
            column: to_zero_based(self.start_line_pos.or(self.line_pos)),
        }
    }

    /// End position; a violation without an explicit end is a point.
    pub fn end(&self) -> CharPosition {
        match (self.end_line_no, self.end_line_pos) {
            (Some(line), Some(pos)) => {
                let end = CharPosition {
                    line: to_zero_based(Some(line)),
                    column: to_zero_based(Some(pos)),
                };
                let start = self.start();
                if (end.line, end.column) < (start.line, start.column) {
                    start
                } else {
                    end
                }
            }
            _ => self.start(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FileReport {
    #[serde(default)]
    pub filepath: String,
    #[serde(default)]
    pub violations: Vec<Violation>,
}

/// One line of lint output, classified.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportLine {
    Reports(Vec<FileReport>),
    Unparseable(String),
}

impl ReportLine {
    /// Parse a line holding one or more concatenated JSON arrays of reports.
    pub fn parse(line: &str) -> Self {
        let mut reports = Vec::new();
        let stream = serde_json::Deserializer::from_str(line).into_iter::<Vec<FileReport>>();
        for item in stream {
            match item {
                Ok(batch) => reports.extend(batch),
                Err(e) => return ReportLine::Unparseable(e.to_string()),
            }
        }
        if reports.is_empty() && line.trim().is_empty() {
            return ReportLine::Unparseable("empty line".to_string());
        }
        ReportLine::Reports(reports)
    }
}

// ============================================================================
// Mapping
// ============================================================================

/// What was linted: the file path, where sqlfluff ran, and the live buffer if open.
#[derive(Debug, Clone, Copy)]
pub struct LintTarget<'a> {
    pub path: &'a Path,
    pub working_directory: Option<&'a Path>,
    pub document: Option<&'a Document>,
}

/// Diagnostics for one file of a lint run.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiagnostics {
    pub path: PathBuf,
    /// Whether `path` is the document that was linted (and may be open).
    pub is_target: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl FileDiagnostics {
    pub fn uri(&self) -> Option<Url> {
        Url::from_file_path(&self.path).ok()
    }
}

fn lexical(path: &Path) -> Vec<Component<'_>> {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn paths_match(a: &Path, b: &Path) -> bool {
    let a = PathBuf::from(normalize_path(&a.display().to_string()));
    let b = PathBuf::from(normalize_path(&b.display().to_string()));
    lexical(&a) == lexical(&b)
}

/// Resolve a report's `filepath` to an absolute path.
fn resolve_report_path(filepath: &str, target: &LintTarget<'_>) -> PathBuf {
    if filepath == STDIN_FILEPATH || filepath.is_empty() {
        return target.path.to_path_buf();
    }
    let normalized = PathBuf::from(normalize_path(filepath));
    match target.working_directory {
        Some(dir) if normalized.is_relative() => dir.join(normalized),
        _ => normalized,
    }
}

fn rule_docs_url(code: &str) -> Option<Url> {
    if code.is_empty() {
        return None;
    }
    Url::parse(&format!("{RULE_DOCS_URL}{code}")).ok()
}

/// Build the diagnostic for one violation.
pub fn violation_to_diagnostic(
    violation: &Violation,
    document: Option<&Document>,
    settings: &Settings,
) -> Diagnostic {
    let start = violation.start();
    let end = violation.end();

    let range = match document {
        Some(doc) => {
            let raw = Range::new(
                doc.position_at_char(start.line, start.column),
                doc.position_at_char(end.line, end.column),
            );
            if start == end {
                doc.word_range_at(start.line, start.column).unwrap_or(raw)
            } else {
                raw
            }
        }
        None => Range::new(
            Position::new(start.line, start.column),
            Position::new(end.line, end.column),
        ),
    };

    Diagnostic {
        range,
        severity: Some(settings.severity_for(&violation.code)),
        code: Some(NumberOrString::String(violation.code.clone())),
        code_description: rule_docs_url(&violation.code).map(|href| CodeDescription { href }),
        source: Some(DIAGNOSTIC_SOURCE.to_string()),
        message: violation.description.clone(),
        ..Diagnostic::default()
    }
}

/// Convert raw lint output lines into per-file diagnostics.
///
/// Never fails: malformed lines are logged and contribute nothing. Files reported
/// with zero violations still produce an (empty) entry so stale results are cleared.
pub fn map_output(
    lines: &[String],
    target: &LintTarget<'_>,
    settings: &Settings,
) -> Vec<FileDiagnostics> {
    let mut grouped: Vec<FileDiagnostics> = Vec::new();

    for line in lines {
        let reports = match ReportLine::parse(line) {
            ReportLine::Reports(reports) => reports,
            ReportLine::Unparseable(reason) => {
                if !line.trim().is_empty() {
                    warn!("skipping unparseable lint output ({}): {}", reason, line);
                }
                continue;
            }
        };

        for report in reports {
            let path = resolve_report_path(&report.filepath, target);
            let is_target = paths_match(&path, target.path);
            let document = if is_target { target.document } else { None };

            let diagnostics: Vec<Diagnostic> = report
                .violations
                .iter()
                .map(|v| violation_to_diagnostic(v, document, settings))
                .collect();

            match grouped.iter_mut().find(|g| paths_match(&g.path, &path)) {
                Some(existing) => existing.diagnostics.extend(diagnostics),
                None => grouped.push(FileDiagnostics {
                    path,
                    is_target,
                    diagnostics,
                }),
            }
        }
    }

    grouped
}

// ============================================================================
// Tests
// ============================================================================
