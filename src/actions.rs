//! Quick fixes and hover documentation for published diagnostics.

use lsp_types::{
    CodeAction, CodeActionKind, CodeActionOrCommand, Command, Diagnostic, Hover, HoverContents,
    MarkupContent, MarkupKind, NumberOrString, Position, Range, TextEdit, WorkspaceEdit,
};
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;

use crate::constants::{DIAGNOSTIC_SOURCE, RULE_DOCS_URL};
use crate::documents::Document;
use crate::settings::Settings;

pub const EXCLUDE_RULE_COMMAND: &str = "sqlfluff.quickfix.excludeRule";
pub const EXCLUDE_RULE_WORKSPACE_COMMAND: &str = "sqlfluff.quickfix.excludeRuleWorkspace";

/// Trailing `-- noqa` comment, optionally followed by a rule list.
const NOQA_PATTERN: &str = r"\s*-- noqa(?::(\s?[A-Za-z]+\d+,?)*)?.*";

/// Rule code of one of our diagnostics.
pub fn diagnostic_code(diagnostic: &Diagnostic) -> Option<String> {
    if diagnostic.source.as_deref() != Some(DIAGNOSTIC_SOURCE) {
        return None;
    }
    match diagnostic.code.as_ref()? {
        NumberOrString::String(code) => Some(code.clone()),
        NumberOrString::Number(code) => Some(code.to_string()),
    }
}

fn utf16_len(text: &str) -> u32 {
    text.chars().map(|c| c.len_utf16() as u32).sum()
}

// ============================================================================
// Code Actions
// ============================================================================

/// All quick fixes for the diagnostics in a code-action request.
pub fn code_actions(
    doc: &Document,
    diagnostics: &[Diagnostic],
    settings: &Settings,
) -> Vec<CodeActionOrCommand> {
    let ours: Vec<(&Diagnostic, String)> = diagnostics
        .iter()
        .filter_map(|d| diagnostic_code(d).map(|code| (d, code)))
        .collect();

    let mut actions = Vec::new();

    if settings.noqa_enabled() {
        let disabled = settings.noqa_disabled_rules();
        for all_rules in [false, true] {
            for (diagnostic, code) in &ours {
                if disabled.iter().any(|r| r == code) {
                    continue;
                }
                if let Some(fix) = noqa_fix(doc, diagnostic, code, all_rules) {
                    actions.push(CodeActionOrCommand::CodeAction(fix));
                }
            }
        }
    }

    if settings.code_actions.exclude_rules.workspace {
        for (diagnostic, code) in &ours {
            actions.push(CodeActionOrCommand::CodeAction(exclude_rule_action(
                diagnostic, code, false,
            )));
        }
    }
    if settings.code_actions.exclude_rules.global {
        for (diagnostic, code) in &ours {
            actions.push(CodeActionOrCommand::CodeAction(exclude_rule_action(
                diagnostic, code, true,
            )));
        }
    }

    actions
}

/// Edit that adds `code` (or every rule) to the line's noqa comment.
pub fn noqa_edit(doc: &Document, line_no: u32, code: &str, all_rules: bool) -> Option<TextEdit> {
    let line = doc.line(line_no)?;
    let end = Position::new(line_no, utf16_len(line));
    let re = Regex::new(NOQA_PATTERN).ok()?;

    let Some(caps) = re.captures(line) else {
        let text = if all_rules {
            " -- noqa".to_string()
        } else {
            format!(" -- noqa: {code}")
        };
        return Some(TextEdit::new(Range::new(end, end), text));
    };

    let whole = caps.get(0)?;
    if all_rules {
        let start = Position::new(line_no, utf16_len(&line[..whole.start()]));
        return Some(TextEdit::new(Range::new(start, end), " -- noqa".to_string()));
    }

    let text = match caps.get(1) {
        Some(last) if last.as_str().ends_with(',') => format!(" {code}"),
        Some(_) => format!(", {code}"),
        None => format!(": {code}"),
    };
    Some(TextEdit::new(Range::new(end, end), text))
}

fn noqa_fix(doc: &Document, diagnostic: &Diagnostic, code: &str, all_rules: bool) -> Option<CodeAction> {
    let edit = noqa_edit(doc, diagnostic.range.start.line, code, all_rules)?;
    let title = if all_rules {
        "Ignore all rules for this line".to_string()
    } else {
        format!("Ignore rule {code} for this line")
    };
    let mut changes = HashMap::new();
    changes.insert(doc.uri.clone(), vec![edit]);

    Some(CodeAction {
        title,
        kind: Some(CodeActionKind::QUICKFIX),
        diagnostics: Some(vec![diagnostic.clone()]),
        edit: Some(WorkspaceEdit {
            changes: Some(changes),
            ..WorkspaceEdit::default()
        }),
        ..CodeAction::default()
    })
}

fn exclude_rule_action(diagnostic: &Diagnostic, code: &str, global: bool) -> CodeAction {
    let title = format!(
        "Exclude Rule {code} {}",
        if global {
            "from Global Settings"
        } else {
            "from Workspace Settings"
        }
    );
    CodeAction {
        title: title.clone(),
        kind: Some(CodeActionKind::QUICKFIX),
        diagnostics: Some(vec![diagnostic.clone()]),
        command: Some(Command {
            title,
            command: if global {
                EXCLUDE_RULE_COMMAND
            } else {
                EXCLUDE_RULE_WORKSPACE_COMMAND
            }
            .to_string(),
            arguments: Some(vec![json!(code)]),
        }),
        ..CodeAction::default()
    }
}

// ============================================================================
// Hover
// ============================================================================

fn contains(range: &Range, position: Position) -> bool {
    let pos = (position.line, position.character);
    (range.start.line, range.start.character) <= pos && pos <= (range.end.line, range.end.character)
}

/// Documentation link for the first diagnostic under `position`.
pub fn hover(doc: &Document, diagnostics: &[Diagnostic], position: Position) -> Option<Hover> {
    diagnostics.iter().find_map(|diagnostic| {
        let code = diagnostic_code(diagnostic)?;
        let hit = contains(&diagnostic.range, position)
            || doc
                .word_range_at_position(diagnostic.range.start)
                .is_some_and(|word| contains(&word, position));
        hit.then(|| Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::Markdown,
                value: format!("[View Documentation]({RULE_DOCS_URL}{code}) for Rule {code}.\n"),
            }),
            range: None,
        })
    })
}

// ============================================================================
// Tests
// ============================================================================
