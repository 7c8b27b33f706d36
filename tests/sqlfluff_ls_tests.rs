// End-to-end tests for sqlfluff_ls. A fake `sqlfluff` is written into a temp
// directory as a shell script; the remote backend is faked with tiny_http.
#![cfg(test)]

use lsp_types::{DiagnosticSeverity, NumberOrString, Position, Range, Url};
use sqlfluff_ls::documents::{Document, DocumentStore};
use sqlfluff_ls::format::FormatOrchestrator;
use sqlfluff_ls::invoker::{CommandInvocation, CommandKind, Invoker, ProcessRegistry};
use sqlfluff_ls::logging::OutputLog;
use sqlfluff_ls::remote::{DbtInterface, RemoteErrorCode, RemoteRequest};
use sqlfluff_ls::scheduler::{LintScheduler, LintSource};
use sqlfluff_ls::settings::{Config, DbtInterfaceSettings, Settings, Variables};
use sqlfluff_ls::surface::RecordingSurface;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

// ============================================================================
// Helpers
// ============================================================================

/// Write an executable `/bin/sh` script standing in for sqlfluff.
#[cfg(unix)]
fn fake_sqlfluff(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-sqlfluff");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn settings_for(exe: &Path, cwd: &Path) -> Settings {
    Settings {
        executable_path: exe.display().to_string(),
        working_directory: cwd.display().to_string(),
        ..Settings::default()
    }
}

struct Harness {
    invoker: Arc<Invoker>,
    surface: Arc<RecordingSurface>,
    documents: Arc<DocumentStore>,
    output: Arc<OutputLog>,
}

fn harness(settings: Settings) -> Harness {
    harness_with_registry(settings, Arc::new(ProcessRegistry::default()))
}

fn harness_with_registry(settings: Settings, registry: Arc<ProcessRegistry>) -> Harness {
    let surface = Arc::new(RecordingSurface::new());
    let output = Arc::new(OutputLog::in_memory());
    let invoker = Arc::new(Invoker::with_registry(
        Config::new(settings, Variables::default()),
        Arc::clone(&output),
        surface.clone(),
        registry,
    ));
    Harness {
        invoker,
        surface,
        documents: Arc::new(DocumentStore::new()),
        output,
    }
}

fn open(documents: &DocumentStore, path: &Path, text: &str) -> Url {
    std::fs::write(path, text).unwrap();
    let uri = Url::from_file_path(path).unwrap();
    documents.open(Document::new(uri.clone(), "sql", 1, text.to_string()));
    uri
}

/// Start a tiny_http server on an ephemeral port, or None if binding is not permitted.
fn fake_dbt_server() -> Option<(tiny_http::Server, u16)> {
    match tiny_http::Server::http("127.0.0.1:0") {
        Ok(server) => {
            let port = server.server_addr().to_ip().map(|a| a.port())?;
            Some((server, port))
        }
        Err(err) => {
            eprintln!("[test] cannot bind HTTP server ({err}); skipping test");
            None
        }
    }
}

fn dbt_settings(port: u16) -> Settings {
    Settings {
        dbt_interface: DbtInterfaceSettings {
            enabled: true,
            host: "127.0.0.1".into(),
            port,
            timeout_ms: 5_000,
        },
        ..Settings::default()
    }
}

// ============================================================================
// Lint
// ============================================================================

/// Lint of an unsaved buffer: stdin report mapped onto the live document.
#[test]
#[cfg(unix)]
fn lint_buffer_maps_violation_to_word_range() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_sqlfluff(
        dir.path(),
        r#"cat > /dev/null
echo '[{"filepath": "stdin", "violations": [{"code": "CP01", "description": "Keywords must be consistently upper case.", "line_no": 1, "line_pos": 1}]}]'
exit 1"#,
    );
    let h = harness(settings_for(&exe, dir.path()));
    let uri = open(&h.documents, &dir.path().join("a.sql"), "select\n1");

    let scheduler = LintScheduler::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));
    scheduler.trigger(&uri, LintSource::Buffer, false);
    assert!(scheduler.wait_idle(Duration::from_secs(10)));

    let diagnostics = h.surface.diagnostics(&uri).expect("diagnostics published");
    assert_eq!(diagnostics.len(), 1);
    let d = &diagnostics[0];
    assert_eq!(d.code, Some(NumberOrString::String("CP01".into())));
    assert_eq!(d.severity, Some(DiagnosticSeverity::ERROR));
    assert_eq!(d.range, Range::new(Position::new(0, 0), Position::new(0, 6)));
    assert_eq!(d.source.as_deref(), Some("sqlfluff"));
    assert!(h.output.contains("Reading from stdin"));
}

/// A malformed line among valid ones still yields the valid diagnostics.
#[test]
#[cfg(unix)]
fn lint_file_tolerates_malformed_lines() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_sqlfluff(
        dir.path(),
        r#"echo 'not json at all'
echo '[{"filepath": "a.sql", "violations": [{"code": "LT01", "description": "Bad spacing.", "start_line_no": 1, "start_line_pos": 7, "end_line_no": 1, "end_line_pos": 9}]}]'
exit 65"#,
    );
    let mut settings = settings_for(&exe, dir.path());
    settings.linter.diagnostic_severity = sqlfluff_ls::settings::Severity::Warning;
    let h = harness(settings);
    let uri = open(&h.documents, &dir.path().join("a.sql"), "select  1");

    let scheduler = LintScheduler::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));
    scheduler.on_save(&uri);
    assert!(scheduler.wait_idle(Duration::from_secs(10)));

    let diagnostics = h.surface.diagnostics(&uri).expect("diagnostics published");
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].severity, Some(DiagnosticSeverity::WARNING));
    assert_eq!(
        diagnostics[0].range,
        Range::new(Position::new(0, 6), Position::new(0, 8))
    );
}

/// Non-success exit codes publish nothing.
#[test]
#[cfg(unix)]
fn failed_lint_publishes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_sqlfluff(dir.path(), "echo '[]'\nexit 2");
    let h = harness(settings_for(&exe, dir.path()));
    let uri = open(&h.documents, &dir.path().join("a.sql"), "select 1");

    let result = h
        .invoker
        .run(&CommandInvocation::for_file(
            CommandKind::Lint,
            vec![],
            dir.path().join("a.sql"),
        ))
        .unwrap();
    assert!(!result.succeeded);

    let scheduler = LintScheduler::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));
    scheduler.on_save(&uri);
    assert!(scheduler.wait_idle(Duration::from_secs(10)));
    assert!(h.surface.diagnostics(&uri).is_none());
}

/// Rapid on-type edits collapse into one run with the final text.
#[test]
#[cfg(unix)]
fn rapid_edits_coalesce_into_one_lint() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("calls.log");
    let exe = fake_sqlfluff(
        dir.path(),
        &format!(
            "cat >> '{log}'\necho '<end>' >> '{log}'\necho '[]'",
            log = log.display()
        ),
    );
    let h = harness(settings_for(&exe, dir.path()));
    let uri = open(&h.documents, &dir.path().join("a.sql"), "s");
    let scheduler = LintScheduler::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));

    let mut text = String::from("s");
    for c in "elect 1".chars() {
        text.push(c);
        h.documents.change(
            &uri,
            2,
            &[lsp_types::TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text.clone(),
            }],
        );
        scheduler.on_change(&uri);
        thread::sleep(Duration::from_millis(5));
    }
    assert!(scheduler.wait_idle(Duration::from_secs(10)));

    let calls = std::fs::read_to_string(&log).unwrap();
    assert_eq!(calls.matches("<end>").count(), 1);
    assert!(calls.starts_with("select 1"));
}

/// A slow lint still running when its document closes never publishes, even
/// after the document is reopened and linted again.
#[test]
#[cfg(unix)]
fn lint_outliving_close_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let slow = dir.path().join("slow.flag");
    let started = dir.path().join("started.flag");
    std::fs::write(&slow, "").unwrap();
    let exe = fake_sqlfluff(
        dir.path(),
        &format!(
            r#"cat > /dev/null
if [ -f '{slow}' ]; then touch '{started}'; sleep 1; code=OLD; else code=NEW; fi
echo "[{{\"filepath\": \"stdin\", \"violations\": [{{\"code\": \"$code\", \"description\": \"d\", \"line_no\": 1, \"line_pos\": 1}}]}}]"
exit 1"#,
            slow = slow.display(),
            started = started.display()
        ),
    );
    let h = harness(settings_for(&exe, dir.path()));
    let path = dir.path().join("a.sql");
    let uri = open(&h.documents, &path, "select 1");
    let scheduler = LintScheduler::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));

    scheduler.trigger(&uri, LintSource::Buffer, false);
    let deadline = Instant::now() + Duration::from_secs(10);
    while !started.exists() {
        assert!(Instant::now() < deadline, "slow lint never started");
        thread::sleep(Duration::from_millis(10));
    }
    std::fs::remove_file(&slow).unwrap();

    h.documents.close(&uri);
    scheduler.on_close(&uri);
    assert_eq!(h.surface.diagnostics(&uri), Some(vec![]));

    open(&h.documents, &path, "select 1");
    scheduler.trigger(&uri, LintSource::Buffer, false);
    assert!(scheduler.wait_idle(Duration::from_secs(10)));
    thread::sleep(Duration::from_millis(1500));

    let codes: Vec<_> = h
        .surface
        .diagnostics(&uri)
        .unwrap()
        .into_iter()
        .map(|d| d.code)
        .collect();
    assert_eq!(codes, vec![Some(NumberOrString::String("NEW".into()))]);
}

/// A path sqlfluff reports as ignored is skipped for buffers until a file-mode run.
#[test]
#[cfg(unix)]
fn ignored_paths_short_circuit_buffer_lints() {
    let dir = tempfile::tempdir().unwrap();
    let count = dir.path().join("count.log");
    let exe = fake_sqlfluff(
        dir.path(),
        &format!(
            "cat > /dev/null\necho run >> '{}'\necho 'a.sql was ignored by a .sqlfluffignore pattern' >&2",
            count.display()
        ),
    );
    let h = harness(settings_for(&exe, dir.path()));
    let path = dir.path().join("a.sql");
    std::fs::write(&path, "select 1").unwrap();
    let buffer = || {
        CommandInvocation::for_buffer(
            CommandKind::Lint,
            vec![],
            "select 1".to_string(),
            Some(path.clone()),
        )
    };

    assert!(h.invoker.run(&buffer()).unwrap().succeeded);
    assert_eq!(h.invoker.ignored_paths(), vec!["a.sql".to_string()]);
    // No popup for ignore notices
    assert!(h.surface.messages().is_empty());

    assert!(!h.invoker.run(&buffer()).unwrap().succeeded);
    let runs = || std::fs::read_to_string(&count).unwrap().lines().count();
    assert_eq!(runs(), 1);

    h.invoker
        .run(&CommandInvocation::for_file(CommandKind::Lint, vec![], path.clone()))
        .unwrap();
    assert_eq!(runs(), 2);
}

// ============================================================================
// Process Ceiling
// ============================================================================

/// More concurrent invocations than the ceiling evicts the oldest processes.
#[test]
#[cfg(unix)]
fn registry_ceiling_kills_oldest_processes() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_sqlfluff(dir.path(), "exec sleep 30");
    let registry = Arc::new(ProcessRegistry::new(3));
    let h = harness_with_registry(settings_for(&exe, dir.path()), Arc::clone(&registry));
    let path = dir.path().join("a.sql");
    std::fs::write(&path, "select 1").unwrap();

    let finished = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..5 {
        let invoker = Arc::clone(&h.invoker);
        let finished = Arc::clone(&finished);
        let path = path.clone();
        handles.push(thread::spawn(move || {
            let result = invoker
                .run(&CommandInvocation::for_file(CommandKind::Lint, vec![], path))
                .unwrap();
            finished.lock().unwrap().push(i);
            result
        }));
        thread::sleep(Duration::from_millis(200));
        assert!(registry.len() <= 3, "registry exceeded its ceiling");
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while finished.lock().unwrap().len() < 2 && Instant::now() < deadline {
        assert!(registry.len() <= 3);
        thread::sleep(Duration::from_millis(20));
    }
    let mut evicted = finished.lock().unwrap().clone();
    evicted.sort();
    assert_eq!(evicted, vec![0, 1]);

    registry.kill_all();
    for handle in handles {
        let result = handle.join().unwrap();
        assert!(!result.succeeded);
        assert!(result.lines.is_empty());
    }
    assert!(registry.is_empty());
}

// ============================================================================
// Format
// ============================================================================

#[test]
#[cfg(unix)]
fn format_strips_no_safety_preamble() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_sqlfluff(
        dir.path(),
        "cat > /dev/null\nprintf 'NO SAFETY:\\nRules are unsafe to fix\\nSELECT 1\\n'",
    );
    let h = harness(settings_for(&exe, dir.path()));
    let uri = open(&h.documents, &dir.path().join("a.sql"), "select 1\n");

    let formatter = FormatOrchestrator::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));
    let edits = formatter.format_document(&uri).unwrap();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].new_text, "SELECT 1\n");
    assert_eq!(
        edits[0].range,
        Range::new(Position::new(0, 0), Position::new(1, 0))
    );
}

#[test]
#[cfg(unix)]
fn format_with_empty_output_makes_no_edit() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_sqlfluff(dir.path(), "cat > /dev/null");
    let h = harness(settings_for(&exe, dir.path()));
    let uri = open(&h.documents, &dir.path().join("a.sql"), "select 1\n");

    let formatter = FormatOrchestrator::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));
    assert!(formatter.format_document(&uri).unwrap().is_empty());
}

#[test]
#[cfg(unix)]
fn format_with_single_blank_line_makes_no_edit() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_sqlfluff(dir.path(), "cat > /dev/null\necho ''");
    let h = harness(settings_for(&exe, dir.path()));
    let uri = open(&h.documents, &dir.path().join("a.sql"), "select 1\n");

    let formatter = FormatOrchestrator::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));
    assert!(formatter.format_document(&uri).unwrap().is_empty());
}

#[test]
#[cfg(unix)]
fn range_format_reindents_selection() {
    let dir = tempfile::tempdir().unwrap();
    let exe = fake_sqlfluff(dir.path(), "cat > /dev/null\nprintf 'SELECT a\\nFROM t\\n'");
    let mut settings = settings_for(&exe, dir.path());
    settings.format.languages = vec![serde_json::from_value(serde_json::json!({
        "language": "sql",
        "preserveLeadingWhitespace": true
    }))
    .unwrap()];
    let h = harness(settings);
    let uri = open(
        &h.documents,
        &dir.path().join("a.sql"),
        "with x as (\n    select a\n    from t\n)\n",
    );

    let formatter = FormatOrchestrator::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));
    let edits = formatter
        .format_range(&uri, Range::new(Position::new(1, 6), Position::new(2, 3)))
        .unwrap();
    assert_eq!(edits.len(), 1);
    assert_eq!(edits[0].range.start, Position::new(1, 0));
    assert_eq!(edits[0].new_text, "    SELECT a\n    FROM t");
}

#[test]
#[cfg(unix)]
fn terminal_mode_fixes_file_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    // Uppercase the file named by the last argument in place
    let exe = fake_sqlfluff(
        dir.path(),
        r#"for last; do :; done
tr a-z A-Z < "$last" > "$last.tmp" && mv "$last.tmp" "$last""#,
    );
    let mut settings = settings_for(&exe, dir.path());
    settings.experimental.format.execute_in_terminal = true;
    let h = harness(settings);
    let path = dir.path().join("a.sql");
    let uri = open(&h.documents, &path, "select 1\n");
    h.documents.change(
        &uri,
        2,
        &[lsp_types::TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: "select 2\n".into(),
        }],
    );

    let formatter = FormatOrchestrator::new(Arc::clone(&h.invoker), Arc::clone(&h.documents));
    let edits = formatter.format_document(&uri).unwrap();
    assert_eq!(edits[0].new_text, "SELECT 2\n");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "SELECT 2\n");
    assert!(formatter
        .format_range(&uri, Range::new(Position::new(0, 0), Position::new(0, 1)))
        .is_err());
}

// ============================================================================
// Remote Backend
// ============================================================================

/// Health check that never answers: unreachable error after ~1s and no /lint request.
#[test]
fn remote_health_timeout_skips_main_request() {
    let Some((server, port)) = fake_dbt_server() else {
        return;
    };
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_by_server = Arc::clone(&seen);
    let server_thread = thread::spawn(move || {
        let mut held = Vec::new();
        while let Ok(Some(request)) = server.recv_timeout(Duration::from_secs(3)) {
            seen_by_server.lock().unwrap().push(request.url().to_string());
            // Never answer
            held.push(request);
        }
    });

    let dbt = DbtInterface::new(&dbt_settings(port).dbt_interface);
    let started = Instant::now();
    let err = dbt
        .lint(&RemoteRequest {
            sql: Some("select 1"),
            sql_path: Some("models/a.sql"),
            extra_config_path: "",
        })
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.code, RemoteErrorCode::FailedToReachServer);
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "health timeout not applied: {elapsed:?}");

    server_thread.join().unwrap();
    let urls = seen.lock().unwrap().clone();
    assert!(urls.iter().all(|u| u.starts_with("/health")), "{urls:?}");
}

/// Successful remote lint flows through the invoker as a synthetic report.
#[test]
fn remote_lint_publishes_through_invoker() {
    let Some((server, port)) = fake_dbt_server() else {
        return;
    };
    let server_thread = thread::spawn(move || {
        for _ in 0..2 {
            let Ok(Some(request)) = server.recv_timeout(Duration::from_secs(5)) else {
                return;
            };
            let body = if request.url().starts_with("/lint") {
                r#"{"result": [{"code": "CP01", "description": "Upper case.", "line_no": 1, "line_pos": 1}]}"#
            } else {
                "{}"
            };
            let _ = request.respond(tiny_http::Response::from_string(body));
        }
    });

    let h = harness(dbt_settings(port));
    let path = std::env::temp_dir().join("sqlfluff_ls_remote_a.sql");
    let result = h
        .invoker
        .run(&CommandInvocation::for_buffer(
            CommandKind::Lint,
            vec![],
            "select 1",
            Some(path),
        ))
        .unwrap();
    server_thread.join().unwrap();

    assert!(result.succeeded);
    assert_eq!(result.lines.len(), 1);
    let report: serde_json::Value = serde_json::from_str(&result.lines[0]).unwrap();
    assert_eq!(report[0]["violations"][0]["code"], "CP01");
}

/// Remote compile failures show one hint; later remote errors stay quiet.
#[test]
fn remote_compile_failure_popup_shown_once() {
    let Some((server, port)) = fake_dbt_server() else {
        return;
    };
    let server_thread = thread::spawn(move || {
        for _ in 0..4 {
            let Ok(Some(request)) = server.recv_timeout(Duration::from_secs(5)) else {
                return;
            };
            let body = if request.url().starts_with("/format") {
                r#"{"error": {"code": 1, "message": "Compile failed", "data": {"error": "bad ref"}}}"#
            } else {
                "{}"
            };
            let _ = request.respond(tiny_http::Response::from_string(body));
        }
    });

    let h = harness(dbt_settings(port));
    let path = std::env::temp_dir().join("sqlfluff_ls_remote_b.sql");
    for _ in 0..2 {
        let result = h
            .invoker
            .run(&CommandInvocation::for_buffer(
                CommandKind::Fix,
                vec![],
                "select 1",
                Some(path.clone()),
            ))
            .unwrap();
        assert!(!result.succeeded);
    }
    server_thread.join().unwrap();

    let messages = h.surface.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].1.starts_with("Compile failed"));
}

/// A closed port is reported without panicking.
#[test]
fn remote_unreachable_port() {
    let listener = match std::net::TcpListener::bind("127.0.0.1:0") {
        Ok(l) => l,
        Err(err) if err.kind() == ErrorKind::PermissionDenied => return,
        Err(err) => panic!("bind failed: {err}"),
    };
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let h = harness(dbt_settings(port));
    let result = h
        .invoker
        .run(&CommandInvocation::for_buffer(
            CommandKind::Lint,
            vec![],
            "select 1",
            None,
        ))
        .unwrap();
    assert!(!result.succeeded);
    assert_eq!(h.surface.messages().len(), 1);
}
