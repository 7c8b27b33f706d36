//! Language server front end.
//!
//! Reads Content-Length framed JSON-RPC messages from the client, dispatches
//! them to the lint scheduler, the format orchestrator and the quick-fix
//! providers, and writes responses and notifications back.

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use lsp_types::{
    CodeActionKind, CodeActionOptions, CodeActionParams, CodeActionProviderCapability, Diagnostic,
    DidChangeConfigurationParams, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, DocumentFormattingParams,
    DocumentRangeFormattingParams, ExecuteCommandOptions, ExecuteCommandParams, HoverParams,
    HoverProviderCapability, InitializeParams, InitializeResult, MessageType, OneOf,
    PublishDiagnosticsParams, SaveOptions, ServerCapabilities, ServerInfo, ShowMessageParams,
    TextDocumentSyncCapability, TextDocumentSyncKind, TextDocumentSyncOptions,
    TextDocumentSyncSaveOptions, Url, WorkDoneProgressOptions, WorkspaceEdit,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::actions::{self, EXCLUDE_RULE_COMMAND, EXCLUDE_RULE_WORKSPACE_COMMAND};
use crate::constants::*;
use crate::doctor;
use crate::documents::{Document, DocumentStore};
use crate::format::{FormatError, FormatOrchestrator};
use crate::invoker::Invoker;
use crate::logging::OutputLog;
use crate::scheduler::LintScheduler;
use crate::settings::{Config, Settings, Variables};
use crate::surface::EditorSurface;

pub const LINT_COMMAND: &str = "sqlfluff.lint";
pub const LINT_PROJECT_COMMAND: &str = "sqlfluff.lintProject";
pub const FORMAT_COMMAND: &str = "sqlfluff.format";
pub const DEBUG_COMMAND: &str = "sqlfluff.debug";
pub const SHOW_OUTPUT_COMMAND: &str = "sqlfluff.showOutput";

// ============================================================================
// Framing
// ============================================================================

/// Read one framed message body. Returns None on a clean EOF.
pub fn read_lsp_message<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;
    let mut header = String::new();

    loop {
        header.clear();
        if reader.read_line(&mut header)? == 0 {
            if saw_header {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "unexpected EOF while reading LSP headers",
                ));
            }
            return Ok(None);
        }
        let trimmed = header.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;
        if let Some(rest) = trimmed.strip_prefix("Content-Length:") {
            let len = rest.trim().parse::<usize>().map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid Content-Length header: {err}"),
                )
            })?;
            content_length = Some(len);
        }
    }

    let content_length = content_length.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "missing Content-Length header in LSP message",
        )
    })?;
    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}

/// Serialised writer shared by the dispatch loop and lint threads.
pub struct MessageWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl MessageWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn send(&self, message: &JsonValue) -> io::Result<()> {
        let body = serde_json::to_vec(message)?;
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        write!(out, "Content-Length: {}\r\n\r\n", body.len())?;
        out.write_all(&body)?;
        out.flush()
    }

    fn send_logged(&self, message: &JsonValue) {
        if let Err(e) = self.send(message) {
            error!("failed to write to client: {}", e);
        }
    }
}

// ============================================================================
// Message Creation
// ============================================================================

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(INITIAL_SERVER_REQUEST_ID);

/// Id for a server-originated request.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

pub fn create_notification<P: serde::Serialize>(method: &str, params: P) -> JsonValue {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
        "params": params
    })
}

pub fn create_request<P: serde::Serialize>(id: u64, method: &str, params: P) -> JsonValue {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
        "params": params
    })
}

fn create_response<R: serde::Serialize>(id: &JsonValue, result: R) -> JsonValue {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result
    })
}

fn create_error_response(id: &JsonValue, code: i64, message: &str) -> JsonValue {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// Capabilities advertised in the initialize response.
pub fn server_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Options(
            TextDocumentSyncOptions {
                open_close: Some(true),
                change: Some(TextDocumentSyncKind::INCREMENTAL),
                will_save: None,
                will_save_wait_until: None,
                save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                    include_text: Some(true),
                })),
            },
        )),
        hover_provider: Some(HoverProviderCapability::Simple(true)),
        document_formatting_provider: Some(OneOf::Left(true)),
        document_range_formatting_provider: Some(OneOf::Left(true)),
        code_action_provider: Some(CodeActionProviderCapability::Options(CodeActionOptions {
            code_action_kinds: Some(vec![CodeActionKind::QUICKFIX]),
            work_done_progress_options: WorkDoneProgressOptions {
                work_done_progress: None,
            },
            resolve_provider: None,
        })),
        execute_command_provider: Some(ExecuteCommandOptions {
            commands: [
                LINT_COMMAND,
                LINT_PROJECT_COMMAND,
                FORMAT_COMMAND,
                DEBUG_COMMAND,
                SHOW_OUTPUT_COMMAND,
                EXCLUDE_RULE_COMMAND,
                EXCLUDE_RULE_WORKSPACE_COMMAND,
            ]
            .iter()
            .map(|c| c.to_string())
            .collect(),
            work_done_progress_options: WorkDoneProgressOptions {
                work_done_progress: None,
            },
        }),
        ..Default::default()
    }
}

// ============================================================================
// LSP Surface
// ============================================================================

/// [`EditorSurface`] that emits LSP notifications and remembers what it published.
pub struct LspSurface {
    writer: Arc<MessageWriter>,
    published: Mutex<HashMap<Url, Vec<Diagnostic>>>,
}

impl LspSurface {
    pub fn new(writer: Arc<MessageWriter>) -> Self {
        Self {
            writer,
            published: Mutex::new(HashMap::new()),
        }
    }

    /// Diagnostics last published for `uri`.
    pub fn published(&self, uri: &Url) -> Vec<Diagnostic> {
        self.published
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }
}

impl EditorSurface for LspSurface {
    fn publish_diagnostics(&self, uri: &Url, diagnostics: Vec<Diagnostic>, version: Option<i32>) {
        {
            let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
            if diagnostics.is_empty() {
                published.remove(uri);
            } else {
                published.insert(uri.clone(), diagnostics.clone());
            }
        }
        let params = PublishDiagnosticsParams {
            uri: uri.clone(),
            diagnostics,
            version,
        };
        self.writer
            .send_logged(&create_notification("textDocument/publishDiagnostics", params));
    }

    fn show_message(&self, kind: MessageType, message: &str) {
        let params = ShowMessageParams {
            typ: kind,
            message: message.to_string(),
        };
        self.writer
            .send_logged(&create_notification("window/showMessage", params));
    }
}

// ============================================================================
// Server
// ============================================================================

/// Command-line overrides applied on top of client settings.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub executable_path: Option<String>,
    pub working_directory: Option<String>,
}

impl ServerOptions {
    /// Overwrite the settings fields given on the command line.
    pub fn apply(&self, settings: &mut Settings) {
        if let Some(exe) = &self.executable_path {
            settings.executable_path = exe.clone();
        }
        if let Some(dir) = &self.working_directory {
            settings.working_directory = dir.clone();
        }
    }
}

/// Whether the dispatch loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Server {
    writer: Arc<MessageWriter>,
    surface: Arc<LspSurface>,
    documents: Arc<DocumentStore>,
    invoker: Arc<Invoker>,
    scheduler: LintScheduler,
    formatter: FormatOrchestrator,
    options: ServerOptions,
    workspace_root: Mutex<Option<PathBuf>>,
    shutdown_requested: AtomicBool,
}

impl Server {
    pub fn new(out: Box<dyn Write + Send>, output: Arc<OutputLog>, options: ServerOptions) -> Self {
        let writer = Arc::new(MessageWriter::new(out));
        let surface = Arc::new(LspSurface::new(Arc::clone(&writer)));
        let documents = Arc::new(DocumentStore::new());

        let mut settings = Settings::default();
        options.apply(&mut settings);
        let config = Config::new(settings, Variables::for_workspace(None));

        let invoker = Arc::new(Invoker::new(
            config,
            output,
            Arc::clone(&surface) as Arc<dyn EditorSurface>,
        ));
        let scheduler = LintScheduler::new(Arc::clone(&invoker), Arc::clone(&documents));
        let formatter = FormatOrchestrator::new(Arc::clone(&invoker), Arc::clone(&documents));

        Self {
            writer,
            surface,
            documents,
            invoker,
            scheduler,
            formatter,
            options,
            workspace_root: Mutex::new(None),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn invoker(&self) -> &Arc<Invoker> {
        &self.invoker
    }

    pub fn documents(&self) -> &Arc<DocumentStore> {
        &self.documents
    }

    pub fn scheduler(&self) -> &LintScheduler {
        &self.scheduler
    }

    pub fn surface(&self) -> &Arc<LspSurface> {
        &self.surface
    }

    fn workspace_root(&self) -> Option<PathBuf> {
        self.workspace_root
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Read and dispatch messages until `exit` or EOF.
    pub fn run<R: BufRead>(&self, reader: &mut R) -> Result<()> {
        loop {
            let Some(body) = read_lsp_message(reader).context("failed to read LSP message")?
            else {
                info!("client closed stdin");
                break;
            };
            let message: JsonValue = match serde_json::from_slice(&body) {
                Ok(m) => m,
                Err(e) => {
                    warn!("dropping malformed message: {}", e);
                    continue;
                }
            };
            if self.handle_message(&message) == Flow::Exit {
                break;
            }
        }
        self.invoker.registry().kill_all();
        Ok(())
    }

    /// Dispatch one decoded JSON-RPC message.
    pub fn handle_message(&self, message: &JsonValue) -> Flow {
        let Some(method) = message.get("method").and_then(JsonValue::as_str) else {
            // Response to one of our requests (e.g. workspace/applyEdit)
            debug!("client response: {}", message);
            return Flow::Continue;
        };
        let params = message.get("params").cloned().unwrap_or(JsonValue::Null);

        match message.get("id") {
            Some(id) => {
                let response = match self.handle_request(method, params) {
                    Ok(result) => create_response(id, result),
                    Err((code, msg)) => {
                        debug!("{} failed: {}", method, msg);
                        create_error_response(id, code, &msg)
                    }
                };
                self.writer.send_logged(&response);
                Flow::Continue
            }
            None => self.handle_notification(method, params),
        }
    }

    fn handle_request(&self, method: &str, params: JsonValue) -> Result<JsonValue, (i64, String)> {
        debug!("request: {}", method);
        match method {
            "initialize" => Ok(self.on_initialize(parse_params(params)?)),
            "shutdown" => {
                self.shutdown_requested.store(true, Ordering::SeqCst);
                self.invoker.registry().kill_all();
                Ok(JsonValue::Null)
            }
            "textDocument/formatting" => {
                let params: DocumentFormattingParams = parse_params(params)?;
                Ok(self.on_format(&params.text_document.uri, None))
            }
            "textDocument/rangeFormatting" => {
                let params: DocumentRangeFormattingParams = parse_params(params)?;
                Ok(self.on_format(&params.text_document.uri, Some(params.range)))
            }
            "textDocument/codeAction" => {
                let params: CodeActionParams = parse_params(params)?;
                let Some(doc) = self.documents.get(&params.text_document.uri) else {
                    return Ok(json!([]));
                };
                let settings = self.invoker.config().settings;
                let actions = actions::code_actions(&doc, &params.context.diagnostics, &settings);
                Ok(to_json(actions))
            }
            "textDocument/hover" => {
                let params: HoverParams = parse_params(params)?;
                let position = params.text_document_position_params;
                let uri = position.text_document.uri;
                let hover = self.documents.get(&uri).and_then(|doc| {
                    actions::hover(&doc, &self.surface.published(&uri), position.position)
                });
                Ok(to_json(hover))
            }
            "workspace/executeCommand" => {
                let params: ExecuteCommandParams = parse_params(params)?;
                self.on_execute_command(&params.command, &params.arguments)
            }
            _ => Err((METHOD_NOT_FOUND, format!("method not found: {method}"))),
        }
    }

    fn handle_notification(&self, method: &str, params: JsonValue) -> Flow {
        debug!("notification: {}", method);
        match method {
            "initialized" => self.on_initialized(),
            "exit" => {
                if !self.shutdown_requested.load(Ordering::SeqCst) {
                    warn!("exit without shutdown");
                }
                self.invoker.registry().kill_all();
                return Flow::Exit;
            }
            "textDocument/didOpen" => {
                if let Ok(p) = parse_params::<DidOpenTextDocumentParams>(params) {
                    let item = p.text_document;
                    let uri = item.uri.clone();
                    self.documents.open(Document::new(
                        item.uri,
                        &item.language_id,
                        item.version,
                        item.text,
                    ));
                    self.scheduler.on_open(&uri);
                }
            }
            "textDocument/didChange" => {
                if let Ok(p) = parse_params::<DidChangeTextDocumentParams>(params) {
                    let uri = p.text_document.uri;
                    self.documents
                        .change(&uri, p.text_document.version, &p.content_changes);
                    self.scheduler.on_change(&uri);
                }
            }
            "textDocument/didSave" => {
                if let Ok(p) = parse_params::<DidSaveTextDocumentParams>(params) {
                    let uri = p.text_document.uri;
                    self.documents.save(&uri, p.text);
                    self.scheduler.on_save(&uri);
                }
            }
            "textDocument/didClose" => {
                if let Ok(p) = parse_params::<DidCloseTextDocumentParams>(params) {
                    let uri = p.text_document.uri;
                    self.documents.close(&uri);
                    self.scheduler.on_close(&uri);
                }
            }
            "workspace/didChangeConfiguration" => {
                if let Ok(p) = parse_params::<DidChangeConfigurationParams>(params) {
                    self.on_configuration(&p.settings);
                }
            }
            _ => debug!("ignoring notification {}", method),
        }
        Flow::Continue
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn on_initialize(&self, params: InitializeParams) -> JsonValue {
        #[allow(deprecated)]
        let root = params
            .workspace_folders
            .as_ref()
            .and_then(|folders| folders.first())
            .and_then(|f| f.uri.to_file_path().ok())
            .or_else(|| params.root_uri.as_ref().and_then(|u| u.to_file_path().ok()));
        info!("workspace root: {:?}", root);
        *self.workspace_root.lock().unwrap_or_else(|e| e.into_inner()) = root.clone();

        let settings = self.load_settings(params.initialization_options.as_ref());
        self.invoker
            .configure(Config::new(settings, Variables::for_workspace(root.as_deref())));

        let result = InitializeResult {
            capabilities: server_capabilities(),
            server_info: Some(ServerInfo {
                name: "sqlfluff_ls".into(),
                version: Some(env!("CARGO_PKG_VERSION").into()),
            }),
        };
        to_json(result)
    }

    fn on_initialized(&self) {
        self.invoker.refresh_version();
        self.lint_project_if_enabled();
    }

    fn load_settings(&self, value: Option<&JsonValue>) -> Settings {
        let mut settings = match value {
            Some(v) => Settings::from_json(v).unwrap_or_else(|e| {
                warn!("{:#}; using defaults", e);
                Settings::default()
            }),
            None => Settings::default(),
        };
        self.options.apply(&mut settings);
        settings
    }

    fn on_configuration(&self, value: &JsonValue) {
        if value.is_null() {
            return;
        }
        let settings = self.load_settings(Some(value));
        let vars = Variables::for_workspace(self.workspace_root().as_deref());
        if self.invoker.configure(Config::new(settings, vars)) {
            info!("executable path changed, probing version");
            self.invoker.refresh_version();
        }
        self.scheduler.reset();
        self.scheduler.lint_open_documents(false);
        self.lint_project_if_enabled();
    }

    fn lint_project_if_enabled(&self) {
        if !self.invoker.config().settings.linter.lint_entire_project {
            return;
        }
        if let Some(root) = self.workspace_root() {
            // Detached; results arrive as publishDiagnostics
            let _ = self.scheduler.lint_project(&root, false);
        }
    }

    // ------------------------------------------------------------------------
    // Formatting
    // ------------------------------------------------------------------------

    fn on_format(&self, uri: &Url, range: Option<lsp_types::Range>) -> JsonValue {
        let formats = self
            .documents
            .get(uri)
            .is_some_and(|doc| self.invoker.config().settings.formats_language(&doc.language_id));
        if !formats {
            debug!("formatting not enabled for {}", uri);
            return json!([]);
        }
        let result = match range {
            Some(range) => self.formatter.format_range(uri, range),
            None => self.formatter.format_document(uri),
        };
        match result {
            Ok(edits) => to_json(edits),
            Err(e) => {
                self.report_format_error(&e);
                json!([])
            }
        }
    }

    fn report_format_error(&self, e: &FormatError) {
        warn!("format failed: {}", e);
        let shown = !matches!(
            e,
            FormatError::Disabled | FormatError::UnknownDocument(_) | FormatError::CommandFailed
        );
        if shown && !self.invoker.config().settings.suppress_notifications {
            self.surface.show_error(&e.to_string());
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn on_execute_command(
        &self,
        command: &str,
        arguments: &[JsonValue],
    ) -> Result<JsonValue, (i64, String)> {
        info!("executing {}", command);
        match command {
            LINT_COMMAND => {
                match uri_argument(arguments) {
                    Some(uri) => self.scheduler.force_lint(&uri),
                    None => self.scheduler.lint_open_documents(true),
                }
                Ok(JsonValue::Null)
            }
            LINT_PROJECT_COMMAND => {
                let root = self
                    .workspace_root()
                    .ok_or((INVALID_PARAMS, "no workspace folder open".to_string()))?;
                let _ = self.scheduler.lint_project(&root, true);
                Ok(JsonValue::Null)
            }
            FORMAT_COMMAND => {
                let uri = uri_argument(arguments)
                    .ok_or((INVALID_PARAMS, "expected a document URI".to_string()))?;
                let edits = match self.formatter.format_document(&uri) {
                    Ok(edits) => edits,
                    Err(e) => {
                        self.report_format_error(&e);
                        return Ok(JsonValue::Null);
                    }
                };
                if !edits.is_empty() {
                    let edit = WorkspaceEdit {
                        changes: Some(HashMap::from([(uri, edits)])),
                        ..WorkspaceEdit::default()
                    };
                    let params = lsp_types::ApplyWorkspaceEditParams {
                        label: Some("SQLFluff Format".into()),
                        edit,
                    };
                    self.writer.send_logged(&create_request(
                        next_request_id(),
                        "workspace/applyEdit",
                        params,
                    ));
                }
                Ok(JsonValue::Null)
            }
            DEBUG_COMMAND => {
                let report = doctor::run_checks(&self.invoker.config(), self.invoker.output());
                let (kind, text) = if report.ok {
                    (MessageType::INFO, "SQLFluff setup looks good.".to_string())
                } else {
                    let failed = report
                        .checks
                        .iter()
                        .find(|c| !c.passed)
                        .map(|c| format!("{}: {}", c.name, c.detail))
                        .unwrap_or_default();
                    (MessageType::ERROR, format!("SQLFluff setup check failed ({failed})."))
                };
                self.surface.show_message(kind, &text);
                Ok(to_json(report))
            }
            SHOW_OUTPUT_COMMAND => {
                let path = self.invoker.output().path().map(|p| p.display().to_string());
                let text = match &path {
                    Some(p) => format!("SQLFluff output log: {p}"),
                    None => "SQLFluff output log is disabled.".to_string(),
                };
                self.surface.show_message(MessageType::INFO, &text);
                Ok(json!({ "path": path }))
            }
            EXCLUDE_RULE_COMMAND | EXCLUDE_RULE_WORKSPACE_COMMAND => {
                let rule = arguments
                    .first()
                    .and_then(JsonValue::as_str)
                    .ok_or((INVALID_PARAMS, "expected a rule code".to_string()))?;
                if self.invoker.update_settings(|s| s.exclude_rule(rule)) {
                    info!("excluded rule {}", rule);
                    self.scheduler.lint_open_documents(false);
                }
                Ok(to_json(&self.invoker.config().settings.exclude_rules))
            }
            _ => Err((INVALID_PARAMS, format!("unknown command: {command}"))),
        }
    }
}

fn parse_params<T: DeserializeOwned>(params: JsonValue) -> Result<T, (i64, String)> {
    serde_json::from_value(params).map_err(|e| (INVALID_PARAMS, format!("invalid params: {e}")))
}

fn to_json<T: serde::Serialize>(value: T) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

/// First argument as a document URI (string or `{ "uri": ... }`).
fn uri_argument(arguments: &[JsonValue]) -> Option<Url> {
    let first = arguments.first()?;
    let text = first
        .as_str()
        .or_else(|| first.get("uri").and_then(JsonValue::as_str))?;
    Url::parse(text).ok()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn messages(&self) -> Vec<JsonValue> {
            let bytes = self.0.lock().unwrap().clone();
            let mut reader = Cursor::new(bytes);
            let mut out = Vec::new();
            while let Some(body) = read_lsp_message(&mut reader).unwrap() {
                out.push(serde_json::from_slice(&body).unwrap());
            }
            out
        }
    }

    fn server() -> (Server, SharedBuffer) {
        let buf = SharedBuffer::default();
        let server = Server::new(
            Box::new(buf.clone()),
            Arc::new(OutputLog::in_memory()),
            ServerOptions {
                executable_path: Some("sqlfluff-missing-for-tests".into()),
                working_directory: None,
            },
        );
        (server, buf)
    }

    #[test]
    fn test_read_lsp_message_valid() {
        let body = r#"{"jsonrpc":"2.0","method":"initialized","params":{}}"#;
        let raw = format!("Content-Length: {}\r\n\r\n{}", body.len(), body);
        let mut reader = Cursor::new(raw.into_bytes());
        let msg = read_lsp_message(&mut reader).unwrap().unwrap();
        assert_eq!(msg, body.as_bytes());
        assert!(read_lsp_message(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_read_lsp_message_missing_length() {
        let mut reader = Cursor::new(b"Content-Type: x\r\n\r\n{}".to_vec());
        assert!(read_lsp_message(&mut reader).is_err());
    }

    #[test]
    fn test_capabilities_list_commands() {
        let caps = server_capabilities();
        let commands = caps.execute_command_provider.unwrap().commands;
        assert!(commands.contains(&LINT_COMMAND.to_string()));
        assert!(commands.contains(&EXCLUDE_RULE_WORKSPACE_COMMAND.to_string()));
        assert_eq!(caps.document_range_formatting_provider, Some(OneOf::Left(true)));
    }

    #[test]
    fn test_initialize_reads_settings_and_responds() {
        let (server, buf) = server();
        let msg = json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize",
            "params": {
                "capabilities": {},
                "rootUri": "file:///tmp/project",
                "initializationOptions": { "sqlfluff": { "dialect": "postgres", "linter": { "run": "off" } } }
            }
        });
        assert_eq!(server.handle_message(&msg), Flow::Continue);
        let out = buf.messages();
        assert_eq!(out[0]["id"], 1);
        assert_eq!(out[0]["result"]["serverInfo"]["name"], "sqlfluff_ls");
        let config = server.invoker().config();
        assert_eq!(config.settings.dialect.as_deref(), Some("postgres"));
        // Command-line override wins over client settings
        assert_eq!(config.settings.executable_path, "sqlfluff-missing-for-tests");
        assert_eq!(config.vars.workspace_folder.as_deref(), Some("/tmp/project"));
    }

    #[test]
    fn test_unknown_request_gets_method_not_found() {
        let (server, buf) = server();
        server.handle_message(&json!({"jsonrpc": "2.0", "id": 7, "method": "textDocument/rename", "params": {}}));
        let out = buf.messages();
        assert_eq!(out[0]["error"]["code"], METHOD_NOT_FOUND);
    }

    #[test]
    fn test_exclude_rule_command_updates_settings() {
        let (server, buf) = server();
        for rule in ["LT02", "CP01", "LT02"] {
            server.handle_message(&json!({
                "jsonrpc": "2.0", "id": 3, "method": "workspace/executeCommand",
                "params": { "command": EXCLUDE_RULE_COMMAND, "arguments": [rule] }
            }));
        }
        assert_eq!(
            server.invoker().config().settings.exclude_rules,
            vec!["CP01".to_string(), "LT02".to_string()]
        );
        let out = buf.messages();
        assert_eq!(out.last().unwrap()["result"], json!(["CP01", "LT02"]));
    }

    #[test]
    fn test_document_lifecycle_and_shutdown() {
        let (server, _buf) = server();
        server.handle_message(&json!({
            "jsonrpc": "2.0", "method": "workspace/didChangeConfiguration",
            "params": { "settings": { "sqlfluff": { "linter": { "run": "off" } } } }
        }));
        server.handle_message(&json!({
            "jsonrpc": "2.0", "method": "textDocument/didOpen",
            "params": { "textDocument": { "uri": "file:///tmp/a.sql", "languageId": "sql", "version": 1, "text": "select 1" } }
        }));
        let uri = Url::parse("file:///tmp/a.sql").unwrap();
        assert!(server.documents().get(&uri).is_some());

        server.handle_message(&json!({
            "jsonrpc": "2.0", "method": "textDocument/didChange",
            "params": {
                "textDocument": { "uri": "file:///tmp/a.sql", "version": 2 },
                "contentChanges": [{ "text": "select 2" }]
            }
        }));
        let doc = server.documents().get(&uri).unwrap();
        assert!(doc.dirty);
        assert_eq!(doc.text, "select 2");

        server.handle_message(&json!({
            "jsonrpc": "2.0", "method": "textDocument/didClose",
            "params": { "textDocument": { "uri": "file:///tmp/a.sql" } }
        }));
        assert!(server.documents().get(&uri).is_none());

        server.handle_message(&json!({"jsonrpc": "2.0", "id": 9, "method": "shutdown"}));
        assert_eq!(
            server.handle_message(&json!({"jsonrpc": "2.0", "method": "exit"})),
            Flow::Exit
        );
    }

    #[test]
    fn test_hover_uses_published_diagnostics() {
        let (server, buf) = server();
        server.handle_message(&json!({
            "jsonrpc": "2.0", "method": "workspace/didChangeConfiguration",
            "params": { "settings": { "linter": { "run": "off" } } }
        }));
        server.handle_message(&json!({
            "jsonrpc": "2.0", "method": "textDocument/didOpen",
            "params": { "textDocument": { "uri": "file:///tmp/h.sql", "languageId": "sql", "version": 1, "text": "select a" } }
        }));
        let uri = Url::parse("file:///tmp/h.sql").unwrap();
        server.surface().publish_diagnostics(
            &uri,
            vec![Diagnostic {
                range: lsp_types::Range::new(
                    lsp_types::Position::new(0, 0),
                    lsp_types::Position::new(0, 6),
                ),
                code: Some(lsp_types::NumberOrString::String("CP01".into())),
                source: Some("sqlfluff".into()),
                message: "Keywords must be consistently upper case.".into(),
                ..Diagnostic::default()
            }],
            None,
        );
        server.handle_message(&json!({
            "jsonrpc": "2.0", "id": 4, "method": "textDocument/hover",
            "params": { "textDocument": { "uri": "file:///tmp/h.sql" }, "position": { "line": 0, "character": 2 } }
        }));
        let out = buf.messages();
        let hover = out.iter().find(|m| m["id"] == 4).unwrap();
        assert!(hover["result"]["contents"]["value"]
            .as_str()
            .unwrap()
            .contains("Rule_CP01"));
    }
}
