//! Running sqlfluff.
//!
//! The [`Invoker`] executes one [`CommandInvocation`] either as a local
//! subprocess or against dbt-core-interface, and always resolves to a
//! [`CommandResult`]. Tool failures never surface as `Err`; only a malformed
//! invocation does.
//!
//! Local runs are tracked in a bounded [`ProcessRegistry`]. When the registry is
//! full the oldest child is killed before a new one is registered, so a burst of
//! lint requests can't pile up processes without limit.

use log::{debug, info, warn};
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

use crate::constants::{
    is_success_exit_code, millis_to_duration, CHILD_POLL_MS, IGNORE_PATTERN_MARKERS,
    MAX_TRACKED_PROCESSES, PIPE_READ_BUFFER_SIZE, STDIN_FILEPATH, STDIN_MARKER,
};
use crate::decoder::{LineDecoder, Utf8StreamDecoder};
use crate::logging::OutputLog;
use crate::process::{
    build_environment, kill_process_tree, make_command, probe_version, ToolVersion,
};
use crate::remote::{DbtInterface, RemoteError, RemoteErrorCode, RemoteRequest};
use crate::settings::{normalize_path, Config};
use crate::surface::EditorSurface;

// ============================================================================
// Invocation Types
// ============================================================================

/// sqlfluff sub-command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Lint,
    Fix,
}

impl CommandKind {
    pub fn as_arg(self) -> &'static str {
        match self {
            CommandKind::Lint => "lint",
            CommandKind::Fix => "fix",
        }
    }
}

/// What the tool reads: a file on disk, or buffer contents piped through stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationTarget {
    File(PathBuf),
    Buffer {
        contents: String,
        /// Path of the document the buffer belongs to, when known.
        path: Option<PathBuf>,
    },
}

impl InvocationTarget {
    pub fn path(&self) -> Option<&Path> {
        match self {
            InvocationTarget::File(path) => Some(path),
            InvocationTarget::Buffer { path, .. } => path.as_deref(),
        }
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, InvocationTarget::Buffer { .. })
    }
}

/// One request to run the tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub kind: CommandKind,
    pub args: Vec<String>,
    pub target: Option<InvocationTarget>,
}

impl CommandInvocation {
    pub fn new(kind: CommandKind, args: Vec<String>) -> Self {
        Self {
            kind,
            args,
            target: None,
        }
    }

    pub fn for_file(kind: CommandKind, args: Vec<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            args,
            target: Some(InvocationTarget::File(path.into())),
        }
    }

    pub fn for_buffer(
        kind: CommandKind,
        args: Vec<String>,
        contents: impl Into<String>,
        path: Option<PathBuf>,
    ) -> Self {
        Self {
            kind,
            args,
            target: Some(InvocationTarget::Buffer {
                contents: contents.into(),
                path,
            }),
        }
    }

    /// Resolve the effective target. An empty buffer falls back to its file path.
    pub fn validate(&self) -> Result<InvocationTarget, InvokeError> {
        match &self.target {
            Some(InvocationTarget::Buffer { contents, path }) if contents.is_empty() => {
                match path {
                    Some(p) => Ok(InvocationTarget::File(p.clone())),
                    None => Err(InvokeError::InvalidInvocation(
                        "buffer contents are empty and no file path was given".into(),
                    )),
                }
            }
            Some(target) => Ok(target.clone()),
            None => Err(InvokeError::InvalidInvocation(
                "either a target file path or buffer contents must be supplied".into(),
            )),
        }
    }
}

/// Normalised outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub succeeded: bool,
    /// Decoded stdout lines for lint; a single text blob for fix.
    pub lines: Vec<String>,
}

impl CommandResult {
    pub fn failed() -> Self {
        Self {
            succeeded: false,
            lines: Vec::new(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),
}

// ============================================================================
// Process Registry
// ============================================================================

struct TrackedProcess {
    id: u64,
    pid: u32,
    child: Arc<Mutex<Child>>,
}

/// Bounded set of running sqlfluff children, oldest first.
pub struct ProcessRegistry {
    capacity: usize,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<TrackedProcess>>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new(MAX_TRACKED_PROCESSES)
    }
}

impl ProcessRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Track a child, killing the oldest entries first if the registry is full.
    pub fn register(&self, child: Arc<Mutex<Child>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let pid = child.lock().map(|c| c.id()).unwrap_or_else(|e| e.into_inner().id());

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        while entries.len() >= self.capacity {
            if let Some(oldest) = entries.pop_front() {
                warn!(
                    "process ceiling of {} reached, killing oldest sqlfluff (pid={})",
                    self.capacity, oldest.pid
                );
                let mut child = oldest.child.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = kill_process_tree(&mut child) {
                    debug!("kill pid={} failed: {}", oldest.pid, e);
                }
            }
        }
        entries.push_back(TrackedProcess { id, pid, child });
        id
    }

    pub fn remove(&self, id: u64) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p.id != id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pids(&self) -> Vec<u32> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|p| p.pid)
            .collect()
    }

    /// Kill every tracked child (shutdown).
    pub fn kill_all(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        for tracked in entries.drain(..) {
            let mut child = tracked.child.lock().unwrap_or_else(|e| e.into_inner());
            let _ = kill_process_tree(&mut child);
        }
    }
}

// ============================================================================
// Invoker
// ============================================================================

const EXECUTABLE_NOT_FOUND_MESSAGE: &str = "The sqlfluff executable was not found. Use the 'Executable Path' setting to configure the location of the executable, or add it to your PATH.";

const DBT_COMPILE_HINT: &str = "Debug by running dbt compile.";

fn contains_ignore_marker(text: &str) -> bool {
    IGNORE_PATTERN_MARKERS.iter().any(|m| text.contains(m))
}

/// Path handed to sqlfluff: relative to the working directory when possible,
/// so the tool finds nested config files.
pub fn relative_target_path(path: &Path, working_directory: Option<&Path>) -> String {
    let normalized = PathBuf::from(normalize_path(&path.display().to_string()));
    let relative = working_directory
        .and_then(|dir| pathdiff::diff_paths(&normalized, dir))
        .unwrap_or(normalized);
    normalize_path(&relative.display().to_string())
}

pub struct Invoker {
    config: RwLock<Config>,
    registry: Arc<ProcessRegistry>,
    ignored: Mutex<HashSet<String>>,
    version: Mutex<Option<ToolVersion>>,
    remote_popup_shown: AtomicBool,
    output: Arc<OutputLog>,
    surface: Arc<dyn EditorSurface>,
}

impl Invoker {
    pub fn new(config: Config, output: Arc<OutputLog>, surface: Arc<dyn EditorSurface>) -> Self {
        Self::with_registry(config, output, surface, Arc::new(ProcessRegistry::default()))
    }

    pub fn with_registry(
        config: Config,
        output: Arc<OutputLog>,
        surface: Arc<dyn EditorSurface>,
        registry: Arc<ProcessRegistry>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            registry,
            ignored: Mutex::new(HashSet::new()),
            version: Mutex::new(None),
            remote_popup_shown: AtomicBool::new(false),
            output,
            surface,
        }
    }

    pub fn config(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration; returns true if the executable path changed.
    pub fn configure(&self, config: Config) -> bool {
        let mut current = self.config.write().unwrap_or_else(|e| e.into_inner());
        let changed = current.executable_path() != config.executable_path();
        *current = config;
        changed
    }

    /// Apply an in-place edit to the live settings.
    pub fn update_settings<R>(&self, f: impl FnOnce(&mut crate::settings::Settings) -> R) -> R {
        let mut current = self.config.write().unwrap_or_else(|e| e.into_inner());
        f(&mut current.settings)
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn output(&self) -> &Arc<OutputLog> {
        &self.output
    }

    pub fn surface(&self) -> &Arc<dyn EditorSurface> {
        &self.surface
    }

    pub fn version(&self) -> Option<ToolVersion> {
        *self.version.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_version(&self, version: Option<ToolVersion>) {
        *self.version.lock().unwrap_or_else(|e| e.into_inner()) = version;
    }

    /// Paths currently short-circuited because sqlfluff reported them as ignored.
    pub fn ignored_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .ignored
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        paths.sort();
        paths
    }

    /// Probe `--version` and remember the result.
    pub fn refresh_version(&self) -> Option<ToolVersion> {
        let config = self.config();
        let cwd = config.working_directory().filter(|d| d.is_dir());
        let env = build_environment(&config.settings, &config.vars, cwd.as_deref());
        let version = match probe_version(
            &config.executable_path(),
            &config.settings.shell,
            cwd.as_deref(),
            &env,
        ) {
            Ok(v) => {
                info!("sqlfluff version {}", v);
                self.output.append_line(&format!("sqlfluff version {v}"));
                Some(v)
            }
            Err(e) => {
                warn!("could not determine sqlfluff version: {:#}", e);
                None
            }
        };
        self.set_version(version);
        version
    }

    fn notify_error(&self, config: &Config, message: &str) {
        if !config.settings.suppress_notifications {
            self.surface.show_error(message);
        }
    }

    /// Execute one invocation.
    pub fn run(&self, invocation: &CommandInvocation) -> Result<CommandResult, InvokeError> {
        let target = invocation.validate()?;
        let config = self.config();

        if config.settings.dbt_interface.enabled {
            return Ok(self.run_remote(invocation.kind, &target, &config));
        }
        Ok(self.run_local(invocation, &target, &config))
    }

    fn build_args(
        &self,
        invocation: &CommandInvocation,
        target: &InvocationTarget,
        relative: Option<&str>,
        config: &Config,
    ) -> Vec<String> {
        let mut args = vec![invocation.kind.as_arg().to_string()];
        args.extend(invocation.args.iter().cloned());
        args.extend(config.settings.extra_arguments(&config.vars));

        match target {
            InvocationTarget::Buffer { .. } => {
                let supports = self.version().is_some_and(|v| v.supports_stdin_filename());
                if let (true, Some(rel)) = (supports, relative) {
                    args.push("--stdin-filename".to_string());
                    args.push(rel.to_string());
                }
                args.push(STDIN_MARKER.to_string());
            }
            InvocationTarget::File(_) => {
                if let Some(rel) = relative {
                    args.push(rel.to_string());
                }
            }
        }
        args
    }

    fn run_local(
        &self,
        invocation: &CommandInvocation,
        target: &InvocationTarget,
        config: &Config,
    ) -> CommandResult {
        let cwd = config.working_directory();
        let relative = target
            .path()
            .map(|p| relative_target_path(p, cwd.as_deref()));
        let args = self.build_args(invocation, target, relative.as_deref(), config);
        let executable = config.executable_path();

        self.output.append_hyphenated_line();
        self.output.append_line(if target.is_buffer() {
            "Reading from stdin, not file, input may be dirty/partial"
        } else {
            "Reading from file, not stdin"
        });
        self.output.append_section("Executing Command");
        self.output
            .append_line(&format!("{} {}", executable, args.join(" ")));
        self.output.append_hyphenated_line();

        if let Some(rel) = relative.as_deref() {
            let mut ignored = self.ignored.lock().unwrap_or_else(|e| e.into_inner());
            if target.is_buffer() && ignored.contains(rel) {
                self.output
                    .append_line(&format!("File marked as ignored: {rel}"));
                return CommandResult::failed();
            }
            ignored.remove(rel);
        }

        let mut cmd = make_command(&executable, &args, &config.settings.shell);
        if let Some(dir) = cwd.as_deref() {
            cmd.current_dir(dir);
        }
        let env = build_environment(&config.settings, &config.vars, cwd.as_deref());
        cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if target.is_buffer() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.output.append_line("Child process threw error");
                self.output.append_line(&e.to_string());
                let message = if e.kind() == std::io::ErrorKind::NotFound {
                    EXECUTABLE_NOT_FOUND_MESSAGE.to_string()
                } else {
                    e.to_string()
                };
                warn!("failed to spawn {}: {}", executable, e);
                self.notify_error(config, &message);
                return CommandResult::failed();
            }
        };

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        let id = self.registry.register(Arc::clone(&child));
        debug!("spawned sqlfluff {} (registry size {})", id, self.registry.len());

        let contents = match target {
            InvocationTarget::Buffer { contents, .. } => Some(contents.as_str()),
            InvocationTarget::File(_) => None,
        };
        let kind = invocation.kind;

        let (status, stdout_lines, stderr_text) = std::thread::scope(|scope| {
            if let (Some(mut pipe), Some(text)) = (stdin, contents) {
                scope.spawn(move || {
                    if let Err(e) = pipe.write_all(text.as_bytes()) {
                        debug!("stdin write failed: {}", e);
                    }
                    // Dropping the pipe closes stdin
                });
            }

            let stdout_handle = scope.spawn(move || match stdout {
                Some(pipe) => read_stdout(pipe, kind),
                None => Vec::new(),
            });
            let stderr_handle = scope.spawn(move || match stderr {
                Some(pipe) => read_stderr(pipe),
                None => String::new(),
            });

            let status = wait_for_exit(&child);
            let lines = stdout_handle.join().unwrap_or_default();
            let errors = stderr_handle.join().unwrap_or_default();
            (status, lines, errors)
        });

        self.registry.remove(id);

        let code = status.and_then(|s| s.code());
        self.output
            .append_line(&format!("Received close event, code {:?}", code));
        self.output.append_line("Raw stdout output:");
        self.output.append_hyphenated_line();
        self.output.append_line(&stdout_lines.join("\n"));
        self.output.append_hyphenated_line();

        if !stderr_text.is_empty() {
            self.output.append_line("Raw stderr output:");
            self.output.append_hyphenated_line();
            self.output.append_line(&stderr_text);
            self.output.append_hyphenated_line();

            if contains_ignore_marker(&stderr_text) {
                if let Some(rel) = relative {
                    self.ignored
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(rel);
                }
            } else {
                self.notify_error(config, &stderr_text);
            }
        }

        match code {
            Some(code) => CommandResult {
                succeeded: is_success_exit_code(code),
                lines: stdout_lines,
            },
            // Killed by a signal (registry eviction)
            None => CommandResult::failed(),
        }
    }

    fn run_remote(
        &self,
        kind: CommandKind,
        target: &InvocationTarget,
        config: &Config,
    ) -> CommandResult {
        let dbt = DbtInterface::new(&config.settings.dbt_interface);
        let path = target.path().map(|p| normalize_path(&p.display().to_string()));
        let sql = match target {
            InvocationTarget::Buffer { contents, .. } => Some(contents.as_str()),
            InvocationTarget::File(_) => None,
        };
        let extra_config = config.settings.config_path(&config.vars);
        let request = RemoteRequest {
            sql,
            sql_path: path.as_deref(),
            extra_config_path: &extra_config,
        };

        self.output.append_section("Executing Command");
        let url = match kind {
            CommandKind::Lint => dbt.lint_url(&request),
            CommandKind::Fix => dbt.format_url(&request),
        };
        self.output.append_line(
            &url.map(|u| u.to_string())
                .unwrap_or_else(|| dbt.base_url()),
        );
        if let Some(body) = sql {
            self.output.append_line("-----Request Body-----");
            self.output.append_line(body);
        }
        self.output.append_hyphenated_line();

        match kind {
            CommandKind::Lint => match dbt.lint(&request) {
                Ok(violations) => {
                    let report = json!([{
                        "filepath": path.as_deref().unwrap_or(STDIN_FILEPATH),
                        "violations": violations,
                    }]);
                    self.output.append_line("Raw dbt-core-interface /lint output:");
                    self.output.append_line(&report.to_string());
                    CommandResult {
                        succeeded: true,
                        lines: vec![report.to_string()],
                    }
                }
                Err(e) => self.remote_failure(config, &e),
            },
            CommandKind::Fix => match dbt.format(&request) {
                Ok(sql) => {
                    let text = sql.unwrap_or_default();
                    self.output.append_line("Raw dbt-core-interface /format output:");
                    self.output.append_line(&text);
                    CommandResult {
                        succeeded: true,
                        lines: vec![text],
                    }
                }
                Err(e) => self.remote_failure(config, &e),
            },
        }
    }

    fn remote_failure(&self, config: &Config, error: &RemoteError) -> CommandResult {
        warn!("dbt-core-interface error {}", error);
        self.output.append_line(&format!("dbt-core-interface error: {error}"));

        if config.settings.suppress_notifications
            || self.remote_popup_shown.load(Ordering::SeqCst)
        {
            return CommandResult::failed();
        }
        if error.code == RemoteErrorCode::CompileSqlFailure {
            self.remote_popup_shown.store(true, Ordering::SeqCst);
            self.surface
                .show_error(&format!("{}\n{}", error.message, DBT_COMPILE_HINT));
        } else {
            self.surface.show_error(&error.user_message());
        }
        CommandResult::failed()
    }
}

/// Poll the child until it exits. A concurrent `kill` from the registry ends the loop too.
fn wait_for_exit(child: &Arc<Mutex<Child>>) -> Option<std::process::ExitStatus> {
    let poll = millis_to_duration(CHILD_POLL_MS);
    loop {
        let result = child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .try_wait();
        match result {
            Ok(Some(status)) => return Some(status),
            Ok(None) => std::thread::sleep(poll),
            Err(e) => {
                warn!("try_wait on sqlfluff failed: {}", e);
                let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
                let _ = kill_process_tree(&mut guard);
                return guard.wait().ok();
            }
        }
    }
}

fn read_stdout(mut pipe: impl Read, kind: CommandKind) -> Vec<String> {
    let mut buf = vec![0u8; PIPE_READ_BUFFER_SIZE];
    match kind {
        CommandKind::Lint => {
            let mut decoder = LineDecoder::new();
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        decoder.write(&buf[..n]);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("stdout read failed: {}", e);
                        break;
                    }
                }
            }
            decoder.end();
            decoder.into_lines()
        }
        CommandKind::Fix => {
            let mut decoder = Utf8StreamDecoder::new();
            let mut text = String::new();
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => text.push_str(&decoder.write(&buf[..n])),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        debug!("stdout read failed: {}", e);
                        break;
                    }
                }
            }
            text.push_str(&decoder.finish());
            vec![text]
        }
    }
}

fn read_stderr(mut pipe: impl Read) -> String {
    let mut bytes = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut bytes) {
        debug!("stderr read failed: {}", e);
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Settings, Variables};
    use crate::surface::RecordingSurface;

    fn invoker(settings: Settings) -> (Invoker, Arc<RecordingSurface>) {
        let surface = Arc::new(RecordingSurface::new());
        let invoker = Invoker::new(
            Config::new(settings, Variables::default()),
            Arc::new(OutputLog::in_memory()),
            surface.clone(),
        );
        (invoker, surface)
    }

    #[test]
    fn test_invocation_requires_a_target() {
        let missing = CommandInvocation::new(CommandKind::Lint, vec![]);
        assert!(matches!(
            missing.validate(),
            Err(InvokeError::InvalidInvocation(_))
        ));

        let empty = CommandInvocation::for_buffer(CommandKind::Lint, vec![], "", None);
        assert!(empty.validate().is_err());

        let fallback =
            CommandInvocation::for_buffer(CommandKind::Lint, vec![], "", Some("/w/a.sql".into()));
        assert_eq!(
            fallback.validate(),
            Ok(InvocationTarget::File("/w/a.sql".into()))
        );

        let (inv, _) = invoker(Settings::default());
        assert!(inv.run(&missing).is_err());
    }

    #[test]
    fn test_relative_target_path() {
        assert_eq!(
            relative_target_path(Path::new("/work/models/a.sql"), Some(Path::new("/work"))),
            "models/a.sql"
        );
        assert_eq!(
            relative_target_path(Path::new("/elsewhere/a.sql"), Some(Path::new("/work"))),
            "../elsewhere/a.sql"
        );
        assert_eq!(relative_target_path(Path::new("/work/a.sql"), None), "/work/a.sql");
    }

    #[test]
    fn test_build_args_for_buffer_and_file() {
        let settings = Settings {
            dialect: Some("ansi".into()),
            ..Settings::default()
        };
        let (inv, _) = invoker(settings);
        let config = inv.config();
        let lint = CommandInvocation::for_buffer(
            CommandKind::Lint,
            vec!["--format".into(), "json".into()],
            "select 1",
            Some("/work/a.sql".into()),
        );
        let target = lint.validate().unwrap();

        let args = inv.build_args(&lint, &target, Some("a.sql"), &config);
        assert_eq!(args, vec!["lint", "--format", "json", "--dialect", "ansi", "-"]);

        inv.set_version(Some(ToolVersion::new(3, 1, 0)));
        let args = inv.build_args(&lint, &target, Some("a.sql"), &config);
        assert_eq!(
            &args[args.len() - 3..],
            &["--stdin-filename".to_string(), "a.sql".to_string(), "-".to_string()]
        );

        let fix = CommandInvocation::for_file(CommandKind::Fix, vec![], "/work/a.sql");
        let target = fix.validate().unwrap();
        let args = inv.build_args(&fix, &target, Some("a.sql"), &config);
        assert_eq!(args, vec!["fix", "--dialect", "ansi", "a.sql"]);
    }

    #[test]
    fn test_missing_executable_reports_remediation() {
        let settings = Settings {
            executable_path: "definitely-not-sqlfluff-xyz".into(),
            ..Settings::default()
        };
        let (inv, surface) = invoker(settings);
        let result = inv
            .run(&CommandInvocation::for_buffer(
                CommandKind::Lint,
                vec![],
                "select 1",
                None,
            ))
            .unwrap();
        assert!(!result.succeeded);
        assert!(result.lines.is_empty());
        let messages = surface.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("Executable Path"));
        assert!(inv.registry().is_empty());
    }

    #[test]
    fn test_suppressed_notifications() {
        let settings = Settings {
            executable_path: "definitely-not-sqlfluff-xyz".into(),
            suppress_notifications: true,
            ..Settings::default()
        };
        let (inv, surface) = invoker(settings);
        let cmd = CommandInvocation::for_file(CommandKind::Lint, vec![], "/tmp/a.sql");
        assert!(!inv.run(&cmd).unwrap().succeeded);
        assert!(surface.messages().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_registry_evicts_oldest() {
        use std::process::Command;

        let registry = ProcessRegistry::new(2);
        let mut children = Vec::new();
        for _ in 0..3 {
            let child = Command::new("sleep").arg("30").spawn().unwrap();
            let child = Arc::new(Mutex::new(child));
            registry.register(Arc::clone(&child));
            children.push(child);
            assert!(registry.len() <= 2);
        }
        assert_eq!(registry.len(), 2);
        // The first child was killed on eviction
        let status = children[0].lock().unwrap().wait().unwrap();
        assert!(status.code().is_none());

        registry.kill_all();
        assert!(registry.is_empty());
        for child in &children[1..] {
            let _ = child.lock().unwrap().wait();
        }
    }

    #[test]
    fn test_read_stdout_fix_keeps_one_blob() {
        let lines = read_stdout(&b"SELECT 1\nFROM t\n"[..], CommandKind::Fix);
        assert_eq!(lines, vec!["SELECT 1\nFROM t\n".to_string()]);
        let empty = read_stdout(&b""[..], CommandKind::Fix);
        assert_eq!(empty, vec![String::new()]);
        let lint = read_stdout(&b"[]\n[]"[..], CommandKind::Lint);
        assert_eq!(lint, vec!["[]", "[]"]);
    }
}
