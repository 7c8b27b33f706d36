//! Deciding when to lint.
//!
//! Every document gets its own [`ThrottledDelayer`]: a worker thread that waits
//! for input to go quiet (debounce) and never runs two lints for the same
//! document at once (throttle). Results carry a per-document generation so a
//! slow run finishing late can't overwrite newer diagnostics.

use log::{debug, error, info, warn};
use lsp_types::Url;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::constants::{
    millis_to_duration, PROJECT_LINT_MAX_IN_FLIGHT, PROJECT_LINT_PACING_MS, PROJECT_LINT_POLL_MS,
    SQL_FILE_EXTENSIONS,
};
use crate::diagnostics::{map_output, LintTarget};
use crate::documents::{Document, DocumentStore};
use crate::invoker::{CommandInvocation, CommandKind, Invoker};
use crate::settings::RunTrigger;

// ============================================================================
// Throttled Delayer
// ============================================================================

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct DelayerState {
    task: Option<Task>,
    deadline: Option<Instant>,
    running: bool,
    closed: bool,
}

type Shared = Arc<(Mutex<DelayerState>, Condvar)>;

/// Debounced, serialised task runner backed by one worker thread.
///
/// `trigger` replaces any pending task and restarts the delay. Tasks never run
/// concurrently; triggers that arrive during a run coalesce into one follow-up.
pub struct ThrottledDelayer {
    delay: Duration,
    shared: Shared,
}

impl ThrottledDelayer {
    pub fn new(delay: Duration) -> Self {
        let shared: Shared = Arc::new((Mutex::new(DelayerState::default()), Condvar::new()));
        let worker_shared = Arc::clone(&shared);
        std::thread::spawn(move || delayer_worker(worker_shared));
        Self { delay, shared }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn trigger(&self, task: impl FnOnce() + Send + 'static) {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        state.task = Some(Box::new(task));
        state.deadline = Some(Instant::now() + self.delay);
        cvar.notify_all();
    }

    /// No task pending and none running.
    pub fn is_idle(&self) -> bool {
        let (lock, _) = &*self.shared;
        let state = lock.lock().unwrap_or_else(|e| e.into_inner());
        state.task.is_none() && !state.running
    }

    /// Block until idle or `timeout` elapses; returns whether idle was reached.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.shared;
        let deadline = Instant::now() + timeout;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        while state.task.is_some() || state.running {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = cvar
                .wait_timeout(state, deadline - now)
                .map(|(s, _)| s)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }
}

impl Drop for ThrottledDelayer {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.shared;
        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        state.closed = true;
        state.task = None;
        cvar.notify_all();
    }
}

fn delayer_worker(shared: Shared) {
    let (lock, cvar) = &*shared;
    loop {
        let task = {
            let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if state.closed {
                    return;
                }
                let now = Instant::now();
                match (state.task.is_some(), state.deadline) {
                    (true, Some(deadline)) if now >= deadline => {
                        state.running = true;
                        state.deadline = None;
                        break state.task.take();
                    }
                    (true, Some(deadline)) => {
                        state = cvar
                            .wait_timeout(state, deadline - now)
                            .map(|(s, _)| s)
                            .unwrap_or_else(|e| e.into_inner().0);
                    }
                    _ => {
                        state = cvar.wait(state).unwrap_or_else(|e| e.into_inner());
                    }
                }
            }
        };

        if let Some(task) = task {
            task();
        }

        let mut state = lock.lock().unwrap_or_else(|e| e.into_inner());
        state.running = false;
        cvar.notify_all();
    }
}

// ============================================================================
// Generations
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Generation {
    issued: u64,
    applied: u64,
}

/// Monotonic per-document counters used to drop stale results.
#[derive(Debug, Default)]
pub struct Generations {
    inner: Mutex<HashMap<Url, Generation>>,
}

impl Generations {
    /// Take the next generation for a dispatch.
    pub fn issue(&self, uri: &Url) -> u64 {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(uri.clone()).or_default();
        entry.issued += 1;
        entry.issued
    }

    /// Record `generation` as applied if it is newer than the last applied one.
    pub fn try_apply(&self, uri: &Url, generation: u64) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(uri.clone()).or_default();
        if generation > entry.applied {
            entry.applied = generation;
            true
        } else {
            false
        }
    }

    /// Invalidate every generation issued so far; later issues stay newer.
    pub fn retire(&self, uri: &Url) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entry = map.entry(uri.clone()).or_default();
        entry.applied = entry.issued;
    }
}

// ============================================================================
// Lint Scheduler
// ============================================================================

/// Where the lint reads SQL from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintSource {
    /// The in-memory buffer, piped through stdin.
    Buffer,
    /// The saved file on disk.
    File,
}

/// State shared between the scheduler and its delayed tasks.
struct LintCore {
    invoker: Arc<Invoker>,
    documents: Arc<DocumentStore>,
    generations: Generations,
}

impl LintCore {
    /// Run one lint for `doc` and publish its results.
    ///
    /// With `require_open`, results for `doc` are dropped if it was closed meanwhile.
    fn lint_document(&self, doc: &Document, source: LintSource, require_open: bool) {
        let config = self.invoker.config();
        let settings = &config.settings;
        let output = self.invoker.output();

        let path = match doc.path() {
            Some(p) => p,
            None => {
                output.append_line("ERROR: File path not found.");
                if !settings.suppress_notifications {
                    self.invoker.surface().show_error("File path not found.");
                }
                return;
            }
        };

        let args = settings.lint_file_arguments();
        let invocation = match source {
            LintSource::Buffer => CommandInvocation::for_buffer(
                CommandKind::Lint,
                args,
                doc.text.clone(),
                Some(path.clone()),
            ),
            LintSource::File => CommandInvocation::for_file(CommandKind::Lint, args, path.clone()),
        };

        let generation = self.generations.issue(&doc.uri);
        let result = match self.invoker.run(&invocation) {
            Ok(result) => result,
            Err(e) => {
                error!("lint of {} rejected: {}", doc.uri, e);
                return;
            }
        };

        if !result.succeeded {
            output.append_line("Linting command failed to execute");
            return;
        }
        if result.lines.is_empty() {
            return;
        }

        let live = self.documents.get(&doc.uri);
        let closed = require_open && live.is_none();
        let cwd = config.working_directory();
        let target = LintTarget {
            path: &path,
            working_directory: cwd.as_deref(),
            document: live.as_ref(),
        };

        for file in map_output(&result.lines, &target, settings) {
            if file.is_target {
                if closed {
                    debug!("dropping lint result for closed {}", doc.uri);
                    continue;
                }
                if !self.generations.try_apply(&doc.uri, generation) {
                    debug!("dropping stale lint result {} for {}", generation, doc.uri);
                    continue;
                }
                let version = live.as_ref().map(|d| d.version);
                self.invoker
                    .surface()
                    .publish_diagnostics(&doc.uri, file.diagnostics, version);
            } else if let Some(uri) = file.uri() {
                self.invoker
                    .surface()
                    .publish_diagnostics(&uri, file.diagnostics, None);
            }
        }
    }
}

/// Per-document lint triggering plus whole-project linting.
pub struct LintScheduler {
    core: Arc<LintCore>,
    delayers: Mutex<HashMap<Url, ThrottledDelayer>>,
    in_flight: Arc<AtomicUsize>,
}

impl LintScheduler {
    pub fn new(invoker: Arc<Invoker>, documents: Arc<DocumentStore>) -> Self {
        Self {
            core: Arc::new(LintCore {
                invoker,
                documents,
                generations: Generations::default(),
            }),
            delayers: Mutex::new(HashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn on_open(&self, uri: &Url) {
        self.trigger(uri, LintSource::File, false);
    }

    pub fn on_change(&self, uri: &Url) {
        if self.core.invoker.config().settings.linter.run == RunTrigger::OnType {
            self.trigger(uri, LintSource::Buffer, false);
        }
    }

    pub fn on_save(&self, uri: &Url) {
        self.trigger(uri, LintSource::File, false);
    }

    /// Drop the document's delayer and, unless project-wide linting is on, its diagnostics.
    pub fn on_close(&self, uri: &Url) {
        self.delayers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(uri);
        self.core.generations.retire(uri);
        if !self.core.invoker.config().settings.linter.lint_entire_project {
            self.core.invoker.surface().clear_diagnostics(uri);
        }
    }

    /// Lint regardless of the run trigger; unsaved buffers are linted from memory.
    pub fn force_lint(&self, uri: &Url) {
        let source = match self.core.documents.get(uri) {
            Some(doc) if doc.dirty => LintSource::Buffer,
            _ => LintSource::File,
        };
        self.trigger(uri, source, true);
    }

    /// Re-trigger every open document (after a settings change).
    pub fn lint_open_documents(&self, force: bool) {
        for doc in self.core.documents.all() {
            let source = if doc.dirty {
                LintSource::Buffer
            } else {
                LintSource::File
            };
            self.trigger(&doc.uri, source, force);
        }
    }

    /// Forget all delayers so new ones pick up a changed delay.
    pub fn reset(&self) {
        self.delayers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn trigger(&self, uri: &Url, source: LintSource, force: bool) {
        let settings = self.core.invoker.config().settings;
        let Some(doc) = self.core.documents.get(uri) else {
            debug!("lint trigger for unknown document {}", uri);
            return;
        };
        if !settings.lints_language(&doc.language_id) {
            return;
        }
        if settings.linter.run == RunTrigger::Off && !force {
            return;
        }

        let delay = match settings.linter.run {
            RunTrigger::OnType => millis_to_duration(settings.linter.delay),
            _ => Duration::ZERO,
        };

        let mut delayers = self.delayers.lock().unwrap_or_else(|e| e.into_inner());
        let delayer = delayers
            .entry(uri.clone())
            .or_insert_with(|| ThrottledDelayer::new(delay));

        let core = Arc::clone(&self.core);
        debug!("lint triggered for {} ({:?})", uri, source);
        delayer.trigger(move || core.lint_document(&doc, source, true));
    }

    /// Wait until every document's delayer is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let delayers = self.delayers.lock().unwrap_or_else(|e| e.into_inner());
        delayers.values().all(|d| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            d.wait_idle(remaining)
        })
    }

    pub fn pending_documents(&self) -> usize {
        self.delayers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of project-lint runs currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Lint every SQL file under `root` on a background thread.
    ///
    /// At most a fixed number of runs are in flight at once; submissions are paced.
    /// The handle yields the number of files submitted.
    pub fn lint_project(&self, root: &Path, force: bool) -> Option<JoinHandle<usize>> {
        let settings = self.core.invoker.config().settings;
        if settings.linter.run == RunTrigger::Off && !force {
            return None;
        }

        let files = find_sql_files(root);
        info!("linting {} files under {}", files.len(), root.display());
        let core = Arc::clone(&self.core);
        let in_flight = Arc::clone(&self.in_flight);

        Some(std::thread::spawn(move || {
            let poll = millis_to_duration(PROJECT_LINT_POLL_MS);
            let pacing = millis_to_duration(PROJECT_LINT_PACING_MS);
            let mut workers = Vec::new();
            let mut submitted = 0;

            for file in files {
                while in_flight.load(Ordering::SeqCst) >= PROJECT_LINT_MAX_IN_FLIGHT {
                    std::thread::sleep(poll);
                }
                let Ok(uri) = Url::from_file_path(&file) else {
                    warn!("skipping non-absolute path {}", file.display());
                    continue;
                };
                let doc = match core.documents.get(&uri) {
                    Some(doc) => doc,
                    None => match std::fs::read_to_string(&file) {
                        Ok(text) => Document::new(uri, "sql", 0, text),
                        Err(e) => {
                            warn!("cannot read {}: {}", file.display(), e);
                            continue;
                        }
                    },
                };

                in_flight.fetch_add(1, Ordering::SeqCst);
                let core = Arc::clone(&core);
                let slot = InFlightSlot(Arc::clone(&in_flight));
                workers.push(std::thread::spawn(move || {
                    let _slot = slot;
                    core.lint_document(&doc, LintSource::File, false);
                }));
                submitted += 1;
                std::thread::sleep(pacing);
            }

            for worker in workers {
                let _ = worker.join();
            }
            submitted
        }))
    }
}

/// Releases one project-lint slot when the worker ends, even by panic.
struct InFlightSlot(Arc<AtomicUsize>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Every file under `root` with a SQL extension, sorted.
pub fn find_sql_files(root: &Path) -> Vec<PathBuf> {
    let base = glob::Pattern::escape(&root.display().to_string());
    let mut files: Vec<PathBuf> = SQL_FILE_EXTENSIONS
        .iter()
        .filter_map(|ext| glob::glob(&format!("{base}/**/*.{ext}")).ok())
        .flat_map(|paths| paths.filter_map(Result::ok))
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files.dedup();
    files
}

// ============================================================================
// Tests
// ============================================================================
