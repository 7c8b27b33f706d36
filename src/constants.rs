//! Centralized constants for sqlfluff_ls timing, process ceilings and tool markers.
//!
//! This module contains all timing, concurrency and output-marker constants used
//! throughout the server to avoid magic numbers scattered across the codebase.

use std::time::Duration;

// ============================================================================
// Process Registry & Polling Constants
// ============================================================================

/// Maximum number of sqlfluff subprocesses tracked at once; the oldest are killed beyond this
pub const MAX_TRACKED_PROCESSES: usize = 10;

/// Interval between `try_wait` polls of a running sqlfluff child in milliseconds
pub const CHILD_POLL_MS: u64 = 10;

/// Read buffer size for child stdout/stderr pipes (8KB)
pub const PIPE_READ_BUFFER_SIZE: usize = 8 * 1024;

// ============================================================================
// Lint Scheduling Constants
// ============================================================================

/// Default debounce delay for on-type linting in milliseconds
pub const DEFAULT_LINT_DELAY_MS: u64 = 100;

/// Maximum number of in-flight invocations during a whole-project lint
pub const PROJECT_LINT_MAX_IN_FLIGHT: usize = 5;

/// Polling interval while waiting for a project-lint slot in milliseconds
pub const PROJECT_LINT_POLL_MS: u64 = 50;

/// Pacing delay between project-lint submissions in milliseconds
pub const PROJECT_LINT_PACING_MS: u64 = 20;

/// File extensions linted by a whole-project run
pub const SQL_FILE_EXTENSIONS: &[&str] = &["sql", "sql-bigquery", "jinja-sql"];

// ============================================================================
// Formatting Constants
// ============================================================================

/// Settle delay after a terminal-mode fix so editor file watchers catch up (milliseconds)
pub const TERMINAL_SETTLE_DELAY_MS: u64 = 250;

/// Upper bound on one file's lint in `--mode lint` (milliseconds)
pub const LINT_MODE_TIMEOUT_MS: u64 = 600_000;

// ============================================================================
// Remote Service (dbt-core-interface) Constants
// ============================================================================

/// Health check timeout in milliseconds
pub const HEALTH_CHECK_TIMEOUT_MS: u64 = 1_000;

/// Default timeout for /lint and /format requests in milliseconds
pub const DEFAULT_REMOTE_TIMEOUT_MS: u64 = 25_000;

/// Default dbt-core-interface host
pub const DEFAULT_DBT_INTERFACE_HOST: &str = "localhost";

/// Default dbt-core-interface port
pub const DEFAULT_DBT_INTERFACE_PORT: u16 = 8581;

// ============================================================================
// sqlfluff Protocol Constants
// ============================================================================

/// Exit codes that count as a successful run: clean, fixed-with-unfixable-remainder, lint-with-findings
pub const SUCCESS_EXIT_CODES: [i32; 3] = [0, 1, 65];

/// Argument telling sqlfluff to read the SQL from stdin
pub const STDIN_MARKER: &str = "-";

/// File path sqlfluff reports for content read from stdin
pub const STDIN_FILEPATH: &str = "stdin";

/// First line emitted by `sqlfluff fix` when safety checks are relaxed
pub const NO_SAFETY_MARKER: &str = "NO SAFETY:";

/// Marker meaning `sqlfluff fix` refused to fix because of templating/parsing errors
pub const TEMPLATING_ERRORS_FOUND: &str = "templating/parsing errors found";

/// Marker meaning `sqlfluff fix` fixed what it could but templating/parsing errors remain
pub const TEMPLATING_ERRORS_REMAINING: &str = "templating/parsing errors remaining";

/// Marker meaning the executable could not be spawned
pub const EXECUTABLE_NOT_FOUND_MARKER: &str = "ENOENT";

/// stderr fragments emitted when the target path is excluded by an ignore file
pub const IGNORE_PATTERN_MARKERS: [&str; 2] = [
    "ignored by a .sqlfluffignore pattern",
    "ignored by an ignore pattern",
];

/// Source tag attached to every published diagnostic
pub const DIAGNOSTIC_SOURCE: &str = "sqlfluff";

/// Rule documentation URL prefix; the rule code is appended
pub const RULE_DOCS_URL: &str = "https://docs.sqlfluff.com/en/stable/rules.html#sqlfluff.rules.Rule_";

// ============================================================================
// LSP Constants
// ============================================================================

/// JSON-RPC protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC "method not found" error code
pub const METHOD_NOT_FOUND: i64 = -32601;

/// JSON-RPC "invalid params" error code
pub const INVALID_PARAMS: i64 = -32602;

/// First id used for server-originated requests (workspace/applyEdit)
pub const INITIAL_SERVER_REQUEST_ID: u64 = 1_000_000;

// ============================================================================
// Helper Functions
// ============================================================================

/// Convert milliseconds to Duration (const fn for compile-time evaluation)
pub const fn millis_to_duration(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

/// Whether a sqlfluff exit code means the run itself succeeded
pub fn is_success_exit_code(code: i32) -> bool {
    SUCCESS_EXIT_CODES.contains(&code)
}
