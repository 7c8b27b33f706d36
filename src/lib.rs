//! SQLFluff language server library.
//!
//! This crate provides the `sqlfluff_ls` binary, which lints and formats SQL
//! documents for any LSP client by driving the `sqlfluff` command line tool
//! (or a dbt-core-interface server).
//!
//! # Architecture
//!
//! ```text
//! Editor <-> stdin/stdout <-> sqlfluff_ls ---> sqlfluff lint|fix (child process)
//!                                  |
//!                                  +---------> dbt-core-interface (HTTP)
//! ```
//!
//! # Modules
//!
//! - [`actions`]: noqa / exclude-rule quick fixes and rule documentation hover
//! - [`constants`]: Timing, ceiling, marker and protocol constants
//! - [`decoder`]: Incremental UTF-8 stream decoding and line splitting
//! - [`diagnostics`]: Lint JSON schema and mapping to LSP diagnostics
//! - [`doctor`]: Working directory / executable / version self-check
//! - [`documents`]: Open-document store
//! - [`format`]: Whole-document and range formatting through `sqlfluff fix`
//! - [`invoker`]: Command invocations, the process registry and the ignore set
//! - [`logging`]: Timestamps, logger setup and the output log
//! - [`process`]: Executable discovery, shell commands, environment and version probing
//! - [`remote`]: dbt-core-interface HTTP client
//! - [`scheduler`]: Run triggers, throttled per-document linting and project lint
//! - [`server`]: LSP framing and dispatch
//! - [`settings`]: Typed settings, argument building and variable interpolation
//! - [`surface`]: Boundary between the core and whatever displays results

use clap::Parser;

pub mod actions;
pub mod constants;
pub mod decoder;
pub mod diagnostics;
pub mod doctor;
pub mod documents;
pub mod format;
pub mod invoker;
pub mod logging;
pub mod process;
pub mod remote;
pub mod scheduler;
pub mod server;
pub mod settings;
pub mod surface;

// ============================================================================
// CLI Types (shared between main.rs and modules)
// ============================================================================

/// SQLFluff language server arguments.
#[derive(Parser, Debug)]
#[command(name = "sqlfluff_ls", version, about = "SQLFluff language server")]
pub struct Args {
    /// Server mode
    #[arg(long, value_enum, default_value_t = Mode::Lsp)]
    pub mode: Mode,

    /// Path to the sqlfluff executable (overrides settings)
    #[arg(long)]
    pub executable_path: Option<String>,

    /// Directory sqlfluff runs in (overrides settings)
    #[arg(long)]
    pub working_directory: Option<String>,

    /// Log level for stderr logging (e.g. error, warn, info, debug)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Files to lint in `lint` mode
    pub paths: Vec<std::path::PathBuf>,
}

/// Server operation mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum Mode {
    /// Speak LSP over stdin/stdout
    Lsp,
    /// Check the setup and print a JSON report
    Probe,
    /// Lint the given files once and print their diagnostics as JSON
    Lint,
}

impl Args {
    /// Command-line overrides for the language server.
    pub fn server_options(&self) -> server::ServerOptions {
        server::ServerOptions {
            executable_path: self.executable_path.clone(),
            working_directory: self.working_directory.clone(),
        }
    }
}

pub use invoker::{CommandInvocation, CommandKind, CommandResult, Invoker};
pub use server::{Server, ServerOptions};
pub use settings::{Config, Settings, Variables};
