use anyhow::{bail, Context, Result};
use clap::Parser;
use log::info;
use serde_json::json;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use sqlfluff_ls::constants::{millis_to_duration, LINT_MODE_TIMEOUT_MS};
use sqlfluff_ls::documents::{Document, DocumentStore};
use sqlfluff_ls::logging::{init_logger, OutputLog};
use sqlfluff_ls::scheduler::LintScheduler;
use sqlfluff_ls::surface::{EditorSurface, RecordingSurface};
use sqlfluff_ls::{doctor, Args, Config, Invoker, Mode, Server, Settings, Variables};

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.log_level.as_deref());

    match args.mode {
        Mode::Lsp => run_lsp(&args),
        Mode::Probe => run_probe(&args),
        Mode::Lint => run_lint(&args),
    }
}

fn cli_config(args: &Args) -> Result<Config> {
    let mut settings = Settings::default();
    args.server_options().apply(&mut settings);
    let cwd = std::env::current_dir().context("cannot determine current directory")?;
    Ok(Config::new(settings, Variables::for_workspace(Some(&cwd))))
}

fn run_lsp(args: &Args) -> Result<()> {
    info!("sqlfluff_ls {} starting", env!("CARGO_PKG_VERSION"));
    let output = Arc::new(OutputLog::open());
    let server = Server::new(Box::new(io::stdout()), output, args.server_options());
    let mut reader = BufReader::new(io::stdin().lock());
    server.run(&mut reader)
}

fn run_probe(args: &Args) -> Result<()> {
    let output = OutputLog::open();
    let report = doctor::run_checks(&cli_config(args)?, &output);
    println!("{}", serde_json::to_string(&report)?);
    if !report.ok {
        bail!("setup check failed");
    }
    Ok(())
}

fn run_lint(args: &Args) -> Result<()> {
    if args.paths.is_empty() {
        bail!("lint mode needs at least one path");
    }
    let config = cli_config(args)?;
    let surface = Arc::new(RecordingSurface::new());
    let invoker = Arc::new(Invoker::new(
        config,
        Arc::new(OutputLog::open()),
        Arc::clone(&surface) as Arc<dyn EditorSurface>,
    ));
    invoker.refresh_version();
    let documents = Arc::new(DocumentStore::new());
    let scheduler = LintScheduler::new(Arc::clone(&invoker), Arc::clone(&documents));

    for path in &args.paths {
        let doc = load_document(path)?;
        let uri = doc.uri.clone();
        documents.open(doc);
        scheduler.force_lint(&uri);
        if !scheduler.wait_idle(millis_to_duration(LINT_MODE_TIMEOUT_MS)) {
            bail!("timed out linting {}", path.display());
        }
        let diagnostics = surface.diagnostics(&uri).unwrap_or_default();
        println!(
            "{}",
            json!({ "path": path.display().to_string(), "diagnostics": diagnostics })
        );
    }
    Ok(())
}

fn load_document(path: &Path) -> Result<Document> {
    let absolute = std::fs::canonicalize(path)
        .with_context(|| format!("cannot resolve {}", path.display()))?;
    let text = std::fs::read_to_string(&absolute)
        .with_context(|| format!("cannot read {}", absolute.display()))?;
    let uri = url_for(&absolute)?;
    Ok(Document::new(uri, "sql", 0, text))
}

fn url_for(path: &Path) -> Result<lsp_types::Url> {
    lsp_types::Url::from_file_path(path)
        .map_err(|_| anyhow::anyhow!("not an absolute path: {}", path.display()))
}
