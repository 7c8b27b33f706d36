//! Setup self-check.
//!
//! Verifies, in order, that the working directory exists, that the sqlfluff
//! executable can be found, and that it reports a version. Stops at the first
//! failing check. Used by `--mode probe` and the `sqlfluff.debug` command.

use log::{info, warn};
use serde::Serialize;
use std::path::Path;

use crate::logging::OutputLog;
use crate::process::{build_environment, detect_executable, probe_version};
use crate::settings::Config;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

/// JSON report printed by `--mode probe`.
#[derive(Debug, Clone, Serialize)]
pub struct DoctorReport {
    pub ok: bool,
    pub working_directory: Option<String>,
    pub executable: Option<String>,
    pub version: Option<String>,
    pub checks: Vec<CheckResult>,
}

impl DoctorReport {
    fn record(&mut self, output: &OutputLog, name: &'static str, passed: bool, detail: String) {
        output.append_line(&format!(
            "TEST {}: {}: {}",
            if passed { "SUCCESS" } else { "FAILED" },
            name,
            detail
        ));
        if passed {
            info!("check '{}' passed: {}", name, detail);
        } else {
            warn!("check '{}' failed: {}", name, detail);
        }
        self.checks.push(CheckResult {
            name,
            passed,
            detail,
        });
        self.ok = passed;
    }
}

/// Run every check against `config`, logging each outcome to `output`.
pub fn run_checks(config: &Config, output: &OutputLog) -> DoctorReport {
    output.append_section("Debug");

    let cwd = config.working_directory();
    let mut report = DoctorReport {
        ok: true,
        working_directory: cwd.as_ref().map(|d| d.display().to_string()),
        executable: None,
        version: None,
        checks: Vec::new(),
    };

    match cwd.as_deref() {
        Some(dir) if !dir.is_dir() => {
            report.record(
                output,
                "working directory",
                false,
                format!("{} is not an existing directory", dir.display()),
            );
            output.append_hyphenated_line();
            return report;
        }
        Some(dir) => report.record(output, "working directory", true, dir.display().to_string()),
        None => report.record(
            output,
            "working directory",
            true,
            "not set, using the server's directory".to_string(),
        ),
    }

    let configured = config.executable_path();
    let executable = match detect_executable(&configured, cwd.as_deref()) {
        Ok(path) => {
            let shown = path.display().to_string();
            report.record(output, "executable", true, format!("found sqlfluff at {shown}"));
            report.executable = Some(shown.clone());
            shown
        }
        Err(e) => {
            report.record(output, "executable", false, format!("{e:#}"));
            output.append_hyphenated_line();
            return report;
        }
    };

    match version_of(config, &configured, &executable, cwd.as_deref()) {
        Ok(version) => {
            report.record(output, "version", true, format!("sqlfluff {version}"));
            report.version = Some(version);
        }
        Err(e) => report.record(output, "version", false, format!("{e:#}")),
    }
    output.append_hyphenated_line();
    report
}

/// Try the configured name first, then the resolved location.
fn version_of(
    config: &Config,
    configured: &str,
    resolved: &str,
    cwd: Option<&Path>,
) -> anyhow::Result<String> {
    let env = build_environment(&config.settings, &config.vars, cwd);
    let shell = &config.settings.shell;
    match probe_version(configured, shell, cwd, &env) {
        Ok(v) => Ok(v.to_string()),
        Err(first) if configured != resolved => probe_version(resolved, shell, cwd, &env)
            .map(|v| v.to_string())
            .map_err(|_| first),
        Err(e) => Err(e),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{Settings, Variables};

    fn config(settings: Settings) -> Config {
        Config::new(settings, Variables::for_workspace(None))
    }

    #[test]
    fn test_missing_working_directory_stops_early() {
        let mut settings = Settings::default();
        settings.working_directory = "/definitely/not/a/dir".to_string();
        let output = OutputLog::in_memory();
        let report = run_checks(&config(settings), &output);
        assert!(!report.ok);
        assert_eq!(report.checks.len(), 1);
        assert!(output.contains("TEST FAILED: working directory"));
    }

    #[test]
    fn test_missing_executable_stops_before_version() {
        let mut settings = Settings::default();
        settings.executable_path = "sqlfluff-does-not-exist-anywhere".to_string();
        let output = OutputLog::in_memory();
        let report = run_checks(&config(settings), &output);
        assert!(!report.ok);
        assert_eq!(report.checks.len(), 2);
        assert!(report.checks[0].passed);
        assert_eq!(report.checks[1].name, "executable");
        assert!(report.version.is_none());
    }

    #[test]
    fn test_report_serializes() {
        let report = DoctorReport {
            ok: true,
            working_directory: None,
            executable: Some("/usr/bin/sqlfluff".into()),
            version: Some("3.0.7".into()),
            checks: vec![],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["executable"], "/usr/bin/sqlfluff");
        assert_eq!(json["ok"], true);
    }
}
