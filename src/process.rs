//! Process support for sqlfluff_ls.
//!
//! Handles sqlfluff executable discovery, command construction (direct or through
//! a shell), environment overlays including `.env` files, and tool version probing.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::settings::{Settings, ShellSetting, Variables};

// ============================================================================
// Tool Version
// ============================================================================

/// Version reported by `sqlfluff --version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ToolVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse the first `X.Y.Z` triple, e.g. from `sqlfluff, version 3.0.7`.
    pub fn parse(output: &str) -> Option<Self> {
        let re = Regex::new(r"(\d+)\.(\d+)\.(\d+)").ok()?;
        let caps = re.captures(output)?;
        Some(Self {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
            patch: caps[3].parse().ok()?,
        })
    }

    /// `--force` on `fix` is deprecated from 3.0.0 on.
    pub fn is_force_deprecated(&self) -> bool {
        *self >= ToolVersion::new(3, 0, 0)
    }

    /// `--stdin-filename` is honoured after 3.0.5.
    pub fn supports_stdin_filename(&self) -> bool {
        *self > ToolVersion::new(3, 0, 5)
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ============================================================================
// Executable Detection & Command Building
// ============================================================================

/// Resolve the sqlfluff executable.
/// Accepts an existing path as-is, otherwise searches PATH (and `cwd` for relative names).
pub fn detect_executable(configured: &str, cwd: Option<&Path>) -> Result<PathBuf> {
    let candidate = Path::new(configured);
    if candidate.is_absolute() && candidate.exists() {
        return Ok(candidate.to_path_buf());
    }

    if let Some(dir) = cwd {
        if configured.contains('/') || configured.contains('\\') {
            let joined = dir.join(candidate);
            if joined.exists() {
                return Ok(joined);
            }
        }
    }

    which::which(configured).map_err(|e| {
        anyhow!(
            "{} not found ({}); set executablePath or add it to PATH",
            configured,
            e
        )
    })
}

/// Quote one argument for a POSIX or cmd.exe shell line.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return arg.to_string();
    }
    if cfg!(windows) {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Construct a sqlfluff command, optionally wrapped in a shell.
///
/// On unix the child leads its own process group so [`kill_process_tree`] also
/// reaches whatever a wrapping shell started.
pub fn make_command(executable: &str, args: &[String], shell: &ShellSetting) -> Command {
    let mut cmd = base_command(executable, args, shell);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd
}

/// Kill `child` and, on unix, every process in the group it leads.
pub fn kill_process_tree(child: &mut Child) -> std::io::Result<()> {
    if let Ok(Some(_)) = child.try_wait() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
            // SAFETY: kill(2) takes plain integers. A negative pid targets a group.
            if unsafe { libc::kill(-pgid, libc::SIGKILL) } == 0 {
                return Ok(());
            }
            debug!("no process group {}, killing the child alone", pgid);
        }
    }
    child.kill()
}

fn base_command(executable: &str, args: &[String], shell: &ShellSetting) -> Command {
    let shell_program = match shell {
        ShellSetting::Enabled(false) => None,
        ShellSetting::Enabled(true) => Some(if cfg!(windows) {
            "cmd".to_string()
        } else {
            "/bin/sh".to_string()
        }),
        ShellSetting::Program(program) if program.is_empty() => None,
        ShellSetting::Program(program) => Some(program.clone()),
    };

    match shell_program {
        None => {
            let mut cmd = Command::new(executable);
            cmd.args(args);
            cmd
        }
        Some(program) => {
            let line = std::iter::once(executable.to_string())
                .chain(args.iter().map(|a| shell_quote(a)))
                .collect::<Vec<_>>()
                .join(" ");
            let mut cmd = Command::new(&program);
            if cfg!(windows) && program.to_ascii_lowercase().ends_with("cmd") {
                cmd.arg("/C");
            } else {
                cmd.arg("-c");
            }
            cmd.arg(line);
            cmd
        }
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Environment overlay for a sqlfluff child: settings variables, then `.env` files.
///
/// `.env` entries never override variables already set in the process environment
/// or by the settings overlay.
pub fn build_environment(
    settings: &Settings,
    vars: &Variables,
    cwd: Option<&Path>,
) -> Vec<(String, String)> {
    let mut overlay: Vec<(String, String)> = settings
        .environment_variables
        .iter()
        .chain(settings.env.environment_variables.iter())
        .map(|v| (v.key.clone(), v.value.clone()))
        .collect();

    let mut files: Vec<PathBuf> = Vec::new();
    if settings.env.use_dot_env_file {
        if let Some(dir) = cwd {
            files.push(dir.join(".env"));
        }
    }
    for custom in &settings.env.custom_dot_env_files {
        let path = PathBuf::from(vars.interpolate(custom));
        match (path.is_relative(), cwd) {
            (true, Some(dir)) => files.push(dir.join(path)),
            _ => files.push(path),
        }
    }

    let mut from_files: HashMap<String, String> = HashMap::new();
    for file in files {
        match dotenvy::from_path_iter(&file) {
            Ok(iter) => {
                for item in iter {
                    match item {
                        Ok((key, value)) => {
                            from_files.entry(key).or_insert(value);
                        }
                        Err(e) => warn!("skipping malformed entry in {}: {}", file.display(), e),
                    }
                }
            }
            Err(e) => debug!("no .env file at {}: {}", file.display(), e),
        }
    }

    let mut keys: Vec<String> = from_files.keys().cloned().collect();
    keys.sort();
    for key in keys {
        let already_set =
            std::env::var_os(&key).is_some() || overlay.iter().any(|(k, _)| *k == key);
        if !already_set {
            if let Some(value) = from_files.remove(&key) {
                overlay.push((key, value));
            }
        }
    }
    overlay
}

// ============================================================================
// Version Probing
// ============================================================================

/// Run `<executable> --version` and parse the result.
pub fn probe_version(
    executable: &str,
    shell: &ShellSetting,
    cwd: Option<&Path>,
    env: &[(String, String)],
) -> Result<ToolVersion> {
    let mut cmd = make_command(executable, &["--version".to_string()], shell);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null());
    let output = cmd
        .output()
        .with_context(|| format!("failed to run {} --version", executable))?;
    let text = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    ToolVersion::parse(&text)
        .ok_or_else(|| anyhow!("unrecognised version output: {}", text.trim()))
}

// ============================================================================
// Tests
// ============================================================================
