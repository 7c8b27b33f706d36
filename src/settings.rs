//! Editor-supplied settings for sqlfluff_ls.
//!
//! Settings arrive as JSON through `initializationOptions` and
//! `workspace/didChangeConfiguration`, shaped like the `sqlfluff.*` namespace of
//! the editor configuration. Every field has a default so partial objects parse.

use anyhow::{Context, Result};
use lsp_types::DiagnosticSeverity;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};

use crate::constants::{
    DEFAULT_DBT_INTERFACE_HOST, DEFAULT_DBT_INTERFACE_PORT, DEFAULT_LINT_DELAY_MS,
    DEFAULT_REMOTE_TIMEOUT_MS,
};
use crate::process::ToolVersion;

// ============================================================================
// Enumerated Settings
// ============================================================================

/// When linting fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunTrigger {
    #[default]
    OnType,
    OnSave,
    Off,
}

/// Configurable diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Hint,
    Information,
}

impl Severity {
    pub fn to_lsp(self) -> DiagnosticSeverity {
        match self {
            Severity::Error => DiagnosticSeverity::ERROR,
            Severity::Warning => DiagnosticSeverity::WARNING,
            Severity::Hint => DiagnosticSeverity::HINT,
            Severity::Information => DiagnosticSeverity::INFORMATION,
        }
    }
}

/// `shell`: `false`, `true` (platform shell) or an explicit shell program.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ShellSetting {
    Enabled(bool),
    Program(String),
}

impl Default for ShellSetting {
    fn default() -> Self {
        ShellSetting::Enabled(false)
    }
}

/// `codeActions.noqa`: `false` disables noqa fixes, a list names rules that never get one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum NoqaSetting {
    Enabled(bool),
    DisabledRules(Vec<String>),
}

impl Default for NoqaSetting {
    fn default() -> Self {
        NoqaSetting::DisabledRules(
            [
                "L015", "L017", "L019", "L030", "L032", "L034", "L035", "L037", "L038", "L040",
                "L041", "L042", "L043", "L044", "L054", "L058", "L063", "L064",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }
}

// ============================================================================
// Nested Settings Groups
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct EnvironmentVariable {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnvSettings {
    pub environment_variables: Vec<EnvironmentVariable>,
    pub custom_dot_env_files: Vec<String>,
    pub use_dot_env_file: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuleSeverity {
    pub rule: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LinterSettings {
    pub arguments: Vec<String>,
    pub run: RunTrigger,
    pub delay: u64,
    pub diagnostic_severity: Severity,
    pub diagnostic_severity_by_rule: Vec<RuleSeverity>,
    pub lint_entire_project: bool,
    pub languages: Vec<String>,
}

impl Default for LinterSettings {
    fn default() -> Self {
        Self {
            arguments: Vec::new(),
            run: RunTrigger::OnType,
            delay: DEFAULT_LINT_DELAY_MS,
            diagnostic_severity: Severity::Error,
            diagnostic_severity_by_rule: Vec::new(),
            lint_entire_project: false,
            languages: default_languages(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormatLanguageSettings {
    pub language: String,
    pub context_menu_format_options: bool,
    pub preserve_leading_whitespace: bool,
}

/// An entry of `format.languages`: either a bare language id or detailed settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FormatLanguage {
    Name(String),
    Detailed(FormatLanguageSettings),
}

impl FormatLanguage {
    pub fn language(&self) -> &str {
        match self {
            FormatLanguage::Name(name) => name,
            FormatLanguage::Detailed(settings) => &settings.language,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormatSettings {
    pub enabled: bool,
    pub arguments: Vec<String>,
    pub languages: Vec<FormatLanguage>,
}

impl Default for FormatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            arguments: Vec::new(),
            languages: default_languages()
                .into_iter()
                .map(FormatLanguage::Name)
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentalFormatSettings {
    pub execute_in_terminal: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentalSettings {
    pub format: ExperimentalFormatSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExcludeRulesActions {
    pub workspace: bool,
    pub global: bool,
}

impl Default for ExcludeRulesActions {
    fn default() -> Self {
        Self {
            workspace: true,
            global: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CodeActionSettings {
    pub exclude_rules: ExcludeRulesActions,
    pub noqa: NoqaSetting,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DbtInterfaceSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
}

impl Default for DbtInterfaceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: DEFAULT_DBT_INTERFACE_HOST.to_string(),
            port: DEFAULT_DBT_INTERFACE_PORT,
            timeout_ms: DEFAULT_REMOTE_TIMEOUT_MS,
        }
    }
}

fn default_languages() -> Vec<String> {
    vec!["sql".into(), "jinja-sql".into(), "sql-bigquery".into()]
}

// ============================================================================
// Settings
// ============================================================================

/// All tunables consumed by the invoker, scheduler and formatter.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub executable_path: String,
    pub config: String,
    pub dialect: Option<String>,
    pub exclude_rules: Vec<String>,
    pub rules: Vec<String>,
    pub ignore_local_config: bool,
    pub ignore_parsing: bool,
    pub working_directory: String,
    pub shell: ShellSetting,
    pub suppress_notifications: bool,
    /// Deprecated top-level variant of `env.environmentVariables`.
    pub environment_variables: Vec<EnvironmentVariable>,
    pub env: EnvSettings,
    pub linter: LinterSettings,
    pub format: FormatSettings,
    pub experimental: ExperimentalSettings,
    pub code_actions: CodeActionSettings,
    pub dbt_interface: DbtInterfaceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            executable_path: "sqlfluff".to_string(),
            config: String::new(),
            dialect: None,
            exclude_rules: Vec::new(),
            rules: Vec::new(),
            ignore_local_config: false,
            ignore_parsing: false,
            working_directory: String::new(),
            shell: ShellSetting::default(),
            suppress_notifications: false,
            environment_variables: Vec::new(),
            env: EnvSettings::default(),
            linter: LinterSettings::default(),
            format: FormatSettings::default(),
            experimental: ExperimentalSettings::default(),
            code_actions: CodeActionSettings::default(),
            dbt_interface: DbtInterfaceSettings::default(),
        }
    }
}

impl Settings {
    /// Parse settings from an LSP payload: either `{"sqlfluff": {...}}` or the bare object.
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        let section = match value {
            JsonValue::Null => return Ok(Self::default()),
            JsonValue::Object(map) => map.get("sqlfluff").unwrap_or(value),
            _ => value,
        };
        serde_json::from_value(section.clone()).context("invalid sqlfluff settings")
    }

    pub fn executable_path(&self, vars: &Variables) -> String {
        vars.interpolate(&self.executable_path)
    }

    pub fn config_path(&self, vars: &Variables) -> String {
        vars.interpolate(&self.config)
    }

    /// Interpolated `workingDirectory`, falling back to the workspace root.
    pub fn working_directory(&self, vars: &Variables) -> Option<PathBuf> {
        let dir = vars.interpolate(&self.working_directory);
        if dir.is_empty() {
            vars.workspace_folder.as_ref().map(PathBuf::from)
        } else {
            Some(PathBuf::from(dir))
        }
    }

    /// Arguments appended to every sqlfluff invocation.
    pub fn extra_arguments(&self, vars: &Variables) -> Vec<String> {
        let mut args = Vec::new();
        let config = self.config_path(vars);
        if !config.is_empty() {
            args.push("--config".to_string());
            args.push(config);
        }
        if let Some(dialect) = self.dialect.as_deref().filter(|d| !d.is_empty()) {
            args.push("--dialect".to_string());
            args.push(dialect.to_string());
        }
        if !self.exclude_rules.is_empty() {
            args.push("--exclude-rules".to_string());
            args.push(self.exclude_rules.join(","));
        }
        if self.ignore_local_config {
            args.push("--ignore-local-config".to_string());
        }
        if self.ignore_parsing {
            args.push("--ignore".to_string());
            args.push("parsing".to_string());
        }
        if !self.rules.is_empty() {
            args.push("--rules".to_string());
            args.push(self.rules.join(","));
        }
        args
    }

    pub fn lint_file_arguments(&self) -> Vec<String> {
        let mut args = self.linter.arguments.clone();
        args.push("--format".to_string());
        args.push("json".to_string());
        args
    }

    /// Fix arguments; `--force` is added for tool versions that still need it.
    pub fn format_file_arguments(&self, version: Option<&ToolVersion>) -> Vec<String> {
        let mut args = self.format.arguments.clone();
        let force_deprecated = version.is_some_and(ToolVersion::is_force_deprecated);
        if !force_deprecated && !args.iter().any(|a| a == "--force") {
            args.push("--force".to_string());
        }
        args
    }

    /// Severity for a rule code, falling back to the default severity.
    pub fn severity_for(&self, code: &str) -> DiagnosticSeverity {
        self.linter
            .diagnostic_severity_by_rule
            .iter()
            .find(|setting| setting.rule == code)
            .map(|setting| setting.severity)
            .unwrap_or(self.linter.diagnostic_severity)
            .to_lsp()
    }

    pub fn lints_language(&self, language_id: &str) -> bool {
        self.linter.languages.iter().any(|l| l == language_id)
    }

    pub fn formats_language(&self, language_id: &str) -> bool {
        self.format
            .languages
            .iter()
            .any(|l| l.language() == language_id)
    }

    /// Detailed format settings for a language, if configured in object form.
    pub fn format_language(&self, language_id: &str) -> Option<&FormatLanguageSettings> {
        self.format.languages.iter().find_map(|l| match l {
            FormatLanguage::Detailed(settings) if settings.language == language_id => {
                Some(settings)
            }
            _ => None,
        })
    }

    pub fn noqa_enabled(&self) -> bool {
        !matches!(self.code_actions.noqa, NoqaSetting::Enabled(false))
    }

    pub fn noqa_disabled_rules(&self) -> &[String] {
        match &self.code_actions.noqa {
            NoqaSetting::DisabledRules(rules) => rules,
            NoqaSetting::Enabled(_) => &[],
        }
    }

    /// Add a rule to `excludeRules`, keeping the list unique and ordered.
    /// Returns false if the rule was already excluded.
    pub fn exclude_rule(&mut self, rule: &str) -> bool {
        if self.exclude_rules.iter().any(|r| r == rule) {
            return false;
        }
        self.exclude_rules.push(rule.to_string());
        self.exclude_rules.sort_by_key(|r| rule_sort_key(r));
        true
    }
}

/// Sort key for rule codes such as `L015` or `CP01`: alphabetic prefix, then number.
fn rule_sort_key(rule: &str) -> (String, u32, String) {
    let prefix: String = rule.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    let digits: String = rule[prefix.len()..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    (prefix, digits.parse().unwrap_or(u32::MAX), rule.to_string())
}

// ============================================================================
// Variable Interpolation
// ============================================================================

/// Values available to `${name}` placeholders in path-like settings.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    pub user_home: Option<String>,
    pub workspace_folder: Option<String>,
    pub workspace_folder_basename: Option<String>,
    pub exec_path: Option<String>,
}

impl Variables {
    pub fn for_workspace(root: Option<&Path>) -> Self {
        let workspace_folder = root.map(|r| normalize_path(&r.display().to_string()));
        let workspace_folder_basename = root
            .and_then(|r| r.file_name())
            .map(|n| n.to_string_lossy().into_owned());
        Self {
            user_home: std::env::var("HOME")
                .or_else(|_| std::env::var("USERPROFILE"))
                .ok(),
            workspace_folder,
            workspace_folder_basename,
            exec_path: std::env::current_exe()
                .ok()
                .map(|p| p.display().to_string()),
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        match name {
            "userHome" => self.user_home.as_deref(),
            "workspaceFolder" => self.workspace_folder.as_deref(),
            "workspaceFolderBasename" => self.workspace_folder_basename.as_deref(),
            "execPath" => self.exec_path.as_deref(),
            _ => None,
        }
    }

    /// Replace known `${name}` placeholders; unknown or unset ones are left untouched.
    pub fn interpolate(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find('}') {
                Some(end) => {
                    let name = &after[..end];
                    match self.lookup(name) {
                        Some(value) => out.push_str(value),
                        None => out.push_str(&rest[start..start + 2 + end + 1]),
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Settings together with the variables used to interpolate them.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub settings: Settings,
    pub vars: Variables,
}

impl Config {
    pub fn new(settings: Settings, vars: Variables) -> Self {
        Self { settings, vars }
    }

    pub fn working_directory(&self) -> Option<PathBuf> {
        self.settings
            .working_directory(&self.vars)
            .map(|p| PathBuf::from(normalize_path(&p.display().to_string())))
    }

    pub fn executable_path(&self) -> String {
        self.settings.executable_path(&self.vars)
    }
}

/// Convert backslash separators to forward slashes.
pub fn normalize_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut in_run = false;
    for c in path.chars() {
        if c == '\\' {
            if !in_run {
                out.push('/');
            }
            in_run = true;
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}
