//! dbt-core-interface client.
//!
//! An alternate backend for lint and format: instead of spawning sqlfluff, SQL is
//! posted to a long-running dbt-core-interface server. Every call is preceded by a
//! short `/health` probe so a missing or still-loading server fails fast.

use log::{debug, warn};
use reqwest::blocking::Client;
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::constants::{millis_to_duration, HEALTH_CHECK_TIMEOUT_MS};
use crate::settings::DbtInterfaceSettings;

// ============================================================================
// Error Codes
// ============================================================================

/// Application-level error codes embedded in dbt-core-interface responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorCode {
    FailedToReachServer,
    CompileSqlFailure,
    ExecuteSqlFailure,
    ProjectParseFailure,
    Other(i64),
}

impl RemoteErrorCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            -1 => RemoteErrorCode::FailedToReachServer,
            1 => RemoteErrorCode::CompileSqlFailure,
            2 => RemoteErrorCode::ExecuteSqlFailure,
            3 => RemoteErrorCode::ProjectParseFailure,
            other => RemoteErrorCode::Other(other),
        }
    }

    pub fn code(self) -> i64 {
        match self {
            RemoteErrorCode::FailedToReachServer => -1,
            RemoteErrorCode::CompileSqlFailure => 1,
            RemoteErrorCode::ExecuteSqlFailure => 2,
            RemoteErrorCode::ProjectParseFailure => 3,
            RemoteErrorCode::Other(code) => code,
        }
    }
}

/// Structured error from the remote service (or synthesised when it can't be reached).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
    pub detail: Option<String>,
}

impl RemoteError {
    fn failed_to_reach(base: &str) -> Self {
        Self {
            code: RemoteErrorCode::FailedToReachServer,
            message: "Query failed to reach dbt sync server.".to_string(),
            detail: Some(format!("Is the server listening on the {base} address?")),
        }
    }

    fn not_registered() -> Self {
        Self {
            code: RemoteErrorCode::FailedToReachServer,
            message: "Dbt project not registered in the dbt-core-interface server.".to_string(),
            detail: Some("Wait for its loading process to finish".to_string()),
        }
    }

    /// Text shown to the user: message plus detail, one per line.
    pub fn user_message(&self) -> String {
        match &self.detail {
            Some(detail) if !detail.is_empty() => format!("{}\n{}", self.message, detail),
            _ => self.message.clone(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.code(), self.user_message())
    }
}

impl std::error::Error for RemoteError {}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: HashMap<String, JsonValue>,
}

impl From<ErrorBody> for RemoteError {
    fn from(body: ErrorBody) -> Self {
        let detail = body.data.get("error").map(|v| match v {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        });
        Self {
            code: RemoteErrorCode::from_code(body.code),
            message: body.message,
            detail,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LintBody {
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct FormatBody {
    #[serde(default)]
    sql: Option<String>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

// ============================================================================
// Client
// ============================================================================

/// One lint or format request against dbt-core-interface.
#[derive(Debug, Clone, Default)]
pub struct RemoteRequest<'a> {
    /// SQL posted as the request body (buffer mode).
    pub sql: Option<&'a str>,
    /// Path sent as `sql_path` when no body is posted.
    pub sql_path: Option<&'a str>,
    /// Sent as `extra_config_path` when non-empty.
    pub extra_config_path: &'a str,
}

pub struct DbtInterface {
    host: String,
    port: u16,
    timeout: Duration,
}

impl DbtInterface {
    pub fn new(settings: &DbtInterfaceSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            timeout: millis_to_duration(settings.timeout_ms),
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn endpoint_url(&self, endpoint: &str, request: &RemoteRequest<'_>) -> Option<Url> {
        let mut params: Vec<(&str, &str)> = Vec::new();
        if request.sql.is_none() {
            if let Some(path) = request.sql_path {
                params.push(("sql_path", path));
            }
        }
        if !request.extra_config_path.is_empty() {
            params.push(("extra_config_path", request.extra_config_path));
        }
        Url::parse_with_params(&format!("{}/{}", self.base_url(), endpoint), &params).ok()
    }

    pub fn lint_url(&self, request: &RemoteRequest<'_>) -> Option<Url> {
        self.endpoint_url("lint", request)
    }

    pub fn format_url(&self, request: &RemoteRequest<'_>) -> Option<Url> {
        self.endpoint_url("format", request)
    }

    /// `GET /health` with a short timeout; healthy only on HTTP 200.
    pub fn health_check(&self) -> bool {
        let client = match Client::builder()
            .timeout(millis_to_duration(HEALTH_CHECK_TIMEOUT_MS))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to build health check client: {}", e);
                return false;
            }
        };
        match client.get(format!("{}/health", self.base_url())).send() {
            Ok(response) => response.status().as_u16() == 200,
            Err(e) => {
                debug!("dbt-core-interface health check failed: {}", e);
                false
            }
        }
    }

    fn post(&self, url: Url, body: Option<&str>) -> Result<String, RemoteError> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|_| RemoteError::failed_to_reach(&self.base_url()))?;
        let mut builder = client.post(url);
        if let Some(sql) = body {
            builder = builder.body(sql.to_string());
        }
        builder
            .send()
            .and_then(|r| r.text())
            .map_err(|e| {
                warn!("dbt-core-interface request failed: {}", e);
                RemoteError::failed_to_reach(&self.base_url())
            })
    }

    /// Lint via `/lint`, returning the raw violation array on success.
    pub fn lint(&self, request: &RemoteRequest<'_>) -> Result<JsonValue, RemoteError> {
        if !self.health_check() {
            return Err(RemoteError::not_registered());
        }
        let url = self
            .lint_url(request)
            .ok_or_else(|| RemoteError::failed_to_reach(&self.base_url()))?;
        let text = self.post(url, request.sql)?;
        let body: LintBody = serde_json::from_str(&text).map_err(|e| {
            warn!("unparseable /lint response: {}", e);
            RemoteError::failed_to_reach(&self.base_url())
        })?;
        match body.error {
            Some(error) if error.code != 0 => Err(error.into()),
            _ => Ok(body.result.unwrap_or_else(|| JsonValue::Array(Vec::new()))),
        }
    }

    /// Format via `/format`, returning the rewritten SQL (None if the server sent none).
    pub fn format(&self, request: &RemoteRequest<'_>) -> Result<Option<String>, RemoteError> {
        if !self.health_check() {
            return Err(RemoteError::not_registered());
        }
        let url = self
            .format_url(request)
            .ok_or_else(|| RemoteError::failed_to_reach(&self.base_url()))?;
        let text = self.post(url, request.sql)?;
        let body: FormatBody = serde_json::from_str(&text).map_err(|e| {
            warn!("unparseable /format response: {}", e);
            RemoteError::failed_to_reach(&self.base_url())
        })?;
        match body.error {
            Some(error) if error.code != 0 => Err(error.into()),
            _ => Ok(body.sql),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn interface() -> DbtInterface {
        DbtInterface::new(&DbtInterfaceSettings::default())
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(RemoteErrorCode::from_code(-1), RemoteErrorCode::FailedToReachServer);
        assert_eq!(RemoteErrorCode::from_code(1), RemoteErrorCode::CompileSqlFailure);
        assert_eq!(RemoteErrorCode::from_code(3).code(), 3);
        assert_eq!(RemoteErrorCode::from_code(42), RemoteErrorCode::Other(42));
    }

    #[test]
    fn test_lint_url_for_path_and_buffer() {
        let dbt = interface();
        let by_path = dbt
            .lint_url(&RemoteRequest {
                sql: None,
                sql_path: Some("models/my model.sql"),
                extra_config_path: "",
            })
            .unwrap();
        assert_eq!(by_path.path(), "/lint");
        assert_eq!(by_path.query(), Some("sql_path=models%2Fmy+model.sql"));

        let by_body = dbt
            .lint_url(&RemoteRequest {
                sql: Some("select 1"),
                sql_path: Some("models/a.sql"),
                extra_config_path: ".sqlfluff",
            })
            .unwrap();
        assert_eq!(by_body.query(), Some("extra_config_path=.sqlfluff"));
    }

    #[test]
    fn test_error_body_detail() {
        let body: ErrorBody = serde_json::from_str(
            r#"{"code": 1, "message": "Compile failed", "data": {"error": "missing ref"}}"#,
        )
        .unwrap();
        let err: RemoteError = body.into();
        assert_eq!(err.code, RemoteErrorCode::CompileSqlFailure);
        assert_eq!(err.user_message(), "Compile failed\nmissing ref");
    }

    #[test]
    fn test_unreachable_server_is_unhealthy() {
        let dbt = DbtInterface::new(&DbtInterfaceSettings {
            host: "127.0.0.1".into(),
            port: 9,
            ..DbtInterfaceSettings::default()
        });
        assert!(!dbt.health_check());
        let err = dbt.lint(&RemoteRequest::default()).unwrap_err();
        assert_eq!(err.code, RemoteErrorCode::FailedToReachServer);
    }
}
