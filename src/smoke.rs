//! Smoke checks against a running flag server.
//!
//! Each [`Check`] evaluates one flag and compares the result with a literal.
//! Checks run in order and the first failure stops the run.
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use crate::api;
use crate::client::Client;
use crate::context::EvaluationContext;
use crate::flag::{ErrorCode, EvaluationDetails, FlagValue};
use crate::{FlagError, OfrepProvider};

const DEFAULT_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Error)]
pub enum SmokeError {
    #[error("{key}: expected {expected}, got {actual}")]
    Mismatch {
        key: String,
        actual: FlagValue,
        expected: FlagValue,
    },

    #[error("{key}: evaluation failed ({code}): {message}")]
    Evaluation {
        key: String,
        code: ErrorCode,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] FlagError),

    #[error("Output error: {0}")]
    Output(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Check {
    pub key: String,
    pub default: FlagValue,
    pub expected: FlagValue,
}

impl Check {
    pub fn new(key: &str, default: impl Into<FlagValue>, expected: impl Into<FlagValue>) -> Self {
        Self {
            key: key.to_string(),
            default: default.into(),
            expected: expected.into(),
        }
    }

    pub fn boolean(key: &str, default: bool, expected: bool) -> Self {
        Self::new(key, default, expected)
    }

    pub fn integer(key: &str, default: i64, expected: i64) -> Self {
        Self::new(key, default, expected)
    }

    pub fn string(key: &str, default: &str, expected: &str) -> Self {
        Self::new(key, default, expected)
    }
}

pub fn default_checks() -> Vec<Check> {
    vec![
        Check::boolean("FF-feature-y", false, true),
        Check::integer("FF-api-timeout", 2000, 5000),
        Check::string("FF-log-level", "info", "debug"),
    ]
}

pub fn default_context() -> EvaluationContext {
    EvaluationContext::new().with_attribute("countryCode", "nl")
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SmokeReport {
    pub passed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Option<Duration>,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            timeout: None,
        }
    }
}

impl SmokeConfig {
    /// Reads `OFREP_BASE_URL`, `OFREP_TOKEN` and `OFREP_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, FlagError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FlagError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let timeout = match non_empty("OFREP_TIMEOUT_MS") {
            Some(raw) => {
                let millis = raw
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|millis| *millis > 0)
                    .ok_or_else(|| {
                        FlagError::ConfigError(format!(
                            "OFREP_TIMEOUT_MS must be a positive number of milliseconds, got '{}'",
                            raw
                        ))
                    })?;
                Some(Duration::from_millis(millis))
            }
            None => None,
        };

        Ok(Self {
            base_url: non_empty("OFREP_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            token: non_empty("OFREP_TOKEN"),
            timeout,
        })
    }

    pub fn build_provider(&self) -> Result<OfrepProvider, FlagError> {
        let mut builder = OfrepProvider::builder().with_base_url(&self.base_url);
        if let Some(token) = &self.token {
            builder = builder.with_token(token);
        }
        if let Some(timeout) = self.timeout {
            builder = builder.with_timeout(timeout);
        }
        builder.build()
    }
}

/// Registers an OFREP provider for `config` as the global default and runs
/// the default checks through the unnamed client.
pub async fn run<W: Write>(config: &SmokeConfig, out: &mut W) -> Result<SmokeReport, SmokeError> {
    let provider = config.build_provider()?;
    debug!("{}", provider.debug_info());
    api::set_provider(Arc::new(provider));

    let client = api::get_client();
    run_checks(&client, &default_context(), &default_checks(), out).await
}

pub async fn run_checks<W: Write>(
    client: &Client,
    context: &EvaluationContext,
    checks: &[Check],
    out: &mut W,
) -> Result<SmokeReport, SmokeError> {
    let mut report = SmokeReport::default();

    for check in checks {
        let details = evaluate(client, check, context).await;

        if let Some(code) = details.error_code {
            return Err(SmokeError::Evaluation {
                key: check.key.clone(),
                code,
                message: details.error_message.unwrap_or_default(),
            });
        }

        if details.value != check.expected {
            return Err(SmokeError::Mismatch {
                key: check.key.clone(),
                actual: details.value,
                expected: check.expected.clone(),
            });
        }

        if context.is_empty() {
            writeln!(out, "PASS {} == {}", check.key, details.value)?;
        } else {
            writeln!(out, "PASS {}({}) == {}", check.key, context.summary(), details.value)?;
        }
        info!("{} passed with reason {}", check.key, details.reason);
        report.passed.push(check.key.clone());
    }

    Ok(report)
}

async fn evaluate(client: &Client, check: &Check, context: &EvaluationContext) -> EvaluationDetails<FlagValue> {
    let key = check.key.as_str();
    match &check.default {
        FlagValue::Bool(default) => client
            .get_boolean_details(key, *default, context)
            .await
            .map(FlagValue::Bool),
        FlagValue::Int(default) => client
            .get_integer_details(key, *default, context)
            .await
            .map(FlagValue::Int),
        FlagValue::Float(default) => client
            .get_float_details(key, *default, context)
            .await
            .map(FlagValue::Float),
        FlagValue::Str(default) => client
            .get_string_details(key, default.as_str(), context)
            .await
            .map(FlagValue::Str),
        FlagValue::Object(default) => client
            .get_object_details(key, default.clone(), context)
            .await
            .map(FlagValue::Object),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::TcpListener;

    use serial_test::serial;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn mount_flag(server: &MockServer, key: &str, value: serde_json::Value, hits: u64) {
        Mock::given(method("POST"))
            .and(path(format!("/ofrep/v1/evaluate/flags/{}", key)))
            .and(body_json(serde_json::json!({"context": {"countryCode": "nl"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "key": key,
                "reason": "TARGETING_MATCH",
                "variant": value.to_string(),
                "value": value,
                "metadata": {}
            })))
            .expect(hits)
            .mount(server)
            .await;
    }

    fn client_for(server: &MockServer) -> Client {
        let provider = OfrepProvider::builder()
            .with_base_url(&server.uri())
            .build()
            .unwrap();
        Client::new(Arc::new(provider))
    }

    #[tokio::test]
    async fn test_default_checks_pass() {
        let server = MockServer::start().await;
        mount_flag(&server, "FF-feature-y", serde_json::json!(true), 1).await;
        mount_flag(&server, "FF-api-timeout", serde_json::json!(5000), 1).await;
        mount_flag(&server, "FF-log-level", serde_json::json!("debug"), 1).await;

        let mut out = Vec::new();
        let report = run_checks(&client_for(&server), &default_context(), &default_checks(), &mut out)
            .await
            .unwrap();

        assert_eq!(report.passed, vec!["FF-feature-y", "FF-api-timeout", "FF-log-level"]);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "PASS FF-feature-y(countryCode=nl) == true\n\
             PASS FF-api-timeout(countryCode=nl) == 5000\n\
             PASS FF-log-level(countryCode=nl) == debug\n"
        );
    }

    #[tokio::test]
    async fn test_mismatch_stops_remaining_checks() {
        let server = MockServer::start().await;
        mount_flag(&server, "FF-feature-y", serde_json::json!(true), 1).await;
        mount_flag(&server, "FF-api-timeout", serde_json::json!(2000), 1).await;
        mount_flag(&server, "FF-log-level", serde_json::json!("debug"), 0).await;

        let mut out = Vec::new();
        let err = run_checks(&client_for(&server), &default_context(), &default_checks(), &mut out)
            .await
            .unwrap_err();

        match &err {
            SmokeError::Mismatch { key, actual, expected } => {
                assert_eq!(key, "FF-api-timeout");
                assert_eq!(actual, &FlagValue::Int(2000));
                assert_eq!(expected, &FlagValue::Int(5000));
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(err.to_string(), "FF-api-timeout: expected 5000, got 2000");
        assert_eq!(String::from_utf8(out).unwrap(), "PASS FF-feature-y(countryCode=nl) == true\n");
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_before_any_pass() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let provider = OfrepProvider::builder()
            .with_base_url(&format!("http://127.0.0.1:{}", port))
            .with_timeout(Duration::from_secs(2))
            .build()
            .unwrap();
        let client = Client::new(Arc::new(provider));

        let mut out = Vec::new();
        let err = run_checks(&client, &default_context(), &default_checks(), &mut out)
            .await
            .unwrap_err();

        match err {
            SmokeError::Evaluation { key, code, .. } => {
                assert_eq!(key, "FF-feature-y");
                assert_eq!(code, ErrorCode::General);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_type_mismatch_is_reported_as_evaluation_error() {
        let server = MockServer::start().await;
        mount_flag(&server, "FF-feature-y", serde_json::json!("yes"), 1).await;

        let mut out = Vec::new();
        let checks = vec![Check::boolean("FF-feature-y", false, true)];
        let err = run_checks(&client_for(&server), &default_context(), &checks, &mut out)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SmokeError::Evaluation { code: ErrorCode::TypeMismatch, .. }
        ));
    }

    #[tokio::test]
    async fn test_repeat_runs_print_the_same_lines() {
        let server = MockServer::start().await;
        mount_flag(&server, "FF-feature-y", serde_json::json!(true), 2).await;

        let client = client_for(&server);
        let checks = vec![Check::boolean("FF-feature-y", false, true)];

        let mut first = Vec::new();
        let mut second = Vec::new();
        run_checks(&client, &default_context(), &checks, &mut first).await.unwrap();
        run_checks(&client, &default_context(), &checks, &mut second).await.unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    #[serial]
    async fn test_run_registers_global_provider() {
        let server = MockServer::start().await;
        mount_flag(&server, "FF-feature-y", serde_json::json!(true), 1).await;
        mount_flag(&server, "FF-api-timeout", serde_json::json!(5000), 1).await;
        mount_flag(&server, "FF-log-level", serde_json::json!("debug"), 1).await;

        let config = SmokeConfig {
            base_url: server.uri(),
            ..SmokeConfig::default()
        };

        let mut out = Vec::new();
        let report = run(&config, &mut out).await.unwrap();

        assert_eq!(report.passed.len(), 3);
        assert_eq!(api::provider_metadata().name, "OFREP Provider");
        api::shutdown();
    }

    #[test]
    fn test_config_defaults() {
        let config = SmokeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, SmokeConfig::default());
        assert_eq!(config.base_url, "http://localhost:8080");
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OFREP_BASE_URL", "http://flags.internal:9000"),
            ("OFREP_TOKEN", "rt_global_abc123"),
            ("OFREP_TIMEOUT_MS", "1500"),
        ]);

        let config = SmokeConfig::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();

        assert_eq!(config.base_url, "http://flags.internal:9000");
        assert_eq!(config.token.as_deref(), Some("rt_global_abc123"));
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert!(config.build_provider().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_timeout() {
        for raw in ["soon", "0", "-10"] {
            let result = SmokeConfig::from_lookup(|name| match name {
                "OFREP_TIMEOUT_MS" => Some(raw.to_string()),
                _ => None,
            });
            assert!(matches!(result, Err(FlagError::ConfigError(_))), "accepted {}", raw);
        }
    }

    #[tokio::test]
    async fn test_pass_line_without_context() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ofrep/v1/evaluate/flags/FF-feature-y"))
            .and(body_json(serde_json::json!({"context": {}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "key": "FF-feature-y",
                "value": true
            })))
            .mount(&server)
            .await;

        let mut out = Vec::new();
        let checks = vec![Check::boolean("FF-feature-y", false, true)];
        run_checks(&client_for(&server), &EvaluationContext::new(), &checks, &mut out)
            .await
            .unwrap();

        assert_eq!(String::from_utf8(out).unwrap(), "PASS FF-feature-y == true\n");
    }

    #[test]
    fn test_custom_check_list() {
        let checks = vec![Check::new("FF-ratio", 0.5, 0.75)];
        assert_eq!(checks[0].default, FlagValue::Float(0.5));
        assert_eq!(default_checks().len(), 3);
    }
}
