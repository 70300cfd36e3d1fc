// src/flag.rs
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::EvaluationContext;

/// A resolved flag value as the server returned it.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Object(serde_json::Value),
}

impl FlagValue {
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Bool(b) => FlagValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => FlagValue::Int(i),
                None => n
                    .as_f64()
                    .map(FlagValue::Float)
                    .unwrap_or(FlagValue::Object(serde_json::Value::Number(n))),
            },
            serde_json::Value::String(s) => FlagValue::Str(s),
            other => FlagValue::Object(other),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            FlagValue::Bool(_) => "boolean",
            FlagValue::Int(_) => "integer",
            FlagValue::Float(_) => "float",
            FlagValue::Str(_) => "string",
            FlagValue::Object(_) => "object",
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(b) => write!(f, "{}", b),
            FlagValue::Int(i) => write!(f, "{}", i),
            FlagValue::Float(x) => write!(f, "{}", x),
            FlagValue::Str(s) => write!(f, "{}", s),
            FlagValue::Object(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        FlagValue::Bool(value)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        FlagValue::Int(value)
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> Self {
        FlagValue::Float(value)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        FlagValue::Str(value.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        FlagValue::Str(value)
    }
}

/// Conversion from a resolved value into the type a typed getter asked for.
pub trait FromFlagValue: Sized {
    fn from_flag_value(value: &FlagValue) -> Option<Self>;
}

impl FromFlagValue for bool {
    fn from_flag_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromFlagValue for i64 {
    fn from_flag_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl FromFlagValue for f64 {
    fn from_flag_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::Float(x) => Some(*x),
            FlagValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl FromFlagValue for String {
    fn from_flag_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromFlagValue for serde_json::Value {
    fn from_flag_value(value: &FlagValue) -> Option<Self> {
        match value {
            FlagValue::Object(v) if v.is_object() || v.is_array() => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromFlagValue for FlagValue {
    fn from_flag_value(value: &FlagValue) -> Option<Self> {
        Some(value.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Reason {
    Static,
    Default,
    TargetingMatch,
    Split,
    Cached,
    Disabled,
    Unknown,
    Error,
    Other(String),
}

impl From<String> for Reason {
    fn from(value: String) -> Self {
        match value.as_str() {
            "STATIC" => Reason::Static,
            "DEFAULT" => Reason::Default,
            "TARGETING_MATCH" => Reason::TargetingMatch,
            "SPLIT" => Reason::Split,
            "CACHED" => Reason::Cached,
            "DISABLED" => Reason::Disabled,
            "UNKNOWN" => Reason::Unknown,
            "ERROR" => Reason::Error,
            _ => Reason::Other(value),
        }
    }
}

impl From<Reason> for String {
    fn from(value: Reason) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Reason::Static => "STATIC",
            Reason::Default => "DEFAULT",
            Reason::TargetingMatch => "TARGETING_MATCH",
            Reason::Split => "SPLIT",
            Reason::Cached => "CACHED",
            Reason::Disabled => "DISABLED",
            Reason::Unknown => "UNKNOWN",
            Reason::Error => "ERROR",
            Reason::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

/// Error codes shared by the OFREP wire format and evaluation details.
/// Unrecognised codes collapse into `General`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    ProviderNotReady,
    FlagNotFound,
    ParseError,
    TypeMismatch,
    TargetingKeyMissing,
    InvalidContext,
    General,
}

impl From<String> for ErrorCode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "PROVIDER_NOT_READY" => ErrorCode::ProviderNotReady,
            "FLAG_NOT_FOUND" => ErrorCode::FlagNotFound,
            "PARSE_ERROR" => ErrorCode::ParseError,
            "TYPE_MISMATCH" => ErrorCode::TypeMismatch,
            "TARGETING_KEY_MISSING" => ErrorCode::TargetingKeyMissing,
            "INVALID_CONTEXT" => ErrorCode::InvalidContext,
            _ => ErrorCode::General,
        }
    }
}

impl From<ErrorCode> for String {
    fn from(value: ErrorCode) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::ProviderNotReady => "PROVIDER_NOT_READY",
            ErrorCode::FlagNotFound => "FLAG_NOT_FOUND",
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::TypeMismatch => "TYPE_MISMATCH",
            ErrorCode::TargetingKeyMissing => "TARGETING_KEY_MISSING",
            ErrorCode::InvalidContext => "INVALID_CONTEXT",
            ErrorCode::General => "GENERAL",
        };
        f.write_str(s)
    }
}

/// Body of both OFREP evaluation endpoints.
#[derive(Debug, Serialize)]
pub struct EvaluationRequest<'a> {
    pub context: &'a EvaluationContext,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluationSuccess {
    pub key: String,
    #[serde(default)]
    pub reason: Option<Reason>,
    #[serde(default)]
    pub variant: Option<String>,
    pub value: serde_json::Value,
    #[serde(default)]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationFailure {
    #[serde(default)]
    pub key: Option<String>,
    pub error_code: ErrorCode,
    #[serde(default)]
    pub error_details: Option<String>,
}

/// One element of a bulk evaluation. Failures are tried first since only
/// they carry `errorCode`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BulkEntry {
    Failure(EvaluationFailure),
    Success(EvaluationSuccess),
}

impl BulkEntry {
    pub fn key(&self) -> Option<&str> {
        match self {
            BulkEntry::Failure(f) => f.key.as_deref(),
            BulkEntry::Success(s) => Some(s.key.as_str()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkEvaluationResponse {
    #[serde(default)]
    pub flags: Vec<BulkEntry>,
}

/// What a provider hands back for one flag, before type conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionDetails {
    pub value: FlagValue,
    pub variant: Option<String>,
    pub reason: Reason,
    pub flag_metadata: HashMap<String, serde_json::Value>,
}

impl From<EvaluationSuccess> for ResolutionDetails {
    fn from(success: EvaluationSuccess) -> Self {
        ResolutionDetails {
            value: FlagValue::from_json(success.value),
            variant: success.variant,
            reason: success.reason.unwrap_or(Reason::Unknown),
            flag_metadata: success.metadata.unwrap_or_default(),
        }
    }
}

/// Outcome of a typed evaluation. On error `value` holds the caller's default.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationDetails<T> {
    pub flag_key: String,
    pub value: T,
    pub variant: Option<String>,
    pub reason: Reason,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub flag_metadata: HashMap<String, serde_json::Value>,
}

impl<T> EvaluationDetails<T> {
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> EvaluationDetails<U> {
        EvaluationDetails {
            flag_key: self.flag_key,
            value: f(self.value),
            variant: self.variant,
            reason: self.reason,
            error_code: self.error_code,
            error_message: self.error_message,
            flag_metadata: self.flag_metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_body() {
        let body = serde_json::json!({
            "key": "FF-api-timeout",
            "reason": "TARGETING_MATCH",
            "variant": "5000",
            "value": 5000,
            "metadata": {}
        });

        let success: EvaluationSuccess = serde_json::from_value(body).unwrap();
        let details = ResolutionDetails::from(success);

        assert_eq!(details.value, FlagValue::Int(5000));
        assert_eq!(details.reason, Reason::TargetingMatch);
        assert_eq!(details.variant.as_deref(), Some("5000"));
        assert!(details.flag_metadata.is_empty());
    }

    #[test]
    fn test_success_body_without_optional_fields() {
        let body = serde_json::json!({"key": "FF-log-level", "value": "debug"});

        let details = ResolutionDetails::from(serde_json::from_value::<EvaluationSuccess>(body).unwrap());

        assert_eq!(details.value, FlagValue::Str("debug".to_string()));
        assert_eq!(details.reason, Reason::Unknown);
        assert_eq!(details.variant, None);
    }

    #[test]
    fn test_failure_body() {
        let body = serde_json::json!({
            "key": "missing",
            "errorCode": "FLAG_NOT_FOUND",
            "errorDetails": "Flag 'missing' was not found"
        });

        let failure: EvaluationFailure = serde_json::from_value(body).unwrap();
        assert_eq!(failure.error_code, ErrorCode::FlagNotFound);
        assert_eq!(failure.error_details.as_deref(), Some("Flag 'missing' was not found"));
    }

    #[test]
    fn test_unknown_codes_and_reasons() {
        let code: ErrorCode = serde_json::from_value(serde_json::json!("SOMETHING_NEW")).unwrap();
        assert_eq!(code, ErrorCode::General);

        let reason: Reason = serde_json::from_value(serde_json::json!("EXPERIMENT")).unwrap();
        assert_eq!(reason, Reason::Other("EXPERIMENT".to_string()));
        assert_eq!(reason.to_string(), "EXPERIMENT");
    }

    #[test]
    fn test_bulk_body_mixes_successes_and_failures() {
        let body = serde_json::json!({
            "flags": [
                {"key": "FF-feature-y", "reason": "DEFAULT", "variant": "true", "value": true, "metadata": {}},
                {"key": "broken", "errorCode": "PARSE_ERROR", "errorDetails": "bad rule"}
            ]
        });

        let bulk: BulkEvaluationResponse = serde_json::from_value(body).unwrap();
        assert_eq!(bulk.flags.len(), 2);
        assert!(matches!(bulk.flags[0], BulkEntry::Success(_)));
        assert!(matches!(bulk.flags[1], BulkEntry::Failure(_)));
        assert_eq!(bulk.flags[1].key(), Some("broken"));
    }

    #[test]
    fn test_numbers_keep_integer_and_float_apart() {
        assert_eq!(FlagValue::from_json(serde_json::json!(2000)), FlagValue::Int(2000));
        assert_eq!(FlagValue::from_json(serde_json::json!(0.25)), FlagValue::Float(0.25));

        assert_eq!(i64::from_flag_value(&FlagValue::Float(1.5)), None);
        assert_eq!(f64::from_flag_value(&FlagValue::Int(3)), Some(3.0));
    }

    #[test]
    fn test_object_conversion_rejects_scalars() {
        let obj = FlagValue::from_json(serde_json::json!({"a": 1}));
        assert!(serde_json::Value::from_flag_value(&obj).is_some());

        let null = FlagValue::from_json(serde_json::Value::Null);
        assert!(serde_json::Value::from_flag_value(&null).is_none());
    }
}
