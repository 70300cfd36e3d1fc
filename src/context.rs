use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Attributes the server uses to compute a flag's value.
///
/// Serialises as one flat JSON object, with the targeting key under
/// `targetingKey`. Attributes are kept sorted so summaries are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    #[serde(rename = "targetingKey", default, skip_serializing_if = "Option::is_none")]
    pub targeting_key: Option<String>,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_targeting_key(mut self, targeting_key: impl Into<String>) -> Self {
        self.targeting_key = Some(targeting_key.into());
        self
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&serde_json::Value> {
        self.attributes.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.targeting_key.is_none() && self.attributes.is_empty()
    }

    /// Layers `other` over `self`. Keys present in both take `other`'s value.
    pub fn merge(&self, other: &EvaluationContext) -> EvaluationContext {
        let mut merged = self.clone();
        if other.targeting_key.is_some() {
            merged.targeting_key = other.targeting_key.clone();
        }
        for (key, value) in &other.attributes {
            merged.attributes.insert(key.clone(), value.clone());
        }
        merged
    }

    /// `key=value` pairs joined with `,`, e.g. `countryCode=nl`.
    pub fn summary(&self) -> String {
        let mut parts = Vec::with_capacity(self.attributes.len() + 1);
        if let Some(targeting_key) = &self.targeting_key {
            parts.push(format!("targetingKey={}", targeting_key));
        }
        for (key, value) in &self.attributes {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            parts.push(format!("{}={}", key, rendered));
        }
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialises_flat() {
        let ctx = EvaluationContext::new()
            .with_targeting_key("user-1")
            .with_attribute("countryCode", "nl")
            .with_attribute("age", 42);

        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"targetingKey": "user-1", "countryCode": "nl", "age": 42})
        );
    }

    #[test]
    fn test_empty_context_serialises_to_empty_object() {
        let json = serde_json::to_value(EvaluationContext::new()).unwrap();
        assert_eq!(json, serde_json::json!({}));
    }

    #[test]
    fn test_merge_prefers_other() {
        let base = EvaluationContext::new()
            .with_targeting_key("base")
            .with_attribute("countryCode", "de")
            .with_attribute("tier", "free");
        let invocation = EvaluationContext::new().with_attribute("countryCode", "nl");

        let merged = base.merge(&invocation);

        assert_eq!(merged.targeting_key.as_deref(), Some("base"));
        assert_eq!(merged.attribute("countryCode"), Some(&serde_json::json!("nl")));
        assert_eq!(merged.attribute("tier"), Some(&serde_json::json!("free")));
    }

    #[test]
    fn test_is_empty() {
        assert!(EvaluationContext::new().is_empty());
        assert!(!EvaluationContext::new().with_targeting_key("user-1").is_empty());
        assert!(!EvaluationContext::new().with_attribute("countryCode", "nl").is_empty());
    }

    #[test]
    fn test_summary() {
        let ctx = EvaluationContext::new()
            .with_attribute("countryCode", "nl")
            .with_attribute("beta", true);
        assert_eq!(ctx.summary(), "beta=true,countryCode=nl");
        assert_eq!(EvaluationContext::new().summary(), "");
    }
}
