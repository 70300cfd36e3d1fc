use std::collections::HashMap;
use std::sync::Arc;

use log::error;

use crate::api;
use crate::context::EvaluationContext;
use crate::flag::{EvaluationDetails, FromFlagValue, Reason};
use crate::provider::{FeatureProvider, ProviderMetadata};
use crate::FlagError;

enum Binding {
    /// Looks up the registered provider on every evaluation.
    Registry(Option<String>),
    Fixed(Arc<dyn FeatureProvider>),
}

/// Typed flag evaluation over a provider.
///
/// Clients from [`api::get_client`] follow whatever provider is registered at
/// evaluation time; [`Client::new`] pins one provider and ignores the
/// API-level context.
///
/// The `get_*_value` methods never fail: on any error they log it and return
/// the default. Use the `get_*_details` methods to see what went wrong.
pub struct Client {
    binding: Binding,
    context: EvaluationContext,
}

impl Client {
    pub fn new(provider: Arc<dyn FeatureProvider>) -> Self {
        Self {
            binding: Binding::Fixed(provider),
            context: EvaluationContext::default(),
        }
    }

    pub(crate) fn registered(domain: Option<String>) -> Self {
        Self {
            binding: Binding::Registry(domain),
            context: EvaluationContext::default(),
        }
    }

    pub fn domain(&self) -> Option<&str> {
        match &self.binding {
            Binding::Registry(domain) => domain.as_deref(),
            Binding::Fixed(_) => None,
        }
    }

    /// Client-level context, merged beneath each invocation's context.
    pub fn with_context(mut self, context: EvaluationContext) -> Self {
        self.context = context;
        self
    }

    pub fn context(&self) -> &EvaluationContext {
        &self.context
    }

    pub fn provider_metadata(&self) -> ProviderMetadata {
        self.provider().metadata()
    }

    pub async fn get_boolean_value(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &EvaluationContext,
    ) -> bool {
        self.get_boolean_details(flag_key, default_value, context).await.value
    }

    pub async fn get_integer_value(
        &self,
        flag_key: &str,
        default_value: i64,
        context: &EvaluationContext,
    ) -> i64 {
        self.get_integer_details(flag_key, default_value, context).await.value
    }

    pub async fn get_float_value(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &EvaluationContext,
    ) -> f64 {
        self.get_float_details(flag_key, default_value, context).await.value
    }

    pub async fn get_string_value(
        &self,
        flag_key: &str,
        default_value: impl Into<String>,
        context: &EvaluationContext,
    ) -> String {
        self.get_string_details(flag_key, default_value, context).await.value
    }

    pub async fn get_object_value(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        context: &EvaluationContext,
    ) -> serde_json::Value {
        self.get_object_details(flag_key, default_value, context).await.value
    }

    pub async fn get_boolean_details(
        &self,
        flag_key: &str,
        default_value: bool,
        context: &EvaluationContext,
    ) -> EvaluationDetails<bool> {
        self.evaluate(flag_key, default_value, context).await
    }

    pub async fn get_integer_details(
        &self,
        flag_key: &str,
        default_value: i64,
        context: &EvaluationContext,
    ) -> EvaluationDetails<i64> {
        self.evaluate(flag_key, default_value, context).await
    }

    pub async fn get_float_details(
        &self,
        flag_key: &str,
        default_value: f64,
        context: &EvaluationContext,
    ) -> EvaluationDetails<f64> {
        self.evaluate(flag_key, default_value, context).await
    }

    pub async fn get_string_details(
        &self,
        flag_key: &str,
        default_value: impl Into<String>,
        context: &EvaluationContext,
    ) -> EvaluationDetails<String> {
        self.evaluate(flag_key, default_value.into(), context).await
    }

    pub async fn get_object_details(
        &self,
        flag_key: &str,
        default_value: serde_json::Value,
        context: &EvaluationContext,
    ) -> EvaluationDetails<serde_json::Value> {
        self.evaluate(flag_key, default_value, context).await
    }

    fn provider(&self) -> Arc<dyn FeatureProvider> {
        match &self.binding {
            Binding::Registry(domain) => api::provider_for(domain.as_deref()),
            Binding::Fixed(provider) => Arc::clone(provider),
        }
    }

    fn effective_context(&self, invocation: &EvaluationContext) -> EvaluationContext {
        let base = match &self.binding {
            Binding::Registry(_) => api::evaluation_context(),
            Binding::Fixed(_) => EvaluationContext::default(),
        };
        base.merge(&self.context).merge(invocation)
    }

    async fn evaluate<T: FromFlagValue>(
        &self,
        flag_key: &str,
        default_value: T,
        context: &EvaluationContext,
    ) -> EvaluationDetails<T> {
        let provider = self.provider();
        let context = self.effective_context(context);

        let result = provider
            .resolve(flag_key, &context)
            .await
            .and_then(|resolution| match T::from_flag_value(&resolution.value) {
                Some(value) => Ok((value, resolution)),
                None => Err(FlagError::TypeMismatch(format!(
                    "flag '{}' resolved to a {} value",
                    flag_key,
                    resolution.value.type_name()
                ))),
            });

        match result {
            Ok((value, resolution)) => EvaluationDetails {
                flag_key: flag_key.to_string(),
                value,
                variant: resolution.variant,
                reason: resolution.reason,
                error_code: None,
                error_message: None,
                flag_metadata: resolution.flag_metadata,
            },
            Err(e) => {
                error!("Failed to evaluate flag {}: {}", flag_key, e);
                EvaluationDetails {
                    flag_key: flag_key.to_string(),
                    value: default_value,
                    variant: None,
                    reason: Reason::Error,
                    error_code: Some(e.error_code()),
                    error_message: Some(e.to_string()),
                    flag_metadata: HashMap::new(),
                }
            }
        }
    }
}
