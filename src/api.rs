//! Process-wide provider registration.
//!
//! Until [`set_provider`] is called every client evaluates against a
//! [`NoopProvider`] and gets its defaults back with `PROVIDER_NOT_READY`.
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use log::info;

use crate::client::Client;
use crate::context::EvaluationContext;
use crate::provider::{FeatureProvider, NoopProvider, ProviderMetadata};

struct Registry {
    default: Arc<dyn FeatureProvider>,
    domains: HashMap<String, Arc<dyn FeatureProvider>>,
    context: EvaluationContext,
}

impl Registry {
    fn new() -> Self {
        Self {
            default: Arc::new(NoopProvider),
            domains: HashMap::new(),
            context: EvaluationContext::default(),
        }
    }
}

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| RwLock::new(Registry::new()));

pub fn set_provider(provider: Arc<dyn FeatureProvider>) {
    info!("Registered default provider: {}", provider.metadata().name);
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    registry.default = provider;
}

pub fn set_provider_for(domain: &str, provider: Arc<dyn FeatureProvider>) {
    info!("Registered provider for domain {}: {}", domain, provider.metadata().name);
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    registry.domains.insert(domain.to_string(), provider);
}

pub fn provider_metadata() -> ProviderMetadata {
    provider_for(None).metadata()
}

/// API-level context, merged beneath client and invocation contexts.
pub fn set_evaluation_context(context: EvaluationContext) {
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    registry.context = context;
}

pub fn evaluation_context() -> EvaluationContext {
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    registry.context.clone()
}

pub fn get_client() -> Client {
    Client::registered(None)
}

/// A client for `domain`. Falls back to the default provider while no
/// provider is bound to the domain.
pub fn get_client_for(domain: &str) -> Client {
    Client::registered(Some(domain.to_string()))
}

/// Drops every registration and the API-level context.
pub fn shutdown() {
    let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
    *registry = Registry::new();
}

pub(crate) fn provider_for(domain: Option<&str>) -> Arc<dyn FeatureProvider> {
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    domain
        .and_then(|d| registry.domains.get(d))
        .unwrap_or(&registry.default)
        .clone()
}
