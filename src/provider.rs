use async_trait::async_trait;

use crate::context::EvaluationContext;
use crate::flag::ResolutionDetails;
use crate::FlagError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub name: String,
}

/// Source of flag values behind a [`crate::Client`].
#[async_trait]
pub trait FeatureProvider: Send + Sync {
    fn metadata(&self) -> ProviderMetadata;

    async fn resolve(
        &self,
        flag_key: &str,
        context: &EvaluationContext,
    ) -> Result<ResolutionDetails, FlagError>;
}

/// Installed until a real provider is set; every evaluation reports
/// `PROVIDER_NOT_READY`.
#[derive(Debug, Default)]
pub struct NoopProvider;

#[async_trait]
impl FeatureProvider for NoopProvider {
    fn metadata(&self) -> ProviderMetadata {
        ProviderMetadata {
            name: "No-op Provider".to_string(),
        }
    }

    async fn resolve(
        &self,
        _flag_key: &str,
        _context: &EvaluationContext,
    ) -> Result<ResolutionDetails, FlagError> {
        Err(FlagError::NotReady)
    }
}
