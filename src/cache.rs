use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::context::EvaluationContext;
use crate::flag::BulkEntry;

/// Storage for the result of one bulk evaluation, bound to the context it was
/// evaluated with.
#[async_trait]
pub trait Cache {
    async fn get(&self, key: &str) -> Result<Option<BulkEntry>, Box<dyn std::error::Error + Send + Sync>>;
    async fn get_all(&self) -> Result<Vec<BulkEntry>, Box<dyn std::error::Error + Send + Sync>>;
    async fn refresh(
        &mut self,
        context: &EvaluationContext,
        flags: Vec<BulkEntry>,
        etag: Option<String>,
        ttl_secs: i64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    /// Keeps the current entries for another `ttl_secs` (server answered 304).
    async fn extend(&mut self, ttl_secs: i64) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn should_refresh_cache(&self, context: &EvaluationContext) -> bool;
    /// ETag of the cached set, only if it was evaluated with `context`.
    async fn etag_for(&self, context: &EvaluationContext) -> Option<String>;
    async fn init(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pub struct MemoryCache {
    flags: HashMap<String, BulkEntry>,
    context: Option<EvaluationContext>,
    etag: Option<String>,
    next_refresh: DateTime<Utc>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            flags: HashMap::new(),
            context: None,
            etag: None,
            next_refresh: Utc::now() - chrono::Duration::seconds(90),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// `now + ttl_secs`, or an error when that instant cannot be represented.
pub fn refresh_deadline(ttl_secs: i64) -> Result<DateTime<Utc>, Box<dyn std::error::Error + Send + Sync>> {
    chrono::Duration::try_seconds(ttl_secs)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| format!("cache TTL of {} seconds is out of range", ttl_secs).into())
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<BulkEntry>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.flags.get(key).cloned())
    }

    async fn get_all(&self) -> Result<Vec<BulkEntry>, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.flags.values().cloned().collect())
    }

    async fn refresh(
        &mut self,
        context: &EvaluationContext,
        flags: Vec<BulkEntry>,
        etag: Option<String>,
        ttl_secs: i64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let next_refresh = refresh_deadline(ttl_secs)?;
        self.flags.clear();

        for flag in flags {
            match flag.key() {
                Some(key) => {
                    let key = key.to_string();
                    self.flags.insert(key, flag);
                }
                None => return Err("bulk entry without a flag key".into()),
            }
        }

        self.context = Some(context.clone());
        self.etag = etag;
        self.next_refresh = next_refresh;

        Ok(())
    }

    async fn extend(&mut self, ttl_secs: i64) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.context.is_none() {
            return Err("nothing cached to extend".into());
        }
        self.next_refresh = refresh_deadline(ttl_secs)?;
        Ok(())
    }

    async fn should_refresh_cache(&self, context: &EvaluationContext) -> bool {
        match &self.context {
            Some(cached) if cached == context => Utc::now() > self.next_refresh,
            _ => true,
        }
    }

    async fn etag_for(&self, context: &EvaluationContext) -> Option<String> {
        match &self.context {
            Some(cached) if cached == context => self.etag.clone(),
            _ => None,
        }
    }

    async fn init(&mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.flags.clear();
        self.context = None;
        self.etag = None;
        self.next_refresh = Utc::now() - chrono::Duration::seconds(90);
        Ok(())
    }
}
