//! CDN purge seam.

use async_trait::async_trait;
use tracing::debug;

use super::error::CacheError;

/// Edge cache purge by tag. Calls are tracked as background work, never
/// awaited inline.
#[async_trait]
pub trait CdnPurger: Send + Sync {
    async fn purge(&self, tags: &[String]) -> Result<(), CacheError>;
}

/// Purger used when no CDN is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPurger;

#[async_trait]
impl CdnPurger for NoopPurger {
    async fn purge(&self, tags: &[String]) -> Result<(), CacheError> {
        debug!(cache = "purge", ?tags, "no purge endpoint configured; skipping");
        Ok(())
    }
}
