//! CDN purge over HTTP: `POST {url}` with `{"cache_tags": [...]}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::debug;

use crate::cache::{CacheError, CdnPurger, NoopPurger};
use crate::config::PurgeSettings;

use super::error::InfraError;
use super::http_store::user_agent;

#[derive(Debug, Serialize)]
struct PurgeRequest<'a> {
    cache_tags: &'a [String],
}

#[derive(Debug, Clone)]
pub struct HttpPurger {
    client: Client,
    url: Url,
    token: Option<String>,
}

impl HttpPurger {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self, InfraError> {
        let url = Url::parse(url)
            .map_err(|err| InfraError::configuration(format!("invalid purge url: {err}")))?;
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::http(err.to_string()))?;
        Ok(Self { client, url, token })
    }
}

/// Purger for `settings`: HTTP when a URL is configured, otherwise a no-op.
pub fn build_purger(
    settings: &PurgeSettings,
    timeout: Duration,
) -> Result<Arc<dyn CdnPurger>, InfraError> {
    match settings.url.as_deref() {
        Some(url) => Ok(Arc::new(HttpPurger::new(url, settings.token.clone(), timeout)?)),
        None => Ok(Arc::new(NoopPurger)),
    }
}

#[async_trait]
impl CdnPurger for HttpPurger {
    async fn purge(&self, tags: &[String]) -> Result<(), CacheError> {
        if tags.is_empty() {
            return Ok(());
        }

        let mut request = self
            .client
            .post(self.url.clone())
            .json(&PurgeRequest { cache_tags: tags });
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| CacheError::purge(tags, err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::purge(tags, format!("status {status}")));
        }

        debug!(cache = "purge", count = tags.len(), "purged tags");
        Ok(())
    }
}
