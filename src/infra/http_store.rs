//! [`BlobStore`] backed by an HTTP blob service.
//!
//! Protocol: `GET {base}/{key}` (optionally with `If-None-Match`) answers
//! `200` with an `ETag`, `304` or `404`; `PUT {base}/{key}` stores the body and
//! answers with the new `ETag`.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, ETAG, IF_NONE_MATCH};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use tracing::debug;

use crate::cache::{BlobRead, BlobStore, StoreError, content_version};
use crate::config::StoreSettings;

use super::error::InfraError;

#[derive(Debug, Clone)]
pub struct HttpBlobStore {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpBlobStore {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self, InfraError> {
        let mut base = Url::parse(base_url)
            .map_err(|err| InfraError::configuration(format!("invalid store url: {err}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::http(err.to_string()))?;

        Ok(Self {
            client,
            base,
            token,
        })
    }

    pub fn from_settings(settings: &StoreSettings) -> Result<Self, InfraError> {
        let url = settings
            .url
            .as_deref()
            .ok_or_else(|| InfraError::configuration("store.url is required"))?;
        Self::new(url, settings.token.clone(), settings.timeout)
    }

    fn url(&self, key: &str) -> Result<Url, StoreError> {
        self.base
            .join(key)
            .map_err(|err| StoreError::transient(format!("invalid store key `{key}`: {err}")))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

pub(crate) fn user_agent() -> &'static str {
    concat!("artifact-cache/", env!("CARGO_PKG_VERSION"))
}

fn transport_error(error: reqwest::Error) -> StoreError {
    if error.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::transient(error.to_string())
    }
}

fn etag_or_digest(response: &reqwest::Response, data: &[u8]) -> String {
    response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| content_version(data))
}

#[async_trait]
impl BlobStore for HttpBlobStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn get_with_metadata(
        &self,
        key: &str,
        if_none_match: Option<&str>,
    ) -> Result<BlobRead, StoreError> {
        let mut request = self.authorized(self.client.get(self.url(key)?));
        if let Some(version) = if_none_match {
            request = request.header(IF_NONE_MATCH, version);
        }

        let response = request.send().await.map_err(transport_error)?;
        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(BlobRead::Unchanged),
            StatusCode::NOT_FOUND => Ok(BlobRead::NotFound),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let data = response.bytes().await.map_err(transport_error)?;
                let version = etag.unwrap_or_else(|| content_version(&data));
                Ok(BlobRead::Found { data, version })
            }
            status => {
                debug!(cache = "store", backend = "http", key, %status, "store rejected read");
                Err(StoreError::Rejected {
                    status: status.as_u16(),
                })
            }
        }
    }

    async fn set(&self, key: &str, data: Bytes) -> Result<String, StoreError> {
        let request = self
            .authorized(self.client.put(self.url(key)?))
            .header(CONTENT_TYPE, "application/json")
            .body(data.clone());

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            debug!(cache = "store", backend = "http", key, %status, "store rejected write");
            return Err(StoreError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(etag_or_digest(&response, &data))
    }
}
