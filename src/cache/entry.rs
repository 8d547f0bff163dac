//! Cache entry data model.
//!
//! A [`CacheEntry`] is an immutable value: the write time is assigned once when
//! it is created for a store write, and revalidation always produces a new entry.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use time::OffsetDateTime;

pub use artifact_cache_types::{LAST_MODIFIED_STALE, Revalidate};

use super::keys;

/// Payload shape of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Route handler response (`ROUTE`/`APP_ROUTE`).
    Route,
    Page,
    AppPage,
    Fetch,
}

impl EntryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Route => "ROUTE",
            Self::Page => "PAGE",
            Self::AppPage => "APP_PAGE",
            Self::Fetch => "FETCH",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific body of an artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactBody {
    Route {
        body: Bytes,
        status: u16,
    },
    Page {
        html: String,
        page_data: serde_json::Value,
        status: Option<u16>,
    },
    AppPage {
        html: String,
        rsc_data: Bytes,
        status: Option<u16>,
    },
    Fetch {
        body: Bytes,
        status: u16,
        url: String,
    },
}

impl ArtifactBody {
    pub fn kind(&self) -> EntryKind {
        match self {
            Self::Route { .. } => EntryKind::Route,
            Self::Page { .. } => EntryKind::Page,
            Self::AppPage { .. } => EntryKind::AppPage,
            Self::Fetch { .. } => EntryKind::Fetch,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Route { status, .. } | Self::Fetch { status, .. } => Some(*status),
            Self::Page { status, .. } | Self::AppPage { status, .. } => *status,
        }
    }
}

/// Freshly rendered output handed to `set`, before a write time exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub body: ArtifactBody,
    pub headers: BTreeMap<String, String>,
    pub revalidate: Option<Revalidate>,
}

impl Artifact {
    pub fn new(body: ArtifactBody) -> Self {
        Self {
            body,
            headers: BTreeMap::new(),
            revalidate: None,
        }
    }

    pub fn route(body: impl Into<Bytes>, status: u16) -> Self {
        Self::new(ArtifactBody::Route {
            body: body.into(),
            status,
        })
    }

    pub fn page(html: impl Into<String>, page_data: serde_json::Value) -> Self {
        Self::new(ArtifactBody::Page {
            html: html.into(),
            page_data,
            status: None,
        })
    }

    pub fn fetch(body: impl Into<Bytes>, status: u16, url: impl Into<String>) -> Self {
        Self::new(ArtifactBody::Fetch {
            body: body.into(),
            status,
            url: url.into(),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_revalidate(mut self, revalidate: Revalidate) -> Self {
        self.revalidate = Some(revalidate);
        self
    }
}

/// Stored unit of the artifact cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    key: String,
    body: ArtifactBody,
    headers: BTreeMap<String, String>,
    revalidate: Option<Revalidate>,
    last_modified: i64,
    tags: BTreeSet<String>,
}

impl CacheEntry {
    /// Build an entry; its tag set is derived from `explicit_tags`, headers and key.
    pub fn new<I>(key: impl Into<String>, artifact: Artifact, last_modified: i64, explicit_tags: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let key = key.into();
        let tags = keys::entry_tags(&key, artifact.body.kind(), &artifact.headers, explicit_tags);
        Self {
            key,
            body: artifact.body,
            headers: artifact.headers,
            revalidate: artifact.revalidate,
            last_modified,
            tags,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> EntryKind {
        self.body.kind()
    }

    pub fn body(&self) -> &ArtifactBody {
        &self.body
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn status(&self) -> Option<u16> {
        self.body.status()
    }

    pub fn revalidate(&self) -> Option<Revalidate> {
        self.revalidate
    }

    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    /// True when the stored record carried the known-stale sentinel.
    pub fn is_marked_stale(&self) -> bool {
        self.last_modified == LAST_MODIFIED_STALE
    }

    /// True when the time-based freshness window has elapsed at `now_ms`.
    ///
    /// A window ending past the representable range counts as elapsed.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        match self.revalidate {
            Some(Revalidate::After(seconds)) => i64::from(seconds)
                .checked_mul(1_000)
                .and_then(|window| self.last_modified.checked_add(window))
                .is_none_or(|deadline| deadline <= now_ms),
            Some(Revalidate::Never) | None => false,
        }
    }
}

/// Whether a returned entry may be served as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    /// Usable, but the caller must trigger an asynchronous refresh.
    Stale,
}

/// Result of a successful `get`.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: Arc<CacheEntry>,
    pub freshness: Freshness,
}

impl CacheHit {
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }

    /// Age of a fresh entry at `now_ms`; stale entries report no age.
    pub fn age(&self, now_ms: i64) -> Option<Duration> {
        if self.is_stale() || self.entry.is_marked_stale() {
            return None;
        }
        let millis = now_ms.saturating_sub(self.entry.last_modified()).max(0);
        Some(Duration::from_millis(millis.unsigned_abs()))
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}
