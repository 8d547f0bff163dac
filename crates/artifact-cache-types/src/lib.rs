//! Wire records persisted in the artifact cache's durable store.
//!
//! Every artifact is stored as a [`StoredRecord`]: the write timestamp plus a
//! kind-tagged [`StoredValue`]. Binary bodies travel as standard base64 strings.
//! Tag revalidations are stored separately as [`TagManifestRecord`]s.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reserved `last_modified` value marking a record as known-stale.
pub const LAST_MODIFIED_STALE: i64 = -1;

/// Kind tags understood by this version of the wire format.
pub const KNOWN_KINDS: &[&str] = &["ROUTE", "APP_ROUTE", "PAGE", "APP_PAGE", "FETCH"];

/// Returns true if `kind` names a variant of [`StoredValue`].
pub fn is_known_kind(kind: &str) -> bool {
    KNOWN_KINDS.contains(&kind)
}

/// Envelope written for every artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    /// Epoch milliseconds assigned when the record was written.
    pub last_modified: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revalidate: Option<Revalidate>,
    /// Explicit tags supplied by the writer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub value: StoredValue,
}

/// Kind-tagged payload of a stored artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoredValue {
    #[serde(alias = "APP_ROUTE")]
    Route(StoredRoute),
    Page(StoredPage),
    AppPage(StoredAppPage),
    Fetch(StoredFetch),
}

impl StoredValue {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Route(_) => "ROUTE",
            Self::Page(_) => "PAGE",
            Self::AppPage(_) => "APP_PAGE",
            Self::Fetch(_) => "FETCH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRoute {
    /// Base64 response body.
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub status: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPage {
    pub html: String,
    #[serde(default)]
    pub page_data: serde_json::Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredAppPage {
    pub html: String,
    /// Base64 serialized component tree.
    pub rsc_data: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFetch {
    /// Base64 body returned by the data fetch.
    pub body: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub status: u16,
    #[serde(default)]
    pub url: String,
}

/// One record per tag, written on every revalidation of that tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagManifestRecord {
    pub tag: String,
    /// Epoch milliseconds of the latest revalidation.
    pub revalidated_at: i64,
}

/// Freshness window of an artifact: seconds, or `false` for tag-only invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revalidate {
    After(u32),
    Never,
}

impl Serialize for Revalidate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::After(seconds) => serializer.serialize_u32(*seconds),
            Self::Never => serializer.serialize_bool(false),
        }
    }
}

impl<'de> Deserialize<'de> for Revalidate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Seconds(u32),
            Flag(bool),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Seconds(seconds) => Ok(Self::After(seconds)),
            Raw::Flag(false) => Ok(Self::Never),
            Raw::Flag(true) => Err(serde::de::Error::custom(
                "revalidate must be a number of seconds or `false`",
            )),
        }
    }
}
