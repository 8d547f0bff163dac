//! Store key encoding and tag derivation.
//!
//! Resource identifiers are arbitrary strings; the durable store accepts a
//! restricted alphabet. Every identifier is mapped into `[A-Za-z0-9_-]` with a
//! scheme marker so that the mapping stays injective:
//!
//! - `b<base64url>` for identifiers whose encoding fits [`MAX_SEGMENT_LEN`]
//! - `h<sha256 hex>` for longer identifiers

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

use super::entry::EntryKind;

/// Prefix of implicit (path-derived) tags.
pub const IMPLICIT_TAG_PREFIX: &str = "_N_T_";

/// Response header carrying a comma-separated list of explicit tags.
pub const CACHE_TAGS_HEADER: &str = "x-next-cache-tags";

const MAX_SEGMENT_LEN: usize = 400;
const ENTRIES_DIR: &str = "entries";
const TAGS_DIR: &str = "tags";

/// Encode one identifier into the store alphabet.
pub fn encode_segment(raw: &str) -> String {
    let encoded = URL_SAFE_NO_PAD.encode(raw.as_bytes());
    if encoded.len() < MAX_SEGMENT_LEN {
        format!("b{encoded}")
    } else {
        format!("h{}", hex::encode(Sha256::digest(raw.as_bytes())))
    }
}

/// Store key of the artifact stored for `key`.
pub fn entry_store_key(namespace: Option<&str>, key: &str) -> String {
    scoped(namespace, ENTRIES_DIR, key)
}

/// Store key of the manifest record for `tag`.
pub fn tag_store_key(namespace: Option<&str>, tag: &str) -> String {
    scoped(namespace, TAGS_DIR, tag)
}

fn scoped(namespace: Option<&str>, dir: &str, raw: &str) -> String {
    match namespace {
        Some(namespace) => format!("ns{}/{dir}/{}", encode_segment(namespace), encode_segment(raw)),
        None => format!("{dir}/{}", encode_segment(raw)),
    }
}

/// Default tag of a resource, so that every entry can be revalidated.
pub fn default_tag(key: &str) -> String {
    format!("{IMPLICIT_TAG_PREFIX}{key}")
}

/// Implicit tags of a request path: every enclosing layout plus the path itself.
///
/// `/blog/post-1` yields `_N_T_/layout`, `_N_T_/blog/layout`,
/// `_N_T_/blog/post-1/layout` and `_N_T_/blog/post-1`.
pub fn derived_tags(pathname: &str) -> Vec<String> {
    let mut derived = vec!["/layout".to_string()];

    if pathname.starts_with('/') {
        let segments: Vec<&str> = pathname.split('/').collect();
        for end in 1..=segments.len() {
            let mut current = segments[..end].join("/");
            if current.is_empty() {
                continue;
            }
            if !current.ends_with("/page") && !current.ends_with("/route") {
                if !current.ends_with('/') {
                    current.push('/');
                }
                current.push_str("layout");
            }
            derived.push(current);
        }
    }

    let mut tags: Vec<String> = derived
        .into_iter()
        .map(|tag| format!("{IMPLICIT_TAG_PREFIX}{tag}"))
        .collect();
    let own = default_tag(pathname);
    if !tags.contains(&own) {
        tags.push(own);
    }
    tags.dedup();
    tags
}

/// Tags listed in the [`CACHE_TAGS_HEADER`] header, header name matched case-insensitively.
pub fn header_tags(headers: &BTreeMap<String, String>) -> Vec<String> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case(CACHE_TAGS_HEADER))
        .flat_map(|(_, value)| value.split(','))
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(str::to_string)
        .collect()
}

/// Full tag set of an entry.
///
/// Rendered kinds always carry their default tag. Fetch entries fall back to
/// the default tag only when nothing explicit was supplied.
pub fn entry_tags<I>(
    key: &str,
    kind: EntryKind,
    headers: &BTreeMap<String, String>,
    explicit: I,
) -> BTreeSet<String>
where
    I: IntoIterator<Item = String>,
{
    let mut tags: BTreeSet<String> = explicit
        .into_iter()
        .filter(|tag| !tag.is_empty())
        .collect();
    tags.extend(header_tags(headers));

    if kind != EntryKind::Fetch || tags.is_empty() {
        tags.insert(default_tag(key));
    }
    tags
}
