//! Incremental artifact cache.
//!
//! Stores rendered artifacts in a durable blob store and answers repeat
//! requests without re-rendering:
//!
//! - **Per-request memo**: read-your-own-writes and in-flight deduplication
//!   inside one request ([`MemoCache`]).
//! - **Global memo**: weak, version-tagged handles that turn cross-request
//!   reads into conditional store reads.
//! - **Tag revalidation**: per-tag manifest records invalidate every entry
//!   carrying the tag without enumerating keys ([`TagResolver`]).
//! - **Background work**: store writes and CDN purges are tracked per request
//!   and drained before the request is finished ([`BackgroundWork`]).
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! memory_budget_bytes = 52428800  # 0 disables the per-request memo
//! ```

mod background;
mod codec;
pub(crate) mod config;
mod entry;
mod error;
mod handler;
pub mod keys;
mod lock;
mod memo;
mod middleware;
mod purge;
pub mod scope;
pub mod size;
mod store;
mod tags;

pub use background::{
    AfterResponse, BackgroundWork, DrainReport, Settlement, TokioAfterResponse,
};
pub use codec::{decode_entry, decode_manifest, encode_entry, entry_to_bytes, manifest_to_bytes};
pub use config::CacheConfig;
pub use entry::{
    Artifact, ArtifactBody, CacheEntry, CacheHit, EntryKind, Freshness, LAST_MODIFIED_STALE,
    Revalidate, now_millis,
};
pub use error::{CacheError, StoreError};
pub use handler::{CacheHandler, GetContext, SetContext};
pub use memo::{Lookup, MemoCache, Memoized, RequestId, Versioned};
pub use middleware::{CacheState, X_CACHE, artifact_cache_layer};
pub use purge::{CdnPurger, NoopPurger};
pub use scope::{RequestContext, current, with_request_scope};
pub use store::{BlobRead, BlobStore, Fetched, MemoryBlobStore, StoreClient, content_version};
pub use tags::TagResolver;
