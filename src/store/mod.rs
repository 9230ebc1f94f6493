//! Persistent cache store abstraction.
//!
//! A store hands out named namespaces; each namespace maps request URLs to
//! captured responses. Entries are replaced wholesale, never edited in place.

mod disk;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::request::Response;

pub use disk::DiskCacheStore;
pub use memory::MemoryCacheStore;

/// Abstraction over the cache storage backend for testability.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Opens (creating if needed) the namespace with the given name.
    ///
    /// Opening the same name twice yields handles onto the same entries.
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheNamespace>>;

    /// Deletes a namespace and all its entries. Returns whether it existed.
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Lists the names of all existing namespaces.
    async fn names(&self) -> Result<Vec<String>>;
}

/// One named key→response map.
#[async_trait]
pub trait CacheNamespace: Send + Sync {
    /// Name the namespace was opened with.
    fn name(&self) -> &str;

    /// Looks up the entry stored for `url`.
    async fn lookup(&self, url: &str) -> Result<Option<Response>>;

    /// Stores `response` under `url`, replacing any previous entry.
    async fn put(&self, url: &str, response: &Response) -> Result<()>;

    /// Stores every entry or none of them.
    async fn put_all(&self, entries: &[(String, Response)]) -> Result<()>;

    /// Removes the entry for `url`. Returns whether it existed.
    async fn delete(&self, url: &str) -> Result<bool>;

    /// Lists the URLs of all stored entries.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Namespace names become directory names on disk, so keep them tame.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidCacheName(name.to_string()))
    }
}
