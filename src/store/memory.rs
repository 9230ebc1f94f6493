use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use super::{CacheNamespace, CacheStore, validate_name};
use crate::error::Result;
use crate::request::Response;

/// Process-local cache store. Entries live as long as the store.
#[derive(Default)]
pub struct MemoryCacheStore {
    namespaces: Mutex<HashMap<String, Arc<MemoryNamespace>>>,
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheNamespace>> {
        validate_name(name)?;
        let mut namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        let ns: Arc<dyn CacheNamespace> = namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(MemoryNamespace {
                    name: name.to_string(),
                    entries: Mutex::new(HashMap::new()),
                })
            })
            .clone();
        Ok(ns)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let removed = self
            .namespaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        // Handles still held elsewhere must not keep serving deleted entries.
        if let Some(ns) = &removed {
            ns.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
        Ok(removed.is_some())
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self
            .namespaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }
}

pub struct MemoryNamespace {
    name: String,
    entries: Mutex<HashMap<String, Response>>,
}

#[async_trait]
impl CacheNamespace for MemoryNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, url: &str) -> Result<Option<Response>> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned())
    }

    async fn put(&self, url: &str, response: &Response) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), response.clone());
        Ok(())
    }

    async fn put_all(&self, entries: &[(String, Response)]) -> Result<()> {
        let mut map = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for (url, response) in entries {
            map.insert(url.clone(), response.clone());
        }
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url)
            .is_some())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<_> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
