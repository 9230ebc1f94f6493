//! On-disk cache store.
//!
//! Layout: one directory per namespace under the store root. Each entry is a
//! body file plus a TOML metadata file named after the SHA-256 of the URL.
//! The metadata file is the commit point: it is written to a temporary path
//! and renamed into place, so readers see either the old or the new entry.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CacheNamespace, CacheStore, validate_name};
use crate::error::{Error, Result};
use crate::request::{Response, ResponseKind};

const META_EXT: &str = "toml";

/// Cache store persisted under a root directory.
pub struct DiskCacheStore {
    root: PathBuf,
    namespaces: Mutex<HashMap<String, Arc<DiskNamespace>>>,
}

impl DiskCacheStore {
    /// Creates a store rooted at `root`. The directory is created lazily.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CacheStore for DiskCacheStore {
    async fn open(&self, name: &str) -> Result<Arc<dyn CacheNamespace>> {
        validate_name(name)?;
        let dir = self.root.join(name);
        tokio::fs::create_dir_all(&dir).await?;

        let mut namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        let ns: Arc<dyn CacheNamespace> = namespaces
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(DiskNamespace {
                    name: name.to_string(),
                    dir,
                })
            })
            .clone();
        Ok(ns)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        self.namespaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        match tokio::fs::remove_dir_all(self.root.join(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn names(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            if let Some(name) = file_name.to_str()
                && validate_name(name).is_ok()
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Metadata stored next to each body file.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    url: String,
    status: u16,
    kind: ResponseKind,
    size: u64,
    body_file: String,
    headers: Vec<(String, String)>,
}

/// Files written for an entry but not yet committed.
struct Staged {
    key: String,
    meta_tmp: PathBuf,
    meta_path: PathBuf,
    body_path: PathBuf,
}

pub struct DiskNamespace {
    name: String,
    dir: PathBuf,
}

impl DiskNamespace {
    fn entry_key(url: &str) -> String {
        format!("{:x}", Sha256::digest(url.as_bytes()))
    }

    fn meta_path(&self, url: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{META_EXT}", Self::entry_key(url)))
    }

    async fn read_meta(path: &Path) -> Result<Option<EntryMeta>> {
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        toml::from_str(&text)
            .map(Some)
            .map_err(|e| Error::CorruptEntry(format!("{}: {e}", path.display())))
    }

    /// Writes the body and a temporary metadata file for one entry.
    async fn stage(&self, url: &str, response: &Response) -> Result<Staged> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let key = Self::entry_key(url);
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        let body_file = format!("{key}-{nonce}.body");
        let body_path = self.dir.join(&body_file);
        let meta_path = self.meta_path(url);
        let meta_tmp = self.dir.join(format!("{key}.{META_EXT}.{nonce}.tmp"));

        let meta = EntryMeta {
            url: url.to_string(),
            status: response.status,
            kind: response.kind,
            size: response.body.len() as u64,
            body_file,
            headers: response.headers.clone(),
        };
        let meta_text = toml::to_string(&meta).map_err(|e| Error::CorruptEntry(e.to_string()))?;

        let staged = Staged {
            key,
            meta_tmp,
            meta_path,
            body_path,
        };
        let written = async {
            tokio::fs::write(&staged.body_path, &response.body).await?;
            tokio::fs::write(&staged.meta_tmp, meta_text).await
        }
        .await;
        if let Err(e) = written {
            discard(&staged).await;
            return Err(e.into());
        }
        Ok(staged)
    }

    /// Renames the metadata into place, keeping what it replaced.
    ///
    /// The replaced body stays on disk until [`finish`] so the swap can be
    /// reverted with [`DiskNamespace::revert`].
    async fn swap_in(&self, staged: &Staged) -> Result<Replaced> {
        let meta_text = match tokio::fs::read_to_string(&staged.meta_path).await {
            Ok(text) => Some(text),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let old_body = meta_text
            .as_deref()
            .and_then(|text| toml::from_str::<EntryMeta>(text).ok())
            .map(|meta| self.dir.join(meta.body_file))
            .filter(|old| *old != staged.body_path);

        tokio::fs::rename(&staged.meta_tmp, &staged.meta_path).await?;
        Ok(Replaced {
            meta_text,
            old_body,
        })
    }

    /// Puts back the metadata a committed entry replaced and drops its body.
    async fn revert(&self, staged: &Staged, replaced: Replaced) {
        let restored = match replaced.meta_text {
            Some(text) => {
                let tmp = self.dir.join(format!(
                    "{}.{META_EXT}.{}.tmp",
                    staged.key,
                    uuid::Uuid::new_v4().simple()
                ));
                match tokio::fs::write(&tmp, text).await {
                    Ok(()) => tokio::fs::rename(&tmp, &staged.meta_path).await,
                    Err(e) => {
                        let _ = tokio::fs::remove_file(&tmp).await;
                        Err(e)
                    }
                }
            }
            None => tokio::fs::remove_file(&staged.meta_path).await,
        };
        if let Err(e) = restored {
            log::warn!("Could not roll back {}: {e}", staged.meta_path.display());
        }
        let _ = tokio::fs::remove_file(&staged.body_path).await;
    }
}

/// What a committed entry replaced.
struct Replaced {
    meta_text: Option<String>,
    old_body: Option<PathBuf>,
}

/// Removes the body a committed entry replaced.
async fn finish(replaced: Replaced) {
    if let Some(old_body) = replaced.old_body {
        let _ = tokio::fs::remove_file(old_body).await;
    }
}

async fn discard(staged: &Staged) {
    let _ = tokio::fs::remove_file(&staged.body_path).await;
    let _ = tokio::fs::remove_file(&staged.meta_tmp).await;
}

#[async_trait]
impl CacheNamespace for DiskNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn lookup(&self, url: &str) -> Result<Option<Response>> {
        let Some(meta) = Self::read_meta(&self.meta_path(url)).await? else {
            return Ok(None);
        };
        if meta.url != url {
            return Ok(None);
        }
        let body = match tokio::fs::read(self.dir.join(&meta.body_file)).await {
            Ok(body) => body,
            // Replaced between reading the metadata and the body.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if body.len() as u64 != meta.size {
            return Err(Error::CorruptEntry(format!(
                "{url}: expected {} bytes, found {}",
                meta.size,
                body.len()
            )));
        }
        Ok(Some(Response {
            url: meta.url,
            status: meta.status,
            headers: meta.headers,
            kind: meta.kind,
            body: Bytes::from(body),
        }))
    }

    async fn put(&self, url: &str, response: &Response) -> Result<()> {
        let staged = self.stage(url, response).await?;
        match self.swap_in(&staged).await {
            Ok(replaced) => {
                finish(replaced).await;
                Ok(())
            }
            Err(e) => {
                discard(&staged).await;
                Err(e)
            }
        }
    }

    /// Stages every entry, then commits them in order. A failed commit
    /// reverts the entries already committed, so the batch lands whole or
    /// not at all.
    async fn put_all(&self, entries: &[(String, Response)]) -> Result<()> {
        let mut staged = Vec::with_capacity(entries.len());
        for (url, response) in entries {
            match self.stage(url, response).await {
                Ok(s) => staged.push(s),
                Err(e) => {
                    for s in &staged {
                        discard(s).await;
                    }
                    return Err(e);
                }
            }
        }
        let mut committed = Vec::with_capacity(staged.len());
        for (i, s) in staged.iter().enumerate() {
            match self.swap_in(s).await {
                Ok(replaced) => committed.push(replaced),
                Err(e) => {
                    log::warn!("Batch commit failed at {}: {e}", s.meta_path.display());
                    for (done, replaced) in staged[..i].iter().zip(committed).rev() {
                        self.revert(done, replaced).await;
                    }
                    for pending in &staged[i..] {
                        discard(pending).await;
                    }
                    return Err(e);
                }
            }
        }
        for replaced in committed {
            finish(replaced).await;
        }
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let meta_path = self.meta_path(url);
        let Some(meta) = Self::read_meta(&meta_path).await? else {
            return Ok(false);
        };
        tokio::fs::remove_file(&meta_path).await?;
        let _ = tokio::fs::remove_file(self.dir.join(meta.body_file)).await;
        Ok(true)
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut read_dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == META_EXT) {
                continue;
            }
            match Self::read_meta(&path).await {
                Ok(Some(meta)) => keys.push(meta.url),
                Ok(None) => {}
                Err(e) => log::warn!("Skipping unreadable cache entry: {e}"),
            }
        }
        keys.sort();
        Ok(keys)
    }
}
