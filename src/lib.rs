//! nyvera - offline asset cache and chunked model fetcher.
//!
//! The crate keeps a web front-end usable offline and gets a large image
//! model onto the machine exactly once:
//!
//! - [`worker`] precaches static assets atomically and answers requests
//!   cache-first.
//! - [`fetcher`] streams the model files with progress, stores them in the
//!   same cache namespace and hands the bytes to a [`runtime::ModelRuntime`].
//! - [`page`] turns user commands into status lines, loading the model
//!   lazily through a [`session::PageSession`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use nyvera::{DownloadProgress, HttpNetwork, MemoryCacheStore, ModelFetcher, NoProgress};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> nyvera::Result<()> {
//! let fetcher = ModelFetcher::new(
//!     Arc::new(MemoryCacheStore::new()),
//!     Arc::new(HttpNetwork::new(None)?),
//!     "nyvera-cache-v1",
//! );
//! let progress: Arc<dyn DownloadProgress> = Arc::new(NoProgress);
//! let fetched = fetcher
//!     .fetch("https://example.com/unet/model.onnx", &progress, &CancellationToken::new())
//!     .await?;
//! println!("{} bytes", fetched.bytes.len());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

#[cfg(feature = "server")]
pub mod api;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod format;
pub mod net;
pub mod page;
pub mod render;
pub mod request;
pub mod runtime;
pub mod session;
pub mod stats;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::AppConfig;
pub use error::{Error, Result};
pub use fetcher::{DownloadProgress, Fetched, ModelFetcher, NoProgress};
pub use format::{format_bytes, format_duration, format_progress};
pub use net::{HttpNetwork, Network};
pub use page::{Command, Page, Status};
pub use render::Canvas;
pub use request::{Request, Response, ResponseKind};
pub use runtime::{ImageResult, ModelRuntime, ModelSession};
pub use session::{PageSession, PipelineConfig};
pub use stats::{FetchStats, ProgressState};
pub use store::{CacheNamespace, CacheStore, DiskCacheStore, MemoryCacheStore};
pub use worker::{AssetWorker, Registration, WorkerConfig};
