//! Error types for the nyvera library.

use thiserror::Error;

/// Errors that can occur while caching assets, fetching models or generating images.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested execution backend is not available on this machine.
    #[error("Runtime unavailable: {backend} backend is not supported here")]
    RuntimeUnavailable {
        /// Name of the missing backend.
        backend: String,
    },

    /// The model runtime rejected the model bytes.
    #[error("Model construction failed: {0}")]
    ModelConstruction(String),

    /// The model runtime failed while generating.
    #[error("Generation failed: {0}")]
    Generation(String),

    /// A network request could not be completed.
    #[error("Network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status} for {url}")]
    HttpStatus {
        /// Requested URL.
        url: String,
        /// Status code returned by the server.
        status: u16,
    },

    /// Download failed after the stream was opened.
    #[error("Download failed: {0}")]
    Download(String),

    /// Precaching did not complete, nothing was committed.
    #[error("Install failed: {0}")]
    InstallFailed(String),

    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Cache namespace names must be plain file-name safe identifiers.
    #[error("Invalid cache name: {0:?}")]
    InvalidCacheName(String),

    /// Cached metadata could not be decoded.
    #[error("Corrupt cache entry: {0}")]
    CorruptEntry(String),

    /// Configuration could not be read or written.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Image decoding or encoding failed.
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Returns true when the error came from the network rather than local state.
    #[must_use]
    pub const fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Http(_) | Self::HttpStatus { .. } | Self::Download(_)
        )
    }
}

/// A specialized `Result` type for nyvera operations.
pub type Result<T> = std::result::Result<T, Error>;
