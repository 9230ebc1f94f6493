//! Page session: owns the model handle and loads it on first use.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetcher::{DownloadProgress, ModelFetcher};
use crate::runtime::{
    DevicePreference, ExecutionBackend, GenerationOptions, ImageResult, ModelPart, ModelRuntime,
    ModelSession, SessionOptions,
};
use crate::worker::resolve_url;

/// Where model files are hosted by default.
pub const DEFAULT_MODEL_BASE: &str = "https://huggingface.co/stabilityai/sdxl-turbo/resolve/main/";

/// One file of the diffusion pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelFile {
    /// Component name handed to the runtime, e.g. `unet`.
    pub name: String,
    /// Path relative to the model base URL, or an absolute URL.
    pub path: String,
}

impl ModelFile {
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Which files make up the model and how the runtime should run them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub base_url: String,
    pub backend: ExecutionBackend,
    pub device_preference: DevicePreference,
    pub files: Vec<ModelFile>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MODEL_BASE.to_string(),
            backend: ExecutionBackend::WebGpu,
            device_preference: DevicePreference::HighPerformance,
            files: vec![
                ModelFile::new("text_encoder", "text_encoder/model.onnx"),
                ModelFile::new("tokenizer", "tokenizer/merges.txt"),
                ModelFile::new("tokenizer_vocab", "tokenizer/vocab.json"),
                ModelFile::new("unet", "unet/model.onnx"),
                ModelFile::new("vae_decoder", "vae_decoder/model.onnx"),
            ],
        }
    }
}

impl PipelineConfig {
    /// Absolute URLs of every model file, in declaration order.
    #[must_use]
    pub fn file_urls(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|file| resolve_url(Some(&self.base_url), &file.path))
            .collect()
    }

    #[must_use]
    pub const fn session_options(&self) -> SessionOptions {
        SessionOptions {
            backend: self.backend,
            device_preference: self.device_preference,
        }
    }
}

/// Session-scoped context holding the single model handle.
///
/// The handle is created on first use. Callers arriving while a load is in
/// flight wait for it instead of starting their own. A failed load leaves the
/// session empty so the next call tries again.
pub struct PageSession {
    fetcher: ModelFetcher,
    runtime: Arc<dyn ModelRuntime>,
    pipeline: PipelineConfig,
    generation: GenerationOptions,
    model: OnceCell<Arc<dyn ModelSession>>,
}

impl PageSession {
    #[must_use]
    pub fn new(
        fetcher: ModelFetcher,
        runtime: Arc<dyn ModelRuntime>,
        pipeline: PipelineConfig,
        generation: GenerationOptions,
    ) -> Self {
        Self {
            fetcher,
            runtime,
            pipeline,
            generation,
            model: OnceCell::new(),
        }
    }

    #[must_use]
    pub const fn pipeline(&self) -> &PipelineConfig {
        &self.pipeline
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    /// Returns the model handle, loading it first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RuntimeUnavailable`] before any download when the
    /// backend is missing, a fetch error if a model file cannot be
    /// downloaded, or [`Error::ModelConstruction`] if the runtime rejects
    /// the bytes.
    pub async fn model(
        &self,
        progress: &Arc<dyn DownloadProgress>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ModelSession>> {
        self.model
            .get_or_try_init(|| self.load(progress, cancel))
            .await
            .cloned()
    }

    async fn load(
        &self,
        progress: &Arc<dyn DownloadProgress>,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn ModelSession>> {
        let options = self.pipeline.session_options();
        if !self.runtime.is_backend_available(options.backend) {
            return Err(Error::RuntimeUnavailable {
                backend: options.backend.to_string(),
            });
        }

        let mut parts = Vec::with_capacity(self.pipeline.files.len());
        for (file, url) in self.pipeline.files.iter().zip(self.pipeline.file_urls()) {
            let fetched = self.fetcher.fetch(&url, progress, cancel).await?;
            parts.push(ModelPart {
                name: file.name.clone(),
                bytes: fetched.bytes,
            });
        }

        log::info!(
            "Creating {} session from {} model files",
            options.backend,
            parts.len()
        );
        let session = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(Error::Cancelled),
            session = self.runtime.create_session(parts, &options) => session?,
        };
        log::info!("Pipeline ready");
        Ok(session)
    }

    /// Generates an image for `prompt`, loading the model first if needed.
    ///
    /// # Errors
    ///
    /// Any load error from [`Self::model`], a generation error from the
    /// runtime, or [`Error::Cancelled`].
    pub async fn generate(
        &self,
        prompt: &str,
        progress: &Arc<dyn DownloadProgress>,
        cancel: &CancellationToken,
    ) -> Result<ImageResult> {
        let model = self.model(progress, cancel).await?;
        log::info!("Generating image for prompt {prompt:?}");
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = model.generate(prompt, &self.generation) => result,
        }
    }
}
