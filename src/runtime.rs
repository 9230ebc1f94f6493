//! Boundary to the external model runtime.
//!
//! The runtime turns raw model bytes into a session and runs it. Nothing in
//! this crate inspects model bytes or performs inference itself.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Execution backend the runtime should run the model on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionBackend {
    #[default]
    WebGpu,
    Wasm,
    Cpu,
}

impl fmt::Display for ExecutionBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WebGpu => "webgpu",
            Self::Wasm => "wasm",
            Self::Cpu => "cpu",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DevicePreference {
    #[default]
    HighPerformance,
    LowPower,
}

/// Options passed when creating a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionOptions {
    pub backend: ExecutionBackend,
    pub device_preference: DevicePreference,
}

/// One named model file, e.g. `unet` or `vae_decoder`.
#[derive(Debug, Clone)]
pub struct ModelPart {
    pub name: String,
    pub bytes: Bytes,
}

/// A dense `f32` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub dims: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    /// Creates a tensor, checking that `data` fills `dims` exactly.
    ///
    /// # Errors
    ///
    /// Returns an error when the element count does not match the shape.
    pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = dims.iter().product();
        if expected != data.len() {
            return Err(Error::Generation(format!(
                "tensor shape {dims:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { dims, data })
    }
}

/// Named input or output tensors of a session run.
pub type NamedTensors = BTreeMap<String, Tensor>;

/// Image generation parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: Option<u64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 1024,
            steps: 20,
            guidance_scale: 7.5,
            seed: None,
        }
    }
}

/// What a generation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageResult {
    /// Raw RGBA pixels, four bytes per pixel, row-major.
    Raster {
        bytes: Vec<u8>,
        width: u32,
        height: u32,
    },
    /// An encoded image file (PNG, JPEG, ...).
    EncodedImage { bytes: Bytes },
    /// The runtime returned something this crate cannot render.
    Unknown,
}

impl ImageResult {
    /// Decodes a `data:` URL into an encoded image.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed URLs or invalid base64 payloads.
    pub fn from_data_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| Error::Generation("data URL must start with \"data:\"".into()))?;
        let (meta, payload) = rest
            .split_once(',')
            .ok_or_else(|| Error::Generation("data URL has no payload".into()))?;
        let bytes = if meta.ends_with(";base64") {
            BASE64
                .decode(payload.trim())
                .map_err(|e| Error::Generation(format!("invalid base64 in data URL: {e}")))?
        } else {
            payload.as_bytes().to_vec()
        };
        Ok(Self::EncodedImage {
            bytes: Bytes::from(bytes),
        })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Raster { .. } => "raster",
            Self::EncodedImage { .. } => "encoded",
            Self::Unknown => "unknown",
        }
    }
}

/// Loosely-shaped output as returned by script-style runtimes.
///
/// Any of the three fields may be present; [`ImageResult::from`] picks the
/// first usable one in the order raster, data URL, blob.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawOutput {
    pub image_data: Option<Vec<u8>>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub data_url: Option<String>,
    pub blob: Option<Vec<u8>>,
}

impl From<RawOutput> for ImageResult {
    fn from(raw: RawOutput) -> Self {
        if let (Some(bytes), Some(width), Some(height)) = (raw.image_data, raw.width, raw.height) {
            return Self::Raster {
                bytes,
                width,
                height,
            };
        }
        if let Some(url) = raw.data_url {
            match Self::from_data_url(&url) {
                Ok(image) => return image,
                Err(e) => log::warn!("Discarding unusable data URL: {e}"),
            }
        }
        if let Some(blob) = raw.blob {
            return Self::EncodedImage {
                bytes: Bytes::from(blob),
            };
        }
        Self::Unknown
    }
}

/// The external model runtime.
#[async_trait]
pub trait ModelRuntime: Send + Sync {
    /// Whether `backend` can be used on this machine.
    fn is_backend_available(&self, backend: ExecutionBackend) -> bool;

    /// Builds a session from raw model bytes.
    ///
    /// Malformed bytes fail with [`Error::ModelConstruction`].
    async fn create_session(
        &self,
        parts: Vec<ModelPart>,
        options: &SessionOptions,
    ) -> Result<Arc<dyn ModelSession>>;
}

/// A loaded, ready-to-run model.
#[async_trait]
pub trait ModelSession: Send + Sync {
    /// Runs the model on named input tensors.
    async fn run(&self, inputs: NamedTensors) -> Result<NamedTensors>;

    /// Generates an image for `prompt`.
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<ImageResult>;
}

/// Runtime used when no inference backend is linked in.
///
/// Every backend reports as unavailable, so generation stops with a
/// "runtime unavailable" status before anything is downloaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableRuntime;

#[async_trait]
impl ModelRuntime for UnavailableRuntime {
    fn is_backend_available(&self, _backend: ExecutionBackend) -> bool {
        false
    }

    async fn create_session(
        &self,
        _parts: Vec<ModelPart>,
        options: &SessionOptions,
    ) -> Result<Arc<dyn ModelSession>> {
        Err(Error::RuntimeUnavailable {
            backend: options.backend.to_string(),
        })
    }
}
