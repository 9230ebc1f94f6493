//! Command handlers behind the user-facing page.
//!
//! Every command ends in a [`Status`]; errors are turned into status lines
//! here and never reach the caller.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::fetcher::DownloadProgress;
use crate::format::format_progress;
use crate::render::{Canvas, RenderOutcome};
use crate::session::PageSession;
use crate::stats::{FetchStats, ProgressState};

pub const EMPTY_PROMPT: &str = "Enter a prompt";
pub const RASTER_DONE: &str = "Done — image rendered (offline ready).";
pub const DECODED_DONE: &str = "Done — image decoded and rendered.";
pub const UNKNOWN_OUTPUT: &str = "Generation finished but output format is unknown.";
pub const PIPELINE_READY: &str = "Pipeline ready (models cached after first load).";

/// A user action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Generate { prompt: String },
    LoadModel,
}

/// The status line shown to the user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Status {
    Idle,
    /// Input was refused before anything ran.
    Rejected { message: String },
    Initializing,
    Downloading {
        url: String,
        #[serde(flatten)]
        progress: ProgressState,
        percent: Option<f64>,
    },
    Generating,
    Done { message: String },
    Error { message: String },
}

impl Status {
    fn done(message: &str) -> Self {
        Self::Done {
            message: message.to_string(),
        }
    }

    /// Whether a command has finished, successfully or not.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Rejected { .. } | Self::Done { .. } | Self::Error { .. }
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("Idle"),
            Self::Rejected { message } | Self::Done { message } => f.write_str(message),
            Self::Initializing => f.write_str("Initializing pipeline"),
            Self::Downloading { progress, .. } => {
                write!(f, "Downloading model: {}", format_progress(progress))
            }
            Self::Generating => f.write_str("Generating"),
            Self::Error { message } => write!(f, "Error: {message}"),
        }
    }
}

/// Shared, observable status line. Also receives download progress.
#[derive(Debug)]
pub struct StatusBoard {
    current: Mutex<Status>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            current: Mutex::new(Status::Idle),
        }
    }
}

impl StatusBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn current(&self) -> Status {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, status: Status) {
        if !matches!(status, Status::Downloading { .. }) {
            log::info!("{status}");
        }
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

impl DownloadProgress for StatusBoard {
    fn on_start(&self, url: &str, total: Option<u64>) {
        let progress = ProgressState::new(total);
        self.set(Status::Downloading {
            url: url.to_string(),
            percent: progress.percent(),
            progress,
        });
    }

    fn on_progress(&self, url: &str, progress: &ProgressState, _speed: u64) {
        self.set(Status::Downloading {
            url: url.to_string(),
            percent: progress.percent(),
            progress: *progress,
        });
    }

    fn on_cache_hit(&self, url: &str, size: u64) {
        log::debug!("{url} served from cache ({size} bytes)");
    }

    fn on_complete(&self, url: &str, stats: &FetchStats) {
        log::debug!("{url} ready after {:?}", stats.elapsed);
        self.set(Status::Initializing);
    }
}

/// The page: a session, a canvas and a status line.
pub struct Page {
    session: PageSession,
    canvas: Mutex<Canvas>,
    status: Arc<StatusBoard>,
}

impl Page {
    #[must_use]
    pub fn new(session: PageSession) -> Self {
        Self {
            session,
            canvas: Mutex::new(Canvas::new()),
            status: Arc::new(StatusBoard::new()),
        }
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status.current()
    }

    #[must_use]
    pub fn is_model_loaded(&self) -> bool {
        self.session.is_loaded()
    }

    /// Last rendered frame as PNG, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if PNG encoding fails.
    pub fn snapshot_png(&self) -> Result<Option<Vec<u8>>> {
        self.canvas
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_png()
    }

    /// Runs one command to completion and returns its final status.
    pub async fn handle(&self, command: Command, cancel: &CancellationToken) -> Status {
        let status = match command {
            Command::Generate { prompt } => self.generate(prompt.trim(), cancel).await,
            Command::LoadModel => self.load_model(cancel).await,
        };
        self.status.set(status.clone());
        status
    }

    async fn load_model(&self, cancel: &CancellationToken) -> Status {
        if !self.session.is_loaded() {
            self.status.set(Status::Initializing);
        }
        let progress: Arc<dyn DownloadProgress> = self.status.clone();
        match self.session.model(&progress, cancel).await {
            Ok(_) => Status::done(PIPELINE_READY),
            Err(e) => {
                log::error!("Model load failed: {e}");
                Status::Error {
                    message: e.to_string(),
                }
            }
        }
    }

    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Status {
        if prompt.is_empty() {
            return Status::Rejected {
                message: EMPTY_PROMPT.to_string(),
            };
        }

        self.status.set(Status::Generating);
        if !self.session.is_loaded() {
            self.status.set(Status::Initializing);
        }
        let progress: Arc<dyn DownloadProgress> = self.status.clone();
        if let Err(e) = self.session.model(&progress, cancel).await {
            log::error!("Model load failed: {e}");
            return Status::Error {
                message: e.to_string(),
            };
        }
        self.status.set(Status::Generating);

        let rendered = match self.session.generate(prompt, &progress, cancel).await {
            Ok(result) => self
                .canvas
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .render(result),
            Err(e) => Err(e),
        };

        match rendered {
            Ok(RenderOutcome::Raster { .. }) => Status::done(RASTER_DONE),
            Ok(RenderOutcome::Decoded { .. }) => Status::done(DECODED_DONE),
            Ok(RenderOutcome::Unrecognized) => {
                log::warn!("Runtime returned an output this page cannot render");
                Status::done(UNKNOWN_OUTPUT)
            }
            Err(e) => {
                log::error!("Generation failed: {e}");
                Status::Error {
                    message: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use bytes::Bytes;

    use super::*;
    use crate::fetcher::ModelFetcher;
    use crate::runtime::{GenerationOptions, ImageResult, ModelRuntime, RawOutput};
    use crate::session::{ModelFile, PipelineConfig};
    use crate::store::MemoryCacheStore;
    use crate::testing::{MockNetwork, MockRuntime};

    const MODEL_URL: &str = "https://models.test/unet/model.onnx";

    fn page_with(runtime: Arc<dyn ModelRuntime>, net: &Arc<MockNetwork>) -> Page {
        let pipeline = PipelineConfig {
            base_url: "https://models.test/".to_string(),
            files: vec![ModelFile::new("unet", "unet/model.onnx")],
            ..PipelineConfig::default()
        };
        let fetcher = ModelFetcher::new(
            Arc::new(MemoryCacheStore::new()),
            net.clone(),
            "nyvera-cache-v1",
        );
        Page::new(PageSession::new(
            fetcher,
            runtime,
            pipeline,
            GenerationOptions::default(),
        ))
    }

    fn online() -> Arc<MockNetwork> {
        let net = Arc::new(MockNetwork::new());
        net.stream_reply(
            MODEL_URL,
            vec![Bytes::from_static(b"onnx"), Bytes::from_static(b" weights")],
            true,
        );
        net
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut canvas = Canvas::new();
        canvas
            .put_image_data(width, height, vec![7; (width * height * 4) as usize])
            .unwrap();
        canvas.to_png().unwrap().unwrap()
    }

    fn generate(prompt: &str) -> Command {
        Command::Generate {
            prompt: prompt.to_string(),
        }
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_without_side_effects() {
        let net = online();
        let runtime = Arc::new(MockRuntime::returning(ImageResult::Unknown));
        let page = page_with(runtime.clone(), &net);

        let status = page.handle(generate("   \n"), &CancellationToken::new()).await;

        assert_eq!(status.to_string(), EMPTY_PROMPT);
        assert_eq!(net.stream_count(), 0);
        assert_eq!(runtime.session_count(), 0);
        assert!(!page.is_model_loaded());
    }

    #[tokio::test]
    async fn raster_result_is_rendered() {
        let net = online();
        let runtime = Arc::new(MockRuntime::returning(ImageResult::Raster {
            bytes: vec![255; 4 * 4 * 4],
            width: 4,
            height: 4,
        }));
        let page = page_with(runtime, &net);

        let status = page
            .handle(generate("a red balloon"), &CancellationToken::new())
            .await;

        assert_eq!(status.to_string(), RASTER_DONE);
        assert_eq!(page.status(), status);
        assert!(page.snapshot_png().unwrap().is_some());
    }

    #[tokio::test]
    async fn data_url_result_is_decoded() {
        let net = online();
        let raw = RawOutput {
            data_url: Some(format!("data:image/png;base64,{}", BASE64.encode(png(3, 2)))),
            ..RawOutput::default()
        };
        let runtime = Arc::new(MockRuntime::returning(ImageResult::from(raw)));
        let page = page_with(runtime, &net);

        let status = page
            .handle(generate("a red balloon"), &CancellationToken::new())
            .await;

        assert_eq!(status.to_string(), DECODED_DONE);
        let frame = page.snapshot_png().unwrap().unwrap();
        let decoded = image::load_from_memory(&frame).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
    }

    #[tokio::test]
    async fn unknown_result_is_reported() {
        let net = online();
        let runtime = Arc::new(MockRuntime::returning(ImageResult::Unknown));
        let page = page_with(runtime, &net);

        let status = page
            .handle(generate("a red balloon"), &CancellationToken::new())
            .await;
        assert_eq!(status.to_string(), UNKNOWN_OUTPUT);
        assert!(page.snapshot_png().unwrap().is_none());
    }

    #[tokio::test]
    async fn errors_become_status_lines() {
        let net = online();
        let page = page_with(Arc::new(MockRuntime::failing_generation()), &net);
        let status = page
            .handle(generate("a red balloon"), &CancellationToken::new())
            .await;
        assert_eq!(status.to_string(), "Error: Generation failed: out of device memory");

        let page = page_with(Arc::new(MockRuntime::without_backend()), &net);
        let status = page
            .handle(generate("a red balloon"), &CancellationToken::new())
            .await;
        assert!(matches!(status, Status::Error { .. }));
        assert!(status.to_string().starts_with("Error: Runtime unavailable"));

        let offline = Arc::new(MockNetwork::new());
        let page = page_with(Arc::new(MockRuntime::returning(ImageResult::Unknown)), &offline);
        let status = page.handle(Command::LoadModel, &CancellationToken::new()).await;
        assert!(status.to_string().starts_with("Error: Network error"));
    }

    #[tokio::test]
    async fn load_model_then_generate_reuses_session() {
        let net = online();
        let runtime = Arc::new(MockRuntime::returning(ImageResult::Unknown));
        let page = page_with(runtime.clone(), &net);
        let cancel = CancellationToken::new();

        let status = page.handle(Command::LoadModel, &cancel).await;
        assert_eq!(status.to_string(), PIPELINE_READY);
        assert!(page.is_model_loaded());

        page.handle(generate("a red balloon"), &cancel).await;
        page.handle(generate("a red balloon"), &cancel).await;
        assert_eq!(runtime.session_count(), 1);
        assert_eq!(runtime.generations.load(Ordering::SeqCst), 2);
        assert_eq!(net.stream_count(), 1);
    }

    #[test]
    fn status_board_tracks_download_progress() {
        let board = StatusBoard::new();
        board.on_start(MODEL_URL, Some(200));
        board.on_progress(
            MODEL_URL,
            &ProgressState {
                received: 85,
                total: Some(200),
            },
            0,
        );
        assert_eq!(board.current().to_string(), "Downloading model: 42.5%");
        assert!(!board.current().is_terminal());

        board.on_progress(
            MODEL_URL,
            &ProgressState {
                received: 2048,
                total: None,
            },
            0,
        );
        assert_eq!(board.current().to_string(), "Downloading model: 2.00 KB received");
    }

    #[test]
    fn status_serializes_with_state_tag() {
        let status = Status::Downloading {
            url: MODEL_URL.to_string(),
            progress: ProgressState {
                received: 1,
                total: Some(4),
            },
            percent: Some(25.0),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "downloading");
        assert_eq!(json["received"], 1);
        assert_eq!(json["percent"], 25.0);
        assert_eq!(serde_json::to_value(Status::Idle).unwrap()["state"], "idle");
    }
}
