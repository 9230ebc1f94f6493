//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::error::{Error, Result};
use crate::fetcher::DownloadProgress;
use crate::net::{BodyStream, Network};
use crate::request::{Request, Response};
use crate::runtime::{
    ExecutionBackend, GenerationOptions, ImageResult, ModelPart, ModelRuntime, ModelSession,
    NamedTensors, SessionOptions,
};
use crate::stats::{FetchStats, ProgressState};

#[derive(Clone)]
enum Reply {
    Response(Response),
    Stream {
        chunks: Vec<Bytes>,
        content_length: Option<u64>,
        /// Yield an error after this many chunks.
        fail_after: Option<usize>,
        /// Never end after the chunks.
        stall: bool,
    },
}

/// Scripted network. Unknown URLs fail like an unreachable host.
#[derive(Default)]
pub struct MockNetwork {
    replies: Mutex<HashMap<String, Reply>>,
    fetches: AtomicUsize,
    streams: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, url: &str, response: Response) {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), Reply::Response(response));
    }

    pub fn ok(&self, url: &str, body: &'static str) {
        self.reply(url, Response::ok(url, body));
    }

    pub fn stream_reply(&self, url: &str, chunks: Vec<Bytes>, declare_length: bool) {
        let total: usize = chunks.iter().map(Bytes::len).sum();
        self.replies.lock().unwrap().insert(
            url.to_string(),
            Reply::Stream {
                chunks,
                content_length: declare_length.then_some(total as u64),
                fail_after: None,
                stall: false,
            },
        );
    }

    pub fn failing_stream_reply(
        &self,
        url: &str,
        chunks: Vec<Bytes>,
        fail_after: usize,
        content_length: Option<u64>,
    ) {
        self.replies.lock().unwrap().insert(
            url.to_string(),
            Reply::Stream {
                chunks,
                content_length,
                fail_after: Some(fail_after),
                stall: false,
            },
        );
    }

    pub fn stalled_stream_reply(&self, url: &str, chunks: Vec<Bytes>, content_length: Option<u64>) {
        self.replies.lock().unwrap().insert(
            url.to_string(),
            Reply::Stream {
                chunks,
                content_length,
                fail_after: None,
                stall: true,
            },
        );
    }

    /// Makes `url` unreachable again.
    pub fn go_offline(&self, url: &str) {
        self.replies.lock().unwrap().remove(url);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.load(Ordering::SeqCst)
    }

    fn lookup(&self, url: &str) -> Result<Reply> {
        self.replies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| Error::Network(format!("{url}: connection refused")))
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.lookup(&request.url)? {
            Reply::Response(response) => Ok(response),
            Reply::Stream {
                chunks,
                fail_after: None,
                stall: false,
                ..
            } => Ok(Response::ok(request.url.clone(), chunks.concat())),
            Reply::Stream { .. } => Err(Error::Network(format!("{}: reset", request.url))),
        }
    }

    async fn stream(&self, url: &str) -> Result<BodyStream> {
        self.streams.fetch_add(1, Ordering::SeqCst);
        match self.lookup(url)? {
            Reply::Response(response) => Ok(BodyStream {
                status: response.status,
                content_length: Some(response.body.len() as u64),
                chunks: futures::stream::iter(vec![Ok(response.body)]).boxed(),
            }),
            Reply::Stream {
                chunks,
                content_length,
                fail_after,
                stall,
            } => {
                let mut items: Vec<Result<Bytes>> = Vec::new();
                for (i, chunk) in chunks.into_iter().enumerate() {
                    if fail_after == Some(i) {
                        break;
                    }
                    items.push(Ok(chunk));
                }
                if let Some(n) = fail_after
                    && n <= items.len()
                {
                    items.push(Err(Error::Network(format!("{url}: connection reset"))));
                }
                let head = futures::stream::iter(items);
                let chunks = if stall {
                    head.chain(futures::stream::pending()).boxed()
                } else {
                    head.boxed()
                };
                Ok(BodyStream {
                    status: 200,
                    content_length,
                    chunks,
                })
            }
        }
    }
}

/// Records every progress callback.
#[derive(Default)]
pub struct RecordingProgress {
    pub states: Mutex<Vec<ProgressState>>,
    pub completed: Mutex<Vec<FetchStats>>,
    pub errors: Mutex<Vec<String>>,
    pub cache_hits: AtomicUsize,
}

impl RecordingProgress {
    pub fn percents(&self) -> Vec<Option<f64>> {
        self.states.lock().unwrap().iter().map(ProgressState::percent).collect()
    }

    pub fn received(&self) -> Vec<u64> {
        self.states.lock().unwrap().iter().map(|s| s.received).collect()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }
}

impl DownloadProgress for RecordingProgress {
    fn on_progress(&self, _url: &str, progress: &ProgressState, _speed: u64) {
        self.states.lock().unwrap().push(*progress);
    }

    fn on_cache_hit(&self, _url: &str, _size: u64) {
        self.cache_hits.fetch_add(1, Ordering::SeqCst);
    }

    fn on_complete(&self, _url: &str, stats: &FetchStats) {
        self.completed.lock().unwrap().push(stats.clone());
    }

    fn on_error(&self, _url: &str, error: &str) {
        self.errors.lock().unwrap().push(error.to_string());
    }
}

/// Runtime whose sessions return a fixed result.
pub struct MockRuntime {
    pub available: bool,
    pub output: Mutex<Option<ImageResult>>,
    pub sessions_created: AtomicUsize,
    pub generations: Arc<AtomicUsize>,
    pub received_parts: Mutex<Vec<String>>,
    /// Delay before a session is handed out.
    pub load_delay: Duration,
}

impl MockRuntime {
    pub fn returning(output: ImageResult) -> Self {
        Self {
            available: true,
            output: Mutex::new(Some(output)),
            sessions_created: AtomicUsize::new(0),
            generations: Arc::new(AtomicUsize::new(0)),
            received_parts: Mutex::new(Vec::new()),
            load_delay: Duration::ZERO,
        }
    }

    pub fn failing_generation() -> Self {
        let runtime = Self::returning(ImageResult::Unknown);
        *runtime.output.lock().unwrap() = None;
        runtime
    }

    pub fn without_backend() -> Self {
        Self {
            available: false,
            ..Self::returning(ImageResult::Unknown)
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub fn session_count(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelRuntime for MockRuntime {
    fn is_backend_available(&self, _backend: ExecutionBackend) -> bool {
        self.available
    }

    async fn create_session(
        &self,
        parts: Vec<ModelPart>,
        _options: &SessionOptions,
    ) -> Result<Arc<dyn ModelSession>> {
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        if parts.iter().any(|p| p.bytes.starts_with(b"garbage")) {
            return Err(Error::ModelConstruction(
                "protobuf parsing failed".to_string(),
            ));
        }
        self.received_parts
            .lock()
            .unwrap()
            .extend(parts.iter().map(|p| p.name.clone()));
        self.sessions_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            output: self.output.lock().unwrap().clone(),
            generations: Arc::clone(&self.generations),
        }))
    }
}

struct MockSession {
    output: Option<ImageResult>,
    generations: Arc<AtomicUsize>,
}

#[async_trait]
impl ModelSession for MockSession {
    async fn run(&self, inputs: NamedTensors) -> Result<NamedTensors> {
        Ok(inputs)
    }

    async fn generate(&self, _prompt: &str, _options: &GenerationOptions) -> Result<ImageResult> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        self.output
            .clone()
            .ok_or_else(|| Error::Generation("out of device memory".to_string()))
    }
}
