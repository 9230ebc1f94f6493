//! HTTP front-end: page commands under `/api`, cached assets everywhere else.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method as HttpMethod, StatusCode, Uri};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{Error, Result};
use crate::page::{Command, Page, Status};
use crate::request::{Destination, Request, Response};
use crate::worker::{Registration, resolve_url};

/// Shared state of every handler.
#[derive(Clone)]
pub struct ApiState {
    page: Arc<Page>,
    registration: Arc<Registration>,
    upstream: Option<String>,
    shutdown: CancellationToken,
}

impl ApiState {
    #[must_use]
    pub const fn new(
        page: Arc<Page>,
        registration: Arc<Registration>,
        upstream: Option<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            page,
            registration,
            upstream,
            shutdown,
        }
    }
}

#[derive(Deserialize)]
struct GenerateRequest {
    prompt: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct StatusResponse {
    message: String,
    model_loaded: bool,
    status: Status,
}

impl StatusResponse {
    fn new(page: &Page, status: Status) -> Self {
        Self {
            message: status.to_string(),
            model_loaded: page.is_model_loaded(),
            status,
        }
    }
}

async fn api_health() -> impl IntoResponse {
    axum::Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn api_status(State(state): State<ApiState>) -> impl IntoResponse {
    axum::Json(StatusResponse::new(&state.page, state.page.status()))
}

async fn run_command(state: &ApiState, command: Command) -> HttpResponse {
    let cancel = state.shutdown.child_token();
    let status = state.page.handle(command, &cancel).await;
    let code = match status {
        Status::Rejected { .. } => StatusCode::BAD_REQUEST,
        Status::Error { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    (code, axum::Json(StatusResponse::new(&state.page, status))).into_response()
}

async fn api_generate(
    State(state): State<ApiState>,
    axum::Json(payload): axum::Json<GenerateRequest>,
) -> HttpResponse {
    run_command(
        &state,
        Command::Generate {
            prompt: payload.prompt,
        },
    )
    .await
}

async fn api_load(State(state): State<ApiState>) -> HttpResponse {
    run_command(&state, Command::LoadModel).await
}

async fn api_image(State(state): State<ApiState>) -> HttpResponse {
    match state.page.snapshot_png() {
        Ok(Some(png)) => ([("content-type", "image/png")], png).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "No image rendered yet").into_response(),
        Err(e) => {
            log::error!("Could not encode frame: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves any other `GET` through the asset worker.
async fn cached_asset(
    State(state): State<ApiState>,
    method: HttpMethod,
    uri: Uri,
    headers: HeaderMap,
) -> HttpResponse {
    if method != HttpMethod::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    let Some(upstream) = state.upstream.as_deref() else {
        return (StatusCode::NOT_FOUND, "No upstream origin configured").into_response();
    };

    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let mut request = Request::get(resolve_url(Some(upstream), path));
    if let Some(dest) = headers
        .get("sec-fetch-dest")
        .and_then(|v| v.to_str().ok())
        .and_then(Destination::from_fetch_dest)
    {
        request = request.with_destination(dest);
    }

    match state.registration.handle_fetch(&request).await {
        Ok(response) => into_http(response),
        Err(e) => {
            log::warn!("GET {} failed: {e}", request.url);
            (StatusCode::BAD_GATEWAY, e.to_string()).into_response()
        }
    }
}

/// Headers that describe the original transfer rather than the payload.
const HOP_BY_HOP: &[&str] = &["connection", "content-length", "transfer-encoding", "keep-alive"];

fn into_http(response: Response) -> HttpResponse {
    // Opaque responses carry no readable status.
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = HttpResponse::new(Body::from(response.body));
    *out.status_mut() = status;
    for (name, value) in &response.headers {
        if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.headers_mut().append(name, value);
        }
    }
    out
}

/// Builds the router with permissive CORS.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/status", get(api_status))
        .route("/api/generate", post(api_generate))
        .route("/api/load", post(api_load))
        .route("/api/image.png", get(api_image))
        .fallback(cached_asset)
        .layer(cors)
        .with_state(state)
}

/// Serves the front-end on `host:port` until the state's shutdown token fires.
///
/// # Errors
///
/// Returns an error if the address is invalid or cannot be bound.
pub async fn run_server(state: ApiState, host: &str, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| Error::Config(format!("invalid listen address {host}:{port}: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("Listening on http://{}", listener.local_addr()?);

    let shutdown = state.shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use axum::http::Request as HttpRequest;
    use bytes::Bytes;
    use tower::ServiceExt;

    use super::*;
    use crate::fetcher::ModelFetcher;
    use crate::runtime::{GenerationOptions, ImageResult};
    use crate::session::{ModelFile, PageSession, PipelineConfig};
    use crate::store::MemoryCacheStore;
    use crate::testing::{MockNetwork, MockRuntime};
    use crate::worker::WorkerConfig;

    const ORIGIN: &str = "https://app.test";

    async fn app(output: ImageResult) -> (Router, Arc<MockNetwork>) {
        let net = Arc::new(MockNetwork::new());
        net.ok("https://app.test/index.html", "<html>nyvera</html>");
        net.stream_reply(
            "https://models.test/unet/model.onnx",
            vec![Bytes::from_static(b"weights")],
            true,
        );
        let store = Arc::new(MemoryCacheStore::new());

        let registration = Arc::new(Registration::new(store.clone(), net.clone()));
        registration
            .register(
                WorkerConfig::new("nyvera-cache-v1")
                    .with_origin(ORIGIN)
                    .with_precache(["/index.html"]),
            )
            .await
            .unwrap();

        let pipeline = PipelineConfig {
            base_url: "https://models.test/".to_string(),
            files: vec![ModelFile::new("unet", "unet/model.onnx")],
            ..PipelineConfig::default()
        };
        let session = PageSession::new(
            ModelFetcher::new(store, net.clone(), "nyvera-cache-v1"),
            Arc::new(MockRuntime::returning(output)),
            pipeline,
            GenerationOptions::default(),
        );
        let state = ApiState::new(
            Arc::new(Page::new(session)),
            registration,
            Some(ORIGIN.to_string()),
            CancellationToken::new(),
        );
        (router(state), net)
    }

    fn get_req(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, json: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap()
    }

    async fn json_body(response: HttpResponse) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health() {
        let (app, _) = app(ImageResult::Unknown).await;
        let response = app.oneshot(get_req("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn generate_renders_and_serves_png() {
        let (app, _) = app(ImageResult::Raster {
            bytes: vec![10; 2 * 2 * 4],
            width: 2,
            height: 2,
        })
        .await;

        let response = app
            .clone()
            .oneshot(post_json("/api/generate", r#"{"prompt":"a red balloon"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["message"], "Done — image rendered (offline ready).");
        assert_eq!(body["model_loaded"], true);

        let png = app.oneshot(get_req("/api/image.png")).await.unwrap();
        assert_eq!(png.status(), StatusCode::OK);
        assert_eq!(png.headers()["content-type"], "image/png");
    }

    #[tokio::test]
    async fn empty_prompt_is_bad_request() {
        let (app, _) = app(ImageResult::Unknown).await;
        let response = app
            .clone()
            .oneshot(post_json("/api/generate", r#"{"prompt":"  "}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["message"], "Enter a prompt");

        let png = app.oneshot(get_req("/api/image.png")).await.unwrap();
        assert_eq!(png.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn load_then_status() {
        let (app, _) = app(ImageResult::Unknown).await;
        let response = app.clone().oneshot(post_json("/api/load", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let status = json_body(app.oneshot(get_req("/api/status")).await.unwrap()).await;
        assert_eq!(status["model_loaded"], true);
        assert_eq!(status["status"]["state"], "done");
    }

    #[tokio::test]
    async fn assets_are_served_from_cache() {
        let (app, net) = app(ImageResult::Unknown).await;
        net.go_offline("https://app.test/index.html");

        let response = app.clone().oneshot(get_req("/index.html")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<html>nyvera</html>");

        let missing = app.clone().oneshot(get_req("/missing.js")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_GATEWAY);

        let image = app.oneshot(get_req("/img/a.png")).await.unwrap();
        assert_eq!(image.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let response = Response::ok("https://app.test/a.js", "x")
            .with_header("Content-Length", "1")
            .with_header("content-type", "text/javascript");
        let http = into_http(response);
        assert!(http.headers().get("content-length").is_none());
        assert_eq!(http.headers()["content-type"], "text/javascript");
        assert_eq!(into_http(Response::opaque("https://x.test/")).status(), StatusCode::BAD_GATEWAY);
    }
}
