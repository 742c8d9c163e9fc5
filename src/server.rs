//! Web server for the mesh editor and cue control API

use anyhow::Result;
use arc_swap::ArcSwap;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};

use crate::config::OutputConfig;
use crate::editor::{grid_segments, Segment, Viewport};
use crate::error::WarpError;
use crate::frame::Frame;
use crate::mesh::Mesh;
use crate::playback::{PlaybackStatus, TriggerEvent};
use crate::playlist::{Playlist, VideoCue};
use crate::session::{MeshSummary, Session};
use crate::warp::WarpSettings;

/// Preview encoding stops this long after the last preview request
const PREVIEW_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Render loop statistics, refreshed every stats interval
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RenderStats {
    pub fps: f64,
    pub avg_render_us: u64,
    pub not_ready_frames: u64,
}

/// Shared application state
pub struct AppState {
    /// Mesh history, editor, playlist and cue controller
    pub session: Mutex<Session>,
    /// Mesh the renderer draws with, including live drags
    mesh_slot: Arc<ArcSwap<Mesh>>,
    output: OutputConfig,
    warp: WarpSettings,
    /// Latest preview frame (JPEG encoded)
    preview_frame: RwLock<Vec<u8>>,
    last_preview_request: Mutex<Option<Instant>>,
    stats: RwLock<RenderStats>,
    calibration_pattern: AtomicBool,
    shutdown: AtomicBool,
}

impl AppState {
    pub fn new(session: Session, output: OutputConfig, warp: WarpSettings) -> Self {
        let mesh_slot = session.published();
        let calibration_pattern = AtomicBool::new(output.calibration_pattern);
        Self {
            session: Mutex::new(session),
            mesh_slot,
            output,
            warp,
            preview_frame: RwLock::new(Vec::new()),
            last_preview_request: Mutex::new(None),
            stats: RwLock::new(RenderStats::default()),
            calibration_pattern,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn mesh_slot(&self) -> Arc<ArcSwap<Mesh>> {
        Arc::clone(&self.mesh_slot)
    }

    pub fn output_config(&self) -> &OutputConfig {
        &self.output
    }

    pub fn warp_settings(&self) -> WarpSettings {
        self.warp
    }

    pub fn calibration_pattern_enabled(&self) -> bool {
        self.calibration_pattern.load(Ordering::Relaxed)
    }

    pub fn set_calibration_pattern(&self, enabled: bool) {
        self.calibration_pattern.store(enabled, Ordering::Relaxed);
    }

    /// Note that a client is watching the preview
    pub fn request_preview(&self) {
        *self.last_preview_request.lock() = Some(Instant::now());
    }

    /// Whether the render loop should spend time on JPEG encoding
    pub fn should_encode_preview(&self) -> bool {
        self.last_preview_request
            .lock()
            .is_some_and(|t| t.elapsed() < PREVIEW_IDLE_TIMEOUT)
    }

    /// Update the preview frame (called from the render thread)
    pub fn update_preview(&self, frame: &Frame) {
        match frame.to_jpeg(70) {
            Ok(jpeg) => *self.preview_frame.write() = jpeg,
            Err(e) => tracing::debug!("Preview encode failed: {}", e),
        }
    }

    /// Get the latest preview frame
    pub fn get_preview(&self) -> Vec<u8> {
        self.preview_frame.read().clone()
    }

    pub fn record_stats(&self, stats: RenderStats) {
        *self.stats.write() = stats;
    }

    pub fn stats(&self) -> RenderStats {
        *self.stats.read()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for WarpError {
    fn into_response(self) -> Response {
        let status = match &self {
            WarpError::NotFound(_) => StatusCode::NOT_FOUND,
            WarpError::InvalidDimension { .. }
            | WarpError::MalformedMesh(_)
            | WarpError::ConfirmationRequired(_) => StatusCode::BAD_REQUEST,
            WarpError::FrameNotReady | WarpError::PersistenceFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Mesh editing
        .route("/api/mesh", get(get_mesh))
        .route("/api/mesh/lines", get(get_mesh_lines))
        .route("/api/mesh/pointer", post(pointer_event))
        .route("/api/mesh/point/:id", post(set_point))
        .route("/api/mesh/undo", post(undo))
        .route("/api/mesh/redo", post(redo))
        .route("/api/mesh/reset", post(reset_mesh))
        .route("/api/mesh/generate", post(generate_mesh))
        .route("/api/save", post(save))
        // Playlist and cues
        .route("/api/playlist", get(get_playlist).post(add_cue))
        .route("/api/playlist/:id", delete(remove_cue))
        .route("/api/cue/event", post(cue_event))
        .route("/api/cue/status", get(cue_status))
        .route("/api/calibration/pattern", post(set_calibration_pattern))
        // Preview
        .route("/api/preview", get(get_preview))
        .route("/api/preview/stream", get(preview_stream))
        // System info
        .route("/api/info", get(get_info))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Get the mesh as shown to the editor (live drag included)
async fn get_mesh(State(state): State<Arc<AppState>>) -> Json<MeshSummary> {
    Json(state.session.lock().summary())
}

async fn get_mesh_lines(
    State(state): State<Arc<AppState>>,
    Query(viewport): Query<Viewport>,
) -> Result<Json<Vec<Segment>>, WarpError> {
    let mesh = state.mesh_slot.load();
    Ok(Json(grid_segments(&mesh, viewport)?))
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PointerPhase {
    Down,
    Move,
    Up,
    Cancel,
}

/// Pointer event in viewport pixels
#[derive(Deserialize)]
struct PointerRequest {
    phase: PointerPhase,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    width: u32,
    height: u32,
}

#[derive(Serialize)]
struct PointerResponse {
    /// Point under the pointer on `down`
    target: Option<String>,
    /// Whether the mesh changed (live on move, committed on up/cancel)
    changed: bool,
    mesh: MeshSummary,
}

async fn pointer_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PointerRequest>,
) -> Result<Json<PointerResponse>, WarpError> {
    let viewport = Viewport::new(req.width, req.height);
    let mut session = state.session.lock();
    let (target, changed) = match req.phase {
        PointerPhase::Down => (session.pointer_down(viewport, req.x, req.y), false),
        PointerPhase::Move => (None, session.pointer_move(viewport, req.x, req.y)?),
        PointerPhase::Up => (None, session.pointer_up()),
        PointerPhase::Cancel => (None, session.pointer_cancel()),
    };
    Ok(Json(PointerResponse {
        target,
        changed,
        mesh: session.summary(),
    }))
}

/// Normalized point position
#[derive(Deserialize)]
struct PointUpdate {
    x: f64,
    y: f64,
}

async fn set_point(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(point): Json<PointUpdate>,
) -> Result<Json<MeshSummary>, WarpError> {
    let mut session = state.session.lock();
    session.set_point(&id, point.x, point.y)?;
    Ok(Json(session.summary()))
}

#[derive(Serialize)]
struct HistoryResponse {
    applied: bool,
    mesh: MeshSummary,
}

async fn undo(State(state): State<Arc<AppState>>) -> Json<HistoryResponse> {
    let mut session = state.session.lock();
    let applied = session.undo();
    Json(HistoryResponse {
        applied,
        mesh: session.summary(),
    })
}

async fn redo(State(state): State<Arc<AppState>>) -> Json<HistoryResponse> {
    let mut session = state.session.lock();
    let applied = session.redo();
    Json(HistoryResponse {
        applied,
        mesh: session.summary(),
    })
}

#[derive(Deserialize)]
struct ResetRequest {
    #[serde(default)]
    confirm: bool,
}

async fn reset_mesh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetRequest>,
) -> Result<Json<MeshSummary>, WarpError> {
    let mut session = state.session.lock();
    session.reset_mesh(req.confirm)?;
    Ok(Json(session.summary()))
}

#[derive(Deserialize)]
struct GenerateRequest {
    rows: usize,
    cols: usize,
    #[serde(default)]
    confirm: bool,
}

async fn generate_mesh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Json<MeshSummary>, WarpError> {
    let mut session = state.session.lock();
    session.regenerate(req.rows, req.cols, req.confirm)?;
    Ok(Json(session.summary()))
}

/// Save mesh and playlist to storage
async fn save(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, WarpError> {
    state.session.lock().save()?;
    Ok((StatusCode::OK, "Saved"))
}

async fn get_playlist(State(state): State<Arc<AppState>>) -> Json<Playlist> {
    Json(state.session.lock().playlist().clone())
}

#[derive(Deserialize)]
struct AddCueRequest {
    name: String,
    uri: String,
    #[serde(rename = "loop", default)]
    looping: bool,
    #[serde(default)]
    duration: Option<f64>,
}

async fn add_cue(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddCueRequest>,
) -> Json<VideoCue> {
    let cue = state
        .session
        .lock()
        .add_cue(&req.name, &req.uri, req.looping, req.duration);
    Json(cue)
}

async fn remove_cue(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<VideoCue>, WarpError> {
    Ok(Json(state.session.lock().remove_cue(&id)?))
}

#[derive(Deserialize)]
struct CueEventRequest {
    event: TriggerEvent,
}

async fn cue_event(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CueEventRequest>,
) -> Json<PlaybackStatus> {
    let status = state.session.lock().handle_event(req.event);
    tracing::info!("Cue event {:?} -> {:?}", req.event, status.state);
    Json(status)
}

async fn cue_status(State(state): State<Arc<AppState>>) -> Json<PlaybackStatus> {
    Json(state.session.lock().playback_status())
}

#[derive(Deserialize)]
struct PatternRequest {
    enabled: bool,
}

/// Toggle the warped test pattern shown while armed
async fn set_calibration_pattern(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PatternRequest>,
) -> impl IntoResponse {
    state.set_calibration_pattern(req.enabled);
    StatusCode::OK
}

/// Get current preview frame (JPEG)
async fn get_preview(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.request_preview();
    let frame = state.get_preview();
    if frame.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response();
    }

    ([(axum::http::header::CONTENT_TYPE, "image/jpeg")], frame).into_response()
}

/// MJPEG stream endpoint for continuous preview
async fn preview_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        Duration::from_millis(100), // ~10 fps for preview
    ))
    .map(move |_| {
        state.request_preview();
        let frame = state.get_preview();
        if frame.is_empty() {
            return Ok::<_, std::convert::Infallible>(
                b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec(),
            );
        }

        let mut response = Vec::with_capacity(frame.len() + 64);
        response.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
        response.extend_from_slice(frame.len().to_string().as_bytes());
        response.extend_from_slice(b"\r\n\r\n");
        response.extend_from_slice(&frame);
        response.extend_from_slice(b"\r\n");

        Ok(response)
    });

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        Body::from_stream(stream),
    )
}

/// System information response
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    width: u32,
    height: u32,
    fps: u32,
    warp: WarpSettings,
    persistent: bool,
    calibration_pattern: bool,
    stats: RenderStats,
}

async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let persistent = state.session.lock().is_persistent();
    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        width: state.output.width,
        height: state.output.height,
        fps: state.output.fps,
        warp: state.warp,
        persistent,
        calibration_pattern: state.calibration_pattern_enabled(),
        stats: state.stats(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::MemoryBlobStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> (Arc<AppState>, Router) {
        let config = Config::default();
        let session =
            Session::load(Box::new(MemoryBlobStore::new()), config.session_settings()).unwrap();
        let state = Arc::new(AppState::new(session, config.output, config.warp));
        (state.clone(), router(state))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn point(mesh: &Value, id: &str) -> (f64, f64) {
        let p = mesh["points"]
            .as_array()
            .unwrap()
            .iter()
            .find(|p| p["id"] == id)
            .unwrap();
        (p["x"].as_f64().unwrap(), p["y"].as_f64().unwrap())
    }

    fn pointer(phase: &str, x: f64, y: f64) -> Value {
        json!({"phase": phase, "x": x, "y": y, "width": 900, "height": 900})
    }

    #[tokio::test]
    async fn test_get_default_mesh() {
        let (_, app) = app();
        let (status, mesh) = send(&app, "GET", "/api/mesh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(mesh["rows"], 4);
        assert_eq!(mesh["cols"], 4);
        assert_eq!(mesh["points"].as_array().unwrap().len(), 16);
        assert_eq!(mesh["can_undo"], false);
    }

    #[tokio::test]
    async fn test_pointer_drag_and_undo() {
        let (state, app) = app();

        // 1-1 sits at (300, 300) in a 900x900 viewport
        let (_, down) = send(&app, "POST", "/api/mesh/pointer", Some(pointer("down", 305.0, 298.0))).await;
        assert_eq!(down["target"], "1-1");

        let (_, moved) = send(&app, "POST", "/api/mesh/pointer", Some(pointer("move", 450.0, 360.0))).await;
        assert_eq!(moved["changed"], true);
        assert_eq!(moved["mesh"]["dragging"], "1-1");
        // The renderer already sees the live position
        assert!((state.mesh_slot().load().get("1-1").unwrap().x - 0.5).abs() < 1e-12);

        let (_, up) = send(&app, "POST", "/api/mesh/pointer", Some(pointer("up", 0.0, 0.0))).await;
        assert_eq!(up["changed"], true);
        let (x, y) = point(&up["mesh"], "1-1");
        assert!((x - 0.5).abs() < 1e-12 && (y - 0.4).abs() < 1e-12);
        assert_eq!(up["mesh"]["history_length"], 2);

        let (_, undone) = send(&app, "POST", "/api/mesh/undo", None).await;
        assert_eq!(undone["applied"], true);
        let (x, _) = point(&undone["mesh"], "1-1");
        assert!((x - 1.0 / 3.0).abs() < 1e-12);

        let (_, redone) = send(&app, "POST", "/api/mesh/redo", None).await;
        assert_eq!(redone["applied"], true);
        assert_eq!(redone["mesh"]["can_redo"], false);
    }

    #[tokio::test]
    async fn test_pointer_miss() {
        let (_, app) = app();
        let (_, down) = send(&app, "POST", "/api/mesh/pointer", Some(pointer("down", 150.0, 150.0))).await;
        assert_eq!(down["target"], Value::Null);
        let (_, moved) = send(&app, "POST", "/api/mesh/pointer", Some(pointer("move", 10.0, 10.0))).await;
        assert_eq!(moved["changed"], false);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (_, app) = app();
        let (status, body) = send(&app, "POST", "/api/mesh/point/9-9", Some(json!({"x": 0.5, "y": 0.5}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("9-9"));

        let (status, _) = send(&app, "POST", "/api/mesh/reset", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &app,
            "POST",
            "/api/mesh/generate",
            Some(json!({"rows": 1, "cols": 3, "confirm": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "DELETE", "/api/playlist/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_generate_and_lines() {
        let (_, app) = app();
        let (status, mesh) = send(
            &app,
            "POST",
            "/api/mesh/generate",
            Some(json!({"rows": 2, "cols": 3, "confirm": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(mesh["cols"], 3);

        let (status, lines) = send(&app, "GET", "/api/mesh/lines?width=200&height=100", None).await;
        assert_eq!(status, StatusCode::OK);
        // 2 rows x 2 horizontal + 3 cols x 1 vertical
        assert_eq!(lines.as_array().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_cue_flow() {
        let (_, app) = app();
        let (status, cue) = send(
            &app,
            "POST",
            "/api/playlist",
            Some(json!({"name": "grid", "uri": "pattern:grid", "loop": true})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cue["loop"], true);

        let (_, playlist) = send(&app, "GET", "/api/playlist", None).await;
        assert_eq!(playlist["cues"].as_array().unwrap().len(), 1);
        assert_eq!(playlist["currentCueIndex"], 0);

        let (_, status) = send(&app, "POST", "/api/cue/event", Some(json!({"event": "trigger"}))).await;
        assert_eq!(status["state"], "playing");
        assert_eq!(status["play_token"], 1);

        let (_, status) = send(&app, "POST", "/api/cue/event", Some(json!({"event": "toggle_blackout"}))).await;
        assert_eq!(status["state"], "blackout");

        let (_, status) = send(&app, "GET", "/api/cue/status", None).await;
        assert_eq!(status["state"], "blackout");

        let id = cue["id"].as_str().unwrap();
        let (status, _) = send(&app, "DELETE", &format!("/api/playlist/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_preview_lifecycle() {
        let (state, app) = app();
        assert!(!state.should_encode_preview());

        let request = Request::builder().uri("/api/preview").body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.should_encode_preview());

        state.update_preview(&Frame::new_black(16, 8));
        let request = Request::builder().uri("/api/preview").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "image/jpeg");
    }

    #[tokio::test]
    async fn test_info_and_pattern_toggle() {
        let (state, app) = app();
        let (status, _) = send(&app, "POST", "/api/calibration/pattern", Some(json!({"enabled": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.calibration_pattern_enabled());

        let (_, info) = send(&app, "GET", "/api/info", None).await;
        assert_eq!(info["width"], 1280);
        assert_eq!(info["persistent"], true);
        assert_eq!(info["calibration_pattern"], true);
        assert_eq!(info["warp"]["mode"], "blit");
    }
}
