//! Classroom Sync Server - real-time code synchronization for live coding classes
//!
//! A collaboration server using:
//! - Operational transformation with one serialized owner per document
//! - Sled embedded database for snapshots and session archives
//! - Axum with WebSocket for the live transport, JSON over HTTP for the rest
//! - Binary protocol (with a JSON fallback) for client/server messages

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

mod catalog;
mod config;
mod storage;
mod sync;

use catalog::{CatalogError, Difficulty, Problem, ProblemCatalog, ProblemFilter, SortKey};
use config::ServerConfig;
use storage::{SessionArchive, SnapshotStore, StorageStats};
use sync::{
    protocol::{ClientMessage, ErrorCode, ServerMessage, SyncProtocol, PROTOCOL_VERSION},
    router::Outbound,
    server::{SessionDetail, SessionInfo},
    session::SummaryReport,
    ParticipantId, SessionId, SyncError, SyncServer,
};

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Shared application state
pub struct AppState {
    /// Sessions, presence and documents
    sync_server: Arc<SyncServer>,
    /// Read-only problem catalog
    catalog: Arc<ProblemCatalog>,
    /// Server start time
    started_at: std::time::Instant,
}

impl AppState {
    pub fn new(sync_server: Arc<SyncServer>, catalog: ProblemCatalog) -> Self {
        Self {
            sync_server,
            catalog: Arc::new(catalog),
            started_at: std::time::Instant::now(),
        }
    }
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_sessions: usize,
    connections: usize,
    online_participants: usize,
    open_documents: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage: Option<StorageStats>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionRequest {
    teacher_id: ParticipantId,
    problem_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: SessionId,
    ws_url: String,
}

#[derive(Debug, Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionInfo>,
    total: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentResponse {
    document_id: String,
    content: String,
    version: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ProblemQuery {
    difficulty: Option<String>,
    category: Option<String>,
    search: Option<String>,
    sort: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProblemListResponse {
    problems: Vec<Problem>,
    total: usize,
    categories: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ArchiveSummary {
    session_id: String,
    teacher_id: String,
    problem_id: Option<String>,
    started_at: i64,
    ended_at: i64,
    report: SummaryReport,
}

impl From<SessionArchive> for ArchiveSummary {
    fn from(archive: SessionArchive) -> Self {
        Self {
            session_id: archive.session_id,
            teacher_id: archive.teacher_id,
            problem_id: archive.problem_id,
            started_at: archive.started_at,
            ended_at: archive.ended_at,
            report: archive.report,
        }
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Error returned by HTTP handlers
#[derive(Debug)]
enum ApiError {
    Sync(SyncError),
    BadRequest(String),
    NotFound(String),
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        ApiError::Sync(err)
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl From<storage::StorageError> for ApiError {
    fn from(err: storage::StorageError) -> Self {
        ApiError::Sync(err.into())
    }
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
        SyncError::StaleSnapshot { .. } | SyncError::AlreadyJoined(_, _) | SyncError::SessionFull(_) => {
            StatusCode::CONFLICT
        }
        SyncError::Unauthorized(_) => StatusCode::FORBIDDEN,
        SyncError::PresenceTimeout(_) => StatusCode::REQUEST_TIMEOUT,
        SyncError::TransportFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
        SyncError::SessionNotFound(_) | SyncError::DocumentNotFound(_) | SyncError::ParticipantNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        SyncError::Storage(_) | SyncError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Sync(err) => (
                status_for(&err),
                serde_json::json!({
                    "error": err.to_string(),
                    "code": ErrorCode::from(&err),
                    "retryable": err.is_retryable(),
                    "resync": err.requires_resync(),
                }),
            ),
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": message, "code": ErrorCode::InvalidMessage }),
            ),
            ApiError::NotFound(message) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": message, "code": ErrorCode::NotFound }),
            ),
        };
        if status.is_server_error() {
            error!("Request failed: {}", body["error"]);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// HTTP HANDLERS
// ============================================================================

/// Health check endpoint
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.sync_server.stats();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_sessions: stats.active_sessions,
        connections: stats.connections,
        online_participants: stats.online_participants,
        open_documents: stats.open_documents,
        storage: stats.storage,
    })
}

/// Start a class session
async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateSessionRequest>,
) -> ApiResult<CreateSessionResponse> {
    if payload.teacher_id.trim().is_empty() {
        return Err(ApiError::BadRequest("teacherId must not be empty".to_string()));
    }
    let session_id = state
        .sync_server
        .start_session(&payload.teacher_id, payload.problem_id)?;

    Ok(Json(CreateSessionResponse {
        ws_url: format!("/ws/{}", session_id),
        session_id,
    }))
}

/// List live sessions
async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionListResponse> {
    let sessions = state.sync_server.list_sessions();
    let total = sessions.len();
    Json(SessionListResponse { sessions, total })
}

/// Session detail with presence
async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionDetail> {
    Ok(Json(state.sync_server.session_detail(&session_id)?))
}

/// End a session and return the class report
async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<SummaryReport> {
    Ok(Json(state.sync_server.end_session(&session_id).await?))
}

/// Pull a participant's document, e.g. for code analysis
async fn get_document(
    State(state): State<Arc<AppState>>,
    Path((session_id, participant_id)): Path<(String, String)>,
) -> ApiResult<DocumentResponse> {
    let snapshot = state
        .sync_server
        .document_snapshot(&session_id, &participant_id)
        .await?;
    Ok(Json(DocumentResponse {
        document_id: snapshot.document_id,
        content: snapshot.content,
        version: snapshot.version,
    }))
}

/// Browse the problem catalog
async fn list_problems(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProblemQuery>,
) -> ApiResult<ProblemListResponse> {
    let mut filter = ProblemFilter::default();
    if let Some(difficulty) = query.difficulty.filter(|d| d != "all") {
        filter = filter.with_difficulty(
            difficulty
                .parse::<Difficulty>()
                .map_err(ApiError::BadRequest)?,
        );
    }
    if let Some(category) = query.category.filter(|c| c != "all") {
        filter = filter.with_category(category);
    }
    if let Some(search) = query.search {
        filter = filter.with_search(search);
    }
    if let Some(sort) = query.sort {
        filter = filter.sorted_by(sort.parse::<SortKey>()?);
    }

    let problems = state.catalog.query(&filter);
    Ok(Json(ProblemListResponse {
        total: problems.len(),
        problems,
        categories: state.catalog.categories(),
    }))
}

async fn get_problem(
    State(state): State<Arc<AppState>>,
    Path(problem_id): Path<u32>,
) -> ApiResult<Problem> {
    state
        .catalog
        .get(problem_id)
        .cloned()
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Problem not found: {}", problem_id)))
}

/// Summaries of ended sessions, newest first
async fn list_archives(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ArchiveSummary>> {
    let archives = match state.sync_server.storage() {
        Some(storage) => storage.list_archives()?,
        None => Vec::new(),
    };
    Ok(Json(archives.into_iter().map(ArchiveSummary::from).collect()))
}

async fn get_archive(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionArchive> {
    let archive = match state.sync_server.storage() {
        Some(storage) => storage.load_archive(&session_id)?,
        None => None,
    };
    archive
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Archive not found: {}", session_id)))
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.sync_server.session_exists(&session_id) {
        return Err(SyncError::SessionNotFound(session_id).into());
    }
    debug!(session_id = %session_id, "WebSocket upgrade request");
    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, session_id, state)))
}

/// Per-socket state
struct Connection {
    session_id: SessionId,
    participant_id: Option<ParticipantId>,
    tx: Outbound,
}

impl Connection {
    fn reply(&self, msg: ServerMessage) {
        if self.tx.send(msg).is_err() {
            debug!(session_id = %self.session_id, "Reply dropped, writer gone");
        }
    }

    fn reply_error(&self, err: &SyncError, document_id: Option<String>) {
        self.reply(SyncProtocol::sync_error(err, document_id));
    }
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, session_id: String, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4().to_string();

    info!(session_id = %session_id, connection_id = %connection_id, "New WebSocket connection");

    // Channel feeding this socket's writer; the router holds a clone once joined
    let (tx, rx) = mpsc::unbounded_channel::<ServerMessage>();
    let json_mode = Arc::new(AtomicBool::new(false));

    let writer_json = json_mode.clone();
    let send_task = tokio::spawn(async move {
        let mut outgoing = UnboundedReceiverStream::new(rx);
        while let Some(msg) = outgoing.next().await {
            let frame = if writer_json.load(Ordering::Relaxed) {
                SyncProtocol::encode_server_json(&msg).map(Message::Text)
            } else {
                SyncProtocol::encode_server(&msg).map(|bytes| Message::Binary(bytes.to_vec()))
            };
            match frame {
                Ok(frame) => {
                    if ws_sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode message: {}", e),
            }
        }
    });

    let mut conn = Connection {
        session_id: session_id.clone(),
        participant_id: None,
        tx: tx.clone(),
    };
    conn.reply(ServerMessage::Welcome {
        protocol_version: PROTOCOL_VERSION,
        connection_id: connection_id.clone(),
        server_time: chrono::Utc::now().timestamp(),
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let decoded = match msg {
            Message::Binary(data) => SyncProtocol::decode_client(&data),
            Message::Text(text) => {
                // JSON for debugging; answer in kind
                json_mode.store(true, Ordering::Relaxed);
                SyncProtocol::decode_client_json(&text)
            }
            Message::Close(_) => break,
            _ => continue,
        };

        match decoded {
            Ok(client_msg) => {
                if !handle_client_message(&mut conn, client_msg, &state).await {
                    break;
                }
            }
            Err(e) => {
                warn!(connection_id = %connection_id, error = %e, "Failed to decode message");
                conn.reply(SyncProtocol::error_response(ErrorCode::InvalidMessage, e.to_string(), None));
            }
        }
    }

    if let Some(participant_id) = &conn.participant_id {
        state.sync_server.disconnect(participant_id, &tx);
    }
    drop(conn);
    drop(tx);
    if let Err(e) = send_task.await {
        debug!("Writer task ended abnormally: {}", e);
    }
    info!(session_id = %session_id, connection_id = %connection_id, "WebSocket closed");
}

/// Handle a decoded client message; returns false when the socket should close
async fn handle_client_message(conn: &mut Connection, msg: ClientMessage, state: &Arc<AppState>) -> bool {
    let server = &state.sync_server;

    match msg {
        ClientMessage::Hello {
            protocol_version,
            client_name,
            resume_token,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                conn.reply(SyncProtocol::error_response(
                    ErrorCode::VersionMismatch,
                    format!("server speaks protocol {}", PROTOCOL_VERSION),
                    None,
                ));
                return true;
            }
            debug!(session_id = %conn.session_id, client_name = %client_name, "Hello");

            if let Some(token) = resume_token {
                match server.resume(&token, conn.tx.clone()) {
                    Ok(subscription) if subscription.session_id == conn.session_id => {
                        conn.participant_id = Some(subscription.participant_id.clone());
                        let participants = server.participants(&conn.session_id);
                        conn.reply(ServerMessage::SessionJoined {
                            subscription,
                            participants,
                        });
                    }
                    Ok(subscription) => {
                        server.disconnect(&subscription.participant_id, &conn.tx);
                        conn.reply(SyncProtocol::error_response(
                            ErrorCode::Unauthorized,
                            "resume token belongs to another session",
                            None,
                        ));
                    }
                    Err(e) => conn.reply_error(&e, None),
                }
            }
        }

        ClientMessage::JoinSession {
            session_id,
            participant_id,
            name,
            role,
        } => {
            if session_id != conn.session_id {
                conn.reply(SyncProtocol::error_response(
                    ErrorCode::InvalidMessage,
                    format!("connection belongs to session {}", conn.session_id),
                    None,
                ));
                return true;
            }
            if conn.participant_id.is_some() {
                conn.reply(SyncProtocol::error_response(
                    ErrorCode::AlreadyJoined,
                    "connection already joined",
                    None,
                ));
                return true;
            }
            match server.join(&session_id, &participant_id, &name, role, conn.tx.clone()) {
                Ok(subscription) => {
                    conn.participant_id = Some(participant_id);
                    conn.reply(ServerMessage::SessionJoined {
                        subscription,
                        participants: server.participants(&session_id),
                    });
                }
                Err(e) => conn.reply_error(&e, None),
            }
        }

        ClientMessage::Ping { timestamp } => {
            conn.reply(ServerMessage::Pong {
                timestamp,
                server_time: chrono::Utc::now().timestamp(),
            });
        }

        ClientMessage::Goodbye { reason } => {
            info!(
                session_id = %conn.session_id,
                reason = %reason.unwrap_or_default(),
                "Client said goodbye"
            );
            conn.reply(ServerMessage::Goodbye { reason: None });
            return false;
        }

        other => {
            let Some(participant_id) = conn.participant_id.clone() else {
                conn.reply(SyncProtocol::error_response(
                    ErrorCode::NotJoined,
                    "join a session first",
                    None,
                ));
                return true;
            };
            handle_participant_message(conn, &participant_id, other, state).await;
        }
    }
    true
}

/// Messages that need a joined participant
async fn handle_participant_message(
    conn: &mut Connection,
    participant_id: &str,
    msg: ClientMessage,
    state: &Arc<AppState>,
) {
    let server = &state.sync_server;

    match msg {
        ClientMessage::LeaveSession => match server.leave(participant_id) {
            Ok(session_id) => {
                conn.participant_id = None;
                conn.reply(ServerMessage::SessionLeft { session_id });
            }
            Err(e) => conn.reply_error(&e, None),
        },

        ClientMessage::SubmitOperation {
            document_id,
            operation,
        } => match server.submit(participant_id, &document_id, operation).await {
            Ok(applied) => conn.reply(ServerMessage::OperationAck {
                client_seq: applied.operation.client_seq,
                version: applied.version,
                duplicate: applied.duplicate,
                document_id,
            }),
            Err(e) => conn.reply_error(&e, Some(document_id)),
        },

        ClientMessage::Ack {
            document_id,
            version,
        } => {
            if let Err(e) = server.acknowledge(participant_id, &document_id, version) {
                conn.reply_error(&e, Some(document_id));
            }
        }

        ClientMessage::SnapshotRequest { document_id } => {
            match server.get_snapshot(participant_id, &document_id).await {
                Ok(snapshot) => conn.reply(ServerMessage::Snapshot { snapshot }),
                Err(e) => conn.reply_error(&e, Some(document_id)),
            }
        }

        ClientMessage::OperationsSince {
            document_id,
            version,
        } => match server
            .operations_since(participant_id, &document_id, version)
            .await
        {
            Ok(operations) => conn.reply(ServerMessage::OperationsReplay {
                document_id,
                operations,
            }),
            Err(e) => conn.reply_error(&e, Some(document_id)),
        },

        ClientMessage::Heartbeat => {
            if let Err(e) = server.heartbeat(participant_id) {
                conn.reply_error(&e, None);
            }
        }

        ClientMessage::CursorUpdate {
            document_id,
            offset,
            selection_end,
        } => {
            if let Err(e) = server.update_cursor(participant_id, &document_id, offset, selection_end) {
                conn.reply_error(&e, Some(document_id));
            }
        }

        ClientMessage::SetShareState { state: share_state } => {
            if let Err(e) = server.set_share_state(participant_id, share_state) {
                conn.reply_error(&e, None);
            }
        }

        ClientMessage::SetViewMode { mode } => {
            if let Err(e) = server.set_view_mode(participant_id, mode) {
                conn.reply_error(&e, None);
            }
        }

        ClientMessage::SelectProblem { problem_id } => {
            let known = problem_id.as_deref().map_or(true, |id| {
                id.parse::<u32>()
                    .ok()
                    .and_then(|id| state.catalog.get(id))
                    .is_some()
            });
            if !known {
                conn.reply(SyncProtocol::error_response(
                    ErrorCode::NotFound,
                    format!("unknown problem {}", problem_id.unwrap_or_default()),
                    None,
                ));
            } else if let Err(e) = server.select_problem(participant_id, problem_id) {
                conn.reply_error(&e, None);
            }
        }

        ClientMessage::ReportProgress {
            tests_passed,
            total_tests,
        } => {
            if let Err(e) = server.report_progress(participant_id, tests_passed, total_tests) {
                conn.reply_error(&e, None);
            }
        }

        ClientMessage::Hello { .. }
        | ClientMessage::JoinSession { .. }
        | ClientMessage::Ping { .. }
        | ClientMessage::Goodbye { .. } => {}
    }
}

// ============================================================================
// ROUTER
// ============================================================================

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Session lifecycle
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:session_id", get(get_session))
        .route("/api/sessions/:session_id/end", post(end_session))
        .route(
            "/api/sessions/:session_id/documents/:participant_id",
            get(get_document),
        )
        // Problem catalog
        .route("/api/problems", get(list_problems))
        .route("/api/problems/:problem_id", get(get_problem))
        // Archived sessions
        .route("/api/archives", get(list_archives))
        .route("/api/archives/:session_id", get(get_archive))
        // WebSocket endpoint
        .route("/ws/:session_id", get(ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before the filter reads RUST_LOG
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "classroom_sync=info,tower_http=info".into()),
        )
        .init();

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    info!("Initializing storage at: {}", config.storage_path);
    let storage = SnapshotStore::open(config.storage()).context("Failed to open storage")?;

    let catalog = match &config.catalog_path {
        Some(path) => ProblemCatalog::load_json(path)
            .with_context(|| format!("Failed to load catalog from {}", path.display()))?,
        None => ProblemCatalog::builtin(),
    };
    info!("Problem catalog loaded: {} problems", catalog.len());

    let sync_server = Arc::new(SyncServer::new(Some(Arc::new(storage)), config.sync_server()));
    let background = sync_server.clone().start_background_tasks();

    let state = Arc::new(AppState::new(sync_server.clone(), catalog));
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("Classroom sync server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   Listening on: http://{}", addr);
    info!("   WebSocket: ws://{}/ws/:session_id", addr);
    info!("   Health check: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sync_server.shutdown();
    background.wait().await;
    Ok(())
}
