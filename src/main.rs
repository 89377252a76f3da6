use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Json, State,
    },
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use chrono::Local;
use futures_util::{SinkExt, StreamExt};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::Deserialize;
use serde_json::json;
use std::{
    env,
    fs::OpenOptions,
    io::Write,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    num::NonZeroU32,
    path::PathBuf,
    sync::{Arc, Mutex},
};
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{AllowOrigin, CorsLayer};

use lettuce_server::models::{LifecycleStatus, ManualTarget};
use lettuce_server::services::{
    revoke_google_token, BroadcastError, BroadcastOrchestrator, CredentialResolver, DocumentStore,
    FfmpegTranscoder, IdentityProvider, LifecycleMachine, LifecycleTunables, MemoryStore,
    RelaySession, SignedTokenVerifier, TokenCipher, Transcoder, TransitionErrorBody, TwitchHandler,
    YouTubeApi, YouTubeHandler, HEARTBEAT_INTERVAL,
};

const DEFAULT_PORT: u16 = 8787;
const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 100;
const DEFAULT_BROADCAST_TITLE: &str = "Lettuce Stream Live";

#[derive(Clone)]
struct AppState {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    credentials: Arc<CredentialResolver>,
    orchestrator: Arc<BroadcastOrchestrator>,
    transcoder: Arc<dyn Transcoder>,
    cipher: Arc<TokenCipher>,
    http_client: reqwest::Client,
    tunables: LifecycleTunables,
    rate_limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

// ============================================================================
// Logging
// ============================================================================

struct ServerLogger {
    file: Mutex<std::fs::File>,
    level: LevelFilter,
}

impl ServerLogger {
    fn new(log_dir: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let log_path = log_dir.join("lettuce-server.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        Ok(Self {
            file: Mutex::new(file),
            level: LevelFilter::Info,
        })
    }
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let date = timestamp.format("%Y-%m-%d");
        let time = timestamp.format("%H:%M:%S");
        let target = record.target();
        let level = record.level();
        let message = format!("{}", record.args());
        let line = format!("[{date}][{time}][{target}][{level}] {message}");

        if let Ok(mut file) = self.file.try_lock() {
            let _ = writeln!(file, "{line}");
        }

        if level <= Level::Info {
            eprintln!("{line}");
        }
    }

    fn flush(&self) {}
}

fn init_logger(log_dir: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let logger = ServerLogger::new(log_dir)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

// ============================================================================
// CORS Configuration
// ============================================================================

fn build_cors_layer() -> CorsLayer {
    let cors_origins = env::var("LETTUCE_CORS_ORIGINS")
        .unwrap_or_else(|_| "http://localhost:*,http://127.0.0.1:*".to_string());

    let allowed_origins: Vec<String> = cors_origins
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let origin_str = match origin.to_str() {
                Ok(s) => s,
                Err(_) => return false,
            };

            allowed_origins.iter().any(|allowed| {
                if allowed.ends_with(":*") {
                    // Wildcard port matching
                    let prefix = allowed.trim_end_matches(":*");
                    origin_str.starts_with(prefix) && origin_str[prefix.len()..].starts_with(':')
                } else {
                    origin_str == allowed
                }
            })
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}

/// Rate limiting middleware
async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match state.rate_limiter.check() {
        Ok(_) => next.run(request).await,
        Err(_) => {
            let body = json!({ "error": "Rate limit exceeded. Please try again later." });
            (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
        }
    }
}

fn error_response(error: BroadcastError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = match &error {
        BroadcastError::Transition {
            message,
            reason,
            snapshot,
            ..
        } => TransitionErrorBody {
            error: message.clone(),
            reason: reason.clone(),
            snapshot_status: Some(*snapshot),
        },
        other => TransitionErrorBody {
            error: other.to_string(),
            reason: None,
            snapshot_status: None,
        },
    };
    (status, Json(body)).into_response()
}

// ============================================================================
// Request Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoLiveRequest {
    id_token: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    destinations: Vec<String>,
    #[serde(default)]
    manual_targets: Vec<ManualTarget>,
}

/// POST /api/go-live - prepare ingest targets across all requested platforms
async fn go_live_handler(
    State(state): State<AppState>,
    Json(request): Json<GoLiveRequest>,
) -> Response {
    let uid = match state.identity.verify_id_token(&request.id_token).await {
        Ok(uid) => uid,
        Err(error) => return error_response(error),
    };

    let title = request
        .title
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_BROADCAST_TITLE.to_string());

    match state
        .orchestrator
        .go_live(&uid, &title, &request.destinations, &request.manual_targets)
        .await
    {
        Ok(summary) => {
            let errors: Vec<_> = summary
                .failures
                .iter()
                .map(|failure| {
                    json!({
                        "platform": failure.platform,
                        "message": failure.error.to_string(),
                    })
                })
                .collect();
            Json(json!({
                "sessions": summary.sessions,
                "ingestTargets": summary.targets,
                "errors": errors,
                "skipped": summary.skipped,
            }))
            .into_response()
        }
        Err(error) => error_response(error),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBroadcastRequest {
    id_token: String,
    #[serde(default)]
    title: Option<String>,
}

/// POST /api/youtube/start-broadcast - create and bind the remote objects
async fn start_broadcast_handler(
    State(state): State<AppState>,
    Json(request): Json<StartBroadcastRequest>,
) -> Response {
    let uid = match state.identity.verify_id_token(&request.id_token).await {
        Ok(uid) => uid,
        Err(error) => return error_response(error),
    };

    let connection = match state.credentials.resolve(&uid, "youtube").await {
        Ok(connection) => connection,
        Err(error) => return error_response(error),
    };

    let title = request
        .title
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_BROADCAST_TITLE.to_string());

    let api = YouTubeApi::new(state.http_client.clone(), connection.access_token);
    let machine = LifecycleMachine::with_tunables(api, state.tunables.clone());

    match machine.start_broadcast(&title).await {
        Ok(started) => Json(json!({
            "broadcastId": started.broadcast_id,
            "streamId": started.stream_id,
            "ingestionAddress": started.ingestion_address,
            "streamName": started.stream_name,
            "streamKey": started.stream_name,
            "rtmpUrl": format!(
                "{}/{}",
                started.ingestion_address.trim_end_matches('/'),
                started.stream_name
            ),
            "lifecycleStatus": started.lifecycle_status,
        }))
        .into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransitionBroadcastRequest {
    id_token: String,
    broadcast_id: String,
    status: LifecycleStatus,
}

/// Only these statuses may be requested over the API; `unknown` and
/// `created` are remote-reported states, not commands.
fn requestable_status(status: LifecycleStatus) -> bool {
    matches!(
        status,
        LifecycleStatus::Testing | LifecycleStatus::Live | LifecycleStatus::Complete
    )
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

/// POST /api/youtube/transition-broadcast - drive the broadcast to a status
async fn transition_broadcast_handler(
    State(state): State<AppState>,
    Json(request): Json<TransitionBroadcastRequest>,
) -> Response {
    if !requestable_status(request.status) {
        return bad_request("status must be one of testing, live, complete");
    }

    let uid = match state.identity.verify_id_token(&request.id_token).await {
        Ok(uid) => uid,
        Err(error) => return error_response(error),
    };

    let connection = match state.credentials.resolve(&uid, "youtube").await {
        Ok(connection) => connection,
        Err(error) => return error_response(error),
    };

    let api = YouTubeApi::new(state.http_client.clone(), connection.access_token);
    let machine = LifecycleMachine::with_tunables(api, state.tunables.clone());

    match machine
        .transition_broadcast(&request.broadcast_id, request.status)
        .await
    {
        Ok(status) => Json(json!({
            "broadcastId": request.broadcast_id,
            "status": status,
        }))
        .into_response(),
        Err(error) => error_response(error),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectRequest {
    id_token: String,
    provider: String,
}

/// POST /api/oauth/disconnect - revoke stored tokens and forget the
/// connection. Revocation is best-effort; removing the stored record is
/// what must succeed. Disconnecting an absent connection succeeds.
const DISCONNECTABLE_PROVIDERS: &[&str] = &["youtube", "twitch"];

async fn disconnect_handler(
    State(state): State<AppState>,
    Json(request): Json<DisconnectRequest>,
) -> Response {
    if !DISCONNECTABLE_PROVIDERS.contains(&request.provider.as_str()) {
        return bad_request("provider must be one of youtube, twitch");
    }

    let uid = match state.identity.verify_id_token(&request.id_token).await {
        Ok(uid) => uid,
        Err(error) => return error_response(error),
    };

    let provider = request.provider;
    let path = format!("users/{uid}/destinations/{provider}");

    if provider == "youtube" {
        if let Ok(Some(document)) = state.store.get(&path).await {
            let blob = document
                .get("tokens")
                .and_then(serde_json::Value::as_str)
                .and_then(|serialized| state.cipher.decrypt_blob(serialized));
            if let Some(blob) = blob {
                for token in [Some(blob.access_token.as_str()), blob.refresh_token.as_deref()]
                    .into_iter()
                    .flatten()
                    .filter(|t| !t.is_empty())
                {
                    if let Err(error) = revoke_google_token(&state.http_client, token).await {
                        log::warn!("Token revocation failed for {provider}: {error}");
                    }
                }
            }
        }
    }

    if let Err(error) = state.store.delete(&path).await {
        return error_response(BroadcastError::Configuration(error));
    }

    Json(json!({ "disconnected": true, "provider": provider })).into_response()
}

// ============================================================================
// Streaming Relay
// ============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_relay_socket(socket, state.transcoder.clone()))
}

async fn handle_relay_socket(socket: WebSocket, transcoder: Arc<dyn Transcoder>) {
    let connection_id = uuid::Uuid::new_v4();
    log::info!("Relay connection {connection_id} opened");

    let (mut sink, mut stream) = socket.split();
    let (mut session, mut exits) = RelaySession::new(transcoder);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            inbound = stream.next() => {
                let Some(Ok(message)) = inbound else { break };
                match message {
                    Message::Text(text) => {
                        let event = session.handle_text(&text).await;
                        if let Some(reply) = event.reply {
                            if sink.send(Message::Text(reply.to_string())).await.is_err() {
                                break;
                            }
                        }
                        if event.close {
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        session.handle_binary(Bytes::from(data)).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if session.is_streaming()
                    && sink.send(Message::Ping(Vec::new())).await.is_err()
                {
                    break;
                }
            }
            info = exits.recv() => {
                let Some(info) = info else { break };
                session.acknowledge_exit();
                let payload = RelaySession::exit_notification(info).to_string();
                let _ = sink.send(Message::Text(payload)).await;
                break;
            }
        }
    }

    // Converges with every other exit path; a second stop is a no-op.
    session.teardown();
    log::info!("Relay connection {connection_id} closed");
}

// ============================================================================
// Startup
// ============================================================================

fn parse_host(value: &str) -> IpAddr {
    value
        .parse()
        .unwrap_or(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)))
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received, server shutting down");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration from environment
    let host = env::var("LETTUCE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("LETTUCE_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let log_dir = PathBuf::from(
        env::var("LETTUCE_LOG_DIR").unwrap_or_else(|_| "data/logs".to_string()),
    );
    std::fs::create_dir_all(&log_dir)?;
    init_logger(&log_dir)?;

    let encryption_key = match env::var("LETTUCE_ENCRYPTION_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => {
            log::warn!("LETTUCE_ENCRYPTION_KEY not set, using development key");
            "lettuce-dev-key".to_string()
        }
    };
    let auth_secret = match env::var("LETTUCE_AUTH_SECRET") {
        Ok(secret) if !secret.is_empty() => secret,
        _ => {
            log::warn!("LETTUCE_AUTH_SECRET not set, using development secret");
            "lettuce-dev-secret".to_string()
        }
    };

    let ffmpeg_override = env::var("LETTUCE_FFMPEG_PATH").ok();
    let transcoder: Arc<dyn Transcoder> =
        Arc::new(FfmpegTranscoder::locate(ffmpeg_override.as_deref())?);

    let rate_limit = env::var("LETTUCE_RATE_LIMIT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_RATE_LIMIT_PER_MINUTE);
    let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(
        NonZeroU32::new(rate_limit).unwrap_or(NonZeroU32::new(100).unwrap()),
    )));

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
    let cipher = Arc::new(TokenCipher::new(&encryption_key));
    let identity: Arc<dyn IdentityProvider> = Arc::new(SignedTokenVerifier::new(&auth_secret));
    let credentials = Arc::new(CredentialResolver::new(store.clone(), cipher.clone()));
    let http_client = reqwest::Client::new();
    let tunables = LifecycleTunables::default();

    let orchestrator = Arc::new(BroadcastOrchestrator::new(
        credentials.clone(),
        store.clone(),
        vec![
            Arc::new(YouTubeHandler::new(http_client.clone(), tunables.clone())),
            Arc::new(TwitchHandler),
        ],
    ));

    let state = AppState {
        store,
        identity,
        credentials,
        orchestrator,
        transcoder,
        cipher,
        http_client,
        tunables,
        rate_limiter,
    };

    let cors = build_cors_layer();

    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .route("/api/go-live", post(go_live_handler))
        .route("/api/youtube/start-broadcast", post(start_broadcast_handler))
        .route(
            "/api/youtube/transition-broadcast",
            post(transition_broadcast_handler),
        )
        .route("/api/oauth/disconnect", post(disconnect_handler))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state,
            rate_limit_middleware,
        ))
        .layer(cors);

    let address = SocketAddr::new(parse_host(&host), port);
    log::info!("Lettuce Stream backend listening on http://{address}");

    let listener = tokio::net::TcpListener::bind(address).await?;

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_commandable_statuses_are_requestable() {
        assert!(requestable_status(LifecycleStatus::Testing));
        assert!(requestable_status(LifecycleStatus::Live));
        assert!(requestable_status(LifecycleStatus::Complete));
        assert!(!requestable_status(LifecycleStatus::Created));
        assert!(!requestable_status(LifecycleStatus::Unknown));
    }

    #[test]
    fn test_disconnect_provider_allowlist() {
        assert!(DISCONNECTABLE_PROVIDERS.contains(&"youtube"));
        assert!(DISCONNECTABLE_PROVIDERS.contains(&"twitch"));
        assert!(!DISCONNECTABLE_PROVIDERS.contains(&"facebook"));
    }

    #[test]
    fn test_logger_writes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = ServerLogger::new(dir.path()).unwrap();

        logger.log(
            &Record::builder()
                .args(format_args!("hello from the test"))
                .level(Level::Info)
                .target("lettuce_server")
                .build(),
        );

        let contents = std::fs::read_to_string(dir.path().join("lettuce-server.log")).unwrap();
        assert!(contents.contains("hello from the test"));
        assert!(contents.contains("[INFO]"));
    }

    #[test]
    fn test_parse_host_falls_back_to_loopback() {
        assert_eq!(parse_host("0.0.0.0"), "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(
            parse_host("not-an-address"),
            IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
        );
    }
}
