// Streaming Relay
// Per-connection actor feeding browser media frames into a supervised
// transcoder process that publishes to an RTMP ingest URL

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Interval between server-initiated pings on a relay socket.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Backpressure bound on frames queued ahead of the transcoder's stdin.
const FRAME_QUEUE_DEPTH: usize = 64;

/// Why a transcoder process stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Signal name, e.g. `SIGKILL`, when the process died to a signal.
    pub signal: Option<String>,
}

/// A running transcode owned by one relay connection.
pub struct TranscoderSession {
    /// Media frames bound for the process stdin.
    pub frames: mpsc::Sender<Bytes>,
    /// One-shot termination request.
    pub stop: oneshot::Sender<()>,
    /// Fires exactly once when the process exits, for any reason.
    pub exited: oneshot::Receiver<ExitInfo>,
}

/// Spawns transcode pipelines. A trait seam so the connection actor can be
/// exercised without a real ffmpeg binary.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn start(&self, ingest_url: &str) -> Result<TranscoderSession, String>;
}

/// Real pipeline: ffmpeg reading raw media from stdin, publishing FLV over
/// RTMP.
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    /// Locate ffmpeg, preferring an explicit override path.
    pub fn locate(override_path: Option<&str>) -> Result<Self, String> {
        let binary = match override_path {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => which::which("ffmpeg")
                .map_err(|_| "ffmpeg not found on PATH".to_string())?,
        };
        Ok(Self { binary })
    }

    fn publish_args(ingest_url: &str) -> Vec<String> {
        [
            "-re",
            "-i",
            "pipe:0",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-pix_fmt",
            "yuv420p",
            "-c:a",
            "aac",
            "-ar",
            "44100",
            "-b:a",
            "160k",
            "-f",
            "flv",
            ingest_url,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        13 => "SIGPIPE".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{other}"),
    }
}

#[cfg(unix)]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal().map(signal_name),
    }
}

#[cfg(not(unix))]
fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn start(&self, ingest_url: &str) -> Result<TranscoderSession, String> {
        let mut child = Command::new(&self.binary)
            .args(Self::publish_args(ingest_url))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("Failed to spawn ffmpeg: {e}"))?;

        let mut stdin = child.stdin.take();
        let stderr = child.stderr.take();

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ffmpeg: {line}");
                }
            });
        }

        let (frames_tx, mut frames_rx) = mpsc::channel::<Bytes>(FRAME_QUEUE_DEPTH);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = oneshot::channel::<ExitInfo>();

        tokio::spawn(async move {
            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    maybe = frames_rx.recv() => match maybe {
                        Some(chunk) => {
                            if let Some(pipe) = stdin.as_mut() {
                                if pipe.write_all(&chunk).await.is_err() {
                                    // Broken pipe; the wait arm reports why.
                                    stdin = None;
                                }
                            }
                        }
                        None => {
                            drop(stdin.take());
                            break child.wait().await;
                        }
                    },
                    _ = &mut stop_rx => {
                        drop(stdin.take());
                        if let Err(e) = child.start_kill() {
                            warn!("Failed to signal ffmpeg: {e}");
                        }
                        break child.wait().await;
                    }
                }
            };

            let info = match status {
                Ok(status) => exit_info(status),
                Err(e) => {
                    error!("Failed waiting on ffmpeg: {e}");
                    ExitInfo {
                        code: None,
                        signal: None,
                    }
                }
            };
            info!(
                "ffmpeg exited (code {:?}, signal {:?})",
                info.code, info.signal
            );
            let _ = exited_tx.send(info);
        });

        Ok(TranscoderSession {
            frames: frames_tx,
            stop: stop_tx,
            exited: exited_rx,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestSpec {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    stream_key: Option<String>,
}

impl IngestSpec {
    /// Full publish URL, or `None` when no usable address was supplied.
    fn publish_url(&self) -> Option<String> {
        let url = self.url.as_deref().filter(|u| !u.is_empty())?;
        match self.stream_key.as_deref() {
            Some(key) if !key.is_empty() => {
                Some(format!("{}/{}", url.trim_end_matches('/'), key))
            }
            _ => Some(url.to_string()),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientMessage {
    Start {
        #[serde(default)]
        ingest: Option<IngestSpec>,
    },
    Stop,
}

/// What the connection loop should do after handling one inbound message.
#[derive(Debug, Default, PartialEq)]
pub struct RelayEvent {
    pub reply: Option<Value>,
    pub close: bool,
}

impl RelayEvent {
    fn reply(value: Value) -> Self {
        Self {
            reply: Some(value),
            close: false,
        }
    }

    fn ignore() -> Self {
        Self::default()
    }
}

struct ActiveTranscode {
    frames: mpsc::Sender<Bytes>,
    stop: Option<oneshot::Sender<()>>,
}

/// Per-connection relay state machine.
///
/// Owns at most one transcoder at a time. Teardown is idempotent and safe
/// to call from every exit path: explicit stop, socket close, and process
/// death all converge on the same cleanup.
///
/// Exit notifications arrive on the receiver returned by [`Self::new`] so
/// the owning socket loop can select on them alongside inbound frames;
/// after each one, [`Self::acknowledge_exit`] readies the session for a
/// fresh start message.
pub struct RelaySession {
    transcoder: std::sync::Arc<dyn Transcoder>,
    active: Option<ActiveTranscode>,
    exit_tx: mpsc::Sender<ExitInfo>,
}

impl RelaySession {
    pub fn new(transcoder: std::sync::Arc<dyn Transcoder>) -> (Self, mpsc::Receiver<ExitInfo>) {
        let (exit_tx, exit_rx) = mpsc::channel(4);
        (
            Self {
                transcoder,
                active: None,
                exit_tx,
            },
            exit_rx,
        )
    }

    pub fn is_streaming(&self) -> bool {
        self.active.is_some()
    }

    /// Handle one text frame from the client.
    pub async fn handle_text(&mut self, text: &str) -> RelayEvent {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring unparseable relay message: {e}");
                return RelayEvent::ignore();
            }
        };

        match message {
            ClientMessage::Start { ingest } => self.handle_start(ingest).await,
            ClientMessage::Stop => {
                self.teardown();
                RelayEvent::ignore()
            }
        }
    }

    async fn handle_start(&mut self, ingest: Option<IngestSpec>) -> RelayEvent {
        // A start while already streaming is a client retry; ignore it
        // rather than spawning a second process.
        if self.active.is_some() {
            debug!("Ignoring start while already streaming");
            return RelayEvent::ignore();
        }

        let url = match ingest.as_ref().and_then(IngestSpec::publish_url) {
            Some(url) => url,
            None => {
                return RelayEvent {
                    reply: Some(json!({
                        "type": "error",
                        "error": "INGEST_URL_MISSING",
                    })),
                    close: true,
                };
            }
        };

        match self.transcoder.start(&url).await {
            Ok(session) => {
                info!("Relay streaming to ingest endpoint");
                let exit_tx = self.exit_tx.clone();
                let exited = session.exited;
                tokio::spawn(async move {
                    let info = exited.await.unwrap_or(ExitInfo {
                        code: None,
                        signal: None,
                    });
                    let _ = exit_tx.send(info).await;
                });
                self.active = Some(ActiveTranscode {
                    frames: session.frames,
                    stop: Some(session.stop),
                });
                RelayEvent::reply(json!({ "type": "relay-ready" }))
            }
            Err(e) => {
                error!("Failed to start transcoder: {e}");
                RelayEvent {
                    reply: Some(json!({
                        "type": "error",
                        "error": "TRANSCODER_SPAWN_FAILED",
                    })),
                    close: true,
                }
            }
        }
    }

    /// Forward one binary media frame. Frames arriving while idle, or after
    /// the process died, are dropped.
    pub async fn handle_binary(&mut self, data: Bytes) {
        if let Some(active) = self.active.as_ref() {
            if active.frames.send(data).await.is_err() {
                debug!("Dropping frame: transcoder input closed");
            }
        }
    }

    /// Request termination of the running transcode, if any. Idempotent:
    /// the stop signal fires at most once and repeat calls are no-ops.
    pub fn teardown(&mut self) {
        if let Some(active) = self.active.as_mut() {
            if let Some(stop) = active.stop.take() {
                info!("Stopping transcoder");
                let _ = stop.send(());
            }
        }
    }

    /// Clear the active slot after an exit notification was observed,
    /// leaving the session ready for a fresh start message.
    pub fn acknowledge_exit(&mut self) {
        self.active = None;
    }

    /// Wire shape for the exit notification sent to the client.
    pub fn exit_notification(info: ExitInfo) -> Value {
        json!({
            "type": "ffmpeg-exit",
            "code": info.code,
            "signal": info.signal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Counts spawns and kills; each fake process exits with signal 9 when
    /// stopped or when its frame channel closes.
    #[derive(Default)]
    struct MockTranscoder {
        spawned: AtomicU32,
        stopped: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Transcoder for MockTranscoder {
        async fn start(&self, _ingest_url: &str) -> Result<TranscoderSession, String> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let (frames_tx, mut frames_rx) = mpsc::channel::<Bytes>(4);
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            let (exited_tx, exited_rx) = oneshot::channel::<ExitInfo>();

            let stopped = self.stopped.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop_rx => {
                        stopped.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = async { while frames_rx.recv().await.is_some() {} } => {}
                }
                let _ = exited_tx.send(ExitInfo {
                    code: None,
                    signal: Some("SIGKILL".to_string()),
                });
            });

            Ok(TranscoderSession {
                frames: frames_tx,
                stop: stop_tx,
                exited: exited_rx,
            })
        }
    }

    struct FailingTranscoder;

    #[async_trait]
    impl Transcoder for FailingTranscoder {
        async fn start(&self, _ingest_url: &str) -> Result<TranscoderSession, String> {
            Err("spawn failed".to_string())
        }
    }

    fn start_message() -> String {
        json!({
            "type": "start",
            "ingest": { "url": "rtmp://live.twitch.tv/app", "streamKey": "abc123" },
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_start_spawns_and_replies_ready() {
        let transcoder = Arc::new(MockTranscoder::default());
        let (mut session, _exits) = RelaySession::new(transcoder.clone());

        let event = session.handle_text(&start_message()).await;
        assert_eq!(event.reply.unwrap()["type"], "relay-ready");
        assert!(!event.close);
        assert!(session.is_streaming());
        assert_eq!(transcoder.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_while_streaming_spawns_nothing() {
        let transcoder = Arc::new(MockTranscoder::default());
        let (mut session, _exits) = RelaySession::new(transcoder.clone());

        session.handle_text(&start_message()).await;
        let event = session.handle_text(&start_message()).await;

        assert_eq!(event, RelayEvent::ignore());
        assert_eq!(transcoder.spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_ingest_url_errors_and_closes() {
        let transcoder = Arc::new(MockTranscoder::default());
        let (mut session, _exits) = RelaySession::new(transcoder.clone());

        let message = json!({ "type": "start", "ingest": { "streamKey": "k" } }).to_string();
        let event = session.handle_text(&message).await;

        assert_eq!(event.reply.unwrap()["error"], "INGEST_URL_MISSING");
        assert!(event.close);
        assert!(!session.is_streaming());
        assert_eq!(transcoder.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_kills_process_and_reports_exit() {
        let transcoder = Arc::new(MockTranscoder::default());
        let (mut session, mut exits) = RelaySession::new(transcoder.clone());

        session.handle_text(&start_message()).await;
        let event = session
            .handle_text(&json!({ "type": "stop" }).to_string())
            .await;
        assert_eq!(event, RelayEvent::ignore());

        let info = exits.recv().await.unwrap();
        session.acknowledge_exit();
        assert_eq!(info.signal.as_deref(), Some("SIGKILL"));
        assert!(!session.is_streaming());
        assert_eq!(transcoder.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let transcoder = Arc::new(MockTranscoder::default());
        let (mut session, mut exits) = RelaySession::new(transcoder.clone());

        session.handle_text(&start_message()).await;
        session.teardown();
        session.teardown();
        exits.recv().await.unwrap();
        session.acknowledge_exit();
        session.teardown();

        assert_eq!(transcoder.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_restart_after_exit_spawns_again() {
        let transcoder = Arc::new(MockTranscoder::default());
        let (mut session, mut exits) = RelaySession::new(transcoder.clone());

        session.handle_text(&start_message()).await;
        session.teardown();
        exits.recv().await.unwrap();
        session.acknowledge_exit();

        let event = session.handle_text(&start_message()).await;
        assert_eq!(event.reply.unwrap()["type"], "relay-ready");
        assert_eq!(transcoder.spawned.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_errors_and_closes() {
        let (mut session, _exits) = RelaySession::new(Arc::new(FailingTranscoder));

        let event = session.handle_text(&start_message()).await;
        assert_eq!(event.reply.unwrap()["error"], "TRANSCODER_SPAWN_FAILED");
        assert!(event.close);
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_binary_frames_reach_frame_channel() {
        let transcoder = Arc::new(MockTranscoder::default());
        let (mut session, mut exits) = RelaySession::new(transcoder);

        session.handle_text(&start_message()).await;
        session.handle_binary(Bytes::from_static(b"frame")).await;
        // Idle frames are dropped without error.
        session.teardown();
        exits.recv().await.unwrap();
        session.acknowledge_exit();
        session.handle_binary(Bytes::from_static(b"late")).await;
    }

    #[test]
    fn test_publish_url_joins_key() {
        let spec = IngestSpec {
            url: Some("rtmp://a.example/live/".to_string()),
            stream_key: Some("k1".to_string()),
        };
        assert_eq!(spec.publish_url().unwrap(), "rtmp://a.example/live/k1");

        let bare = IngestSpec {
            url: Some("rtmp://a.example/live".to_string()),
            stream_key: None,
        };
        assert_eq!(bare.publish_url().unwrap(), "rtmp://a.example/live");

        let missing = IngestSpec {
            url: None,
            stream_key: Some("k1".to_string()),
        };
        assert!(missing.publish_url().is_none());
    }
}
