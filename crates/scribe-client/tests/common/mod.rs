#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use scribe_client::{ChannelConfig, UploadConfig};
use scribe_types::{FrameKind, InboundMessage, classify_frame};
use tracing_subscriber::EnvFilter;

/// What the stand-in service sends back once it sees the end marker.
#[derive(Debug, Clone)]
pub enum Reply {
    /// `transcribing` for each partial, then `completed` with the full text
    Transcript { partials: Vec<String>, full: String },
    /// An `error` status in the service's own shape (`message` field)
    Fail(String),
    Silent,
}

impl Reply {
    pub fn transcript(partials: &[&str], full: &str) -> Self {
        Self::Transcript {
            partials: partials.iter().map(|p| p.to_string()).collect(),
            full: full.to_string(),
        }
    }
}

/// One upload as the service saw it.
#[derive(Debug, Clone, Default)]
pub struct ReceivedUpload {
    pub frame_sizes: Vec<usize>,
    pub bytes: Vec<u8>,
    /// The end marker arrived
    pub completed: bool,
}

struct ServiceState {
    reply: Reply,
    accepted: AtomicUsize,
    drop_next: AtomicUsize,
    uploads: Mutex<Vec<ReceivedUpload>>,
}

/// In-process WebSocket service that reassembles frames the way the real
/// transcription service does and answers with a scripted reply.
pub struct StandInService {
    pub addr: SocketAddr,
    state: Arc<ServiceState>,
}

impl StandInService {
    pub async fn start(reply: Reply) -> Self {
        init_tracing();
        let state = Arc::new(ServiceState {
            reply,
            accepted: AtomicUsize::new(0),
            drop_next: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/ws", get(ws_upgrade))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Close the next `n` sockets right after accepting them.
    pub fn drop_next(&self, n: usize) {
        self.state.drop_next.store(n, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<ReceivedUpload> {
        self.state.uploads.lock().unwrap().clone()
    }

    /// Poll until `check` holds, panicking after `timeout`.
    pub async fn wait_until(&self, timeout: Duration, check: impl Fn(&Self) -> bool) {
        tokio::time::timeout(timeout, async {
            while !check(self) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stand-in service never reached the expected state");
    }
}

/// Route client logs to the test harness. `RUST_LOG` overrides the filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "scribe_client=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn channel_config(endpoint: &str) -> ChannelConfig {
    init_tracing();
    ChannelConfig {
        endpoint: endpoint.to_string(),
        reconnect_delay: Duration::from_millis(100),
        open_timeout: Duration::from_secs(2),
        max_reconnect_attempts: None,
    }
}

pub fn upload_config(chunk_size: usize) -> UploadConfig {
    UploadConfig {
        chunk_size,
        connect_wait: Duration::from_secs(2),
        ..UploadConfig::default()
    }
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 + 1).collect()
}

async fn ws_upgrade(
    State(state): State<Arc<ServiceState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<ServiceState>) {
    state.accepted.fetch_add(1, Ordering::SeqCst);

    let dropped = state
        .drop_next
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if dropped {
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    send_status(
        &mut socket,
        &InboundMessage::Connected {
            message: Some("Ready to receive MP4 file".to_string()),
        },
    )
    .await;

    let mut upload = ReceivedUpload::default();
    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Binary(data) => match classify_frame(&data) {
                FrameKind::Data => {
                    upload.frame_sizes.push(data.len());
                    upload.bytes.extend_from_slice(&data);
                    send_status(
                        &mut socket,
                        &InboundMessage::ChunkUpdate {
                            text: Some(format!("Received {} bytes", upload.bytes.len())),
                        },
                    )
                    .await;
                }
                FrameKind::EndOfStream => {
                    upload.completed = true;
                    state.uploads.lock().unwrap().push(std::mem::take(&mut upload));
                    reply(&mut socket, &state.reply).await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Interrupted mid-transfer.
    if !upload.frame_sizes.is_empty() {
        state.uploads.lock().unwrap().push(upload);
    }
}

async fn reply(socket: &mut WebSocket, reply: &Reply) {
    match reply {
        Reply::Transcript { partials, full } => {
            for text in partials {
                send_status(socket, &InboundMessage::Transcribing { text: text.clone() }).await;
            }
            send_status(
                socket,
                &InboundMessage::Completed {
                    full_transcript: Some(full.clone()),
                    text: None,
                },
            )
            .await;
        }
        Reply::Fail(message) => {
            let raw = serde_json::json!({ "status": "error", "message": message }).to_string();
            let _ = socket.send(Message::Text(raw.into())).await;
        }
        Reply::Silent => {}
    }
}

async fn send_status(socket: &mut WebSocket, message: &InboundMessage) {
    let raw = serde_json::to_string(message).unwrap();
    let _ = socket.send(Message::Text(raw.into())).await;
}
