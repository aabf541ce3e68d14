use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregator::{AggregateResult, ResultAggregator};
use crate::channel::ChannelManager;
use crate::config::UploadConfig;
use crate::connection::{Connection, ConnectionStatus};
use crate::error::TransferError;
use crate::logging::{TracingLogger, TransferLogger};
use crate::payload::Payload;
use crate::sender::{ChunkSender, SendReport, UploadPhase, UploadProgress};

/// Everything a renderer needs, republished on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UploadView {
    pub transfer_id: Option<Uuid>,
    pub file_name: Option<String>,
    pub connected: bool,
    pub phase: UploadPhase,
    /// Why the last upload failed on this side, if it did
    pub upload_error: Option<String>,
    pub result: AggregateResult,
    /// An aggregator is attached and still consuming messages
    pub listening: bool,
}

impl UploadView {
    pub fn display_text(&self) -> &str {
        self.result.display_text()
    }

    /// Either side gave up on the current transfer.
    pub fn is_error(&self) -> bool {
        self.upload_error.is_some() || self.result.is_failed()
    }

    /// Nothing more will change for the current transfer.
    pub fn is_settled(&self) -> bool {
        self.result.is_terminal()
            || self.upload_error.is_some()
            || (self.phase == UploadPhase::Sent && !self.listening)
    }
}

/// Runs one upload at a time against a shared channel.
pub struct UploadController {
    channel: ChannelManager,
    config: UploadConfig,
    logger: Arc<dyn TransferLogger>,
    progress: Arc<UploadProgress>,
    view: Arc<watch::Sender<UploadView>>,
    /// Held for the whole of `upload()`; owns the current transfer's aggregator task
    active: Mutex<Option<JoinHandle<AggregateResult>>>,
}

impl UploadController {
    /// Must be called from inside a Tokio runtime.
    pub fn new(channel: ChannelManager, config: UploadConfig) -> Self {
        let (view, _) = watch::channel(UploadView {
            connected: channel.is_open(),
            ..UploadView::default()
        });
        let view = Arc::new(view);

        tokio::spawn(relay_connection(channel.subscribe_open(), view.clone()));

        Self {
            channel,
            config,
            logger: Arc::new(TracingLogger),
            progress: Arc::new(UploadProgress::new()),
            view,
            active: Mutex::new(None),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn channel(&self) -> &ChannelManager {
        &self.channel
    }

    pub fn view(&self) -> watch::Receiver<UploadView> {
        self.view.subscribe()
    }

    pub fn snapshot(&self) -> UploadView {
        self.view.borrow().clone()
    }

    pub fn progress(&self) -> Arc<UploadProgress> {
        self.progress.clone()
    }

    /// Check a payload against the accepted types and the size ceiling.
    pub fn validate<R>(&self, payload: &Payload<R>) -> Result<(), TransferError> {
        if payload.len() > self.config.max_file_size {
            return Err(TransferError::Unsupported(format!(
                "{} is {} bytes, limit is {}",
                payload.name(),
                payload.len(),
                self.config.max_file_size
            )));
        }

        let accepted = match payload.mime() {
            Some(mime) => self
                .config
                .accepted_types
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&mime)),
            None => payload.extension().is_some_and(|ext| {
                self.config
                    .accepted_extensions
                    .iter()
                    .any(|e| e.eq_ignore_ascii_case(&ext))
            }),
        };
        if !accepted {
            let kind = payload
                .mime()
                .or_else(|| payload.extension())
                .unwrap_or_else(|| "unknown type".to_string());
            return Err(TransferError::Unsupported(format!(
                "{} ({}) is not an accepted type",
                payload.name(),
                kind
            )));
        }

        Ok(())
    }

    /// Validate, connect if needed, attach a fresh aggregator and send the
    /// payload. Returns once the end marker is out; the transcript keeps
    /// arriving through `view()` and `wait_result()`.
    ///
    /// The connection stays open whatever the outcome.
    pub async fn upload<R>(&self, mut payload: Payload<R>) -> Result<SendReport, TransferError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut active = self.active.lock().await;
        // Whatever the previous transfer's aggregator was doing no longer matters.
        if let Some(previous) = active.take() {
            previous.abort();
        }

        let transfer_id = Uuid::new_v4();
        self.progress.reset();
        self.view.send_modify(|view| {
            view.transfer_id = Some(transfer_id);
            view.file_name = Some(payload.name().to_string());
            view.phase = UploadPhase::Validating;
            view.upload_error = None;
            view.result = AggregateResult::default();
            view.listening = false;
        });
        info!(%transfer_id, name = payload.name(), bytes = payload.len(), "upload requested");

        if let Err(e) = self.validate(&payload) {
            return Err(self.fail(transfer_id, e));
        }

        self.set_phase(UploadPhase::Connecting);
        let connection = match self.acquire().await {
            Ok(connection) => connection,
            Err(e) => return Err(self.fail(transfer_id, e)),
        };

        // Subscribe before the first frame so no reply can slip past.
        let aggregator = ResultAggregator::new()
            .with_transfer_id(transfer_id)
            .with_logger(self.logger.clone());
        let results = aggregator.watch();
        let subscription = connection.subscribe();
        self.view.send_modify(|view| view.listening = true);
        *active = Some(tokio::spawn(aggregator.run(subscription)));
        tokio::spawn(relay_results(transfer_id, results, self.view.clone()));

        self.set_phase(UploadPhase::Uploading);
        let sender = ChunkSender::new(self.config.chunk_size)
            .with_transfer_id(transfer_id)
            .with_progress(self.progress.clone())
            .with_logger(self.logger.clone());

        match sender.send(&connection, &mut payload).await {
            Ok(report) => {
                self.set_phase(UploadPhase::Sent);
                Ok(report)
            }
            Err(e) => Err(self.fail(transfer_id, e)),
        }
    }

    /// Wait until the current transfer settles: final result, service error,
    /// local failure, or the message stream ending. Returns the result as it
    /// stands then, or the empty result at once if nothing was uploaded yet.
    pub async fn wait_result(&self) -> AggregateResult {
        let mut view = self.view.subscribe();
        if view.borrow_and_update().transfer_id.is_none() {
            return AggregateResult::default();
        }

        let settled = view
            .wait_for(UploadView::is_settled)
            .await
            .map(|view| view.result.clone());
        settled.unwrap_or_else(|_| self.view.borrow().result.clone())
    }

    async fn acquire(&self) -> Result<Connection, TransferError> {
        match self.channel.current() {
            Some(connection) if connection.is_open() => return Ok(connection),
            // Already on its way; just wait for it.
            Some(connection) if connection.status() == ConnectionStatus::Connecting => {}
            _ => {
                self.channel.connect();
            }
        }
        self.channel.wait_open(self.config.connect_wait).await
    }

    fn set_phase(&self, phase: UploadPhase) {
        self.view.send_if_modified(|view| {
            let changed = view.phase != phase;
            view.phase = phase;
            changed
        });
    }

    fn fail(&self, transfer_id: Uuid, error: TransferError) -> TransferError {
        warn!(%transfer_id, "upload failed: {}", error);
        self.progress.set_phase(UploadPhase::Failed);
        self.view.send_modify(|view| {
            view.phase = UploadPhase::Failed;
            view.upload_error = Some(error.to_string());
        });
        error
    }
}

/// Mirror the channel's open flag into the view.
async fn relay_connection(mut open: watch::Receiver<bool>, view: Arc<watch::Sender<UploadView>>) {
    loop {
        let connected = *open.borrow_and_update();
        view.send_if_modified(|v| {
            let changed = v.connected != connected;
            v.connected = connected;
            changed
        });

        if open.changed().await.is_err() {
            break;
        }
    }
}

/// Copy one transfer's result into the view until its aggregator finishes.
/// Stale transfers never touch the view.
async fn relay_results(
    transfer_id: Uuid,
    mut results: watch::Receiver<AggregateResult>,
    view: Arc<watch::Sender<UploadView>>,
) {
    while results.changed().await.is_ok() {
        let result = results.borrow_and_update().clone();
        view.send_if_modified(|v| {
            if v.transfer_id != Some(transfer_id) {
                return false;
            }
            v.result = result;
            true
        });
    }

    view.send_if_modified(|v| {
        if v.transfer_id != Some(transfer_id) || !v.listening {
            return false;
        }
        v.listening = false;
        true
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ChannelConfig;

    fn controller(config: UploadConfig) -> UploadController {
        let channel = ChannelManager::new(ChannelConfig {
            endpoint: "ws://127.0.0.1:9/ws".to_string(),
            reconnect_delay: Duration::from_millis(20),
            open_timeout: Duration::from_millis(100),
            max_reconnect_attempts: Some(0),
        });
        UploadController::new(channel, config)
    }

    #[tokio::test]
    async fn accepts_mp4_by_mime_or_extension() {
        let controller = controller(UploadConfig::default());
        assert!(controller.validate(&Payload::from_bytes("talk.mp4", vec![0; 8])).is_ok());
        assert!(
            controller
                .validate(&Payload::from_bytes("talk.bin", vec![0; 8]).with_mime("video/MP4"))
                .is_ok()
        );
    }

    #[tokio::test]
    async fn rejects_other_types() {
        let controller = controller(UploadConfig::default());
        let err = controller
            .validate(&Payload::from_bytes("notes.txt", vec![0; 8]))
            .unwrap_err();
        assert!(matches!(err, TransferError::Unsupported(_)));

        let err = controller
            .validate(&Payload::from_bytes("recording", vec![0; 8]))
            .unwrap_err();
        assert!(matches!(err, TransferError::Unsupported(_)));
    }

    #[tokio::test]
    async fn extension_list_applies_without_mime() {
        let controller = controller(UploadConfig {
            accepted_types: vec![],
            accepted_extensions: vec!["scribe".to_string()],
            ..UploadConfig::default()
        });
        assert!(controller.validate(&Payload::from_bytes("take.SCRIBE", vec![0; 8])).is_ok());
        // A known MIME type is judged by the type list alone.
        assert!(controller.validate(&Payload::from_bytes("take.mp4", vec![0; 8])).is_err());
    }

    #[tokio::test]
    async fn rejects_oversized_files() {
        let controller = controller(UploadConfig {
            max_file_size: 16,
            ..UploadConfig::default()
        });
        let payload = Payload::from_bytes("talk.mp4", vec![0; 17]);
        assert!(matches!(
            controller.validate(&payload),
            Err(TransferError::Unsupported(_))
        ));
        assert!(controller.validate(&Payload::from_bytes("talk.mp4", vec![0; 16])).is_ok());
    }

    #[tokio::test]
    async fn rejection_is_published_without_connecting() {
        let controller = controller(UploadConfig::default());
        let err = controller
            .upload(Payload::from_bytes("notes.txt", b"hello".to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::Unsupported(_)));
        let view = controller.snapshot();
        assert_eq!(view.phase, UploadPhase::Failed);
        assert_eq!(view.file_name.as_deref(), Some("notes.txt"));
        assert!(view.is_error());
        assert!(view.is_settled());
        assert!(controller.channel().current().is_none());
    }

    #[tokio::test]
    async fn wait_result_without_upload_returns_at_once() {
        let controller = controller(UploadConfig::default());
        let result = tokio::time::timeout(Duration::from_secs(1), controller.wait_result())
            .await
            .unwrap();

        assert_eq!(result, AggregateResult::default());
        assert!(!result.is_terminal());
        assert!(controller.channel().current().is_none());
    }

    #[tokio::test]
    async fn unreachable_service_times_out() {
        let controller = controller(UploadConfig {
            connect_wait: Duration::from_millis(150),
            ..UploadConfig::default()
        });
        let err = controller
            .upload(Payload::from_bytes("talk.mp4", vec![1; 32]))
            .await
            .unwrap_err();

        assert!(matches!(err, TransferError::OpenTimeout(_)));
        assert!(controller.snapshot().upload_error.is_some());
        controller.channel().shutdown();
    }
}
