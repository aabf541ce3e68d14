/// Chunked upload over an open channel.
///
/// A payload goes out as consecutive binary frames of at most `chunk_size`
/// bytes, in file order, followed by the end marker. Frames are sent one at a
/// time: the next read starts only after the previous frame was accepted.
/// A failed transfer is never resumed; the next one starts from offset 0.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use scribe_types::{END_MARKER, frame_count, frame_lengths};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use crate::error::TransferError;
use crate::logging::{NullLogger, TransferEvent, TransferLog, TransferLogger};
use crate::payload::Payload;

/// Where frames go. Implemented by `Connection`; tests substitute their own.
pub trait FrameSink {
    /// Send one binary frame, resolving once it has been accepted.
    fn send_frame(&self, frame: Bytes)
    -> impl Future<Output = Result<(), TransferError>> + Send;

    fn is_open(&self) -> bool;
}

/// Where an upload currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum UploadPhase {
    #[default]
    Idle = 0,
    Validating = 1,
    Connecting = 2,
    Uploading = 3,
    /// Every frame and the end marker were sent; waiting on the service
    Sent = 4,
    Failed = 5,
}

impl UploadPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Validating,
            2 => Self::Connecting,
            3 => Self::Uploading,
            4 => Self::Sent,
            5 => Self::Failed,
            _ => Self::Idle,
        }
    }
}

/// Progress tracking for the UI (shared via Arc).
#[derive(Debug, Default)]
pub struct UploadProgress {
    bytes_done: AtomicU64,
    bytes_total: AtomicU64,
    frames_sent: AtomicU64,
    phase: AtomicU8,
}

impl UploadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn phase(&self) -> UploadPhase {
        UploadPhase::from_u8(self.phase.load(Ordering::Relaxed))
    }

    pub fn set_phase(&self, phase: UploadPhase) {
        self.phase.store(phase as u8, Ordering::Relaxed);
    }

    /// Share of the payload sent so far, 0.0..=1.0. An empty payload counts
    /// as done once it has been sent.
    pub fn fraction(&self) -> f64 {
        let total = self.bytes_total();
        if total == 0 {
            return if self.phase() == UploadPhase::Sent { 1.0 } else { 0.0 };
        }
        self.bytes_done() as f64 / total as f64
    }

    pub(crate) fn reset(&self) {
        self.bytes_done.store(0, Ordering::Relaxed);
        self.bytes_total.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.set_phase(UploadPhase::Idle);
    }

    fn begin(&self, total: u64) {
        self.bytes_done.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.bytes_total.store(total, Ordering::Relaxed);
        self.set_phase(UploadPhase::Uploading);
    }

    fn record_frame(&self, len: usize) {
        self.bytes_done.fetch_add(len as u64, Ordering::Relaxed);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }
}

/// Summary of a fully sent payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendReport {
    /// Data frames, not counting the end marker
    pub frames: u64,
    pub bytes: u64,
    /// Hex SHA-256 of the bytes sent
    pub sha256: String,
}

pub struct ChunkSender {
    chunk_size: usize,
    transfer_id: Uuid,
    progress: Arc<UploadProgress>,
    logger: Arc<dyn TransferLogger>,
}

impl ChunkSender {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            transfer_id: Uuid::new_v4(),
            progress: Arc::new(UploadProgress::new()),
            logger: Arc::new(NullLogger),
        }
    }

    pub fn with_transfer_id(mut self, transfer_id: Uuid) -> Self {
        self.transfer_id = transfer_id;
        self
    }

    pub fn with_progress(mut self, progress: Arc<UploadProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn progress(&self) -> Arc<UploadProgress> {
        self.progress.clone()
    }

    /// Send the whole payload followed by the end marker.
    ///
    /// Stops at the first frame the sink refuses. Nothing is sent after a
    /// failure, the end marker included.
    pub async fn send<S, R>(
        &self,
        sink: &S,
        payload: &mut Payload<R>,
    ) -> Result<SendReport, TransferError>
    where
        S: FrameSink + Sync,
        R: AsyncRead + Unpin + Send,
    {
        let started = Instant::now();
        let total = payload.len();
        let frames = frame_count(total, self.chunk_size);

        self.progress.begin(total);
        self.log(TransferEvent::Started {
            name: payload.name().to_string(),
            total_bytes: total,
            frames,
        });

        if !sink.is_open() {
            return Err(self.abort(0, TransferError::ConnectionNotOpen));
        }

        let mut hasher = Sha256::new();
        let mut offset = 0u64;
        let mut index = 0u64;

        for len in frame_lengths(total, self.chunk_size) {
            let frame = match read_frame(payload.source_mut(), len).await {
                Ok(frame) => frame,
                Err(e) => return Err(self.abort(offset, TransferError::ReadFailed(e))),
            };
            hasher.update(&frame);

            if let Err(e) = sink.send_frame(frame).await {
                return Err(self.abort(offset, e));
            }

            self.log(TransferEvent::FrameSent { index, offset, len });
            self.progress.record_frame(len);
            offset += len as u64;
            index += 1;

            // Let the inbound side run between frames.
            tokio::task::yield_now().await;
        }

        if let Err(e) = sink.send_frame(Bytes::copy_from_slice(&END_MARKER)).await {
            return Err(self.abort(offset, e));
        }

        self.progress.set_phase(UploadPhase::Sent);
        self.log(TransferEvent::EndMarkerSent {
            frames: index,
            total_bytes: offset,
            duration_ms: started.elapsed().as_millis() as u64,
        });

        Ok(SendReport {
            frames: index,
            bytes: offset,
            sha256: hex::encode(hasher.finalize()),
        })
    }

    fn abort(&self, offset: u64, error: TransferError) -> TransferError {
        self.progress.set_phase(UploadPhase::Failed);
        self.log(TransferEvent::Aborted {
            offset,
            reason: error.to_string(),
        });
        error
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "sender",
            transfer_id: self.transfer_id,
            event,
        });
    }
}

async fn read_frame<R: AsyncRead + Unpin>(source: &mut R, len: usize) -> io::Result<Bytes> {
    let mut buf = vec![0u8; len];
    source.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}
