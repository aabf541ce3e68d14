/// Structured transfer logging.
///
/// The sender and the aggregator describe what they do as `TransferEvent`s
/// keyed by transfer id, and hand them to a `TransferLogger`.

use std::fmt;

use uuid::Uuid;

/// Structured log entry for one transfer.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub transfer_id: Uuid,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Sender: transfer started
    Started {
        name: String,
        total_bytes: u64,
        frames: u64,
    },
    /// Sender: data frame written to the channel
    FrameSent {
        index: u64,
        offset: u64,
        len: usize,
    },
    /// Sender: end marker written, transfer fully sent
    EndMarkerSent {
        frames: u64,
        total_bytes: u64,
        duration_ms: u64,
    },
    /// Sender: transfer abandoned at `offset`
    Aborted {
        offset: u64,
        reason: String,
    },
    /// Aggregator: a status message was applied
    MessageApplied {
        status: &'static str,
    },
    /// Aggregator: a message could not be decoded and was dropped
    MessageDropped {
        reason: String,
    },
    /// Aggregator: a message arrived after the result became terminal
    MessageIgnored {
        status: &'static str,
    },
    /// Aggregator: the result reached Done
    Completed {
        chars: usize,
    },
    /// Aggregator: the service reported an error
    ServiceError {
        message: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started { name, total_bytes, frames } => {
                write!(f, "started name={} bytes={} frames={}", name, total_bytes, frames)
            }
            Self::FrameSent { index, offset, len } => {
                write!(f, "frame_sent idx={} offset={} len={}", index, offset, len)
            }
            Self::EndMarkerSent { frames, total_bytes, duration_ms } => {
                write!(f, "end_marker_sent frames={} bytes={} duration_ms={}", frames, total_bytes, duration_ms)
            }
            Self::Aborted { offset, reason } => {
                write!(f, "aborted offset={}: {}", offset, reason)
            }
            Self::MessageApplied { status } => write!(f, "message_applied status={}", status),
            Self::MessageDropped { reason } => write!(f, "message_dropped: {}", reason),
            Self::MessageIgnored { status } => write!(f, "message_ignored status={}", status),
            Self::Completed { chars } => write!(f, "completed chars={}", chars),
            Self::ServiceError { message } => write!(f, "service_error: {}", message),
        }
    }
}

/// Sink for transfer events.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // info for lifecycle, warn for faults, debug for per-frame/per-message spam
        match &entry.event {
            TransferEvent::Started { .. }
            | TransferEvent::EndMarkerSent { .. }
            | TransferEvent::Completed { .. } => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::Aborted { .. }
            | TransferEvent::MessageDropped { .. }
            | TransferEvent::ServiceError { .. } => {
                tracing::warn!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}
