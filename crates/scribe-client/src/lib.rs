/// Scribe upload client.
///
/// Streams a media file to a transcription service over one long-lived
/// WebSocket and folds the service's replies into a live result:
/// - `ChannelManager`: owns at most one connection, reconnects on loss
/// - `ChunkSender`: paced 1 MiB binary frames followed by an end marker
/// - `ResultAggregator`: partial/final/error state machine over status messages
/// - `UploadController`: validates, connects, wires the two together and
///   publishes an `UploadView` for whatever renders it

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod connection;
pub mod controller;
pub mod error;
pub mod logging;
pub mod payload;
pub mod sender;

pub use aggregator::{AggregateResult, AggregateState, ResultAggregator};
pub use channel::ChannelManager;
pub use config::{ChannelConfig, ClientConfig, UploadConfig};
pub use connection::{Connection, ConnectionStatus, Subscription};
pub use controller::{UploadController, UploadView};
pub use error::{ConnectionError, ProtocolError, TransferError};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use payload::Payload;
pub use sender::{ChunkSender, FrameSink, SendReport, UploadPhase, UploadProgress};
