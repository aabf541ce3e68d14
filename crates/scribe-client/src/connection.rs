use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::error::{ConnectionError, TransferError};
use crate::sender::FrameSink;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a local close waits for the service to acknowledge the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of one WebSocket session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Notifications from a connection's driver task to its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelEvent {
    Opened(Uuid),
    Closed(Uuid),
    /// Sent by the manager itself when `disconnect()` lets a connection go.
    Released(Uuid),
}

/// A frame queued for the driver, acknowledged once it is written to the socket.
struct OutboundFrame {
    data: Bytes,
    ack: oneshot::Sender<bool>,
}

/// Handle to one duplex session with the service.
///
/// Handles are cheap clones of the same session. The socket itself lives in a
/// driver task; the handle talks to it through an outbound queue, a
/// single-slot inbound subscription and a status watch.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: Uuid,
    endpoint: String,
    status: watch::Sender<ConnectionStatus>,
    outbound: mpsc::Sender<OutboundFrame>,
    /// Current inbound subscriber, at most one per connection
    subscriber: Mutex<Option<mpsc::UnboundedSender<String>>>,
    close: CancellationToken,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("endpoint", &self.inner.endpoint)
            .field("status", &self.status())
            .finish()
    }
}

impl Connection {
    /// Start connecting in the background. The handle starts out `Connecting`.
    /// Must be called from inside a Tokio runtime.
    pub(crate) fn open(
        config: &ChannelConfig,
        events: mpsc::UnboundedSender<ChannelEvent>,
        close: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        // One frame in flight at a time; the sender waits for each ack anyway.
        let (outbound, outbound_rx) = mpsc::channel(1);

        let inner = Arc::new(ConnectionInner {
            id: Uuid::new_v4(),
            endpoint: config.endpoint.clone(),
            status,
            outbound,
            subscriber: Mutex::new(None),
            close,
        });

        tokio::spawn(drive(inner.clone(), outbound_rx, config.open_timeout, events));

        Self { inner }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    /// Watch status transitions.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Wait until the handshake settles. Errors if the connection closed
    /// without ever opening.
    pub async fn opened(&self) -> Result<(), TransferError> {
        let mut status = self.inner.status.subscribe();
        let settled = status
            .wait_for(|s| *s != ConnectionStatus::Connecting)
            .await
            .map(|s| *s);
        match settled {
            Ok(ConnectionStatus::Open) => Ok(()),
            _ => Err(TransferError::ConnectionNotOpen),
        }
    }

    /// Write one binary message. Resolves once the frame has been handed to
    /// the socket; fails as soon as the connection stops being open, even if
    /// the write itself is still stuck.
    pub async fn send_binary(&self, data: Bytes) -> Result<(), TransferError> {
        let mut status = self.inner.status.subscribe();
        if *status.borrow_and_update() != ConnectionStatus::Open {
            return Err(TransferError::ConnectionNotOpen);
        }

        let (ack, acked) = oneshot::channel();
        let delivered = async {
            self.inner
                .outbound
                .send(OutboundFrame { data, ack })
                .await
                .ok()?;
            acked.await.ok()
        };
        let left_open = async {
            let _ = status.wait_for(|s| *s != ConnectionStatus::Open).await;
        };

        tokio::select! {
            delivered = delivered => match delivered {
                Some(true) => Ok(()),
                _ => Err(TransferError::ConnectionNotOpen),
            },
            _ = left_open => Err(TransferError::ConnectionNotOpen),
        }
    }

    /// Register as the inbound message handler. Replaces (and ends) any
    /// earlier subscription on this connection.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = self
            .inner
            .subscriber
            .lock()
            .expect("subscriber lock poisoned");
        if slot.replace(tx).is_some() {
            debug!(connection = %self.inner.id, "replacing inbound subscriber");
        }
        // The driver clears the slot after marking the connection closed, so a
        // subscriber arriving later must not be left waiting forever.
        if self.status() == ConnectionStatus::Closed {
            slot.take();
        }

        Subscription::new(self.inner.id, rx)
    }

    /// Close the session. The status moves to `Closing` immediately so that
    /// no further frames are accepted; the driver then reports `Closed`.
    pub fn close(&self) {
        self.inner.status.send_if_modified(|status| match status {
            ConnectionStatus::Connecting | ConnectionStatus::Open => {
                *status = ConnectionStatus::Closing;
                true
            }
            _ => false,
        });
        self.inner.close.cancel();
    }
}

impl FrameSink for Connection {
    fn send_frame(
        &self,
        frame: Bytes,
    ) -> impl Future<Output = Result<(), TransferError>> + Send {
        self.send_binary(frame)
    }

    fn is_open(&self) -> bool {
        Connection::is_open(self)
    }
}

/// Inbound text messages of one connection, in delivery order.
///
/// Dropping the subscription deregisters it. It ends when the connection is
/// torn down or another subscriber takes its place.
#[derive(Debug)]
pub struct Subscription {
    connection_id: Uuid,
    rx: mpsc::UnboundedReceiver<String>,
}

impl Subscription {
    pub(crate) fn new(connection_id: Uuid, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { connection_id, rx }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

impl ConnectionInner {
    fn deliver(&self, text: &str) {
        let subscriber = self
            .subscriber
            .lock()
            .expect("subscriber lock poisoned")
            .clone();
        match subscriber {
            Some(tx) if tx.send(text.to_owned()).is_ok() => {}
            _ => debug!(connection = %self.id, "no inbound subscriber, dropping message"),
        }
    }
}

/// Driver task: owns the socket for the whole life of one connection.
async fn drive(
    inner: Arc<ConnectionInner>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    open_timeout: Duration,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let established = tokio::select! {
        _ = inner.close.cancelled() => None,
        result = establish(&inner.endpoint, open_timeout) => Some(result),
    };

    match established {
        None => debug!(connection = %inner.id, "closed before the handshake finished"),
        Some(Err(e)) => warn!(connection = %inner.id, endpoint = %inner.endpoint, "{}", e),
        Some(Ok(ws)) => {
            let opened = inner.status.send_if_modified(|status| {
                if *status == ConnectionStatus::Connecting {
                    *status = ConnectionStatus::Open;
                    true
                } else {
                    false
                }
            });
            if opened {
                info!(connection = %inner.id, endpoint = %inner.endpoint, "connection open");
                let _ = events.send(ChannelEvent::Opened(inner.id));
            }

            match pump(&inner, ws, &mut outbound).await {
                Ok(()) => debug!(connection = %inner.id, "connection closed locally"),
                Err(ConnectionError::ClosedByRemote) => {
                    info!(connection = %inner.id, "connection closed by service")
                }
                Err(e) => warn!(connection = %inner.id, "{}", e),
            }
        }
    }

    inner.status.send_replace(ConnectionStatus::Closed);
    // Deregister the subscriber so its stream ends with the connection.
    inner
        .subscriber
        .lock()
        .expect("subscriber lock poisoned")
        .take();
    // Frames still queued are dropped with their acks, failing their senders.
    drop(outbound);
    let _ = events.send(ChannelEvent::Closed(inner.id));
}

async fn establish(endpoint: &str, open_timeout: Duration) -> Result<WsStream, ConnectionError> {
    let (ws, _response) = tokio::time::timeout(open_timeout, connect_async(endpoint))
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout(open_timeout))??;
    Ok(ws)
}

/// Move frames out and messages in until either side closes.
/// `Ok` means the close was requested locally.
async fn pump(
    inner: &ConnectionInner,
    ws: WsStream,
    outbound: &mut mpsc::Receiver<OutboundFrame>,
) -> Result<(), ConnectionError> {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            _ = inner.close.cancelled() => {
                let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
                return Ok(());
            }
            Some(frame) = outbound.recv() => {
                // A peer that stops reading can stall the write indefinitely.
                let written = tokio::select! {
                    written = sink.send(Message::Binary(frame.data)) => written,
                    _ = inner.close.cancelled() => {
                        let _ = frame.ack.send(false);
                        return Ok(());
                    }
                };
                match written {
                    Ok(()) => {
                        let _ = frame.ack.send(true);
                    }
                    Err(e) => {
                        let _ = frame.ack.send(false);
                        return Err(ConnectionError::Transport(e));
                    }
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => inner.deliver(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    debug!(connection = %inner.id, ?frame, "close frame from service");
                    return Err(ConnectionError::ClosedByRemote);
                }
                // Ping/pong are answered by tungstenite; binary replies are not part of the protocol.
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ConnectionError::Transport(e)),
                None => return Err(ConnectionError::ClosedByRemote),
            }
        }
    }
}
