use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ChannelConfig;
use crate::connection::{ChannelEvent, Connection};
use crate::error::TransferError;

/// Owns the single live connection to the service and keeps it alive.
///
/// `connect()` opens a connection, replacing any earlier one. Whenever the
/// channel stops being open, whether the service dropped it or `disconnect()`
/// closed it, a supervisor task opens a new one after `reconnect_delay`.
/// Only `shutdown()` (or dropping the last handle) ends that loop.
/// Clones share the same state.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    /// Mirrors "current connection is open"; only written under `state`
    open: watch::Sender<bool>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    shutdown: CancellationToken,
}

struct ChannelState {
    current: Option<Connection>,
    /// Cleared once `max_reconnect_attempts` is exceeded; `connect` sets it again.
    armed: bool,
    /// Closes since the last successful open
    failures: u32,
}

impl ChannelManager {
    /// Create a manager and start its supervisor. Does not connect.
    /// Must be called from inside a Tokio runtime.
    pub fn new(config: ChannelConfig) -> Self {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (open, _) = watch::channel(false);
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(ChannelState {
                current: None,
                armed: true,
                failures: 0,
            }),
            open,
            events,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(supervise(Arc::downgrade(&inner), events_rx, shutdown));

        Self { inner }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.config.endpoint
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Open a new connection, closing whichever one was current.
    /// Re-arms reconnection if an attempt cap had stopped it.
    pub fn connect(&self) -> Connection {
        let mut state = self.inner.lock();
        state.armed = true;
        state.failures = 0;
        self.inner.replace_connection(&mut state)
    }

    /// Close and release the current connection. The reconnect loop treats
    /// this like any other loss and reopens after the delay; use `shutdown()`
    /// to stop for good. A no-op when there is no connection.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        state.failures = 0;
        if let Some(connection) = state.current.take() {
            info!(connection = %connection.id(), "disconnecting");
            connection.close();
            let _ = self.inner.events.send(ChannelEvent::Released(connection.id()));
        }
        self.inner.open.send_replace(false);
    }

    /// Disconnect and stop the supervisor for good. Connections opened after
    /// this are closed immediately.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.disconnect();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Whether the current connection is open.
    pub fn is_open(&self) -> bool {
        *self.inner.open.borrow()
    }

    /// Watch the open flag of whichever connection is current.
    pub fn subscribe_open(&self) -> watch::Receiver<bool> {
        self.inner.open.subscribe()
    }

    pub fn current(&self) -> Option<Connection> {
        self.inner.lock().current.clone()
    }

    /// Wait until some connection is open and return it.
    pub async fn wait_open(&self, timeout: Duration) -> Result<Connection, TransferError> {
        let mut open = self.inner.open.subscribe();
        let deadline = Instant::now() + timeout;

        loop {
            tokio::time::timeout_at(deadline, open.wait_for(|open| *open))
                .await
                .map_err(|_| TransferError::OpenTimeout(timeout))?
                .map_err(|_| TransferError::ConnectionNotOpen)?;

            // The flag can lag a close by a moment; only hand out a live one.
            if let Some(connection) = self.current().filter(Connection::is_open) {
                return Ok(connection);
            }
            tokio::time::timeout_at(deadline, open.changed())
                .await
                .map_err(|_| TransferError::OpenTimeout(timeout))?
                .map_err(|_| TransferError::ConnectionNotOpen)?;
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().expect("channel state lock poisoned")
    }

    fn replace_connection(&self, state: &mut ChannelState) -> Connection {
        if let Some(previous) = state.current.take() {
            debug!(connection = %previous.id(), "closing previous connection");
            previous.close();
        }

        let connection = Connection::open(
            &self.config,
            self.events.clone(),
            self.shutdown.child_token(),
        );
        info!(connection = %connection.id(), endpoint = %self.config.endpoint, "connecting");

        state.current = Some(connection.clone());
        self.open.send_replace(false);
        connection
    }

    /// Apply a driver event. Returns which connection a retry expects to
    /// still be current (`None` for a released one) and when it is due.
    fn on_event(&self, event: ChannelEvent) -> Option<(Option<Uuid>, Instant)> {
        let mut state = self.lock();
        let current = state.current.as_ref().map(Connection::id);

        match event {
            ChannelEvent::Opened(id) if current == Some(id) => {
                state.failures = 0;
                self.open.send_replace(true);
                None
            }
            ChannelEvent::Closed(id) if current == Some(id) => {
                self.open.send_replace(false);
                info!(connection = %id, "connection lost");
                self.schedule_retry(&mut state, current)
            }
            // Released by disconnect() and nothing has taken its place yet.
            ChannelEvent::Released(id) if current.is_none() => {
                debug!(connection = %id, "connection released");
                self.schedule_retry(&mut state, None)
            }
            // Events from connections that were already replaced.
            ChannelEvent::Opened(id) | ChannelEvent::Closed(id) | ChannelEvent::Released(id) => {
                debug!(connection = %id, "ignoring event from stale connection");
                None
            }
        }
    }

    fn schedule_retry(
        &self,
        state: &mut ChannelState,
        expected: Option<Uuid>,
    ) -> Option<(Option<Uuid>, Instant)> {
        if !state.armed || self.shutdown.is_cancelled() {
            return None;
        }

        state.failures += 1;
        if let Some(max) = self.config.max_reconnect_attempts {
            if state.failures > max {
                warn!(attempts = max, "giving up on reconnecting");
                state.armed = false;
                return None;
            }
        }

        info!(
            attempt = state.failures,
            delay_ms = self.config.reconnect_delay.as_millis() as u64,
            "reconnecting"
        );
        Some((expected, Instant::now() + self.config.reconnect_delay))
    }

    fn reconnect(&self, expected: Option<Uuid>) {
        let mut state = self.lock();
        // A connect() during the delay supersedes the retry.
        let unchanged = state.current.as_ref().map(Connection::id) == expected;
        if !state.armed || !unchanged || self.shutdown.is_cancelled() {
            return;
        }
        self.replace_connection(&mut state);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Child tokens close every connection this manager opened.
        self.shutdown.cancel();
    }
}

/// Reconnect loop. Holds only a weak reference so dropping the last
/// `ChannelManager` ends it.
async fn supervise(
    manager: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    shutdown: CancellationToken,
) {
    let mut retry: Option<(Option<Uuid>, Instant)> = None;

    loop {
        let retry_at = retry.map(|(_, at)| at);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(inner) = manager.upgrade() else { break };
                if let Some(next) = inner.on_event(event) {
                    retry = Some(next);
                }
            }
            _ = sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                let Some((lost, _)) = retry.take() else { continue };
                let Some(inner) = manager.upgrade() else { break };
                inner.reconnect(lost);
            }
        }
    }

    debug!("channel supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> ChannelConfig {
        ChannelConfig {
            // Port 9 on loopback: refused immediately on any sane host
            endpoint: "ws://127.0.0.1:9/ws".to_string(),
            reconnect_delay: Duration::from_millis(20),
            open_timeout: Duration::from_millis(200),
            max_reconnect_attempts: Some(2),
        }
    }

    #[tokio::test]
    async fn new_manager_is_closed_and_idle() {
        let channel = ChannelManager::new(unreachable_config());
        assert!(!channel.is_open());
        assert!(channel.current().is_none());
        channel.shutdown();
        assert!(channel.is_shut_down());
    }

    #[tokio::test]
    async fn disconnect_without_connection_is_noop() {
        let channel = ChannelManager::new(unreachable_config());
        channel.disconnect();
        channel.disconnect();
        assert!(channel.current().is_none());
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn connect_replaces_current_connection() {
        let channel = ChannelManager::new(unreachable_config());
        let first = channel.connect();
        let second = channel.connect();

        assert_ne!(first.id(), second.id());
        assert_eq!(channel.current().map(|c| c.id()), Some(second.id()));
        assert!(!first.is_open());
        channel.shutdown();
    }

    #[tokio::test]
    async fn wait_open_times_out_when_unreachable() {
        let channel = ChannelManager::new(unreachable_config());
        channel.connect();

        let err = channel
            .wait_open(Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::OpenTimeout(_)));
        channel.shutdown();
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let channel = ChannelManager::new(unreachable_config());
        let first = channel.connect();

        // Initial attempt plus two retries, each refused quickly.
        let mut last = first.id();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let current = channel.current().map(|c| c.id());
            if let Some(id) = current {
                last = id;
            }
            if !channel.inner.lock().armed {
                break;
            }
        }

        assert!(!channel.inner.lock().armed);
        assert_ne!(last, first.id());
        // Once disarmed, nothing replaces the dead connection.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(channel.current().map(|c| c.id()), Some(last));
        channel.shutdown();
    }

    #[tokio::test]
    async fn disconnect_leads_to_a_fresh_connection() {
        let channel = ChannelManager::new(unreachable_config());
        let first = channel.connect();
        channel.disconnect();
        assert!(channel.current().is_none());

        let replaced = async {
            loop {
                if let Some(current) = channel.current() {
                    break current.id();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let next = tokio::time::timeout(Duration::from_secs(5), replaced)
            .await
            .unwrap();
        assert_ne!(next, first.id());
        channel.shutdown();
    }

    #[tokio::test]
    async fn connect_after_shutdown_closes_immediately() {
        let channel = ChannelManager::new(unreachable_config());
        channel.shutdown();

        let connection = channel.connect();
        assert!(connection.opened().await.is_err());
    }
}
