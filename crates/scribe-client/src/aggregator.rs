use std::sync::Arc;

use scribe_types::{InboundMessage, decode_message};
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::connection::Subscription;
use crate::error::ProtocolError;
use crate::logging::{NullLogger, TransferEvent, TransferLog, TransferLogger};

/// Lifecycle of one transfer's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateState {
    #[default]
    Receiving,
    Done,
    Failed,
}

/// Transcript accumulated for one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateResult {
    /// Concatenation of every `transcribing` fragment, in arrival order
    pub partial_text: String,
    pub final_text: Option<String>,
    pub error: Option<String>,
    pub state: AggregateState,
}

impl AggregateResult {
    pub fn is_terminal(&self) -> bool {
        self.state != AggregateState::Receiving
    }

    pub fn is_failed(&self) -> bool {
        self.state == AggregateState::Failed
    }

    /// The final text once there is one, the partial text until then.
    pub fn display_text(&self) -> &str {
        self.final_text.as_deref().unwrap_or(&self.partial_text)
    }
}

/// Folds the service's status stream into an [`AggregateResult`].
///
/// Once the result is `Done` or `Failed` it is frozen; later messages are
/// logged and ignored. Every change is published on a watch channel.
pub struct ResultAggregator {
    transfer_id: Uuid,
    result: AggregateResult,
    updates: watch::Sender<AggregateResult>,
    logger: Arc<dyn TransferLogger>,
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultAggregator {
    pub fn new() -> Self {
        let (updates, _) = watch::channel(AggregateResult::default());
        Self {
            transfer_id: Uuid::nil(),
            result: AggregateResult::default(),
            updates,
            logger: Arc::new(NullLogger),
        }
    }

    pub fn with_transfer_id(mut self, transfer_id: Uuid) -> Self {
        self.transfer_id = transfer_id;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Receive every published change of the result.
    pub fn watch(&self) -> watch::Receiver<AggregateResult> {
        self.updates.subscribe()
    }

    pub fn result(&self) -> &AggregateResult {
        &self.result
    }

    /// Apply one decoded message. Returns whether the result changed.
    pub fn apply(&mut self, message: InboundMessage) -> bool {
        let status = message.status();
        if self.result.is_terminal() {
            self.log(TransferEvent::MessageIgnored { status });
            return false;
        }

        let final_text = message.final_text();
        let changed = match message {
            InboundMessage::Transcribing { text } => {
                self.result.partial_text.push_str(&text);
                !text.is_empty()
            }
            InboundMessage::Completed { .. } => {
                let text = final_text.unwrap_or_default();
                self.log(TransferEvent::Completed { chars: text.chars().count() });
                self.result.final_text = Some(text);
                self.result.state = AggregateState::Done;
                true
            }
            InboundMessage::Error { text } => {
                self.log(TransferEvent::ServiceError { message: text.clone() });
                self.result.error = Some(text);
                self.result.state = AggregateState::Failed;
                true
            }
            // Informational statuses leave the result alone.
            _ => false,
        };

        if changed {
            self.log(TransferEvent::MessageApplied { status });
            self.updates.send_replace(self.result.clone());
        }
        changed
    }

    /// Decode and apply a raw text message. Undecodable messages are dropped.
    pub fn apply_text(&mut self, raw: &str) -> bool {
        match decode_message(raw).map_err(ProtocolError::from) {
            Ok(message) => self.apply(message),
            Err(e) => {
                self.log(TransferEvent::MessageDropped { reason: e.to_string() });
                false
            }
        }
    }

    /// Consume messages until the result is terminal or the subscription
    /// ends, and return the result.
    pub async fn run(mut self, mut subscription: Subscription) -> AggregateResult {
        while let Some(raw) = subscription.next().await {
            self.apply_text(&raw);
            if self.result.is_terminal() {
                break;
            }
        }

        if !self.result.is_terminal() {
            debug!(
                transfer_id = %self.transfer_id,
                connection = %subscription.connection_id(),
                "message stream ended before a final result"
            );
        }
        self.result
    }

    fn log(&self, event: TransferEvent) {
        self.logger.log(TransferLog {
            component: "aggregator",
            transfer_id: self.transfer_id,
            event,
        });
    }
}
