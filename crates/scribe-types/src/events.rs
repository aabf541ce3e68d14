use serde::{Deserialize, Serialize};

/// Error returned when an inbound text message is not a recognisable status object.
pub type DecodeError = serde_json::Error;

/// Status messages sent by the transcription service over the WebSocket.
///
/// Every message is a JSON object carrying a `status` discriminator. Fields a
/// variant does not use are ignored, and statuses this client does not know
/// decode as [`InboundMessage::Unknown`] instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InboundMessage {
    /// A piece of partial transcript, appended to what came before
    Transcribing {
        #[serde(default)]
        text: String,
    },

    /// Per-chunk diagnostic from the service
    ChunkUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    /// Transcription finished. `full_transcript` wins over `text` when both are set.
    Completed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        full_transcript: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    /// The service gave up on this transfer
    Error {
        #[serde(default, alias = "message")]
        text: String,
    },

    /// Greeting sent right after the socket is accepted
    Connected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Byte count acknowledgement while frames are arriving
    Uploading {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        progress: Option<String>,
    },

    /// Upload finished on the service side; transcription has started
    Processing {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Wire name of the status, for logs.
    pub fn status(&self) -> &'static str {
        match self {
            Self::Transcribing { .. } => "transcribing",
            Self::ChunkUpdate { .. } => "chunk_update",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
            Self::Connected { .. } => "connected",
            Self::Uploading { .. } => "uploading",
            Self::Processing { .. } => "processing",
            Self::Unknown => "unknown",
        }
    }

    /// Final text carried by a `completed` message, if this is one.
    pub fn final_text(&self) -> Option<String> {
        match self {
            Self::Completed {
                full_transcript,
                text,
            } => Some(
                full_transcript
                    .clone()
                    .or_else(|| text.clone())
                    .unwrap_or_default(),
            ),
            _ => None,
        }
    }
}

/// Decode one inbound text message.
pub fn decode_message(raw: &str) -> Result<InboundMessage, DecodeError> {
    serde_json::from_str(raw)
}
