/// Wire vocabulary shared by the scribe upload client and anything that
/// speaks its protocol:
/// - frame sizing and the end-of-stream sentinel
/// - status messages the transcription service sends back

pub mod events;
pub mod protocol;

pub use events::{DecodeError, InboundMessage, decode_message};
pub use protocol::{
    CHUNK_SIZE, DEFAULT_ENDPOINT, END_MARKER, FrameKind, MAX_FILE_SIZE, classify_frame,
    frame_count, frame_lengths,
};
