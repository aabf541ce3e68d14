/// Binary upload framing.
///
/// ```text
/// [frame 0: bytes 0..C] [frame 1: bytes C..2C] ... [last: <= C bytes] [end marker: 8 x 0x00]
/// ```
///
/// Every data frame is a separate binary WebSocket message of at most
/// `CHUNK_SIZE` bytes, sent in offset order. The end marker always follows the
/// last data frame, even when that frame exactly fills a chunk, and is told
/// apart from data by its exact content rather than its length.

/// Default frame size: 1 MiB.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Default upload ceiling: 100 MiB.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// End-of-stream sentinel sent after the last data frame.
pub const END_MARKER: [u8; 8] = [0u8; 8];

/// Service endpoint used when nothing else is configured.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws";

/// How a receiver should interpret one inbound binary message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    EndOfStream,
}

/// Classify a binary message by shape. Only the exact sentinel counts as
/// end-of-stream; a short data frame of any other content is data.
pub fn classify_frame(frame: &[u8]) -> FrameKind {
    if frame == END_MARKER.as_slice() {
        FrameKind::EndOfStream
    } else {
        FrameKind::Data
    }
}

/// Number of data frames needed for `total` bytes: ceil(total / chunk_size).
///
/// # Panics
/// Panics if `chunk_size` is zero.
pub fn frame_count(total: u64, chunk_size: usize) -> u64 {
    assert!(chunk_size > 0, "chunk size must be non-zero");
    total.div_ceil(chunk_size as u64)
}

/// Lengths of the data frames for `total` bytes, in send order.
pub fn frame_lengths(total: u64, chunk_size: usize) -> impl Iterator<Item = usize> {
    let chunk = chunk_size as u64;
    (0..frame_count(total, chunk_size)).map(move |idx| {
        let offset = idx * chunk;
        (total - offset).min(chunk) as usize
    })
}
