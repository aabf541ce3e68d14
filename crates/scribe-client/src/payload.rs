use std::io::{self, Cursor};
use std::path::Path;

use tokio::fs::File;

/// The file being uploaded: a display name, a declared length and a byte
/// source read front to back by the sender.
#[derive(Debug)]
pub struct Payload<R = File> {
    name: String,
    len: u64,
    mime: Option<String>,
    source: R,
}

impl Payload<File> {
    /// Open a file on disk. The name is the path's final component.
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(name, len, file))
    }
}

impl Payload<Cursor<Vec<u8>>> {
    /// In-memory payload.
    pub fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let len = bytes.len() as u64;
        Self::new(name, len, Cursor::new(bytes))
    }
}

impl<R> Payload<R> {
    pub fn new(name: impl Into<String>, len: u64, source: R) -> Self {
        Self {
            name: name.into(),
            len,
            mime: None,
            source,
        }
    }

    /// Set the MIME type explicitly instead of guessing it from the name.
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Explicit MIME type, or the one implied by the name's extension.
    pub fn mime(&self) -> Option<String> {
        self.mime.clone().or_else(|| {
            mime_guess::from_path(&self.name)
                .first_raw()
                .map(str::to_string)
        })
    }

    /// Lowercased extension of the name, without the dot.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }

    pub(crate) fn source_mut(&mut self) -> &mut R {
        &mut self.source
    }
}
