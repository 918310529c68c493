//! Loading of source documents as opaque byte payloads.
//!
//! The document content is never inspected:
//! any byte sequence is accepted,
//! no matter what its extension or MIME type hint claims.
use std::fs;
use std::path::{Path, PathBuf};

use snafu::{ensure, ResultExt, Snafu};

/// Maximum byte length of a document
/// which can still be carried by a single data element
/// with a defined 32-bit length
/// (`0xFFFF_FFFF` is reserved for undefined length).
pub const MAX_DOCUMENT_SIZE: u64 = 0xFFFF_FFFE;

#[derive(Debug, Snafu)]
pub enum LoadError {
    /// The source document could not be inspected.
    #[snafu(display("Could not inspect source document {}: {}", path.display(), source))]
    Inspect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The source document could not be read into memory.
    #[snafu(display("Could not read source document {}: {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The document does not fit in a single binary data element.
    #[snafu(display(
        "Document {} is too large ({} bytes, maximum is {})",
        path.display(),
        size,
        MAX_DOCUMENT_SIZE
    ))]
    UnsupportedSize { path: PathBuf, size: u64 },
}

type Result<T, E = LoadError> = std::result::Result<T, E>;

/// An opaque document payload in memory,
/// with an optional MIME type hint taken from the source file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPayload {
    data: Vec<u8>,
    mime_type: Option<String>,
}

impl DocumentPayload {
    /// Create a payload directly from its parts.
    pub fn new(data: Vec<u8>, mime_type: Option<String>) -> Self {
        DocumentPayload { data, mime_type }
    }

    /// The raw bytes of the document.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The byte length of the document.
    pub fn byte_len(&self) -> u64 {
        self.data.len() as u64
    }

    /// The MIME type hint, if one could be derived.
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    /// Take ownership of the raw bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Read a whole document file into memory.
///
/// The file size is checked up front
/// so that an oversized document is rejected before any buffering.
pub fn load_document(path: impl AsRef<Path>) -> Result<DocumentPayload> {
    let path = path.as_ref();
    let meta = fs::metadata(path).context(InspectSnafu { path })?;
    ensure!(
        meta.len() <= MAX_DOCUMENT_SIZE,
        UnsupportedSizeSnafu {
            path,
            size: meta.len(),
        }
    );
    let data = fs::read(path).context(ReadSnafu { path })?;

    Ok(DocumentPayload {
        data,
        mime_type: mime_type_hint(path).map(str::to_string),
    })
}

/// Guess a MIME type from the file extension of the source document.
fn mime_type_hint(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some("application/pdf"),
        "xml" | "cda" => Some("text/XML"),
        "stl" => Some("model/stl"),
        _ => None,
    }
}
