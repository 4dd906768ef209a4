//! Error types for the ovfremap core library.

use std::path::PathBuf;

/// The main error type for remapping operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The descriptor is not well-formed XML.
    #[error("Descriptor parse error: {message}")]
    ParseFailure { message: String },

    /// A required descriptor element is missing, duplicated or empty.
    #[error("Malformed descriptor: {message}")]
    MalformedDescriptor { message: String },

    /// The archive contains no descriptor file.
    #[error("No descriptor (*.ovf) found under '{}'", root.display())]
    MissingDescriptor { root: PathBuf },

    /// Files are not where the archive layout expects them.
    #[error("Unexpected archive layout: {message}")]
    InvalidLayout { message: String },

    /// No `<image-id>.meta` sidecar exists for a disk.
    #[error("Sidecar '{image_id}.meta' was not found in the archive")]
    MissingSidecar { image_id: String },

    /// No image data file exists for a disk.
    #[error("Image file '{image_id}' was not found in the archive")]
    MissingImage { image_id: String },

    /// A rename target already exists, or a rename would touch the archive root.
    #[error("Filesystem conflict: {message}")]
    FilesystemConflict { message: String },

    /// The commit journal could not be written or read back.
    #[error("Journal error: {message}")]
    Journal { message: String },

    /// Undoing a failed commit did not complete; the journal is left in place.
    #[error("Rollback failed after '{cause}': {message}")]
    Rollback { cause: String, message: String },
}

/// A specialized Result type for remapping operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a descriptor parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::ParseFailure {
            message: message.into(),
        }
    }

    /// Create a malformed-descriptor error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedDescriptor {
            message: message.into(),
        }
    }

    /// Create an archive layout error.
    pub fn layout(message: impl Into<String>) -> Self {
        Self::InvalidLayout {
            message: message.into(),
        }
    }

    /// Create a filesystem conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::FilesystemConflict {
            message: message.into(),
        }
    }

    /// Create a journal error.
    pub fn journal(message: impl Into<String>) -> Self {
        Self::Journal {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
