use std::path::PathBuf;

use thiserror::Error;

/// The primary error type for all operations in the `zipmaster` crate.
///
/// Every variant is structured so a presentation layer can render its own
/// message from the kind and the attached path or index.
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Bad caller input, detected before any work starts.
    #[error("invalid input: {0}")]
    Validation(#[from] ValidationError),

    /// Malformed or corrupt archive data.
    #[error("archive format error: {0}")]
    Codec(#[from] CodecError),

    /// Key derivation failure or failed authentication.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// An I/O error, with the path where it happened.
    #[error("I/O error on path '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A volume set with a gap in its numbering. `index` is 1-based.
    #[error("volume {index} is missing")]
    MissingVolume { index: u32 },

    /// The task body panicked; carries the panic message.
    #[error("task worker panicked: {0}")]
    Worker(String),

    /// A failure while processing one entry; `path` is the archive path of the entry.
    #[error("entry '{path}': {source}")]
    Entry {
        path: String,
        #[source]
        source: Box<ArchiveError>,
    },
}

/// Flat classification of [`ArchiveError`], looking through [`ArchiveError::Entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Codec,
    Crypto,
    Io,
    MissingVolume,
    Internal,
}

impl ArchiveError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ArchiveError::Io {
            path: path.into(),
            source,
        }
    }

    /// Attaches the offending entry path. Already attributed errors are left alone.
    pub fn for_entry(self, path: &str) -> Self {
        match self {
            e @ ArchiveError::Entry { .. } => e,
            other => ArchiveError::Entry {
                path: path.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::Validation(_) => ErrorKind::Validation,
            ArchiveError::Codec(_) => ErrorKind::Codec,
            ArchiveError::Crypto(_) => ErrorKind::Crypto,
            ArchiveError::Io { .. } => ErrorKind::Io,
            ArchiveError::MissingVolume { .. } => ErrorKind::MissingVolume,
            ArchiveError::Worker(_) => ErrorKind::Internal,
            ArchiveError::Entry { source, .. } => source.kind(),
        }
    }

    /// Archive path of the entry this error is attributed to, if any.
    pub fn entry_path(&self) -> Option<&str> {
        match self {
            ArchiveError::Entry { path, .. } => Some(path),
            _ => None,
        }
    }

    /// The error with any entry attribution stripped.
    pub fn root(&self) -> &ArchiveError {
        match self {
            ArchiveError::Entry { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self.root(),
            ArchiveError::Crypto(CryptoError::AuthenticationFailed)
        )
    }
}

/// Bad caller input. Always recoverable by correcting the input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("no input files were given")]
    EmptyInput,

    #[error("input '{}' does not exist", .0.display())]
    SourceNotFound(PathBuf),

    #[error("destination '{}' does not exist", .0.display())]
    DestinationNotFound(PathBuf),

    #[error("destination '{}' is not a directory", .0.display())]
    DestinationNotDirectory(PathBuf),

    #[error("output '{}' already exists", .0.display())]
    OutputExists(PathBuf),

    #[error("compression level {0} is outside 0..=9")]
    InvalidLevel(u32),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("key derivation needs at least {min} iterations, got {got}")]
    IterationsTooLow { min: u32, got: u32 },

    #[error("key derivation allows at most {max} iterations, got {got}")]
    IterationsTooHigh { max: u32, got: u32 },

    #[error("part size must be at least 1 byte")]
    InvalidPartSize,

    #[error("cannot split an empty stream")]
    EmptyStream,

    #[error("format '{0}' is not supported")]
    UnsupportedFormat(String),

    #[error("algorithm '{0}' is not supported")]
    UnsupportedAlgorithm(String),

    #[error("format '{0}' cannot carry encrypted entries")]
    FormatCannotEncrypt(String),

    #[error("gzip output holds exactly one file, got {0}")]
    SingleFileFormat(usize),

    #[error("archive comment is {0} bytes, the limit is 65535")]
    CommentTooLong(usize),

    #[error("archive has no encrypted entries")]
    NotEncrypted,

    #[error("entry '{0}' is already encrypted")]
    AlreadyEncrypted(String),

    #[error("entry '{0}' is encrypted and no password was given")]
    PasswordRequired(String),

    #[error("volume {index} is {actual} bytes, manifest says {expected}")]
    VolumeLength { index: u32, expected: u64, actual: u64 },

    #[error("volume {index} checksum does not match the manifest")]
    VolumeChecksum { index: u32 },

    #[error("volume {found} found where volume {expected} was expected")]
    VolumeOutOfSequence { expected: u32, found: u32 },

    #[error("volume manifest is inconsistent: {0}")]
    VolumeManifest(String),
}

/// Malformed or corrupt archive data, or an entry that cannot be framed.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("invalid entry path '{path}': {reason}")]
    InvalidPath { path: String, reason: PathRejection },

    #[error("duplicate entry path '{0}'")]
    DuplicatePath(String),

    #[error("archive truncated while reading {0}")]
    Truncated(&'static str),

    #[error("bad {record} signature at offset {offset}")]
    BadSignature { record: &'static str, offset: u64 },

    #[error("{what} at offset {offset} (+{len}) lies outside the {bound}-byte stream")]
    OffsetOutOfRange {
        what: &'static str,
        offset: u64,
        len: u64,
        bound: u64,
    },

    #[error("central directory declares {declared} entries but holds {found}")]
    EntryCount { declared: u64, found: u64 },

    #[error("local header of '{0}' disagrees with the central directory")]
    HeaderMismatch(String),

    #[error("checksum mismatch for '{path}': stored {expected:08x}, computed {actual:08x}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("size mismatch for '{path}': expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("compression method {method} of '{path}' is not supported")]
    UnsupportedMethod { path: String, method: u16 },

    #[error("corrupt payload for '{path}': {source}")]
    CorruptPayload {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encryption header of '{path}' is invalid: {reason}")]
    EncryptionHeader { path: String, reason: &'static str },

    #[error("'{what}' exceeds the 4 GiB limit of the container ({size} bytes)")]
    TooLarge { what: String, size: u64 },

    #[error("not a gzip stream")]
    NotGzip,

    #[error("no entry at index {0}")]
    NoSuchEntry(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Lifts a codec error to the crate error, naming `path` if it is an I/O failure.
    pub fn at(self, path: &std::path::Path) -> ArchiveError {
        match self {
            CodecError::Io(source) => ArchiveError::io(path, source),
            other => ArchiveError::Codec(other),
        }
    }
}

/// Why a path was refused as an archive entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRejection {
    Empty,
    Absolute,
    ParentTraversal,
    NulByte,
    TooLong,
}

impl std::fmt::Display for PathRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PathRejection::Empty => "path is empty",
            PathRejection::Absolute => "path is absolute",
            PathRejection::ParentTraversal => "path contains a '..' segment",
            PathRejection::NulByte => "path contains a NUL byte",
            PathRejection::TooLong => "path is longer than 65535 bytes",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("password must not be empty")]
    EmptyPassword,

    /// Wrong password or tampered data. The two cases are deliberately not
    /// distinguished.
    #[error("authentication failed: the data is damaged or the password is wrong")]
    AuthenticationFailed,

    #[error("key length {0} does not match the cipher")]
    KeyLength(usize),

    #[error("encryption failed")]
    SealFailed,
}

// Crate-wide result type
pub type Result<T> = std::result::Result<T, ArchiveError>;
