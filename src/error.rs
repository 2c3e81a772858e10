//! Errors

use std::io;

use thiserror::Error;

use crate::codec::CodecUuid;

/// Errors generated from library
#[derive(Error, Debug)]
pub enum SixcyError {
    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("deku error: {0:?}")]
    Deku(#[from] deku::DekuError),

    #[error("unsupported format version: {0}")]
    FormatVersion(u32),

    #[error("wrong magic bytes")]
    Magic,

    #[error("header crc32 mismatch")]
    HeaderCrc,

    #[error("content hash mismatch after decode")]
    ContentHash,

    #[error("codec {0} not present in registry")]
    UnknownCodec(CodecUuid),

    #[error("codec {codec} failed: {msg}")]
    CodecFailure { codec: &'static str, msg: String },

    #[error("authentication tag verification failed")]
    AuthFailed,

    #[error("key derivation failed")]
    KdfFailed,

    #[error("invalid index: {0}")]
    IndexParse(String),

    #[error("field out of range: {0}")]
    OutOfRange(&'static str),

    #[error("truncated: {declared} bytes declared, {available} available")]
    Truncated { declared: u64, available: u64 },

    #[error("file not found in archive")]
    FileNotFound,

    #[error("file duplicated in archive")]
    DuplicatedFileName,

    #[error("archive is encrypted and no password was given")]
    PasswordRequired,

    #[error("invalid file path in the archive")]
    InvalidFilePath,

    #[error("writer is in the wrong state: {0}")]
    InvalidWriterState(&'static str),

    #[error("plugin declares unsupported abi version {0}")]
    PluginAbiVersion(u32),

    #[error("plugin codec {0} collides with a registered codec")]
    PluginCollision(CodecUuid),
}

impl From<serde_json::Error> for SixcyError {
    fn from(value: serde_json::Error) -> Self {
        Self::IndexParse(value.to_string())
    }
}

impl From<SixcyError> for io::Error {
    fn from(value: SixcyError) -> Self {
        use SixcyError::*;
        match value {
            StdIo(io) => io,
            e @ (UnknownCodec(_) | PluginAbiVersion(_)) => {
                Self::new(io::ErrorKind::Unsupported, e)
            }
            e @ FileNotFound => Self::new(io::ErrorKind::NotFound, e),
            e @ (AuthFailed | PasswordRequired) => Self::new(io::ErrorKind::PermissionDenied, e),
            e @ Truncated { .. } => Self::new(io::ErrorKind::UnexpectedEof, e),
            e @ (Deku(_)
            | FormatVersion(_)
            | Magic
            | HeaderCrc
            | ContentHash
            | CodecFailure { .. }
            | KdfFailed
            | IndexParse(_)
            | OutOfRange(_)
            | DuplicatedFileName
            | InvalidFilePath
            | InvalidWriterState(_)
            | PluginCollision(_)) => Self::new(io::ErrorKind::InvalidData, e),
        }
    }
}
