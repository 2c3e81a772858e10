//! Library for the reading, creating, and recovery of `.6cy` archive
//! containers.
//!
//! A `.6cy` archive is a flat sequence of self-describing blocks behind a
//! fixed 256-byte superblock. Every block is parseable in isolation and
//! integrity-checked twice: a crc32 over its header and a BLAKE3 hash over
//! its plaintext. Codecs are identified by 128-bit values written verbatim on
//! disk, and an archive refuses to open unless every codec it declares is
//! registered.
//!
//! ## Writing
//! ```rust,no_run
//! use std::io::Cursor;
//! use sixcy::ArchiveWriter;
//!
//! let mut fs = ArchiveWriter::create("out.6cy").unwrap();
//! fs.add_file("readme.txt", Cursor::new(b"Hello, world!".to_vec())).unwrap();
//! let (superblock, bytes_written) = fs.finalize().unwrap();
//! ```
//!
//! ## Reading
//! ```rust,no_run
//! use sixcy::ArchiveReader;
//!
//! let mut archive = ArchiveReader::open("out.6cy").unwrap();
//! let bytes = archive.read_file("readme.txt").unwrap();
//! let mut buf = [0u8; 64];
//! let n = archive.read_at("readme.txt", 7, &mut buf).unwrap();
//! ```
//!
//! ## Recovery
//! An archive whose index or superblock is gone is still walkable from its
//! block headers: [`scan_blocks`] rebuilds a catalog, [`extract_recoverable`]
//! salvages file data into a fresh archive.
//!
//! # Features
#![cfg_attr(feature = "document-features", doc = document_features::document_features!())]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod block;
mod codec;
mod crypto;
mod error;
mod index;
mod plugin;
mod reader;
mod recovery;
mod superblock;
mod writer;

pub use crate::block::{
    BlockHeader, BlockType, BLOCK_FLAG_ENCRYPTED, BLOCK_HEADER_SIZE, BLOCK_HEADER_VERSION,
    BLOCK_MAGIC, NO_FILE_ID,
};
pub use crate::codec::{BuiltinCodec, CodecEntry, CodecRegistry, CodecUuid};
pub use crate::crypto::{derive_key, KDF_ITERATIONS, KDF_MEMORY_KIB, KDF_PARALLELISM};
pub use crate::error::SixcyError;
pub use crate::index::{BlockRef, Checkpoint, FileIndex, FileRecord, RecoveryMap};
pub use crate::reader::{ArchiveReader, BufReadSeek, ReaderOptions, WriteSeek};
pub use crate::recovery::{
    extract_recoverable, scan_blocks, BlockHealth, RecoveryOptions, RecoveryQuality,
    RecoveryReport, ScannedArchive, SolidBlockInfo,
};
pub use crate::superblock::{
    SuperBlock, FLAG_ANY_ENCRYPTED, FORMAT_VERSION, MAX_REQUIRED_CODECS, SUPERBLOCK_MAGIC,
    SUPERBLOCK_SIZE,
};
pub use crate::writer::{
    ArchiveWriter, WriterOptions, WriterState, DEFAULT_CHUNK_SIZE, DEFAULT_LEVEL, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE,
};

/// The frozen C plugin interface
pub mod plugin_abi {
    pub use crate::plugin::{
        CodecDescriptor, PluginBoundFn, PluginCompressFn, PluginDecompressFn, PluginEntryFn,
        PLUGIN_ABI_VERSION, PLUGIN_ERR_CORRUPT, PLUGIN_ERR_INTERNAL, PLUGIN_ERR_OVERFLOW,
        PLUGIN_OK,
    };
}
