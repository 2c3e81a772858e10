//! Stream files into blocks and seal the archive

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, instrument, trace};

use crate::block::{self, BlockType, NO_FILE_ID};
use crate::codec::{CodecRegistry, CodecUuid};
use crate::crypto::BlockCipher;
use crate::error::SixcyError;
use crate::index::{compute_root_hash, BlockRef, Checkpoint, FileIndex, FileRecord, RecoveryMap};
use crate::superblock::{SuperBlock, FLAG_ANY_ENCRYPTED, SUPERBLOCK_SIZE};

/// 4MiB
pub const DEFAULT_CHUNK_SIZE: u32 = 0x40_0000;

/// 4KiB
pub const MIN_CHUNK_SIZE: u32 = 0x1000;

/// 1GiB
pub const MAX_CHUNK_SIZE: u32 = 0x4000_0000;

/// Compression level used when the caller does not pick one
pub const DEFAULT_LEVEL: i32 = 3;

/// Options for [`ArchiveWriter`]
#[derive(Clone)]
pub struct WriterOptions {
    /// Plaintext bytes per DATA block; the last chunk of a file may be smaller
    pub chunk_size: u32,
    /// When set, every DATA and SOLID block is encrypted
    pub password: Option<String>,
    /// Archive identity; allocated fresh when not given
    pub archive_uuid: Option<[u8; 16]>,
    /// Codec for [`ArchiveWriter::add_file`]
    pub codec: CodecUuid,
    pub level: i32,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            password: None,
            archive_uuid: None,
            codec: CodecUuid::ZSTD,
            level: DEFAULT_LEVEL,
        }
    }
}

impl std::fmt::Debug for WriterOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterOptions")
            .field("chunk_size", &self.chunk_size)
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("archive_uuid", &self.archive_uuid)
            .field("codec", &self.codec)
            .field("level", &self.level)
            .finish()
    }
}

/// Where the writer is in its lifecycle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriterState {
    /// Superblock placeholder reserved, no blocks yet
    Fresh,
    WritingBlocks,
    /// A solid group is open; `add_file` appends to its buffer
    Solid,
    /// The superblock has been patched; the archive is sealed
    Finalized,
}

#[derive(Copy, Clone, Debug)]
struct DedupEntry {
    archive_offset: u64,
    orig_size: u32,
    comp_size: u32,
}

struct SolidBuffer {
    codec: CodecUuid,
    level: i32,
    buf: Vec<u8>,
    members: Vec<PendingMember>,
}

struct PendingMember {
    name: String,
    metadata: BTreeMap<String, String>,
    intra_offset: u64,
    intra_length: u64,
}

/// Streams files into DATA/SOLID blocks and seals the archive on
/// [`finalize`](Self::finalize).
///
/// Writes are append-only until finalize, which patches the superblock in
/// place; dropping a writer before finalize leaves the blocks written so far
/// valid for forward scan.
pub struct ArchiveWriter<W: Write + Seek> {
    w: W,
    registry: Arc<CodecRegistry>,
    chunk_size: u32,
    default_codec: CodecUuid,
    default_level: i32,
    archive_uuid: [u8; 16],
    cipher: Option<BlockCipher>,
    /// Content hash of every DATA block written so far
    dedup: FxHashMap<[u8; 32], DedupEntry>,
    names: FxHashSet<String>,
    records: Vec<FileRecord>,
    required_codecs: BTreeSet<CodecUuid>,
    checkpoints: Vec<Checkpoint>,
    solid: Option<SolidBuffer>,
    any_encrypted: bool,
    state: WriterState,
    finalized: Option<(SuperBlock, u64)>,
}

impl ArchiveWriter<BufWriter<File>> {
    /// Create a new archive at `path`, overwriting any existing file
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SixcyError> {
        Self::create_with_options(path, WriterOptions::default())
    }

    pub fn create_with_options(
        path: impl AsRef<Path>,
        options: WriterOptions,
    ) -> Result<Self, SixcyError> {
        let file = BufWriter::new(File::create(path)?);
        Self::with_options(file, options)
    }
}

impl<W: Write + Seek> ArchiveWriter<W> {
    /// Start an archive in `w` with default options
    pub fn new(w: W) -> Result<Self, SixcyError> {
        Self::with_options(w, WriterOptions::default())
    }

    pub fn with_options(w: W, options: WriterOptions) -> Result<Self, SixcyError> {
        Self::with_registry(w, options, CodecRegistry::shared())
    }

    /// Same as [`Self::with_options`] with an explicit codec registry, for
    /// embedders that registered plugin codecs
    ///
    /// # Panics
    /// If `options.chunk_size` is outside [`MIN_CHUNK_SIZE`]`..=`[`MAX_CHUNK_SIZE`]
    pub fn with_registry(
        mut w: W,
        options: WriterOptions,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self, SixcyError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&options.chunk_size) {
            panic!("invalid chunk_size");
        }
        registry.lookup(options.codec)?;

        let archive_uuid =
            options.archive_uuid.unwrap_or_else(|| uuid::Uuid::new_v4().into_bytes());
        let cipher = match &options.password {
            Some(password) => Some(BlockCipher::from_password(password, &archive_uuid)?),
            None => None,
        };

        // reserve the superblock; the real one is patched in on finalize
        w.seek(SeekFrom::Start(0))?;
        w.write_all(&[0u8; SUPERBLOCK_SIZE])?;

        Ok(Self {
            w,
            registry,
            chunk_size: options.chunk_size,
            default_codec: options.codec,
            default_level: options.level,
            archive_uuid,
            cipher,
            dedup: FxHashMap::default(),
            names: FxHashSet::default(),
            records: vec![],
            required_codecs: BTreeSet::new(),
            checkpoints: vec![],
            solid: None,
            any_encrypted: false,
            state: WriterState::Fresh,
            finalized: None,
        })
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.archive_uuid
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    /// Consume the writer, returning the underlying stream
    pub fn into_inner(self) -> W {
        self.w
    }

    /// Add `reader`'s bytes as one file, with the writer's default codec
    pub fn add_file(
        &mut self,
        name: impl Into<String>,
        reader: impl Read,
    ) -> Result<(), SixcyError> {
        let (codec, level) = (self.default_codec, self.default_level);
        self.add_file_inner(name.into(), reader, codec, level, BTreeMap::new())
    }

    pub fn add_file_with_codec(
        &mut self,
        name: impl Into<String>,
        reader: impl Read,
        codec: CodecUuid,
        level: i32,
    ) -> Result<(), SixcyError> {
        self.add_file_inner(name.into(), reader, codec, level, BTreeMap::new())
    }

    pub fn add_file_with_metadata(
        &mut self,
        name: impl Into<String>,
        reader: impl Read,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), SixcyError> {
        let (codec, level) = (self.default_codec, self.default_level);
        self.add_file_inner(name.into(), reader, codec, level, metadata)
    }

    #[instrument(skip_all, fields(name = %name))]
    fn add_file_inner(
        &mut self,
        name: String,
        mut reader: impl Read,
        codec: CodecUuid,
        level: i32,
        metadata: BTreeMap<String, String>,
    ) -> Result<(), SixcyError> {
        if self.state == WriterState::Finalized {
            return Err(SixcyError::InvalidWriterState("archive is finalized"));
        }
        if !self.names.insert(name.clone()) {
            return Err(SixcyError::DuplicatedFileName);
        }

        // while a solid group is open, files only accumulate in its buffer
        if let Some(solid) = &mut self.solid {
            let intra_offset = solid.buf.len() as u64;
            let copied = std::io::copy(&mut reader, &mut solid.buf)?;
            solid.members.push(PendingMember {
                name,
                metadata,
                intra_offset,
                intra_length: copied,
            });
            return Ok(());
        }

        self.state = WriterState::WritingBlocks;
        let registry = self.registry.clone();
        let codec_entry = registry.lookup(codec)?;

        let file_id = self.records.len() as u32;
        let mut block_refs = vec![];
        let mut file_offset = 0u64;
        let mut compressed_size = 0u64;

        loop {
            let chunk = read_chunk(&mut reader, self.chunk_size as usize)?;
            if chunk.is_empty() {
                break;
            }
            let content_hash = *blake3::hash(&chunk).as_bytes();

            // content-addressed dedup: a hit elides compression entirely and
            // points at the block already on disk
            let (archive_offset, comp_size) = match self.dedup.get(&content_hash).copied() {
                Some(entry) => {
                    trace!(
                        "duplicate {}-byte chunk at {:#x}",
                        entry.orig_size,
                        entry.archive_offset
                    );
                    (entry.archive_offset, entry.comp_size)
                }
                None => {
                    let prepared = block::encode_block(
                        &chunk,
                        content_hash,
                        BlockType::Data,
                        codec_entry,
                        level,
                        file_id,
                        file_offset,
                        self.cipher.as_ref(),
                    )?;
                    let archive_offset = self.write_block(&prepared, codec)?;
                    self.dedup.insert(
                        content_hash,
                        DedupEntry {
                            archive_offset,
                            orig_size: prepared.header.orig_size,
                            comp_size: prepared.header.comp_size,
                        },
                    );
                    (archive_offset, prepared.header.comp_size)
                }
            };

            block_refs.push(BlockRef {
                content_hash,
                archive_offset,
                intra_offset: 0,
                intra_length: 0,
            });
            compressed_size += comp_size as u64;
            let short_chunk = chunk.len() < self.chunk_size as usize;
            file_offset += chunk.len() as u64;
            if short_chunk {
                break;
            }
        }

        self.records.push(FileRecord {
            id: file_id,
            parent_id: 0,
            name,
            block_refs,
            original_size: file_offset,
            compressed_size,
            metadata,
            degraded_integrity: false,
        });
        self.push_checkpoint(file_id)?;
        Ok(())
    }

    /// Open a logical concatenation buffer; subsequent [`Self::add_file`]
    /// calls append to it until [`Self::end_solid`]
    pub fn begin_solid(&mut self, codec: CodecUuid, level: i32) -> Result<(), SixcyError> {
        if self.state == WriterState::Finalized {
            return Err(SixcyError::InvalidWriterState("archive is finalized"));
        }
        if self.solid.is_some() {
            return Err(SixcyError::InvalidWriterState("solid group already open"));
        }
        self.registry.lookup(codec)?;
        self.solid = Some(SolidBuffer { codec, level, buf: vec![], members: vec![] });
        self.state = WriterState::Solid;
        Ok(())
    }

    /// Close the solid group and emit exactly one SOLID block holding the
    /// concatenation of its members. Solid blocks never deduplicate.
    #[instrument(skip_all)]
    pub fn end_solid(&mut self) -> Result<(), SixcyError> {
        let solid = self
            .solid
            .take()
            .ok_or(SixcyError::InvalidWriterState("no solid group open"))?;
        self.state = WriterState::WritingBlocks;

        let (content_hash, archive_offset, comp_size) = if solid.buf.is_empty() {
            ([0u8; 32], 0, 0)
        } else {
            let registry = self.registry.clone();
            let codec_entry = registry.lookup(solid.codec)?;
            let content_hash = *blake3::hash(&solid.buf).as_bytes();
            let prepared = block::encode_block(
                &solid.buf,
                content_hash,
                BlockType::Solid,
                codec_entry,
                solid.level,
                NO_FILE_ID,
                0,
                self.cipher.as_ref(),
            )?;
            let archive_offset = self.write_block(&prepared, solid.codec)?;
            info!(
                "solid block: {} members, {} -> {} bytes",
                solid.members.len(),
                prepared.header.orig_size,
                prepared.header.comp_size
            );
            (content_hash, archive_offset, prepared.header.comp_size)
        };

        for member in solid.members {
            let file_id = self.records.len() as u32;
            let block_refs = if member.intra_length > 0 {
                vec![BlockRef {
                    content_hash,
                    archive_offset,
                    intra_offset: member.intra_offset,
                    intra_length: member.intra_length,
                }]
            } else {
                vec![]
            };
            self.records.push(FileRecord {
                id: file_id,
                parent_id: 0,
                name: member.name,
                block_refs,
                original_size: member.intra_length,
                // members of a solid block share it; each reports the whole
                // block's payload size
                compressed_size: comp_size as u64,
                metadata: member.metadata,
                degraded_integrity: false,
            });
            self.push_checkpoint(file_id)?;
        }
        Ok(())
    }

    /// Write the INDEX block and recovery map, then patch the superblock.
    ///
    /// Idempotent after success; fatal on I/O error, leaving the archive
    /// recoverable by forward scan.
    #[instrument(skip_all)]
    pub fn finalize(&mut self) -> Result<(SuperBlock, u64), SixcyError> {
        if let Some(done) = &self.finalized {
            return Ok(done.clone());
        }
        if self.solid.is_some() {
            return Err(SixcyError::InvalidWriterState("solid group still open"));
        }

        info!("writing index block");
        let root_hash = compute_root_hash(&self.records);
        let index = FileIndex { records: self.records.clone(), root_hash };
        let json = index.to_json()?;
        let content_hash = *blake3::hash(&json).as_bytes();
        let registry = self.registry.clone();
        // the index is always zstd-compressed and never encrypted: listing an
        // archive must not need the password
        let prepared = block::encode_block(
            &json,
            content_hash,
            BlockType::Index,
            registry.lookup(CodecUuid::ZSTD)?,
            DEFAULT_LEVEL,
            NO_FILE_ID,
            0,
            None,
        )?;
        let index_offset = self.w.stream_position()?;
        self.w.write_all(&prepared.wire_header)?;
        self.w.write_all(&prepared.payload)?;
        let index_size = prepared.total_size();

        info!("writing recovery map");
        let map = RecoveryMap { checkpoints: std::mem::take(&mut self.checkpoints) };
        let map_json = serde_json::to_vec(&map)?;
        self.w.write_all(&(map_json.len() as u64).to_le_bytes())?;
        self.w.write_all(&map_json)?;
        let bytes_written = self.w.stream_position()?;

        info!("writing superblock");
        let mut superblock = SuperBlock::new(self.archive_uuid);
        if self.any_encrypted {
            superblock.flags |= FLAG_ANY_ENCRYPTED;
        }
        superblock.index_offset = index_offset;
        superblock.index_size = index_size;
        superblock.required_codec_uuids =
            self.required_codecs.iter().map(|uuid| uuid.0).collect();
        let wire = superblock.to_wire()?;
        self.w.seek(SeekFrom::Start(0))?;
        self.w.write_all(&wire)?;
        self.w.flush()?;

        trace!("{superblock:#x?}");
        self.state = WriterState::Finalized;
        self.finalized = Some((superblock.clone(), bytes_written));
        Ok((superblock, bytes_written))
    }

    /// Append a prepared block at the current position, tracking the codec
    /// and encryption bookkeeping. Returns the block's offset.
    fn write_block(
        &mut self,
        prepared: &block::PreparedBlock,
        codec: CodecUuid,
    ) -> Result<u64, SixcyError> {
        let archive_offset = self.w.stream_position()?;
        self.w.write_all(&prepared.wire_header)?;
        self.w.write_all(&prepared.payload)?;
        if !codec.is_none() {
            self.required_codecs.insert(codec);
        }
        if prepared.header.is_encrypted() {
            self.any_encrypted = true;
        }
        Ok(archive_offset)
    }

    fn push_checkpoint(&mut self, last_file_id: u32) -> Result<(), SixcyError> {
        let archive_offset = self.w.stream_position()?;
        self.checkpoints.push(Checkpoint {
            archive_offset,
            last_file_id,
            timestamp: unix_timestamp(),
        });
        Ok(())
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Read up to `chunk_size` bytes, short only at end of input
fn read_chunk(reader: &mut impl Read, chunk_size: usize) -> Result<Vec<u8>, SixcyError> {
    let mut chunk = vec![0u8; chunk_size];
    let mut filled = 0;
    while filled < chunk_size {
        match reader.read(&mut chunk[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    chunk.truncate(filled);
    Ok(chunk)
}
