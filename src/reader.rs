//! Open an archive, load its index, and serve random-access reads

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Seek, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{info, instrument, trace};

use crate::block::{self, BlockType};
use crate::codec::CodecRegistry;
use crate::crypto::BlockCipher;
use crate::error::SixcyError;
use crate::index::{BlockRef, FileIndex, FileRecord};
use crate::superblock::{SuperBlock, FORMAT_VERSION, SUPERBLOCK_MAGIC, SUPERBLOCK_SIZE};

/// Pseudo-trait for `BufRead + Seek + Send`
pub trait BufReadSeek: BufRead + Seek + Send {}
impl<T: BufRead + Seek + Send> BufReadSeek for T {}

/// Pseudo-trait for `Write + Seek`
pub trait WriteSeek: Write + Seek {}
impl<T: Write + Seek> WriteSeek for T {}

/// Decoded block plaintexts kept around for repeated/spanning reads
const PLAINTEXT_CACHE_BLOCKS: usize = 8;

/// Options for [`ArchiveReader`]
#[derive(Clone)]
pub struct ReaderOptions {
    pub password: Option<String>,
    /// Reject records that rely on the legacy `offsets` list (and so have no
    /// content hashes)
    pub strict: bool,
    /// Upper bound accepted for any block's `orig_size`; embedders that trust
    /// input less than the default can lower it
    pub max_orig_size: u64,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self { password: None, strict: false, max_orig_size: u32::MAX as u64 }
    }
}

impl std::fmt::Debug for ReaderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderOptions")
            .field("password", &self.password.as_ref().map(|_| "<set>"))
            .field("strict", &self.strict)
            .field("max_orig_size", &self.max_orig_size)
            .finish()
    }
}

#[derive(Copy, Clone, Debug)]
struct BlockInfo {
    orig_size: u32,
    block_type: BlockType,
    content_hash: [u8; 32],
}

/// Random-access reader over a sealed archive.
///
/// Opening verifies the superblock, refuses the archive unless every required
/// codec resolves in the registry, and loads the whole file catalog from the
/// INDEX block. Reads decode whole blocks (the atomic unit) and slice.
pub struct ArchiveReader<R: BufReadSeek> {
    reader: R,
    registry: Arc<CodecRegistry>,
    superblock: SuperBlock,
    cipher: Option<BlockCipher>,
    max_orig_size: u64,
    records: Vec<FileRecord>,
    by_name: FxHashMap<String, usize>,
    root_hash: [u8; 32],
    info: FxHashMap<u64, BlockInfo>,
    cache: FxHashMap<u64, Vec<u8>>,
}

impl ArchiveReader<BufReader<File>> {
    /// Open the archive at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SixcyError> {
        Self::from_reader(BufReader::new(File::open(path)?))
    }

    /// Open an encrypted archive; the key is derived from `password` with the
    /// archive uuid as salt
    pub fn open_encrypted(
        path: impl AsRef<Path>,
        password: impl Into<String>,
    ) -> Result<Self, SixcyError> {
        let options = ReaderOptions { password: Some(password.into()), ..Default::default() };
        Self::from_reader_with_options(BufReader::new(File::open(path)?), options)
    }
}

impl<R: BufReadSeek> ArchiveReader<R> {
    pub fn from_reader(reader: R) -> Result<Self, SixcyError> {
        Self::from_reader_with_options(reader, ReaderOptions::default())
    }

    pub fn from_reader_with_options(reader: R, options: ReaderOptions) -> Result<Self, SixcyError> {
        Self::from_reader_with_registry(reader, options, CodecRegistry::shared())
    }

    #[instrument(skip_all)]
    pub fn from_reader_with_registry(
        mut reader: R,
        options: ReaderOptions,
        registry: Arc<CodecRegistry>,
    ) -> Result<Self, SixcyError> {
        reader.rewind()?;

        // the version gate fires before anything past byte 8 is read
        let mut head = [0u8; 8];
        block::read_exact_or_truncated(&mut reader, &mut head)?;
        if head[..4] != SUPERBLOCK_MAGIC {
            return Err(SixcyError::Magic);
        }
        let format_version = u32::from_le_bytes(head[4..8].try_into().unwrap());
        if format_version != FORMAT_VERSION {
            return Err(SixcyError::FormatVersion(format_version));
        }

        let mut buf = [0u8; SUPERBLOCK_SIZE];
        buf[..8].copy_from_slice(&head);
        block::read_exact_or_truncated(&mut reader, &mut buf[8..])?;
        let superblock = SuperBlock::from_wire(&buf)?;
        trace!("{superblock:#x?}");

        // all-or-nothing codec gate: refuse to read any block unless every
        // declared codec resolves
        for uuid in superblock.required_codecs() {
            registry.lookup(uuid)?;
        }

        let cipher = match &options.password {
            Some(password) => {
                Some(BlockCipher::from_password(password, &superblock.archive_uuid)?)
            }
            None => None,
        };

        info!("reading index block");
        let index_header = block::read_header_at(&mut reader, superblock.index_offset)?;
        if index_header.block_type()? != BlockType::Index {
            return Err(SixcyError::IndexParse("no INDEX block at index_offset".into()));
        }
        if index_header.is_encrypted() {
            return Err(SixcyError::IndexParse("index block is encrypted".into()));
        }
        let decoded = block::read_block_at(
            &mut reader,
            superblock.index_offset,
            &registry,
            None,
            options.max_orig_size,
        )?;
        let index = FileIndex::from_json(&decoded.plaintext, options.strict)?;

        let mut by_name = FxHashMap::default();
        for (i, record) in index.records.iter().enumerate() {
            by_name.entry(record.name.clone()).or_insert(i);
        }
        info!("opened archive with {} files", index.records.len());

        Ok(Self {
            reader,
            registry,
            superblock,
            cipher,
            max_orig_size: options.max_orig_size,
            records: index.records,
            by_name,
            root_hash: index.root_hash,
            info: FxHashMap::default(),
            cache: FxHashMap::default(),
        })
    }

    pub fn superblock(&self) -> &SuperBlock {
        &self.superblock
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.superblock.archive_uuid
    }

    /// The index's BLAKE3 over all content hashes in record/block order
    pub fn root_hash(&self) -> [u8; 32] {
        self.root_hash
    }

    /// Every file record in the catalog, in index order
    pub fn list(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn record(&self, name: &str) -> Option<&FileRecord> {
        self.by_name.get(name).map(|i| &self.records[*i])
    }

    /// Read a whole file by concatenating its decoded blocks
    pub fn read_file(&mut self, name: &str) -> Result<Vec<u8>, SixcyError> {
        let record = self.named_record(name)?.clone();
        let mut out = vec![0u8; record.original_size as usize];
        let copied = self.read_record_range(&record, 0, &mut out)?;
        if copied as u64 != record.original_size {
            return Err(SixcyError::Truncated {
                declared: record.original_size,
                available: copied as u64,
            });
        }
        Ok(out)
    }

    /// Read into `buf` starting at byte `offset` of the file, decoding only
    /// the blocks that overlap the range. Returns the bytes copied, short
    /// only at end of file.
    pub fn read_at(&mut self, name: &str, offset: u64, buf: &mut [u8]) -> Result<usize, SixcyError> {
        let record = self.named_record(name)?.clone();
        self.read_record_range(&record, offset, buf)
    }

    /// Decode every file into `dir`, creating parent directories as needed
    pub fn extract_all(&mut self, dir: impl AsRef<Path>) -> Result<(), SixcyError> {
        let dir = dir.as_ref();
        let names: Vec<String> = self.records.iter().map(|r| r.name.clone()).collect();
        for name in names {
            let dest = dir.join(sanitize_name(&name)?);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = self.read_file(&name)?;
            fs::write(&dest, bytes)?;
            trace!("extracted {name}");
        }
        Ok(())
    }

    fn named_record(&self, name: &str) -> Result<&FileRecord, SixcyError> {
        self.by_name
            .get(name)
            .map(|i| &self.records[*i])
            .ok_or(SixcyError::FileNotFound)
    }

    /// Prefix-sum walk over the record's refs, copying the overlap with
    /// `[offset, offset + buf.len())` out of each overlapping block
    fn read_record_range(
        &mut self,
        record: &FileRecord,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, SixcyError> {
        if buf.is_empty() || offset >= record.original_size {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(record.original_size);

        let mut logical = 0u64;
        let mut copied = 0usize;
        for block_ref in &record.block_refs {
            let len = self.ref_len(block_ref)?;
            let ref_start = logical;
            let ref_end = logical + len;
            logical = ref_end;
            if ref_end <= offset {
                continue;
            }
            if ref_start >= end {
                break;
            }

            let from = offset.max(ref_start) - ref_start;
            let to = end.min(ref_end) - ref_start;
            let dst = (offset.max(ref_start) - offset) as usize;
            let n = (to - from) as usize;
            self.copy_ref_range(block_ref, from, to, &mut buf[dst..dst + n])?;
            copied += n;
        }
        Ok(copied)
    }

    /// Bytes this ref contributes to its file: the intra range for solid
    /// members, the block's full `orig_size` otherwise. Costs at most one
    /// header read.
    fn ref_len(&mut self, block_ref: &BlockRef) -> Result<u64, SixcyError> {
        if block_ref.intra_length > 0 {
            return Ok(block_ref.intra_length);
        }
        Ok(self.block_info(block_ref.archive_offset)?.orig_size as u64)
    }

    fn block_info(&mut self, archive_offset: u64) -> Result<BlockInfo, SixcyError> {
        if let Some(info) = self.info.get(&archive_offset) {
            return Ok(*info);
        }
        let header = block::read_header_at(&mut self.reader, archive_offset)?;
        let info = BlockInfo {
            orig_size: header.orig_size,
            block_type: header.block_type()?,
            content_hash: header.content_hash,
        };
        self.info.insert(archive_offset, info);
        Ok(info)
    }

    fn copy_ref_range(
        &mut self,
        block_ref: &BlockRef,
        from: u64,
        to: u64,
        dst: &mut [u8],
    ) -> Result<(), SixcyError> {
        let (plaintext, info) = self.block_plaintext(block_ref)?;
        let base = match info.block_type {
            BlockType::Solid => {
                if block_ref.intra_offset + block_ref.intra_length > plaintext.len() as u64 {
                    return Err(SixcyError::OutOfRange("solid intra range"));
                }
                block_ref.intra_offset
            }
            _ => {
                if block_ref.intra_length > 0 {
                    return Err(SixcyError::OutOfRange("intra range on non-solid block"));
                }
                0
            }
        };
        let start = (base + from) as usize;
        let stop = (base + to) as usize;
        if stop > plaintext.len() {
            return Err(SixcyError::OutOfRange("block range"));
        }
        dst.copy_from_slice(&plaintext[start..stop]);
        Ok(())
    }

    /// Decode (or fetch from cache) the whole block behind `block_ref`,
    /// verifying the ref's content hash unless it is legacy-zeroed
    fn block_plaintext(
        &mut self,
        block_ref: &BlockRef,
    ) -> Result<(&Vec<u8>, BlockInfo), SixcyError> {
        let offset = block_ref.archive_offset;
        if !self.cache.contains_key(&offset) {
            let decoded = block::read_block_at(
                &mut self.reader,
                offset,
                &self.registry,
                self.cipher.as_ref(),
                self.max_orig_size,
            )?;
            self.info.insert(
                offset,
                BlockInfo {
                    orig_size: decoded.header.orig_size,
                    block_type: decoded.header.block_type()?,
                    content_hash: decoded.header.content_hash,
                },
            );
            if self.cache.len() >= PLAINTEXT_CACHE_BLOCKS {
                self.cache.clear();
            }
            self.cache.insert(offset, decoded.plaintext);
        }
        let info = self.info[&offset];
        if block_ref.content_hash != [0; 32] && block_ref.content_hash != info.content_hash {
            return Err(SixcyError::ContentHash);
        }
        Ok((&self.cache[&offset], info))
    }
}

/// Keep extraction inside the target directory: no roots, no `..`
fn sanitize_name(name: &str) -> Result<PathBuf, SixcyError> {
    let mut out = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return Err(SixcyError::InvalidFilePath),
        }
    }
    if out.as_os_str().is_empty() {
        return Err(SixcyError::InvalidFilePath);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_sanitizer() {
        assert_eq!(sanitize_name("a/b.txt").unwrap(), PathBuf::from("a/b.txt"));
        assert_eq!(sanitize_name("./a").unwrap(), PathBuf::from("a"));
        assert!(sanitize_name("/etc/passwd").is_err());
        assert!(sanitize_name("../up").is_err());
        assert!(sanitize_name("a/../../up").is_err());
        assert!(sanitize_name("").is_err());
    }
}
