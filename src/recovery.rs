//! Index-bypass forward scan and archive recovery
//!
//! Both modes walk headers from offset 256 and never touch the INDEX block:
//! [`scan_blocks`] rebuilds a catalog from headers alone, and
//! [`extract_recoverable`] additionally decodes every block, classifies its
//! health, and re-emits the healthy file data into a fresh archive.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom, Write};

use tracing::{info, instrument, trace, warn};

use crate::block::{self, BlockType, BLOCK_HEADER_SIZE, BLOCK_MAGIC};
use crate::codec::{CodecRegistry, CodecUuid};
use crate::crypto::BlockCipher;
use crate::error::SixcyError;
use crate::index::{BlockRef, FileRecord};
use crate::reader::BufReadSeek;
use crate::superblock::{SuperBlock, SUPERBLOCK_SIZE};
use crate::writer::ArchiveWriter;

/// A SOLID block seen during a scan. Its members cannot be recovered without
/// the original index, so it is reported rather than split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolidBlockInfo {
    pub archive_offset: u64,
    pub orig_size: u32,
    pub comp_size: u32,
    pub content_hash: [u8; 32],
}

/// Catalog reconstructed from headers alone
#[derive(Debug, Default)]
pub struct ScannedArchive {
    /// Synthesized records (`file_{id:08x}`), block lists sorted by
    /// `file_offset`
    pub records: Vec<FileRecord>,
    pub solid_blocks: Vec<SolidBlockInfo>,
    pub blocks_scanned: usize,
    pub index_found: bool,
}

/// Verdict on a single block during full recovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHealth {
    Healthy,
    /// Header crc or magic failure; the scan resynchronizes on the next
    /// plausible header
    HeaderCorrupt,
    TruncatedPayload { declared: u64, available: u64 },
    UnknownCodec { uuid: CodecUuid },
    /// The header is sound but decode failed: hash or tag mismatch, or a
    /// codec-internal error
    PayloadCorrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryQuality {
    /// >= 95% of scanned blocks healthy
    Full,
    /// 50%..95% healthy
    Partial,
    /// Blocks were scanned but no healthy DATA block was recovered
    HeaderOnly,
    /// Less than half healthy, or nothing scanned at all
    Catastrophic,
}

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub blocks_scanned: usize,
    pub blocks_healthy: usize,
    pub header_corrupt: usize,
    pub truncated_payload: usize,
    pub unknown_codec: usize,
    pub payload_corrupt: usize,
    pub files_recovered: usize,
    /// Per-block verdicts in scan order, keyed by header offset
    pub blocks: Vec<(u64, BlockHealth)>,
    pub quality: RecoveryQuality,
}

/// Options for [`extract_recoverable`]
#[derive(Clone, Default)]
pub struct RecoveryOptions {
    /// Needed to decode encrypted blocks; ignored when the superblock (and
    /// with it the key-derivation salt) is unreadable
    pub password: Option<String>,
}

/// Reconstruct a catalog from block headers alone, bypassing the INDEX.
///
/// Starting at offset 256, headers are verified (crc, then magic) and
/// classified; DATA blocks are grouped by `file_id` and sorted by
/// `file_offset`, SOLID blocks are reported unsplit, and the scan stops at an
/// INDEX block. A corrupt header triggers a forward search for the next
/// plausible one.
#[instrument(skip_all)]
pub fn scan_blocks<R: BufReadSeek>(reader: &mut R) -> Result<ScannedArchive, SixcyError> {
    let file_len = reader.seek(SeekFrom::End(0))?;
    let mut data: BTreeMap<u32, Vec<DataBlock>> = BTreeMap::new();
    let mut scanned = ScannedArchive::default();

    let mut pos = SUPERBLOCK_SIZE as u64;
    while pos + (BLOCK_HEADER_SIZE as u64) <= file_len {
        match block::read_header_at(reader, pos) {
            Ok(header) => {
                match header.block_type()? {
                    BlockType::Index => {
                        trace!("index block at {pos:#x}, stopping scan");
                        scanned.index_found = true;
                        break;
                    }
                    BlockType::Data => {
                        scanned.blocks_scanned += 1;
                        data.entry(header.file_id).or_default().push(DataBlock {
                            file_offset: header.file_offset,
                            archive_offset: pos,
                            orig_size: header.orig_size,
                            comp_size: header.comp_size,
                            content_hash: header.content_hash,
                        });
                    }
                    BlockType::Solid => {
                        scanned.blocks_scanned += 1;
                        scanned.solid_blocks.push(SolidBlockInfo {
                            archive_offset: pos,
                            orig_size: header.orig_size,
                            comp_size: header.comp_size,
                            content_hash: header.content_hash,
                        });
                    }
                }
                pos += header.total_size();
            }
            Err(SixcyError::Truncated { .. }) => break,
            Err(_) => match resync(reader, pos + 1, file_len)? {
                Some(next) => pos = next,
                None => break,
            },
        }
    }

    for (file_id, mut blocks) in data {
        blocks.sort_by_key(|b| b.file_offset);
        scanned.records.push(synthesize_record(file_id, &blocks));
    }
    info!(
        "scanned {} blocks into {} files ({} solid blocks unsplit)",
        scanned.blocks_scanned,
        scanned.records.len(),
        scanned.solid_blocks.len()
    );
    Ok(scanned)
}

/// Forward-scan `reader` like [`scan_blocks`], but decode every block and
/// classify its health; healthy DATA blocks are re-emitted into a fresh
/// archive written to `out`.
#[instrument(skip_all)]
pub fn extract_recoverable<R: BufReadSeek, W: Write + Seek>(
    reader: &mut R,
    out: W,
    options: RecoveryOptions,
) -> Result<RecoveryReport, SixcyError> {
    let registry = CodecRegistry::shared();
    let file_len = reader.seek(SeekFrom::End(0))?;

    // the superblock is only needed for the key-derivation salt; recovery
    // itself runs fine without one
    let cipher = match &options.password {
        Some(password) => match read_superblock_lenient(reader)? {
            Some(superblock) => {
                Some(BlockCipher::from_password(password, &superblock.archive_uuid)?)
            }
            None => {
                warn!("superblock unreadable, cannot derive key; encrypted blocks will not decode");
                None
            }
        },
        None => None,
    };

    let mut report = RecoveryReport {
        blocks_scanned: 0,
        blocks_healthy: 0,
        header_corrupt: 0,
        truncated_payload: 0,
        unknown_codec: 0,
        payload_corrupt: 0,
        files_recovered: 0,
        blocks: vec![],
        quality: RecoveryQuality::Catastrophic,
    };
    let mut recovered: BTreeMap<u32, BTreeMap<u64, Vec<u8>>> = BTreeMap::new();
    let mut recovered_data_blocks = 0usize;

    let mut pos = SUPERBLOCK_SIZE as u64;
    while pos + (BLOCK_HEADER_SIZE as u64) <= file_len {
        let header = match block::read_header_at(reader, pos) {
            Ok(header) => header,
            Err(SixcyError::Truncated { .. }) => break,
            Err(_) => {
                report.blocks.push((pos, BlockHealth::HeaderCorrupt));
                report.header_corrupt += 1;
                report.blocks_scanned += 1;
                match resync(reader, pos + 1, file_len)? {
                    Some(next) => {
                        pos = next;
                        continue;
                    }
                    None => break,
                }
            }
        };

        if header.block_type()? == BlockType::Index {
            trace!("index block at {pos:#x}, stopping scan");
            break;
        }

        report.blocks_scanned += 1;
        let declared = header.total_size();
        let available = file_len - pos;
        if declared > available {
            report.blocks.push((pos, BlockHealth::TruncatedPayload { declared, available }));
            report.truncated_payload += 1;
            break;
        }

        let health =
            match block::read_block_at(reader, pos, &registry, cipher.as_ref(), u32::MAX as u64) {
                Ok(decoded) => {
                    report.blocks_healthy += 1;
                    if decoded.header.block_type()? == BlockType::Data {
                        recovered_data_blocks += 1;
                        recovered
                            .entry(decoded.header.file_id)
                            .or_default()
                            .insert(decoded.header.file_offset, decoded.plaintext);
                    }
                    BlockHealth::Healthy
                }
                Err(SixcyError::UnknownCodec(uuid)) => {
                    report.unknown_codec += 1;
                    BlockHealth::UnknownCodec { uuid }
                }
                Err(SixcyError::Truncated { declared, available }) => {
                    report.truncated_payload += 1;
                    BlockHealth::TruncatedPayload { declared, available }
                }
                Err(_) => {
                    report.payload_corrupt += 1;
                    BlockHealth::PayloadCorrupt
                }
            };
        report.blocks.push((pos, health));
        pos += declared;
    }

    // re-emit what survived
    let mut writer = ArchiveWriter::new(out)?;
    for (file_id, chunks) in recovered {
        let mut bytes = vec![];
        for chunk in chunks.into_values() {
            bytes.extend_from_slice(&chunk);
        }
        writer.add_file(format!("file_{file_id:08x}"), std::io::Cursor::new(bytes))?;
        report.files_recovered += 1;
    }
    writer.finalize()?;

    let quality = rate(&report, recovered_data_blocks);
    report.quality = quality;
    info!(
        "recovered {} files from {} healthy of {} scanned blocks ({:?})",
        report.files_recovered, report.blocks_healthy, report.blocks_scanned, report.quality
    );
    Ok(report)
}

fn rate(report: &RecoveryReport, recovered_data_blocks: usize) -> RecoveryQuality {
    if report.blocks_scanned == 0 {
        return RecoveryQuality::Catastrophic;
    }
    if recovered_data_blocks == 0 {
        return RecoveryQuality::HeaderOnly;
    }
    let share = report.blocks_healthy as f64 / report.blocks_scanned as f64;
    if share >= 0.95 {
        RecoveryQuality::Full
    } else if share >= 0.5 {
        RecoveryQuality::Partial
    } else {
        RecoveryQuality::Catastrophic
    }
}

struct DataBlock {
    file_offset: u64,
    archive_offset: u64,
    orig_size: u32,
    comp_size: u32,
    content_hash: [u8; 32],
}

fn synthesize_record(file_id: u32, blocks: &[DataBlock]) -> FileRecord {
    FileRecord {
        id: file_id,
        parent_id: 0,
        name: format!("file_{file_id:08x}"),
        block_refs: blocks
            .iter()
            .map(|b| BlockRef {
                content_hash: b.content_hash,
                archive_offset: b.archive_offset,
                intra_offset: 0,
                intra_length: 0,
            })
            .collect(),
        original_size: blocks.iter().map(|b| b.orig_size as u64).sum(),
        compressed_size: blocks.iter().map(|b| b.comp_size as u64).sum(),
        metadata: BTreeMap::new(),
        degraded_integrity: false,
    }
}

/// Best-effort superblock read for recovery: any failure is `None`, never fatal
fn read_superblock_lenient<R: BufReadSeek>(
    reader: &mut R,
) -> Result<Option<SuperBlock>, SixcyError> {
    reader.rewind()?;
    let mut buf = [0u8; SUPERBLOCK_SIZE];
    if read_up_to(reader, &mut buf)? < SUPERBLOCK_SIZE {
        return Ok(None);
    }
    Ok(SuperBlock::from_wire(&buf).ok())
}

/// Search forward for the next offset that parses as a valid block header
fn resync<R: BufReadSeek>(
    reader: &mut R,
    mut from: u64,
    file_len: u64,
) -> Result<Option<u64>, SixcyError> {
    const WINDOW: usize = 64 * 1024;
    let magic = BLOCK_MAGIC.to_le_bytes();

    while from + (BLOCK_HEADER_SIZE as u64) <= file_len {
        reader.seek(SeekFrom::Start(from))?;
        let mut window = vec![0u8; WINDOW];
        let n = read_up_to(reader, &mut window)?;
        if n < magic.len() {
            return Ok(None);
        }
        for i in 0..=(n - magic.len()) {
            if window[i..i + magic.len()] == magic {
                let candidate = from + i as u64;
                if candidate + (BLOCK_HEADER_SIZE as u64) > file_len {
                    return Ok(None);
                }
                if block::read_header_at(reader, candidate).is_ok() {
                    trace!("resynchronized at {candidate:#x}");
                    return Ok(Some(candidate));
                }
            }
        }
        // overlap the window tail so a magic straddling the boundary is seen
        from += (n - (magic.len() - 1)) as u64;
        if n < WINDOW {
            return Ok(None);
        }
    }
    Ok(None)
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, SixcyError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::block::encode_block;

    #[test]
    fn resync_skips_garbage() {
        let registry = CodecRegistry::shared();
        let codec = registry.lookup(CodecUuid::NONE).unwrap();
        let plaintext = vec![0x77u8; 100];
        let hash = *blake3::hash(&plaintext).as_bytes();
        let prepared =
            encode_block(&plaintext, hash, BlockType::Data, codec, 0, 0, 0, None).unwrap();

        let mut bytes = vec![0xeeu8; 300];
        bytes.extend_from_slice(&prepared.wire_header);
        bytes.extend_from_slice(&prepared.payload);
        let len = bytes.len() as u64;

        let mut cursor = Cursor::new(bytes);
        let found = resync(&mut cursor, 0, len).unwrap();
        assert_eq!(found, Some(300));
    }

    #[test]
    fn resync_gives_up_on_noise() {
        let bytes = vec![0x4bu8; 500];
        let len = bytes.len() as u64;
        let mut cursor = Cursor::new(bytes);
        assert_eq!(resync(&mut cursor, 0, len).unwrap(), None);
    }
}
