//! Block header layout and the encode/decode pipeline

use std::io::{Read, Seek, SeekFrom};

use deku::prelude::*;
use tracing::trace;

use crate::codec::{CodecEntry, CodecRegistry, CodecUuid};
use crate::crypto::{BlockCipher, NONCE_LEN, TAG_LEN};
use crate::error::SixcyError;

/// "BLCK" interpreted as a u32, asserted after little-endian decode
pub const BLOCK_MAGIC: u32 = 0x424C_434B;

/// Size of the version 1 header; readers honor `header_size`, writers always
/// emit exactly this
pub const BLOCK_HEADER_SIZE: usize = 84;

/// Byte range of the header covered by `header_crc32`
const HEADER_CRC_RANGE: usize = 80;

pub const BLOCK_HEADER_VERSION: u16 = 1;

/// `file_id` of blocks that belong to no single file (INDEX, SOLID)
pub const NO_FILE_ID: u32 = 0xFFFF_FFFF;

/// Block flag: payload is `nonce || ciphertext || tag`
pub const BLOCK_FLAG_ENCRYPTED: u16 = 1 << 0;

/// What a block stores
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum BlockType {
    /// One contiguous range of one file
    Data = 0,
    /// The serialized file catalog
    Index = 1,
    /// Multiple files' plaintext concatenated
    Solid = 2,
}

impl TryFrom<u16> for BlockType {
    type Error = SixcyError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Index),
            2 => Ok(Self::Solid),
            _ => Err(SixcyError::OutOfRange("block_type")),
        }
    }
}

/// The 84-byte header in front of every block payload
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct BlockHeader {
    pub magic: u32,
    pub header_version: u16,
    pub header_size: u16,
    pub block_type: u16,
    pub flags: u16,
    pub codec_uuid: [u8; 16],
    pub file_id: u32,
    pub file_offset: u64,
    pub orig_size: u32,
    pub comp_size: u32,
    pub content_hash: [u8; 32],
    pub header_crc32: u32,
}

impl BlockHeader {
    fn new(
        block_type: BlockType,
        codec_uuid: CodecUuid,
        file_id: u32,
        file_offset: u64,
    ) -> Self {
        Self {
            magic: BLOCK_MAGIC,
            header_version: BLOCK_HEADER_VERSION,
            header_size: BLOCK_HEADER_SIZE as u16,
            block_type: block_type as u16,
            flags: 0,
            codec_uuid: codec_uuid.0,
            file_id,
            file_offset,
            orig_size: 0,
            comp_size: 0,
            content_hash: [0; 32],
            header_crc32: 0,
        }
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.flags & BLOCK_FLAG_ENCRYPTED != 0
    }

    pub fn block_type(&self) -> Result<BlockType, SixcyError> {
        BlockType::try_from(self.block_type)
    }

    pub fn codec_uuid(&self) -> CodecUuid {
        CodecUuid(self.codec_uuid)
    }

    /// Total on-disk size of the block, header included
    pub fn total_size(&self) -> u64 {
        self.header_size as u64 + self.comp_size as u64
    }

    /// Serialize, computing `header_crc32` over the first 80 bytes
    pub fn to_wire(&mut self) -> Result<[u8; BLOCK_HEADER_SIZE], SixcyError> {
        let bytes = self.to_bytes()?;
        let mut wire = [0u8; BLOCK_HEADER_SIZE];
        wire.copy_from_slice(&bytes);
        self.header_crc32 = crc32fast::hash(&wire[..HEADER_CRC_RANGE]);
        wire[HEADER_CRC_RANGE..].copy_from_slice(&self.header_crc32.to_le_bytes());
        Ok(wire)
    }

    /// Parse and verify a header: crc first, then magic, then field ranges
    pub fn from_wire(buf: &[u8; BLOCK_HEADER_SIZE]) -> Result<Self, SixcyError> {
        let declared = u32::from_le_bytes(buf[HEADER_CRC_RANGE..].try_into().unwrap());
        if crc32fast::hash(&buf[..HEADER_CRC_RANGE]) != declared {
            return Err(SixcyError::HeaderCrc);
        }
        let (_, header) = Self::from_bytes((buf.as_slice(), 0))?;
        if header.magic != BLOCK_MAGIC {
            return Err(SixcyError::Magic);
        }
        if header.header_version != BLOCK_HEADER_VERSION {
            return Err(SixcyError::FormatVersion(header.header_version as u32));
        }
        if (header.header_size as usize) < BLOCK_HEADER_SIZE {
            return Err(SixcyError::OutOfRange("header_size"));
        }
        header.block_type()?;
        Ok(header)
    }
}

/// A block ready to hit the disk: 84 header bytes plus `comp_size` of payload
pub(crate) struct PreparedBlock {
    pub header: BlockHeader,
    pub wire_header: [u8; BLOCK_HEADER_SIZE],
    pub payload: Vec<u8>,
}

impl PreparedBlock {
    pub fn total_size(&self) -> u64 {
        self.header.total_size()
    }
}

/// Encode pipeline: compress, optionally seal, fill the header.
///
/// The caller has already hashed the plaintext (and taken the dedup decision
/// on that hash), so `content_hash` arrives precomputed.
pub(crate) fn encode_block(
    plaintext: &[u8],
    content_hash: [u8; 32],
    block_type: BlockType,
    codec: &CodecEntry,
    level: i32,
    file_id: u32,
    file_offset: u64,
    cipher: Option<&BlockCipher>,
) -> Result<PreparedBlock, SixcyError> {
    let orig_size =
        u32::try_from(plaintext.len()).map_err(|_| SixcyError::OutOfRange("orig_size"))?;

    let compressed = codec.compress(plaintext, level)?;
    let (payload, flags) = match cipher {
        Some(cipher) => (cipher.seal(&compressed)?, BLOCK_FLAG_ENCRYPTED),
        None => (compressed, 0),
    };
    let comp_size =
        u32::try_from(payload.len()).map_err(|_| SixcyError::OutOfRange("comp_size"))?;

    let mut header = BlockHeader::new(block_type, codec.uuid(), file_id, file_offset);
    header.flags = flags;
    header.orig_size = orig_size;
    header.comp_size = comp_size;
    header.content_hash = content_hash;
    let wire_header = header.to_wire()?;
    trace!(
        "encoded {block_type:?} block: {orig_size} -> {comp_size} bytes ({})",
        codec.name()
    );

    Ok(PreparedBlock { header, wire_header, payload })
}

/// A fully decoded block: verified header and verified plaintext
pub(crate) struct DecodedBlock {
    pub header: BlockHeader,
    pub plaintext: Vec<u8>,
}

/// Read and verify the header at `offset` without touching the payload
pub(crate) fn read_header_at<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
) -> Result<BlockHeader, SixcyError> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; BLOCK_HEADER_SIZE];
    read_exact_or_truncated(reader, &mut buf)?;
    BlockHeader::from_wire(&buf)
}

/// Decode pipeline: header crc and magic, codec availability, payload read,
/// optional open, decompress, length and hash verification. Any mismatch is
/// fatal for the block.
pub(crate) fn read_block_at<R: Read + Seek>(
    reader: &mut R,
    offset: u64,
    registry: &CodecRegistry,
    cipher: Option<&BlockCipher>,
    max_orig_size: u64,
) -> Result<DecodedBlock, SixcyError> {
    let header = read_header_at(reader, offset)?;

    // enforced globally at open time; rechecked here to guard recovery scans
    let codec = registry.lookup(header.codec_uuid())?;

    if header.orig_size as u64 > max_orig_size {
        return Err(SixcyError::OutOfRange("orig_size"));
    }

    // skip extension bytes of headers newer than we write
    let extension = header.header_size as u64 - BLOCK_HEADER_SIZE as u64;
    if extension > 0 {
        reader.seek(SeekFrom::Current(extension as i64))?;
    }

    let mut payload = vec![0u8; header.comp_size as usize];
    read_exact_or_truncated(reader, &mut payload)?;

    let compressed = if header.is_encrypted() {
        let cipher = cipher.ok_or(SixcyError::PasswordRequired)?;
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(SixcyError::OutOfRange("encrypted payload too short"));
        }
        cipher.open(&payload)?
    } else {
        payload
    };

    let plaintext = codec.decompress(&compressed, header.orig_size as usize)?;
    if plaintext.len() != header.orig_size as usize {
        return Err(SixcyError::ContentHash);
    }
    if blake3::hash(&plaintext).as_bytes() != &header.content_hash {
        return Err(SixcyError::ContentHash);
    }

    Ok(DecodedBlock { header, plaintext })
}

/// `read_exact` that reports how much was actually there
pub(crate) fn read_exact_or_truncated<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), SixcyError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(SixcyError::Truncated {
                    declared: buf.len() as u64,
                    available: filled as u64,
                })
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn sample_header() -> BlockHeader {
        let mut header = BlockHeader::new(BlockType::Data, CodecUuid::ZSTD, 7, 0x1000);
        header.orig_size = 100;
        header.comp_size = 60;
        header.content_hash = *blake3::hash(b"sample").as_bytes();
        header
    }

    #[test]
    fn header_wire_roundtrip() {
        let mut header = sample_header();
        let wire = header.to_wire().unwrap();
        assert_eq!(wire.len(), BLOCK_HEADER_SIZE);
        let back = BlockHeader::from_wire(&wire).unwrap();
        assert_eq!(back, header);
        assert_eq!(back.block_type().unwrap(), BlockType::Data);
    }

    #[test]
    fn any_header_bit_flip_fails_crc() {
        let mut header = sample_header();
        let wire = header.to_wire().unwrap();
        for byte in 0..HEADER_CRC_RANGE {
            let mut corrupt = wire;
            corrupt[byte] ^= 0x10;
            assert!(
                matches!(BlockHeader::from_wire(&corrupt), Err(SixcyError::HeaderCrc)),
                "flip in byte {byte} went undetected"
            );
        }
    }

    #[test]
    fn bad_magic_detected_after_crc() {
        let mut header = sample_header();
        header.magic = 0xdead_beef;
        let wire = header.to_wire().unwrap();
        assert!(matches!(BlockHeader::from_wire(&wire), Err(SixcyError::Magic)));
    }

    #[test]
    fn unknown_block_type_out_of_range() {
        let mut header = sample_header();
        header.block_type = 3;
        let wire = header.to_wire().unwrap();
        assert!(matches!(
            BlockHeader::from_wire(&wire),
            Err(SixcyError::OutOfRange("block_type"))
        ));
    }

    #[test]
    fn short_header_size_out_of_range() {
        let mut header = sample_header();
        header.header_size = 80;
        let wire = header.to_wire().unwrap();
        assert!(matches!(
            BlockHeader::from_wire(&wire),
            Err(SixcyError::OutOfRange("header_size"))
        ));
    }

    fn write_block(block: &PreparedBlock) -> Vec<u8> {
        let mut bytes = block.wire_header.to_vec();
        bytes.extend_from_slice(&block.payload);
        bytes
    }

    #[test]
    fn encode_decode_roundtrip() {
        let registry = CodecRegistry::with_builtins();
        let codec = registry.lookup(CodecUuid::ZSTD).unwrap();
        let plaintext = b"roundtrip me please ".repeat(64);
        let hash = *blake3::hash(&plaintext).as_bytes();

        let block =
            encode_block(&plaintext, hash, BlockType::Data, codec, 3, 1, 0, None).unwrap();
        assert_eq!(block.header.orig_size as usize, plaintext.len());
        assert!(!block.header.is_encrypted());

        let mut cursor = Cursor::new(write_block(&block));
        let decoded = read_block_at(&mut cursor, 0, &registry, None, u32::MAX as u64).unwrap();
        assert_eq!(decoded.plaintext, plaintext);
        assert_eq!(decoded.header, block.header);
    }

    #[test]
    fn payload_bit_flip_fails_content_hash() {
        let registry = CodecRegistry::with_builtins();
        let codec = registry.lookup(CodecUuid::NONE).unwrap();
        let plaintext = vec![0x55u8; 256];
        let hash = *blake3::hash(&plaintext).as_bytes();
        let block =
            encode_block(&plaintext, hash, BlockType::Data, codec, 0, 1, 0, None).unwrap();

        let mut bytes = write_block(&block);
        bytes[BLOCK_HEADER_SIZE + 17] ^= 0x01;
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_block_at(&mut cursor, 0, &registry, None, u32::MAX as u64),
            Err(SixcyError::ContentHash)
        ));
    }

    #[test]
    fn encrypted_roundtrip_and_tamper() {
        let registry = CodecRegistry::with_builtins();
        let codec = registry.lookup(CodecUuid::ZSTD).unwrap();
        let cipher = BlockCipher::new(&[0x07; 32]);
        let plaintext = b"secret chunk".repeat(32);
        let hash = *blake3::hash(&plaintext).as_bytes();

        let block =
            encode_block(&plaintext, hash, BlockType::Data, codec, 3, 1, 0, Some(&cipher))
                .unwrap();
        assert!(block.header.is_encrypted());

        let bytes = write_block(&block);
        let mut cursor = Cursor::new(bytes.clone());
        let decoded =
            read_block_at(&mut cursor, 0, &registry, Some(&cipher), u32::MAX as u64).unwrap();
        assert_eq!(decoded.plaintext, plaintext);

        // any payload flip must fail authentication before plaintext is seen
        let mut corrupt = bytes.clone();
        corrupt[BLOCK_HEADER_SIZE + NONCE_LEN + 3] ^= 0x80;
        let mut cursor = Cursor::new(corrupt);
        assert!(matches!(
            read_block_at(&mut cursor, 0, &registry, Some(&cipher), u32::MAX as u64),
            Err(SixcyError::AuthFailed)
        ));

        // no password, encrypted block
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_block_at(&mut cursor, 0, &registry, None, u32::MAX as u64),
            Err(SixcyError::PasswordRequired)
        ));
    }

    #[test]
    fn truncated_payload_reported() {
        let registry = CodecRegistry::with_builtins();
        let codec = registry.lookup(CodecUuid::NONE).unwrap();
        let plaintext = vec![0xaa; 512];
        let hash = *blake3::hash(&plaintext).as_bytes();
        let block =
            encode_block(&plaintext, hash, BlockType::Data, codec, 0, 1, 0, None).unwrap();

        let mut bytes = write_block(&block);
        bytes.truncate(BLOCK_HEADER_SIZE + 100);
        let mut cursor = Cursor::new(bytes);
        assert!(matches!(
            read_block_at(&mut cursor, 0, &registry, None, u32::MAX as u64),
            Err(SixcyError::Truncated { declared: 512, available: 100 })
        ));
    }
}
