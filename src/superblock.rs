//! The fixed 256-byte archive header

use deku::prelude::*;

use crate::codec::CodecUuid;
use crate::error::SixcyError;

pub const SUPERBLOCK_MAGIC: [u8; 4] = *b".6cy";

/// Only this exact version opens; there is no forward or backward tolerance
pub const FORMAT_VERSION: u32 = 3;

pub const SUPERBLOCK_SIZE: usize = 256;

/// Superblock flag: at least one block in the archive is encrypted
pub const FLAG_ANY_ENCRYPTED: u32 = 1 << 0;

/// Upper bound on `required_codec_count` accepted from disk. Counts above 12
/// are additionally rejected because the codec list plus its trailing crc
/// would no longer fit in the 256-byte superblock.
pub const MAX_REQUIRED_CODECS: u16 = 13;

/// Fixed prefix before the codec uuid list: magic(4) + version(4) + uuid(16)
/// + flags(4) + index_offset(8) + index_size(8) + count(2)
const FIXED_PREFIX: usize = 46;

/// Contains the archive identity, the location of the INDEX block, and the
/// set of codecs a reader must have before reading any block
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct SuperBlock {
    pub magic: [u8; 4],
    pub format_version: u32,
    /// Archive identity; doubles as the key-derivation salt
    pub archive_uuid: [u8; 16],
    pub flags: u32,
    /// Offset of the INDEX block's header
    pub index_offset: u64,
    /// Header plus payload size of the INDEX block
    pub index_size: u64,
    pub required_codec_count: u16,
    /// Exactly the codec uuids appearing in DATA/SOLID blocks, minus None
    #[deku(count = "required_codec_count")]
    pub required_codec_uuids: Vec<[u8; 16]>,
    pub header_crc32: u32,
}

impl SuperBlock {
    pub fn new(archive_uuid: [u8; 16]) -> Self {
        Self {
            magic: SUPERBLOCK_MAGIC,
            format_version: FORMAT_VERSION,
            archive_uuid,
            flags: 0,
            index_offset: 0,
            index_size: 0,
            required_codec_count: 0,
            required_codec_uuids: vec![],
            header_crc32: 0,
        }
    }

    /// flag value
    pub fn any_encrypted(&self) -> bool {
        self.flags & FLAG_ANY_ENCRYPTED != 0
    }

    pub fn required_codecs(&self) -> impl Iterator<Item = CodecUuid> + '_ {
        self.required_codec_uuids.iter().map(|raw| CodecUuid(*raw))
    }

    /// Serialize to exactly 256 bytes, computing the crc over the populated
    /// prefix and zero-padding the remainder
    pub fn to_wire(&mut self) -> Result<[u8; SUPERBLOCK_SIZE], SixcyError> {
        self.required_codec_count = u16::try_from(self.required_codec_uuids.len())
            .map_err(|_| SixcyError::OutOfRange("required_codec_count"))?;
        let crc_offset = FIXED_PREFIX + self.required_codec_uuids.len() * 16;
        if crc_offset + 4 > SUPERBLOCK_SIZE {
            return Err(SixcyError::OutOfRange("required_codec_count"));
        }

        let bytes = self.to_bytes()?;
        let mut wire = [0u8; SUPERBLOCK_SIZE];
        wire[..bytes.len()].copy_from_slice(&bytes);
        self.header_crc32 = crc32fast::hash(&wire[..crc_offset]);
        wire[crc_offset..crc_offset + 4].copy_from_slice(&self.header_crc32.to_le_bytes());
        Ok(wire)
    }

    /// Parse and verify: magic, exact version, codec count bounds, crc, and
    /// the no-duplicate/no-None rules for the codec list.
    ///
    /// The version check touches nothing past byte 8, so a placeholder or
    /// foreign-version superblock is rejected before any other field is
    /// interpreted.
    pub fn from_wire(buf: &[u8; SUPERBLOCK_SIZE]) -> Result<Self, SixcyError> {
        if buf[..4] != SUPERBLOCK_MAGIC {
            return Err(SixcyError::Magic);
        }
        let format_version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if format_version != FORMAT_VERSION {
            return Err(SixcyError::FormatVersion(format_version));
        }

        let count = u16::from_le_bytes(buf[44..46].try_into().unwrap());
        if count > MAX_REQUIRED_CODECS {
            return Err(SixcyError::OutOfRange("required_codec_count"));
        }
        let crc_offset = FIXED_PREFIX + count as usize * 16;
        if crc_offset + 4 > SUPERBLOCK_SIZE {
            return Err(SixcyError::OutOfRange("required_codec_count"));
        }
        let declared = u32::from_le_bytes(buf[crc_offset..crc_offset + 4].try_into().unwrap());
        if crc32fast::hash(&buf[..crc_offset]) != declared {
            return Err(SixcyError::HeaderCrc);
        }

        let (_, superblock) = Self::from_bytes((buf.as_slice(), 0))?;
        for (i, uuid) in superblock.required_codec_uuids.iter().enumerate() {
            if CodecUuid(*uuid).is_none() {
                return Err(SixcyError::OutOfRange("required codec is None"));
            }
            if superblock.required_codec_uuids[..i].contains(uuid) {
                return Err(SixcyError::OutOfRange("duplicate required codec"));
            }
        }
        Ok(superblock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SuperBlock {
        let mut sb = SuperBlock::new([0x33; 16]);
        sb.flags = FLAG_ANY_ENCRYPTED;
        sb.index_offset = 0x1234;
        sb.index_size = 0x200;
        sb.required_codec_uuids = vec![CodecUuid::ZSTD.0, CodecUuid::LZ4.0];
        sb
    }

    #[test]
    fn wire_roundtrip() {
        let mut sb = sample();
        let wire = sb.to_wire().unwrap();
        let back = SuperBlock::from_wire(&wire).unwrap();
        assert_eq!(back, sb);
        assert!(back.any_encrypted());
        assert_eq!(back.required_codec_count, 2);
        // padding stays zero
        assert!(wire[FIXED_PREFIX + 2 * 16 + 4..].iter().all(|b| *b == 0));
    }

    #[test]
    fn rejects_wrong_version_before_anything_else() {
        let mut sb = sample();
        let mut wire = sb.to_wire().unwrap();
        wire[4] = 4;
        // crc is now stale too, but the version must fire first
        assert!(matches!(
            SuperBlock::from_wire(&wire),
            Err(SixcyError::FormatVersion(4))
        ));
    }

    #[test]
    fn rejects_placeholder() {
        let wire = [0u8; SUPERBLOCK_SIZE];
        assert!(matches!(SuperBlock::from_wire(&wire), Err(SixcyError::Magic)));
    }

    #[test]
    fn crc_covers_populated_prefix() {
        let mut sb = sample();
        let wire = sb.to_wire().unwrap();
        let crc_offset = FIXED_PREFIX + 2 * 16;
        for byte in 0..crc_offset {
            // skip bytes whose corruption trips an earlier, more specific check
            if (4..8).contains(&byte) || (44..46).contains(&byte) {
                continue;
            }
            let mut corrupt = wire;
            corrupt[byte] ^= 0x40;
            let err = SuperBlock::from_wire(&corrupt).unwrap_err();
            assert!(
                matches!(err, SixcyError::HeaderCrc | SixcyError::Magic),
                "flip in byte {byte} gave {err:?}"
            );
        }
    }

    #[test]
    fn rejects_codec_count_overflow() {
        let mut sb = sample();
        let mut wire = sb.to_wire().unwrap();
        wire[44..46].copy_from_slice(&14u16.to_le_bytes());
        assert!(matches!(
            SuperBlock::from_wire(&wire),
            Err(SixcyError::OutOfRange("required_codec_count"))
        ));
    }

    #[test]
    fn rejects_duplicate_codec() {
        let mut sb = sample();
        sb.required_codec_uuids = vec![CodecUuid::ZSTD.0, CodecUuid::ZSTD.0];
        let wire = sb.to_wire().unwrap();
        assert!(matches!(
            SuperBlock::from_wire(&wire),
            Err(SixcyError::OutOfRange("duplicate required codec"))
        ));
    }

    #[test]
    fn codec_list_never_fits_thirteen() {
        let mut sb = sample();
        sb.required_codec_uuids = (0..13u8).map(|i| [i + 1; 16]).collect();
        assert!(sb.to_wire().is_err());
    }
}
