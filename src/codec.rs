//! Codec identities and the uuid-keyed codec registry

use std::fmt;
#[cfg(feature = "lzma")]
use std::io::Read;
use std::sync::{Arc, OnceLock};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::error::SixcyError;
use crate::plugin::{CodecDescriptor, PluginCodec, PluginEntryFn, PLUGIN_ABI_VERSION};

/// A codec identity: 16 bytes in RFC 4122 little-endian field order, exactly
/// as written into block headers and the superblock. Compared byte-for-byte,
/// never byte-swapped at runtime.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodecUuid(pub [u8; 16]);

impl CodecUuid {
    /// The "no compression" codec. Never listed in a superblock.
    pub const NONE: Self = Self([0; 16]);

    /// Zstandard: `b28a9d4f-5e3c-4a1b-8f2e-7c6d9b0e1a2f`
    pub const ZSTD: Self = Self([
        0x4f, 0x9d, 0x8a, 0xb2, 0x3c, 0x5e, 0x1b, 0x4a, //
        0x8f, 0x2e, 0x7c, 0x6d, 0x9b, 0x0e, 0x1a, 0x2f,
    ]);

    /// LZ4: `3f7b2c8e-1a4d-4e9f-b6c3-5d8a2f7e0b1c`
    pub const LZ4: Self = Self([
        0x8e, 0x2c, 0x7b, 0x3f, 0x4d, 0x1a, 0x9f, 0x4e, //
        0xb6, 0xc3, 0x5d, 0x8a, 0x2f, 0x7e, 0x0b, 0x1c,
    ]);

    /// Brotli: `9c1e5f3a-7b2d-4c8e-a5f1-2e6b9d0c3a7f`
    pub const BROTLI: Self = Self([
        0x3a, 0x5f, 0x1e, 0x9c, 0x2d, 0x7b, 0x8e, 0x4c, //
        0xa5, 0xf1, 0x2e, 0x6b, 0x9d, 0x0c, 0x3a, 0x7f,
    ]);

    /// LZMA: `4a8f2e1c-9b3d-4f7a-c2e8-6d5b1a0f3c9e`
    pub const LZMA: Self = Self([
        0x1c, 0x2e, 0x8f, 0x4a, 0x3d, 0x9b, 0x7a, 0x4f, //
        0xc2, 0xe8, 0x6d, 0x5b, 0x1a, 0x0f, 0x3c, 0x9e,
    ]);

    /// `true` for the all-zero "no compression" identity
    #[inline]
    pub fn is_none(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Display for CodecUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_bytes_le(self.0).hyphenated())
    }
}

impl fmt::Debug for CodecUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodecUuid({self})")
    }
}

fn codec_err(codec: &'static str, e: impl fmt::Display) -> SixcyError {
    SixcyError::CodecFailure { codec, msg: e.to_string() }
}

/// Built-in compression algorithms
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum BuiltinCodec {
    None,
    #[default]
    Zstd,
    Lz4,
    Brotli,
    Lzma,
}

impl BuiltinCodec {
    pub fn uuid(&self) -> CodecUuid {
        match self {
            Self::None => CodecUuid::NONE,
            Self::Zstd => CodecUuid::ZSTD,
            Self::Lz4 => CodecUuid::LZ4,
            Self::Brotli => CodecUuid::BROTLI,
            Self::Lzma => CodecUuid::LZMA,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
            Self::Brotli => "brotli",
            Self::Lzma => "lzma",
        }
    }

    fn compress(&self, bytes: &[u8], level: i32) -> Result<Vec<u8>, SixcyError> {
        match self {
            Self::None => Ok(bytes.to_vec()),
            Self::Zstd => {
                let level = level.clamp(1, 19);
                let mut encoder =
                    zstd::bulk::Compressor::new(level).map_err(|e| codec_err("zstd", e))?;
                let mut buf = Vec::with_capacity(zstd_safe::compress_bound(bytes.len()));
                encoder
                    .compress_to_buffer(bytes, &mut buf)
                    .map_err(|e| codec_err("zstd", e))?;
                Ok(buf)
            }
            #[cfg(feature = "lz4")]
            Self::Lz4 => Ok(lz4_flex::compress(bytes)),
            #[cfg(feature = "brotli")]
            Self::Brotli => {
                let params = brotli::enc::BrotliEncoderParams {
                    quality: level.clamp(0, 11),
                    ..Default::default()
                };
                let mut input = bytes;
                let mut buf = Vec::new();
                brotli::BrotliCompress(&mut input, &mut buf, &params)
                    .map_err(|e| codec_err("brotli", e))?;
                Ok(buf)
            }
            #[cfg(feature = "lzma")]
            Self::Lzma => {
                let preset = if (0..=9).contains(&level) { level as u32 } else { 6 };
                let mut encoder = liblzma::read::XzEncoder::new(bytes, preset);
                let mut buf = Vec::new();
                encoder.read_to_end(&mut buf).map_err(|e| codec_err("lzma", e))?;
                Ok(buf)
            }
            #[allow(unreachable_patterns)]
            _ => Err(SixcyError::UnknownCodec(self.uuid())),
        }
    }

    fn decompress(&self, bytes: &[u8], out_capacity: usize) -> Result<Vec<u8>, SixcyError> {
        match self {
            Self::None => Ok(bytes.to_vec()),
            Self::Zstd => {
                let mut decoder =
                    zstd::bulk::Decompressor::new().map_err(|e| codec_err("zstd", e))?;
                let mut buf = Vec::with_capacity(out_capacity);
                decoder
                    .decompress_to_buffer(bytes, &mut buf)
                    .map_err(|e| codec_err("zstd", e))?;
                Ok(buf)
            }
            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::decompress(bytes, out_capacity).map_err(|e| codec_err("lz4", e)),
            #[cfg(feature = "brotli")]
            Self::Brotli => {
                let mut input = bytes;
                let mut buf = Vec::with_capacity(out_capacity);
                brotli::BrotliDecompress(&mut input, &mut buf)
                    .map_err(|e| codec_err("brotli", e))?;
                Ok(buf)
            }
            #[cfg(feature = "lzma")]
            Self::Lzma => {
                let mut decoder = liblzma::read::XzDecoder::new(bytes);
                let mut buf = Vec::with_capacity(out_capacity);
                decoder.read_to_end(&mut buf).map_err(|e| codec_err("lzma", e))?;
                Ok(buf)
            }
            #[allow(unreachable_patterns)]
            _ => Err(SixcyError::UnknownCodec(self.uuid())),
        }
    }

    fn compress_bound(&self, len: usize) -> usize {
        match self {
            Self::None => len,
            Self::Zstd => zstd_safe::compress_bound(len),
            #[cfg(feature = "lz4")]
            Self::Lz4 => lz4_flex::block::get_maximum_output_size(len),
            // xz and brotli publish no simple bound; len + len/2 + 512 covers
            // the container overhead of both for any input
            _ => len + len / 2 + 512,
        }
    }
}

/// A registered codec: the identity plus the compress/decompress/bound triple,
/// either built-in or contributed by a plugin.
pub struct CodecEntry {
    uuid: CodecUuid,
    alias: Option<u32>,
    kind: CodecKind,
}

enum CodecKind {
    BuiltIn(BuiltinCodec),
    Plugin(PluginCodec),
}

impl CodecEntry {
    pub fn uuid(&self) -> CodecUuid {
        self.uuid
    }

    /// Process-local short alias, never written to disk
    pub fn alias(&self) -> Option<u32> {
        self.alias
    }

    pub fn name(&self) -> &'static str {
        match &self.kind {
            CodecKind::BuiltIn(b) => b.name(),
            CodecKind::Plugin(_) => "plugin",
        }
    }

    pub fn compress(&self, bytes: &[u8], level: i32) -> Result<Vec<u8>, SixcyError> {
        match &self.kind {
            CodecKind::BuiltIn(b) => b.compress(bytes, level),
            CodecKind::Plugin(p) => p.compress(bytes, level),
        }
    }

    pub fn decompress(&self, bytes: &[u8], out_capacity: usize) -> Result<Vec<u8>, SixcyError> {
        match &self.kind {
            CodecKind::BuiltIn(b) => b.decompress(bytes, out_capacity),
            CodecKind::Plugin(p) => p.decompress(bytes, out_capacity),
        }
    }

    pub fn compress_bound(&self, len: usize) -> usize {
        match &self.kind {
            CodecKind::BuiltIn(b) => b.compress_bound(len),
            CodecKind::Plugin(p) => p.compress_bound(len),
        }
    }
}

/// Map from codec uuid to its function triple, seeded with the built-in codecs.
///
/// The registry is populated before the first archive is touched and treated
/// as read-only afterwards. Readers and writers hold it behind an [`Arc`];
/// [`CodecRegistry::shared`] returns the process-wide built-ins-only instance.
pub struct CodecRegistry {
    entries: FxHashMap<CodecUuid, CodecEntry>,
}

impl CodecRegistry {
    /// Registry seeded with every built-in codec enabled at compile time
    pub fn with_builtins() -> Self {
        let mut entries = FxHashMap::default();
        let builtins = [
            BuiltinCodec::None,
            BuiltinCodec::Zstd,
            #[cfg(feature = "lz4")]
            BuiltinCodec::Lz4,
            #[cfg(feature = "brotli")]
            BuiltinCodec::Brotli,
            #[cfg(feature = "lzma")]
            BuiltinCodec::Lzma,
        ];
        for b in builtins {
            entries.insert(
                b.uuid(),
                CodecEntry { uuid: b.uuid(), alias: None, kind: CodecKind::BuiltIn(b) },
            );
        }
        Self { entries }
    }

    /// The process-wide registry holding only built-in codecs
    pub fn shared() -> Arc<Self> {
        static SHARED: OnceLock<Arc<CodecRegistry>> = OnceLock::new();
        SHARED.get_or_init(|| Arc::new(Self::with_builtins())).clone()
    }

    pub fn get(&self, uuid: CodecUuid) -> Option<&CodecEntry> {
        self.entries.get(&uuid)
    }

    /// Fatal lookup: an absent uuid is [`SixcyError::UnknownCodec`]
    pub fn lookup(&self, uuid: CodecUuid) -> Result<&CodecEntry, SixcyError> {
        self.entries.get(&uuid).ok_or(SixcyError::UnknownCodec(uuid))
    }

    pub fn contains(&self, uuid: CodecUuid) -> bool {
        self.entries.contains_key(&uuid)
    }

    /// Lookup by process-local short alias
    pub fn get_by_alias(&self, alias: u32) -> Option<&CodecEntry> {
        self.entries.values().find(|e| e.alias == Some(alias))
    }

    /// Register a plugin codec from its descriptor.
    ///
    /// Built-ins shadow plugins: any uuid collision with an existing entry is
    /// a load-time error, as is a descriptor with an abi version newer than
    /// [`PLUGIN_ABI_VERSION`].
    ///
    /// # Safety
    /// The function pointers in `descriptor` must stay valid for the lifetime
    /// of the registry and obey the plugin ABI contract (reentrant,
    /// non-overlapping buffers, return codes).
    pub unsafe fn register_plugin(
        &mut self,
        descriptor: &CodecDescriptor,
    ) -> Result<CodecUuid, SixcyError> {
        let abi_version = descriptor.abi_version;
        if abi_version > PLUGIN_ABI_VERSION {
            return Err(SixcyError::PluginAbiVersion(abi_version));
        }
        let uuid = CodecUuid(descriptor.codec_uuid);
        if uuid.is_none() || self.entries.contains_key(&uuid) {
            return Err(SixcyError::PluginCollision(uuid));
        }
        let alias = descriptor.short_id;
        if self.get_by_alias(alias).is_some() {
            return Err(SixcyError::PluginCollision(uuid));
        }
        trace!("registering plugin codec {uuid}");
        self.entries.insert(
            uuid,
            CodecEntry {
                uuid,
                alias: Some(alias),
                kind: CodecKind::Plugin(PluginCodec::from_descriptor(descriptor)),
            },
        );
        Ok(uuid)
    }

    /// Call a plugin's exported entry point and register the descriptor it
    /// returns.
    ///
    /// # Safety
    /// `entry` must be the plugin's exported entry: idempotent, returning a
    /// process-lifetime static descriptor whose function pointers obey the
    /// plugin ABI contract.
    pub unsafe fn load_plugin(&mut self, entry: PluginEntryFn) -> Result<CodecUuid, SixcyError> {
        let descriptor = entry();
        if descriptor.is_null() {
            return Err(SixcyError::CodecFailure {
                codec: "plugin",
                msg: "entry returned a null descriptor".to_string(),
            });
        }
        self.register_plugin(&*descriptor)
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_uuid_wire_order() {
        // time_low/mid/hi are byte-swapped on the wire, the rest verbatim
        assert_eq!(
            CodecUuid::ZSTD.to_string(),
            "b28a9d4f-5e3c-4a1b-8f2e-7c6d9b0e1a2f"
        );
        assert_eq!(
            CodecUuid::LZMA.to_string(),
            "4a8f2e1c-9b3d-4f7a-c2e8-6d5b1a0f3c9e"
        );
        assert!(CodecUuid::NONE.is_none());
    }

    #[test]
    fn builtin_roundtrip() {
        let registry = CodecRegistry::with_builtins();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(100);
        let mut codecs = vec![CodecUuid::NONE, CodecUuid::ZSTD];
        #[cfg(feature = "lz4")]
        codecs.push(CodecUuid::LZ4);
        #[cfg(feature = "brotli")]
        codecs.push(CodecUuid::BROTLI);
        #[cfg(feature = "lzma")]
        codecs.push(CodecUuid::LZMA);
        for uuid in codecs {
            let codec = registry.lookup(uuid).unwrap();
            let compressed = codec.compress(&data, 3).unwrap();
            let back = codec.decompress(&compressed, data.len()).unwrap();
            assert_eq!(back, data, "codec {uuid}");
        }
    }

    #[test]
    fn unknown_uuid_is_fatal() {
        let registry = CodecRegistry::with_builtins();
        let bogus = CodecUuid([0xab; 16]);
        assert!(matches!(
            registry.lookup(bogus),
            Err(SixcyError::UnknownCodec(u)) if u == bogus
        ));
    }

    #[test]
    fn zstd_bound_covers_worst_case() {
        let registry = CodecRegistry::with_builtins();
        let codec = registry.lookup(CodecUuid::ZSTD).unwrap();
        // incompressible input must still fit in the declared bound
        let data: Vec<u8> = (0..4096u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let compressed = codec.compress(&data, 19).unwrap();
        assert!(compressed.len() <= codec.compress_bound(data.len()));
    }
}
