//! Frozen C-compatible plugin ABI, version 1
//!
//! A plugin exposes one entry point returning a process-lifetime static
//! [`CodecDescriptor`]. The host copies the descriptor's function pointers and
//! dispatches through them like any built-in codec. Loading the shared object
//! and resolving the entry symbol is the embedder's job; this module only
//! defines the ABI and the host-side wrapper.

use crate::error::SixcyError;

/// Highest descriptor abi version this host accepts
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Operation completed
pub const PLUGIN_OK: i32 = 0;
/// Output buffer too small; retry with a capacity from `compress_bound`
pub const PLUGIN_ERR_OVERFLOW: i32 = -1;
/// Input is not valid for this codec
pub const PLUGIN_ERR_CORRUPT: i32 = -2;
/// Codec-internal failure
pub const PLUGIN_ERR_INTERNAL: i32 = -3;

/// `compress(input, input_len, output, output_cap, written, level)`
pub type PluginCompressFn = unsafe extern "C" fn(
    input: *const u8,
    input_len: usize,
    output: *mut u8,
    output_cap: usize,
    written: *mut usize,
    level: i32,
) -> i32;

/// `decompress(input, input_len, output, output_cap, written)`
pub type PluginDecompressFn = unsafe extern "C" fn(
    input: *const u8,
    input_len: usize,
    output: *mut u8,
    output_cap: usize,
    written: *mut usize,
) -> i32;

/// `compress_bound(input_len)`
pub type PluginBoundFn = unsafe extern "C" fn(input_len: usize) -> usize;

/// Descriptor returned by a plugin's exported entry point.
///
/// The entry is idempotent and returns the same static address on every call.
/// Input and output buffers passed to the functions never overlap; the
/// functions must be reentrant.
#[repr(C, packed)]
pub struct CodecDescriptor {
    /// Codec identity in RFC 4122 little-endian field order
    pub codec_uuid: [u8; 16],
    /// Process-local short alias for dispatch; never written to disk
    pub short_id: u32,
    /// Must be `<=` [`PLUGIN_ABI_VERSION`]
    pub abi_version: u32,
    pub compress: PluginCompressFn,
    pub decompress: PluginDecompressFn,
    pub compress_bound: PluginBoundFn,
}

/// Exported plugin entry: `extern "C" fn() -> *const CodecDescriptor`
pub type PluginEntryFn = unsafe extern "C" fn() -> *const CodecDescriptor;

/// Host-side wrapper around a plugin's function triple
#[derive(Copy, Clone)]
pub(crate) struct PluginCodec {
    compress: PluginCompressFn,
    decompress: PluginDecompressFn,
    bound: PluginBoundFn,
}

impl PluginCodec {
    pub(crate) fn from_descriptor(descriptor: &CodecDescriptor) -> Self {
        Self {
            compress: descriptor.compress,
            decompress: descriptor.decompress,
            bound: descriptor.compress_bound,
        }
    }

    pub(crate) fn compress(&self, bytes: &[u8], level: i32) -> Result<Vec<u8>, SixcyError> {
        let mut cap = self.compress_bound(bytes.len()).max(64);
        let mut retried = false;
        loop {
            let mut out = vec![0u8; cap];
            let mut written = 0usize;
            let rc = unsafe {
                (self.compress)(bytes.as_ptr(), bytes.len(), out.as_mut_ptr(), cap, &mut written, level)
            };
            match rc {
                PLUGIN_OK => {
                    out.truncate(written);
                    return Ok(out);
                }
                PLUGIN_ERR_OVERFLOW if !retried => {
                    retried = true;
                    cap *= 2;
                }
                PLUGIN_ERR_OVERFLOW => return Err(plugin_err("output overflow after retry")),
                PLUGIN_ERR_CORRUPT => return Err(plugin_err("corrupt input")),
                _ => return Err(plugin_err("internal error")),
            }
        }
    }

    pub(crate) fn decompress(
        &self,
        bytes: &[u8],
        out_capacity: usize,
    ) -> Result<Vec<u8>, SixcyError> {
        let mut out = vec![0u8; out_capacity];
        let mut written = 0usize;
        let rc = unsafe {
            (self.decompress)(
                bytes.as_ptr(),
                bytes.len(),
                out.as_mut_ptr(),
                out_capacity,
                &mut written,
            )
        };
        match rc {
            PLUGIN_OK => {
                out.truncate(written);
                Ok(out)
            }
            // the caller passes the exact decoded size, so overflow means the
            // payload does not match its header
            PLUGIN_ERR_OVERFLOW | PLUGIN_ERR_CORRUPT => Err(plugin_err("corrupt input")),
            _ => Err(plugin_err("internal error")),
        }
    }

    pub(crate) fn compress_bound(&self, len: usize) -> usize {
        unsafe { (self.bound)(len) }
    }
}

fn plugin_err(msg: &str) -> SixcyError {
    SixcyError::CodecFailure { codec: "plugin", msg: msg.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CodecRegistry, CodecUuid};

    // memcpy "codec" used to exercise the dispatch path
    unsafe extern "C" fn copy_compress(
        input: *const u8,
        input_len: usize,
        output: *mut u8,
        output_cap: usize,
        written: *mut usize,
        _level: i32,
    ) -> i32 {
        if output_cap < input_len {
            return PLUGIN_ERR_OVERFLOW;
        }
        std::ptr::copy_nonoverlapping(input, output, input_len);
        *written = input_len;
        PLUGIN_OK
    }

    unsafe extern "C" fn copy_decompress(
        input: *const u8,
        input_len: usize,
        output: *mut u8,
        output_cap: usize,
        written: *mut usize,
    ) -> i32 {
        if output_cap < input_len {
            return PLUGIN_ERR_OVERFLOW;
        }
        std::ptr::copy_nonoverlapping(input, output, input_len);
        *written = input_len;
        PLUGIN_OK
    }

    unsafe extern "C" fn copy_bound(input_len: usize) -> usize {
        input_len
    }

    fn copy_descriptor(uuid: [u8; 16], abi_version: u32) -> CodecDescriptor {
        CodecDescriptor {
            codec_uuid: uuid,
            short_id: 0x636f_7079,
            abi_version,
            compress: copy_compress,
            decompress: copy_decompress,
            compress_bound: copy_bound,
        }
    }

    #[test]
    fn plugin_registration_and_dispatch() {
        let mut registry = CodecRegistry::with_builtins();
        let desc = copy_descriptor([0x42; 16], 1);
        let uuid = unsafe { registry.register_plugin(&desc) }.unwrap();
        assert_eq!(uuid, CodecUuid([0x42; 16]));

        let codec = registry.lookup(uuid).unwrap();
        assert_eq!(codec.alias(), Some(0x636f_7079));
        let data = b"plugin bytes".to_vec();
        let compressed = codec.compress(&data, 0).unwrap();
        assert_eq!(codec.decompress(&compressed, data.len()).unwrap(), data);
        assert!(registry.get_by_alias(0x636f_7079).is_some());
    }

    #[test]
    fn plugin_collision_with_builtin_rejected() {
        let mut registry = CodecRegistry::with_builtins();
        let desc = copy_descriptor(CodecUuid::ZSTD.0, 1);
        assert!(matches!(
            unsafe { registry.register_plugin(&desc) },
            Err(SixcyError::PluginCollision(_))
        ));
    }

    #[test]
    fn plugin_newer_abi_rejected() {
        let mut registry = CodecRegistry::with_builtins();
        let desc = copy_descriptor([0x43; 16], 2);
        assert!(matches!(
            unsafe { registry.register_plugin(&desc) },
            Err(SixcyError::PluginAbiVersion(2))
        ));
    }

    #[test]
    fn plugin_zero_uuid_rejected() {
        let mut registry = CodecRegistry::with_builtins();
        let desc = copy_descriptor([0; 16], 1);
        assert!(unsafe { registry.register_plugin(&desc) }.is_err());
    }

    static ENTRY_DESCRIPTOR: CodecDescriptor = CodecDescriptor {
        codec_uuid: [0x51; 16],
        short_id: 51,
        abi_version: 1,
        compress: copy_compress,
        decompress: copy_decompress,
        compress_bound: copy_bound,
    };

    unsafe extern "C" fn plugin_entry() -> *const CodecDescriptor {
        // idempotent: always the same static address
        &ENTRY_DESCRIPTOR
    }

    #[test]
    fn plugin_loads_through_entry_point() {
        let mut registry = CodecRegistry::with_builtins();
        let uuid = unsafe { registry.load_plugin(plugin_entry) }.unwrap();
        assert_eq!(uuid, CodecUuid([0x51; 16]));
        assert!(registry.contains(uuid));
        // second load is a collision, not a replacement
        assert!(unsafe { registry.load_plugin(plugin_entry) }.is_err());
    }
}
