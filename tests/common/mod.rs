#![allow(dead_code)]

use std::io::Cursor;

use sixcy::{ArchiveReader, ArchiveWriter, ReaderOptions, WriterOptions};

/// Write the given files into an in-memory archive and return its bytes
pub fn memory_archive(files: &[(&str, &[u8])], options: WriterOptions) -> Vec<u8> {
    let mut fs = ArchiveWriter::with_options(Cursor::new(vec![]), options).unwrap();
    for (name, bytes) in files {
        fs.add_file(name.to_string(), Cursor::new(bytes.to_vec())).unwrap();
    }
    fs.finalize().unwrap();
    fs.into_inner().into_inner()
}

pub fn open_memory(bytes: Vec<u8>, options: ReaderOptions) -> ArchiveReader<Cursor<Vec<u8>>> {
    ArchiveReader::from_reader_with_options(Cursor::new(bytes), options).unwrap()
}

/// Deterministic incompressible-ish filler (xorshift)
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        let bytes = state.to_le_bytes();
        let take = bytes.len().min(len - out.len());
        out.extend_from_slice(&bytes[..take]);
    }
    out
}
