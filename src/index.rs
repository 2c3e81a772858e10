//! The JSON file catalog stored in the INDEX block, and the recovery map tail

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::SixcyError;

/// Pointer from a file record to a block, optionally narrowed to a sub-range
/// of a SOLID block's decompressed payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    /// Content hash of the referenced block. All-zero only in records parsed
    /// from a legacy index, where integrity degrades to the header crc.
    #[serde(with = "hex_hash")]
    pub content_hash: [u8; 32],
    /// Offset of the block's header in the archive
    pub archive_offset: u64,
    /// Zero for DATA blocks
    pub intra_offset: u64,
    /// Zero for DATA blocks
    pub intra_length: u64,
}

/// One file in the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub id: u32,
    pub parent_id: u32,
    pub name: String,
    pub block_refs: Vec<BlockRef>,
    pub original_size: u64,
    pub compressed_size: u64,
    pub metadata: BTreeMap<String, String>,
    /// Set when this record came from a legacy `offsets` list and its blocks
    /// carry no content hashes. Never serialized.
    #[serde(skip)]
    pub degraded_integrity: bool,
}

/// The document serialized into the INDEX block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIndex {
    pub records: Vec<FileRecord>,
    #[serde(with = "hex_hash")]
    pub root_hash: [u8; 32],
}

impl FileIndex {
    /// Parse the decompressed INDEX payload.
    ///
    /// Records may carry the legacy `offsets: [u64]` field instead of
    /// `block_refs`; each such offset becomes a stub ref with a zeroed
    /// content hash and the record is flagged degraded. With `strict` set,
    /// legacy records are rejected outright.
    pub fn from_json(bytes: &[u8], strict: bool) -> Result<Self, SixcyError> {
        let wire: FileIndexWire = serde_json::from_slice(bytes)?;
        let mut records = Vec::with_capacity(wire.records.len());
        for record in wire.records {
            let (block_refs, degraded_integrity) = match (record.block_refs, record.offsets) {
                (Some(refs), _) => (refs, false),
                (None, Some(offsets)) => {
                    if strict {
                        return Err(SixcyError::IndexParse(format!(
                            "record {:?} uses the legacy offsets list",
                            record.name
                        )));
                    }
                    let refs = offsets
                        .into_iter()
                        .map(|archive_offset| BlockRef {
                            content_hash: [0; 32],
                            archive_offset,
                            intra_offset: 0,
                            intra_length: 0,
                        })
                        .collect();
                    (refs, true)
                }
                (None, None) => (vec![], false),
            };
            records.push(FileRecord {
                id: record.id,
                parent_id: record.parent_id,
                name: record.name,
                block_refs,
                original_size: record.original_size,
                compressed_size: record.compressed_size,
                metadata: record.metadata,
                degraded_integrity,
            });
        }
        Ok(Self { records, root_hash: wire.root_hash })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, SixcyError> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Deserialize)]
struct FileIndexWire {
    records: Vec<FileRecordWire>,
    #[serde(with = "hex_hash")]
    root_hash: [u8; 32],
}

#[derive(Deserialize)]
struct FileRecordWire {
    id: u32,
    parent_id: u32,
    name: String,
    #[serde(default)]
    block_refs: Option<Vec<BlockRef>>,
    /// Legacy field: bare block offsets without content hashes
    #[serde(default)]
    offsets: Option<Vec<u64>>,
    original_size: u64,
    compressed_size: u64,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// BLAKE3 over the concatenation of every `content_hash` in record order,
/// block order. Verifies a whole archive without reading payloads.
pub fn compute_root_hash(records: &[FileRecord]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    for record in records {
        for block_ref in &record.block_refs {
            hasher.update(&block_ref.content_hash);
        }
    }
    *hasher.finalize().as_bytes()
}

/// One entry in the recovery map, appended after each completed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Archive position after the file's last block
    pub archive_offset: u64,
    pub last_file_id: u32,
    /// Seconds since the unix epoch
    pub timestamp: i64,
}

/// Length-prefixed JSON tail of the archive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryMap {
    pub checkpoints: Vec<Checkpoint>,
}

mod hex_hash {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        bytes.try_into().map_err(|_| D::Error::custom("expected 32 hash bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u32, name: &str, hashes: &[[u8; 32]]) -> FileRecord {
        FileRecord {
            id,
            parent_id: 0,
            name: name.to_string(),
            block_refs: hashes
                .iter()
                .enumerate()
                .map(|(i, h)| BlockRef {
                    content_hash: *h,
                    archive_offset: 256 + i as u64 * 1000,
                    intra_offset: 0,
                    intra_length: 0,
                })
                .collect(),
            original_size: hashes.len() as u64 * 4096,
            compressed_size: hashes.len() as u64 * 100,
            metadata: BTreeMap::new(),
            degraded_integrity: false,
        }
    }

    #[test]
    fn json_roundtrip() {
        let records = vec![
            record(0, "a.txt", &[[0x01; 32], [0x02; 32]]),
            record(1, "b/c.bin", &[[0x03; 32]]),
        ];
        let index = FileIndex { root_hash: compute_root_hash(&records), records };
        let json = index.to_json().unwrap();
        let back = FileIndex::from_json(&json, true).unwrap();
        assert_eq!(back, index);
    }

    #[test]
    fn root_hash_is_order_sensitive() {
        let a = vec![record(0, "a", &[[0x01; 32]]), record(1, "b", &[[0x02; 32]])];
        let b = vec![record(0, "a", &[[0x02; 32]]), record(1, "b", &[[0x01; 32]])];
        assert_ne!(compute_root_hash(&a), compute_root_hash(&b));

        let mut expected = blake3::Hasher::new();
        expected.update(&[0x01; 32]);
        expected.update(&[0x02; 32]);
        assert_eq!(compute_root_hash(&a), *expected.finalize().as_bytes());
    }

    #[test]
    fn legacy_offsets_accepted_unless_strict() {
        let json = br#"{
            "records": [{
                "id": 0, "parent_id": 0, "name": "old.bin",
                "offsets": [256, 4532],
                "original_size": 8192, "compressed_size": 900
            }],
            "root_hash": "0000000000000000000000000000000000000000000000000000000000000000"
        }"#;

        let index = FileIndex::from_json(json, false).unwrap();
        let rec = &index.records[0];
        assert!(rec.degraded_integrity);
        assert_eq!(rec.block_refs.len(), 2);
        assert_eq!(rec.block_refs[0].archive_offset, 256);
        assert_eq!(rec.block_refs[1].archive_offset, 4532);
        assert_eq!(rec.block_refs[0].content_hash, [0; 32]);

        assert!(matches!(
            FileIndex::from_json(json, true),
            Err(SixcyError::IndexParse(_))
        ));
    }

    #[test]
    fn missing_fields_rejected() {
        let json = br#"{"records": [{"id": 0, "name": "x"}]}"#;
        assert!(matches!(
            FileIndex::from_json(json, false),
            Err(SixcyError::IndexParse(_))
        ));
    }

    #[test]
    fn recovery_map_roundtrip() {
        let map = RecoveryMap {
            checkpoints: vec![Checkpoint { archive_offset: 4380, last_file_id: 0, timestamp: 1_700_000_000 }],
        };
        let json = serde_json::to_vec(&map).unwrap();
        let back: RecoveryMap = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, map);
    }
}
