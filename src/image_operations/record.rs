// record.rs
//
// Per-key metadata record stored in the ordered index, plus the fanout
// hasher that maps a key to its blob file path.

use std::path::PathBuf;

const DELETED_PREFIX: &str = "DELETED";
const HASH_PREFIX: &str = "HASH";

/// One index entry. A key with no record at all is "hard deleted";
/// that state is represented by `Option::<Record>::None` and can never
/// be written back to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Key has a blob file on disk; `hash` is the MD5 hex of its bytes.
    /// Empty while a first write is in flight (key reservation).
    Live { hash: String },
    /// Soft-deleted: record retained for listing, blob file removed.
    Tombstoned { hash: String },
}

impl Record {
    pub fn live(hash: impl Into<String>) -> Self {
        Record::Live { hash: hash.into() }
    }

    pub fn tombstoned(hash: impl Into<String>) -> Self {
        Record::Tombstoned { hash: hash.into() }
    }

    pub fn hash(&self) -> &str {
        match self {
            Record::Live { hash } | Record::Tombstoned { hash } => hash,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Record::Live { .. })
    }

    pub fn is_tombstoned(&self) -> bool {
        matches!(self, Record::Tombstoned { .. })
    }

    /// Serialize for the index: optional "DELETED" marker, then
    /// "HASH" + 32 hex chars when a content hash is present.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        if self.is_tombstoned() {
            out.push_str(DELETED_PREFIX);
        }
        let hash = self.hash();
        if is_md5_hex(hash) {
            out.push_str(HASH_PREFIX);
            out.push_str(hash);
        }
        out.into_bytes()
    }

    /// Tolerant parse: anything malformed decodes to a live record with
    /// an empty hash rather than failing.
    pub fn decode(data: &[u8]) -> Record {
        let mut s = std::str::from_utf8(data).unwrap_or("");
        let tombstoned = s.starts_with(DELETED_PREFIX);
        if tombstoned {
            s = &s[DELETED_PREFIX.len()..];
        }
        let mut hash = String::new();
        if let Some(rest) = s.strip_prefix(HASH_PREFIX) {
            if rest.len() >= 32 && is_md5_hex(&rest[..32]) {
                hash = rest[..32].to_string();
            }
        }
        if tombstoned {
            Record::Tombstoned { hash }
        } else {
            Record::Live { hash }
        }
    }
}

fn is_md5_hex(s: &str) -> bool {
    s.len() == 32 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Shard path for a key: first two bytes of MD5(key) as hex directories,
/// then the hex-encoded key itself. 65,536 shard directories, sized for
/// up to ~16M objects.
pub fn key_to_path(key: &str) -> PathBuf {
    let digest = md5::compute(key.as_bytes());
    let mut path = PathBuf::new();
    path.push(format!("{:02x}", digest.0[0]));
    path.push(format!("{:02x}", digest.0[1]));
    path.push(hex::encode(key.as_bytes()));
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let records = [
            Record::live("fc3ff98e8c6a0d3087d515c0473f8677"),
            Record::live(""),
            Record::tombstoned("fc3ff98e8c6a0d3087d515c0473f8677"),
            Record::tombstoned(""),
        ];
        for rec in records {
            assert_eq!(Record::decode(&rec.encode()), rec);
        }
    }

    #[test]
    fn encoding_layout() {
        let rec = Record::tombstoned("fc3ff98e8c6a0d3087d515c0473f8677");
        assert_eq!(
            rec.encode(),
            b"DELETEDHASHfc3ff98e8c6a0d3087d515c0473f8677".to_vec()
        );
        assert_eq!(Record::live("").encode(), b"".to_vec());
        assert_eq!(Record::tombstoned("").encode(), b"DELETED".to_vec());
    }

    #[test]
    fn decode_is_tolerant() {
        // Unknown prefix or malformed hash decodes to a live empty record.
        assert_eq!(Record::decode(b"garbage"), Record::live(""));
        assert_eq!(Record::decode(b"HASHnothex"), Record::live(""));
        assert_eq!(Record::decode(b"HASHFC3FF98E8C6A0D3087D515C0473F8677"), Record::live(""));
        assert_eq!(Record::decode(b""), Record::live(""));
        assert_eq!(Record::decode(b"DELETEDjunk"), Record::tombstoned(""));
        assert_eq!(Record::decode(&[0xff, 0xfe]), Record::live(""));
    }

    #[test]
    fn fanout_path_shape() {
        let path = key_to_path("a/b.jpg");
        let parts: Vec<_> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_string())
            .collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 2);
        assert_eq!(parts[1].len(), 2);
        assert_eq!(parts[2], hex::encode(b"a/b.jpg"));
        // Deterministic.
        assert_eq!(key_to_path("a/b.jpg"), key_to_path("a/b.jpg"));
        assert_ne!(key_to_path("a/b.jpg"), key_to_path("a/c.jpg"));
    }
}
