//! Content fingerprints for dataset rows and uploaded files.
//!
//! Both fingerprints are lowercase hex SHA-256 digests and depend only on
//! content, so they stay stable across process restarts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};

/// Joins row fields before hashing. The ASCII unit separator does not occur in
/// ordinary text, so `["a,b"]` and `["a", "b"]` hash differently.
const FIELD_SEPARATOR: &str = "\u{1f}";

const READ_CHUNK: usize = 64 * 1024;

/// Stable identity of a dataset row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowFingerprint(String);

/// Stable identity of an uploaded file's raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileFingerprint(String);

impl RowFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FileFingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for FileFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fingerprint a row by hashing its fields joined with a fixed separator.
pub fn fingerprint_row<S: AsRef<str>>(fields: &[S]) -> RowFingerprint {
    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            hasher.update(FIELD_SEPARATOR.as_bytes());
        }
        hasher.update(field.as_ref().as_bytes());
    }
    RowFingerprint(format!("{:x}", hasher.finalize()))
}

/// Fingerprint an in-memory file.
pub fn fingerprint_bytes(data: &[u8]) -> FileFingerprint {
    let mut hasher = Sha256::new();
    hasher.update(data);
    FileFingerprint(format!("{:x}", hasher.finalize()))
}

/// Fingerprint a file by streaming it through the hasher in fixed-size chunks.
///
/// Reads the source exactly once and never buffers more than one chunk.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<FileFingerprint> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(FileFingerprint(format!("{:x}", hasher.finalize())))
}
