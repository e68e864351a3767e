//! Content fingerprints for duplicate detection
//!
//! A fingerprint is the lowercase hex SHA-256 digest of a byte stream. Files are
//! read once, in fixed-size chunks, so large inputs never sit in memory.

use crate::error::{MbaError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

/// Read buffer size used while hashing
const CHUNK_SIZE: usize = 8192;

/// Length of a hex encoded SHA-256 digest
pub const FINGERPRINT_HEX_LEN: usize = 64;

/// SHA-256 content fingerprint, stored as lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint a file with a single streaming read
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        Self::from_reader(&mut file)
    }

    /// Fingerprint any readable source
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; CHUNK_SIZE];

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Fingerprint an in-memory buffer
    pub fn from_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Verify that a buffer read after fingerprinting still has this content
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let actual = Self::from_bytes(data);
        if actual == *self {
            Ok(())
        } else {
            Err(MbaError::ChecksumMismatch {
                expected: self.0.clone(),
                actual: actual.0,
            })
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = MbaError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        if normalized.len() != FINGERPRINT_HEX_LEN
            || !normalized.chars().all(|c| c.is_ascii_hexdigit())
        {
            return Err(MbaError::InvalidFingerprint(s.to_string()));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = MbaError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_fingerprint_from_reader() {
        let mut cursor = Cursor::new(b"hello world");
        let fingerprint = Fingerprint::from_reader(&mut cursor).unwrap();
        assert_eq!(
            fingerprint.as_str(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_streaming_matches_in_memory() {
        // Larger than one chunk so the loop runs more than once
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();

        let streamed = Fingerprint::from_file(file.path()).unwrap();
        assert_eq!(streamed, Fingerprint::from_bytes(&data));
        assert!(streamed.verify(&data).is_ok());
    }

    #[test]
    fn test_verify_reports_changed_content() {
        let fp = Fingerprint::from_bytes(b"before");
        let err = fp.verify(b"after").unwrap_err();
        assert!(matches!(
            err,
            MbaError::ChecksumMismatch { ref expected, .. } if expected == fp.as_str()
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = Fingerprint::from_file("/definitely/not/here.pdf").unwrap_err();
        assert!(matches!(err, MbaError::Io(_)));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("abc".parse::<Fingerprint>().is_err());
        assert!("z".repeat(64).parse::<Fingerprint>().is_err());

        let upper = "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9";
        let parsed: Fingerprint = upper.parse().unwrap();
        assert_eq!(parsed.as_str(), upper.to_lowercase());
    }

    #[test]
    fn test_serde_round_trip_validates() {
        let json = "\"b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9\"";
        let parsed: Fingerprint = serde_json::from_str(json).unwrap();
        assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
        assert!(serde_json::from_str::<Fingerprint>("\"nope\"").is_err());
    }
}
