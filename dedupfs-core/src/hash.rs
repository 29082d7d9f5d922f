//! Content hashing.
//!
//! A stateless `digest(bytes) -> Vec<u8>` operation. The algorithm is
//! chosen once, at database-creation time, and its name is persisted as
//! an [`crate::options::Options`] field; a small closed enum rather than
//! a dynamic lookup table, since only two algorithms are supported.

use crate::error::{DedupError, DedupResult};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Supported digest algorithms. `Sha1` is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn parse(name: &str) -> DedupResult<Self> {
        match name {
            "sha1" => Ok(HashAlgorithm::Sha1),
            "sha256" => Ok(HashAlgorithm::Sha256),
            other => Err(DedupError::FatalIntegrity(format!(
                "unsupported hash algorithm {other:?}"
            ))),
        }
    }

    /// Digest `block` with the selected algorithm. The core treats the
    /// result as an opaque byte string; it never inspects its length
    /// beyond using it as a map key.
    pub fn digest(&self, block: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => {
                let mut h = Sha1::new();
                h.update(block);
                h.finalize().to_vec()
            }
            HashAlgorithm::Sha256 => {
                let mut h = Sha256::new();
                h.update(block);
                h.finalize().to_vec()
            }
        }
    }
}

impl Default for HashAlgorithm {
    fn default() -> Self {
        HashAlgorithm::Sha1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_matches_known_vector() {
        let digest = HashAlgorithm::Sha1.digest(b"abc");
        assert_eq!(
            hex(&digest),
            "a9993e364706816aba3e25717850c26c9cd0d89"
        );
    }

    #[test]
    fn sha256_matches_known_vector() {
        let digest = HashAlgorithm::Sha256.digest(b"abc");
        assert_eq!(
            hex(&digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn same_input_same_digest() {
        let a = HashAlgorithm::Sha1.digest(b"hello world!");
        let b = HashAlgorithm::Sha1.digest(b"hello world!");
        assert_eq!(a, b);
    }

    #[test]
    fn different_input_different_digest() {
        let a = HashAlgorithm::Sha1.digest(b"hell");
        let b = HashAlgorithm::Sha1.digest(b"o wo");
        assert_ne!(a, b);
    }

    #[test]
    fn parse_roundtrips_as_str() {
        for algo in [HashAlgorithm::Sha1, HashAlgorithm::Sha256] {
            assert_eq!(HashAlgorithm::parse(algo.as_str()).unwrap(), algo);
        }
    }

    #[test]
    fn parse_rejects_unknown_name() {
        assert!(HashAlgorithm::parse("md5").is_err());
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }
}
