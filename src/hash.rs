//! Key hashing for node selection.
//!
//! The Ketama variants are wire-compatible with other memcached clients:
//! the MD5 byte extraction is little-endian 32-bit words at fixed digest
//! offsets, and changing it would silently reroute every key away from
//! where other clients put it.

use md5::{Digest, Md5};

const FNV_32_INIT: u32 = 0x811c9dc5;
const FNV_32_PRIME: u32 = 0x01000193;

/// Hash algorithm used to place keys (and, for the array locator, to pick a
/// slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// Fast process-local hash (fxhash). Not stable across
    /// architectures or versions; fine for a homogeneous fleet.
    Native,
    /// The classic memcached CRC hash: `(crc32(key) >> 16) & 0x7fff`.
    Crc,
    /// 32-bit FNV-1.
    Fnv1_32,
    /// 32-bit FNV-1a.
    Fnv1a32,
    /// First little-endian word of `MD5(key)`; the hash used by Ketama
    /// reference clients.
    Ketama,
}

impl HashAlgorithm {
    pub fn hash(&self, key: &[u8]) -> u32 {
        match self {
            HashAlgorithm::Native => fxhash::hash32(key),
            HashAlgorithm::Crc => (crc32fast::hash(key) >> 16) & 0x7fff,
            HashAlgorithm::Fnv1_32 => {
                let mut hash = FNV_32_INIT;
                for &b in key {
                    hash = hash.wrapping_mul(FNV_32_PRIME);
                    hash ^= u32::from(b);
                }
                hash
            }
            HashAlgorithm::Fnv1a32 => {
                let mut hash = FNV_32_INIT;
                for &b in key {
                    hash ^= u32::from(b);
                    hash = hash.wrapping_mul(FNV_32_PRIME);
                }
                hash
            }
            HashAlgorithm::Ketama => {
                let digest = Md5::digest(key);
                md5_word(digest.as_slice(), 0)
            }
        }
    }
}

/// The four little-endian u32 words at offsets 0, 4, 8 and 12 of an MD5
/// digest.
pub(crate) fn md5_word(digest: &[u8], word: usize) -> u32 {
    let off = word * 4;
    u32::from_le_bytes([digest[off], digest[off + 1], digest[off + 2], digest[off + 3]])
}

/// Ketama continuum points for one node: 40 digests of `"{node_key}-{i}"`,
/// four words each, 160 points total.
pub(crate) fn ketama_points(node_key: &str) -> Vec<u32> {
    let mut points = Vec::with_capacity(160);
    for i in 0..40 {
        let digest = Md5::digest(format!("{}-{}", node_key, i).as_bytes());
        for word in 0..4 {
            points.push(md5_word(digest.as_slice(), word));
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ketama_hash_matches_md5_word_extraction() {
        // MD5("") = d41d8cd98f00b204e9800998ecf8427e
        assert_eq!(HashAlgorithm::Ketama.hash(b""), 0xd98c1dd4);
        // MD5("a") = 0cc175b9c0f1b6a831c399e269772661
        assert_eq!(HashAlgorithm::Ketama.hash(b"a"), 0xb975c10c);
    }

    #[test]
    fn test_md5_words_are_little_endian() {
        // MD5("") laid out byte by byte.
        let digest: [u8; 16] = [
            0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8,
            0x42, 0x7e,
        ];
        assert_eq!(md5_word(&digest, 0), 0xd98c1dd4);
        assert_eq!(md5_word(&digest, 1), 0x04b2008f);
        assert_eq!(md5_word(&digest, 2), 0x980980e9);
        assert_eq!(md5_word(&digest, 3), 0x7e42f8ec);
    }

    #[test]
    fn test_fnv_reference_vectors() {
        // Published FNV test vectors.
        assert_eq!(HashAlgorithm::Fnv1a32.hash(b""), 0x811c9dc5);
        assert_eq!(HashAlgorithm::Fnv1a32.hash(b"a"), 0xe40c292c);
        assert_eq!(HashAlgorithm::Fnv1_32.hash(b"a"), 0x050c5d7e);
    }

    #[test]
    fn test_crc_hash_truncation() {
        // crc32("a") = 0xe8b7be43
        assert_eq!(HashAlgorithm::Crc.hash(b"a"), (0xe8b7 & 0x7fff) as u32);
    }

    #[test]
    fn test_ketama_points_are_stable() {
        let a = ketama_points("10.0.1.1:11211");
        let b = ketama_points("10.0.1.1:11211");
        assert_eq!(a.len(), 160);
        assert_eq!(a, b);
        assert_ne!(a, ketama_points("10.0.1.2:11211"));
    }
}
