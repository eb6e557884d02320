//! Hashing algorithms for Ferrite Coin.

use blake3::Hasher as Blake3Hasher;
use sha2::Digest;

/// BLAKE3 content hash of arbitrary bytes.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Double BLAKE3, used by the masternode rank score.
pub fn double_hash256(data: &[u8]) -> [u8; 32] {
    let inner = blake3::hash(data);
    *Blake3Hasher::new()
        .update(data)
        .update(inner.as_bytes())
        .finalize()
        .as_bytes()
}

/// Calculate SHA256 hash of input data.
pub fn calculate_sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// First four bytes of SHA256, used as the persisted-state checksum.
pub fn checksum32(data: &[u8]) -> [u8; 4] {
    let digest = calculate_sha256(data);
    [digest[0], digest[1], digest[2], digest[3]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_calculate_sha256() {
        let hash = calculate_sha256(&[]);
        assert_eq!(
            hash,
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );

        let hash = calculate_sha256(b"hello");
        assert_eq!(
            hash,
            hex!("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
    }

    #[test]
    fn double_hash_differs_from_single() {
        assert_ne!(hash256(b"ferrite"), double_hash256(b"ferrite"));
    }

    #[test]
    fn checksum_is_prefix_of_sha256() {
        let digest = calculate_sha256(b"state");
        assert_eq!(checksum32(b"state"), [digest[0], digest[1], digest[2], digest[3]]);
    }
}
