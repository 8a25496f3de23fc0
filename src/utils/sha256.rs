use bitcoin::hashes::{sha256, Hash};

/// Compute sha256 hash of bytes
pub fn sha256sum(bytes: &[u8]) -> Vec<u8> {
    sha256::Hash::hash(bytes).to_byte_array().to_vec()
}
