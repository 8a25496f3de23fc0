use bitcoin::hashes::{hash160, Hash};

pub fn h160sum(bytes: &[u8]) -> Vec<u8> {
    hash160::Hash::hash(bytes).to_byte_array().to_vec()
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_compute_h160() {
        assert_eq!(
            "d7d5ee7824ff93f94c3055af9382c86c68b5ca92",
            hex::encode(h160sum("hello world".as_bytes()))
        );
    }
}
