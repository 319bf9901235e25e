//! SHA-256 (§2, §4.1): "a separate SHA-256 utility hashes byte streams to a
//! 32-byte digest; it is pure and self-contained." Backed by the `sha2`
//! crate rather than a hand-rolled digest — per the teacher workspace,
//! reaching for a vetted crate is the idiomatic choice whenever the
//! ecosystem already has one.

use sha2::{Digest, Sha256};

pub fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn hex_digest(bytes: &[u8]) -> String {
    hex::encode(digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_matches_known_vector() {
        let got = hex_digest(b"");
        assert_eq!(
            got,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest(b"ember"), digest(b"ember"));
        assert_ne!(digest(b"ember"), digest(b"lumen"));
    }
}
