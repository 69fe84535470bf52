use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha512};

/// SHA-512 digest of `data`, standard base64 encoded.
pub fn sha512_b64(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(Sha512::digest(data.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha512_b64_known_vector() {
        // sha512("") in base64
        assert_eq!(
            sha512_b64(""),
            "z4PhNX7vuL3xVChQ1m2AB9Yg5AULVxXcg/SpIdNs6c5H0NE8XYXysP+DGNKHfuwvY7kxvUdBeoGlODJ6+SfaPg=="
        );
    }

    #[test]
    fn test_sha512_b64_differs() {
        assert_ne!(sha512_b64("a"), sha512_b64("b"));
        assert_eq!(sha512_b64("a").len(), 88);
    }
}
