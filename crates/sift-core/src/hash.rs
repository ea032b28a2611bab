//! Content hashing helpers.

/// Hex-encoded blake3 digest of `bytes`.
pub fn content_hash(bytes: impl AsRef<[u8]>) -> String {
    blake3::hash(bytes.as_ref()).to_hex().to_string()
}

/// Digest over several parts, each length-prefixed so that
/// `["ab", "c"]` and `["a", "bc"]` do not collide.
pub fn composite_hash<I, P>(parts: I) -> String
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update(&(bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("abc"), content_hash(b"abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert_eq!(content_hash("abc").len(), 64);
    }

    #[test]
    fn test_composite_hash_is_boundary_sensitive() {
        assert_ne!(composite_hash(["ab", "c"]), composite_hash(["a", "bc"]));
        assert_eq!(composite_hash(["a", "b"]), composite_hash(["a", "b"]));
    }
}
