use xxhash_rust::xxh3::xxh3_64;

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 16777619;

/// FNV-1a 32-bit hash of an object id, used for shard routing. The routing
/// hash is part of the on-disk contract: changing it would strand existing
/// objects on the wrong shard.
pub fn object_hash(id: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in id {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// 64-bit hash of a selection or dimension name, used as a submap key in the
/// nested result hashmap.
pub fn name_hash(name: &str) -> u64 {
    xxh3_64(name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_reference_vectors() {
        assert_eq!(object_hash(b""), 0x811c9dc5);
        assert_eq!(object_hash(b"a"), 0xe40c292c);
        assert_eq!(object_hash(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn test_object_hash_is_stable() {
        assert_eq!(object_hash(b"user-42"), object_hash(b"user-42"));
        assert_ne!(object_hash(b"user-42"), object_hash(b"user-43"));
    }

    #[test]
    fn test_name_hash_distinguishes_names() {
        assert_ne!(name_hash("fruit"), name_hash("price"));
        assert_eq!(name_hash("fruit"), name_hash("fruit"));
    }
}
