//! Fingerprints and Hashes
//!
//! Two distinct digests serve two distinct purposes:
//!
//! - A 64-bit *fingerprint* identifies a value across independent processes
//!   running the same program. It must be fully deterministic: no per-run
//!   seeding, no address dependence. Container fingerprints combine element
//!   fingerprints in an order-dependent way so structure is captured.
//! - A 32-bit *hash* feeds the in-process map. Container hashes use the
//!   xor combiner, which is associative and commutative, so any traversal
//!   order produces the same result.

const FP_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FP_PRIME: u64 = 0x0000_0100_0000_01b3;

const HASH_OFFSET: u32 = 0x811c_9dc5;
const HASH_PRIME: u32 = 0x0100_0193;

// Mixing constant shared by fingerprint_cat (from the 128-to-64 reduction
// family of hash finalizers).
const CAT_MUL: u64 = 0x9ddf_ea08_eb38_2d69;

/// Fingerprint of a byte sequence.
pub fn fingerprint_bytes(bytes: &[u8]) -> u64 {
    let mut h = FP_OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FP_PRIME);
    }
    h
}

/// Fingerprint of a 64-bit payload (ints, uints, floats-as-bits, times,
/// fingerprints, bools widened to a full word).
pub fn fingerprint_u64(x: u64) -> u64 {
    fingerprint_bytes(&x.to_le_bytes())
}

/// Order-dependent combiner for container fingerprints.
pub fn fingerprint_cat(fp: u64, x: u64) -> u64 {
    let mut h = (fp ^ x).wrapping_mul(CAT_MUL);
    h ^= h >> 47;
    h = h.wrapping_mul(CAT_MUL);
    h ^ (fp.rotate_left(31))
}

/// Seed for container fingerprints. Non-zero, so an empty container has a
/// distinct non-zero fingerprint.
pub fn finger_seed() -> u64 {
    fingerprint_u64(0)
}

/// 32-bit hash of a byte sequence.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut h = HASH_OFFSET;
    for &b in bytes {
        h ^= b as u32;
        h = h.wrapping_mul(HASH_PRIME);
    }
    h
}

/// 32-bit hash of a 64-bit payload.
pub fn hash_u64(x: u64) -> u32 {
    hash_bytes(&x.to_le_bytes())
}

/// Associative-commutative combiner for container hashes. Elements may be
/// visited in any order.
#[inline]
pub fn map_hash_cat(h1: u32, h2: u32) -> u32 {
    h1 ^ h2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        assert_eq!(fingerprint_bytes(b"abc"), fingerprint_bytes(b"abc"));
        assert_eq!(fingerprint_u64(12345), fingerprint_u64(12345));
    }

    #[test]
    fn test_fingerprint_discriminates() {
        assert_ne!(fingerprint_bytes(b"abc"), fingerprint_bytes(b"abd"));
        assert_ne!(fingerprint_bytes(b""), 0);
        assert_ne!(finger_seed(), 0);
    }

    #[test]
    fn test_fingerprint_cat_order_dependent() {
        let a = fingerprint_u64(1);
        let b = fingerprint_u64(2);
        let ab = fingerprint_cat(fingerprint_cat(finger_seed(), a), b);
        let ba = fingerprint_cat(fingerprint_cat(finger_seed(), b), a);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_map_hash_cat_commutative() {
        let h1 = hash_u64(7);
        let h2 = hash_u64(11);
        let h3 = hash_u64(13);
        assert_eq!(
            map_hash_cat(map_hash_cat(h1, h2), h3),
            map_hash_cat(h3, map_hash_cat(h2, h1))
        );
    }

    #[test]
    fn test_empty_container_seed_distinct() {
        // The seed must differ from the fingerprint of common scalars so
        // that empty containers do not collide with them.
        assert_ne!(finger_seed(), fingerprint_u64(1));
        assert_ne!(finger_seed(), fingerprint_bytes(b""));
    }
}
