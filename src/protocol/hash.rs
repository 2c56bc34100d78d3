//! Reproducible 16-bit name hash
//!
//! Model package names are too long to send with every aircraft, so the
//! protocol carries a 16-bit PJW-style hash instead. The result must be
//! identical on every platform and in every process, which rules out
//! `std::hash` and its randomly seeded hashers.

/// 16-bit variant of the PJW hash.
///
/// Shifts by 2 bits per input byte and folds the upper 2 bits back into
/// the low end. Hashing stops at the first zero byte, so a zero padded
/// fixed-width field hashes the same as its unpadded content.
pub fn pjw_hash16(bytes: &[u8]) -> u16 {
    let mut h: u16 = 0;
    for &b in bytes.iter().take_while(|&&b| b != 0) {
        h = (h << 2).wrapping_add(u16::from(b));
        let high = h & 0xC000;
        if high != 0 {
            h ^= high >> 14;
        }
        h &= !high;
    }
    h
}

/// Hash a package name
pub fn package_hash(name: &str) -> u16 {
    pjw_hash16(name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert_eq!(pjw_hash16(b""), 0);
    }

    #[test]
    fn test_known_values() {
        // single byte: just the byte value
        assert_eq!(pjw_hash16(b"A"), 0x41);
        // (0x41 << 2) + 0x42 = 0x146
        assert_eq!(pjw_hash16(b"AB"), 0x146);
        // (0x146 << 2) + 0x43 = 0x55B
        assert_eq!(pjw_hash16(b"ABC"), 0x55B);
    }

    #[test]
    fn test_upper_bits_folded() {
        // long inputs never set the top two bits
        let h = package_hash("Bluebell/BB_Airbus/A320_Lufthansa_livery_package");
        assert_eq!(h & 0xC000, 0);
    }

    #[test]
    fn test_stable_across_calls() {
        let name = "XCSL/B738";
        let first = package_hash(name);
        for _ in 0..100 {
            assert_eq!(package_hash(name), first);
        }
        // an independently built copy of the same bytes hashes the same
        let copy: Vec<u8> = name.bytes().collect();
        assert_eq!(pjw_hash16(&copy), first);
    }

    #[test]
    fn test_stops_at_nul() {
        assert_eq!(pjw_hash16(b"B738\0\0\0\0"), pjw_hash16(b"B738"));
        assert_eq!(pjw_hash16(b"B738\0junk"), pjw_hash16(b"B738"));
    }

    #[test]
    fn test_different_names_usually_differ() {
        assert_ne!(package_hash("XCSL"), package_hash("Bluebell"));
    }
}
