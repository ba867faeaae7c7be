//! ULID identifiers for messages, users and groups.
//!
//! 26 characters of Crockford base32: 48 bits of millisecond timestamp
//! followed by 80 random bits, so ids sort by creation time.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate an id stamped with the current time.
pub fn generate() -> String {
    generate_at(chrono::Utc::now().timestamp_millis().max(0) as u64)
}

/// Generate an id stamped with `now_ms` (milliseconds since the epoch).
pub fn generate_at(now_ms: u64) -> String {
    let mut rng = rand::thread_rng();
    let rand_hi: u16 = rng.r#gen();
    let rand_lo: u64 = rng.r#gen();

    let mut buf = [0u8; 26];

    let mut ts = now_ms;
    for slot in buf[..10].iter_mut().rev() {
        *slot = CROCKFORD[(ts & 0x1F) as usize];
        ts >>= 5;
    }

    let mut r = rand_hi as u128 | ((rand_lo as u128) << 16);
    for slot in buf[10..].iter_mut().rev() {
        *slot = CROCKFORD[(r & 0x1F) as usize];
        r >>= 5;
    }

    buf.iter().map(|&b| b as char).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_and_uniqueness() {
        let a = generate();
        let b = generate();
        assert_eq!(a.len(), 26);
        assert_ne!(a, b);
    }

    #[test]
    fn only_crockford_characters() {
        let id = generate();
        assert!(id.bytes().all(|b| CROCKFORD.contains(&b)), "bad id: {id}");
    }

    #[test]
    fn sorts_by_time() {
        let a = generate_at(1_700_000_000_000);
        let b = generate_at(1_700_000_000_001);
        assert!(a < b, "{a} should sort before {b}");
    }
}
