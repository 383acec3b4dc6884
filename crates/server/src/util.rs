use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Generates a prefixed, collision-resistant identifier such as
/// `message-9f2c…`. Mixes wall-clock time with OS entropy through blake3.
pub fn generate_id(prefix: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let mut entropy = [0u8; 16];
    OsRng.fill_bytes(&mut entropy);
    let mut hasher = blake3::Hasher::new();
    hasher.update(prefix.as_bytes());
    hasher.update(&now.as_nanos().to_le_bytes());
    hasher.update(&entropy);
    let digest = hasher.finalize();
    format!("{}-{}", prefix, encode_hex(&digest.as_bytes()[..16]))
}

pub fn encode_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(nibble(byte >> 4));
        out.push(nibble(byte & 0x0f));
    }
    out
}

fn nibble(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        _ => (b'a' + value - 10) as char,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_prefixed_and_unique() {
        let first = generate_id("message");
        let second = generate_id("message");
        assert!(first.starts_with("message-"));
        assert_eq!(first.len(), "message-".len() + 32);
        assert_ne!(first, second);
    }

    #[test]
    fn hex_encoding_is_lowercase() {
        assert_eq!(encode_hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}
