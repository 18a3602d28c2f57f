use rand::RngCore;
use zeroize::Zeroizing;

/// Number of random bytes in a stop-token. Hex encoding doubles the length.
pub const TOKEN_BYTES: usize = 32;

/// Generate a fresh opaque stop-token: 32 bytes from the OS RNG, hex-encoded.
///
/// The token carries no information about the session it guards.
pub fn generate_token() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; TOKEN_BYTES]);
    rand::rngs::OsRng.fill_bytes(&mut bytes[..]);
    Zeroizing::new(hex::encode(&bytes[..]))
}

/// Compare an issued token with one presented by a caller.
///
/// Runs in time independent of where the first difference is. ASCII case is
/// ignored so upper-cased hex from older clients still matches. An empty
/// presented token never matches.
pub fn tokens_match(issued: &str, presented: &str) -> bool {
    let a = issued.as_bytes();
    let b = presented.as_bytes();
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return false;
    }
    let diff = a
        .iter()
        .zip(b)
        .fold(0u8, |acc, (x, y)| acc | (x.to_ascii_lowercase() ^ y.to_ascii_lowercase()));
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_64_hex_chars() {
        let t = generate_token();
        assert_eq!(t.len(), TOKEN_BYTES * 2);
        assert!(t.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(*a, *b);
    }

    #[test]
    fn match_rules() {
        let t = generate_token();
        assert!(tokens_match(&t, &t));
        assert!(tokens_match(&t, &t.to_uppercase()));
        assert!(!tokens_match(&t, ""));
        assert!(!tokens_match("", ""));
        assert!(!tokens_match(&t, &t[..10]));

        let mut wrong = t.to_string();
        let last = if wrong.ends_with('0') { "1" } else { "0" };
        wrong.replace_range(63.., last);
        assert!(!tokens_match(&t, &wrong));
    }
}
