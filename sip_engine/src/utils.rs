use rand::Rng;

const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Lower-case alphanumeric token of `len` characters.
pub fn random_token(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

pub fn new_tag() -> String {
    random_token(10)
}

/// Via branch carrying the RFC 3261 magic cookie.
pub fn new_branch() -> String {
    format!("z9hG4bK{}", random_token(12))
}

pub fn new_call_id(prefix: &str) -> String {
    format!("{}{}", prefix, random_token(15))
}

/// Starting CSeq for requests that were not given one.
pub fn initial_cseq() -> u32 {
    rand::rng().random_range(1..10_000)
}

/// Seconds for the `Retry-After` sent when the peer re-offers while we are
/// still answering its previous offer.
pub fn retry_after_jitter() -> u32 {
    rand::rng().random_range(1..=10)
}

/// Largest prefix of `text` that is at most `max` bytes and ends on a char
/// boundary.
pub(crate) fn truncate_at_boundary(text: &str, max: usize) -> &str {
    if max >= text.len() {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_have_requested_shape() {
        let token = random_token(12);
        assert_eq!(token.len(), 12);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert!(new_branch().starts_with("z9hG4bK"));
        assert!(new_call_id("ab").starts_with("ab"));
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let secs = retry_after_jitter();
            assert!((1..=10).contains(&secs));
            assert!((1..10_000).contains(&initial_cseq()));
        }
    }

    #[test]
    fn truncation_respects_utf8() {
        assert_eq!(truncate_at_boundary("abc", 10), "abc");
        assert_eq!(truncate_at_boundary("abc", 2), "ab");
        // 'é' is two bytes; cutting in the middle backs off.
        assert_eq!(truncate_at_boundary("aé", 2), "a");
    }
}
