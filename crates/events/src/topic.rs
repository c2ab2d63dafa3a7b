//! Topic-exchange routing key matching.
//!
//! Routing keys and binding patterns are dot-separated words. In a pattern,
//! `*` matches exactly one word and `#` matches zero or more words.

/// Does `routing_key` match the binding `pattern`?
pub fn matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) => (word == "*" || word == k) && match_words(rest, key_rest),
            None => false,
        },
    }
}
