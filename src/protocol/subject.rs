//! Dotted-subject validation.
//!
//! Subjects are `.`-separated token strings. Published subjects carry only
//! literal tokens; subscribed subjects may use `*` (one token) or a trailing
//! `>` (one or more remaining tokens), each standing alone as a token.

/// A published subject must have non-empty tokens, none containing a
/// wildcard character.
pub fn valid_published(subject: &str) -> bool {
    subject
        .split('.')
        .all(|token| !token.is_empty() && !token.contains(['*', '>']))
}

/// A subscribed subject must have non-empty tokens; `*` and `>` must stand
/// alone, and `>` must be the last token.
pub fn valid_subscribed(subject: &str) -> bool {
    let tokens: Vec<&str> = subject.split('.').collect();
    for (index, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return false;
        }
        match token.find(['*', '>']) {
            None => {}
            Some(0) => {
                if token.len() != 1 {
                    return false;
                }
                if *token == ">" && index != tokens.len() - 1 {
                    return false;
                }
            }
            Some(_) => return false,
        }
    }
    true
}

/// Split `s` on whitespace into at most `n` fields; the final field keeps
/// the remainder of the string verbatim. Used for control-line arguments
/// where the last argument may itself contain spaces (CONNECT JSON).
pub fn fields_n(s: &str, n: usize) -> Vec<&str> {
    let mut result = Vec::with_capacity(n);
    let mut start = None;
    for (index, c) in s.char_indices() {
        if c.is_whitespace() {
            if let Some(begin) = start {
                result.push(&s[begin..index]);
                start = None;
            }
        } else if start.is_none() {
            start = Some(index);
            if result.len() + 1 == n {
                break;
            }
        }
    }
    if let Some(begin) = start {
        result.push(&s[begin..]);
    }
    result
}
