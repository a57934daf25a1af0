//! Glob matching for pattern subscriptions.
//!
//! Supports `*` (any run of bytes), `?` (any single byte), bracket classes
//! (`[abc]`, `[a-z]`, `[^x]`) and `\` to escape the next byte. An unterminated
//! class runs to the end of the pattern.

/// Returns true if `text` matches the glob `pattern`.
///
/// Runs in `O(pattern * text)`: a mismatch after a `*` resumes from the most
/// recent star instead of recursing.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let tokens = parse(pattern.as_bytes());
    let text = text.as_bytes();

    let (mut p_idx, mut t_idx) = (0usize, 0usize);
    let (mut star_idx, mut match_idx) = (None, 0usize);

    while t_idx < text.len() {
        if let Some(Token::Star) = tokens.get(p_idx) {
            star_idx = Some(p_idx);
            match_idx = t_idx;
            p_idx += 1;
            continue;
        }

        if tokens.get(p_idx).is_some_and(|token| token.accepts(text[t_idx])) {
            p_idx += 1;
            t_idx += 1;
            continue;
        }

        if let Some(star) = star_idx {
            p_idx = star + 1;
            match_idx += 1;
            t_idx = match_idx;
            continue;
        }

        return false;
    }

    while let Some(Token::Star) = tokens.get(p_idx) {
        p_idx += 1;
    }

    p_idx == tokens.len()
}

enum Token {
    Star,
    Any,
    Byte(u8),
    Class { negate: bool, ranges: Vec<(u8, u8)> },
}

impl Token {
    /// Whether this single-byte token accepts `ch`. `Star` is handled by the
    /// matcher loop.
    fn accepts(&self, ch: u8) -> bool {
        match self {
            Token::Star => false,
            Token::Any => true,
            Token::Byte(b) => *b == ch,
            Token::Class { negate, ranges } => {
                ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&ch)) != *negate
            }
        }
    }
}

fn parse(mut pattern: &[u8]) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(pattern.len());
    while let Some((&c, rest)) = pattern.split_first() {
        pattern = rest;
        match c {
            b'*' => {
                if !matches!(tokens.last(), Some(Token::Star)) {
                    tokens.push(Token::Star);
                }
            }
            b'?' => tokens.push(Token::Any),
            b'[' => {
                let (token, after) = parse_class(rest);
                tokens.push(token);
                pattern = after;
            }
            b'\\' if !rest.is_empty() => {
                tokens.push(Token::Byte(rest[0]));
                pattern = &rest[1..];
            }
            _ => tokens.push(Token::Byte(c)),
        }
    }
    tokens
}

/// Parse the class body starting right after `[`. Returns the class and the
/// pattern remaining after the closing `]`.
fn parse_class(class: &[u8]) -> (Token, &[u8]) {
    let (negate, mut class) = match class {
        [b'^', rest @ ..] => (true, rest),
        _ => (false, class),
    };
    let mut ranges = Vec::new();
    loop {
        match class {
            [] => break,
            [b']', rest @ ..] => {
                class = rest;
                break;
            }
            [b'\\', escaped, rest @ ..] => {
                ranges.push((*escaped, *escaped));
                class = rest;
            }
            [lo, b'-', hi, rest @ ..] if *hi != b']' => {
                ranges.push(if lo <= hi { (*lo, *hi) } else { (*hi, *lo) });
                class = rest;
            }
            [c, rest @ ..] => {
                ranges.push((*c, *c));
                class = rest;
            }
        }
    }
    (Token::Class { negate, ranges }, class)
}
