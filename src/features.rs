//! Spam-signal feature extraction from raw post text.
//!
//! Pure single-pass scanner: counts cashtags, mentions, and urls, and
//! measures the uppercase ratio of whatever prose remains once those tokens
//! are stripped. No state, no I/O.

use crate::models::PostFeatures;

/// Compute spam-signal features for a post body.
///
/// - cashtag: `$` followed by 1-5 uppercase ASCII letters
/// - mention: `@` followed by at least one word character
/// - url: `http://` or `https://` followed by at least one non-whitespace char
/// - caps_ratio: uppercase fraction of alphabetic chars outside those tokens
pub fn extract(text: &str) -> PostFeatures {
    let chars: Vec<char> = text.chars().collect();
    let mut cashtag_count = 0u32;
    let mut mention_count = 0u32;
    let mut url_count = 0u32;
    let mut letters = 0u64;
    let mut upper = 0u64;

    let mut i = 0usize;
    while i < chars.len() {
        if let Some(len) = url_len(&chars[i..]) {
            url_count += 1;
            i += len;
            continue;
        }
        if chars[i] == '$' {
            let run = uppercase_run(&chars[i + 1..]);
            if (1..=5).contains(&run) {
                cashtag_count += 1;
                i += 1 + run;
                continue;
            }
        }
        if chars[i] == '@' {
            let run = word_run(&chars[i + 1..]);
            if run > 0 {
                mention_count += 1;
                i += 1 + run;
                continue;
            }
        }

        let c = chars[i];
        if c.is_alphabetic() {
            letters += 1;
            if c.is_uppercase() {
                upper += 1;
            }
        }
        i += 1;
    }

    let caps_ratio = if letters == 0 {
        0.0
    } else {
        upper as f64 / letters as f64
    };

    PostFeatures {
        cashtag_count,
        mention_count,
        url_count,
        caps_ratio,
        is_reply: None,
        is_quote: None,
    }
}

/// Length of a url token starting at `rest[0]`, or None if not a url.
fn url_len(rest: &[char]) -> Option<usize> {
    for scheme in ["https://", "http://"] {
        let prefix: Vec<char> = scheme.chars().collect();
        if rest.len() > prefix.len() && rest[..prefix.len()] == prefix[..] {
            let mut len = prefix.len();
            let mut tail = 0usize;
            while len + tail < rest.len() && !rest[len + tail].is_whitespace() {
                tail += 1;
            }
            if tail > 0 {
                len += tail;
                return Some(len);
            }
        }
    }
    None
}

fn uppercase_run(rest: &[char]) -> usize {
    rest.iter()
        .take_while(|c| c.is_ascii_uppercase())
        .count()
}

fn word_run(rest: &[char]) -> usize {
    rest.iter()
        .take_while(|c| c.is_alphanumeric() || **c == '_')
        .count()
}
