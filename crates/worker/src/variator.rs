//! Message body variation.
//!
//! Every outbound body is rewritten so no two sends are byte-identical:
//! spin tags are resolved, a few dictionary terms may be swapped, invisible
//! code points and punctuation jitter are sprinkled in. Pure functions over
//! the template; determinism is explicitly unwanted.

use rand::seq::SliceRandom;
use rand::Rng;

/// Zero-width code points safe to drop anywhere between characters.
const ZERO_WIDTH: &[char] = &['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}'];

/// Closed emoji set for the optional suffix.
const EMOJI: &[&str] = &["🙂", "👍", "🙌", "✨", "😊", "🤝"];

/// Term → alternatives. Matched on whole lowercase words.
const SYNONYMS: &[(&str, &[&str])] = &[
    ("hello", &["hey", "hi"]),
    ("hi", &["hey", "hello"]),
    ("great", &["awesome", "fantastic"]),
    ("good", &["nice", "solid"]),
    ("thanks", &["thank you", "thx"]),
    ("please", &["pls", "kindly"]),
    ("today", &["right now", "at the moment"]),
    ("offer", &["deal", "promotion"]),
];

/// Produce a varied body from `template`. Steps run in a fixed order; each
/// probabilistic step rolls independently per call.
pub fn vary(template: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut body = resolve_spin(template, &mut rng);
    body = substitute_synonyms(&body, &mut rng);
    body = insert_zero_width(&body, &mut rng);

    // Occasional stray whitespace.
    if rng.gen_bool(0.10) {
        body.push(' ');
    }
    if rng.gen_bool(0.05) {
        body.insert(0, ' ');
    }

    body = jitter_punctuation(body, &mut rng);

    if rng.gen_bool(0.30) {
        body.push(' ');
        body.push_str(EMOJI.choose(&mut rng).unwrap_or(&EMOJI[0]));
    }
    body
}

/// Resolve `{a|b|c}` spin tags by uniform choice, recursively. Text without
/// braces passes through untouched; unbalanced braces are left literal.
pub fn resolve_spin(text: &str, rng: &mut impl Rng) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        match find_matching_brace(&rest[open..]) {
            Some(close) => {
                let inner = &rest[open + 1..open + close];
                let options = split_top_level(inner);
                let pick = options.choose(rng).copied().unwrap_or(inner);
                // Options may nest further spin tags.
                out.push_str(&resolve_spin(pick, rng));
                rest = &rest[open + close + 1..];
            }
            None => {
                // Unbalanced: emit the brace literally and move on.
                out.push('{');
                rest = &rest[open + 1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Index of the brace closing the one at byte 0 of `s`, respecting nesting.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split on `|` at nesting depth zero.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            '|' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Replace dictionary terms with a synonym, 30% per occurrence. Words are
/// matched case-insensitively on alphabetic runs.
fn substitute_synonyms(text: &str, rng: &mut impl Rng) -> String {
    // Tokenize into alternating word / non-word segments.
    let mut segments: Vec<(String, bool)> = Vec::new();
    for c in text.chars() {
        let is_word = c.is_alphabetic();
        match segments.last_mut() {
            Some((seg, word)) if *word == is_word => seg.push(c),
            _ => segments.push((c.to_string(), is_word)),
        }
    }

    let mut out = String::with_capacity(text.len());
    for (seg, is_word) in segments {
        if !is_word {
            out.push_str(&seg);
            continue;
        }
        let lower = seg.to_lowercase();
        let replacement = SYNONYMS
            .iter()
            .find(|(term, _)| *term == lower)
            .filter(|_| rng.gen_bool(0.30))
            .and_then(|(_, alts)| alts.choose(rng).copied());
        match replacement {
            Some(alt) => out.push_str(alt),
            None => out.push_str(&seg),
        }
    }
    out
}

/// Drop one to three zero-width code points at random char boundaries.
fn insert_zero_width(text: &str, rng: &mut impl Rng) -> String {
    let boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    if boundaries.is_empty() {
        return text.to_owned();
    }
    let mut out = text.to_owned();
    let n = rng.gen_range(1..=3);
    for _ in 0..n {
        let at = *boundaries.choose(rng).unwrap_or(&0);
        let zw = *ZERO_WIDTH.choose(rng).unwrap_or(&ZERO_WIDTH[0]);
        // Recompute a valid boundary in the mutated string.
        let at = out
            .char_indices()
            .map(|(i, _)| i)
            .find(|i| *i >= at)
            .unwrap_or(out.len());
        out.insert(at, zw);
    }
    out
}

/// Upgrade a trailing `!` run 20% of the time; add a terminal `.` 10% of
/// the time when the body ends unpunctuated.
fn jitter_punctuation(mut body: String, rng: &mut impl Rng) -> String {
    let trimmed_end = body.trim_end_matches(|c: char| c.is_whitespace()).len();
    let core = &body[..trimmed_end];

    if core.ends_with('!') {
        if rng.gen_bool(0.20) {
            body.insert(trimmed_end, '!');
        }
    } else if !core.ends_with(['.', '?', '…']) && !core.is_empty() && rng.gen_bool(0.10) {
        body.insert(trimmed_end, '.');
    }
    body
}

/// Strip the cosmetic layers `vary` may have added. Tests use this to check
/// the displayed characters survive variation.
pub fn strip_variation(body: &str) -> String {
    let mut s: String = body.chars().filter(|c| !ZERO_WIDTH.contains(c)).collect();
    for emoji in EMOJI {
        if let Some(stripped) = s.strip_suffix(emoji) {
            s = stripped.to_owned();
        }
    }
    let s = s.trim();
    s.trim_end_matches(['!', '.']).to_owned()
}
