//! Word-aligned composition of redacted answers
//!
//! Redaction detectors return the answer with offending words replaced by
//! an inline marker (`***`, `XXXXX`, `[PASSPORT]`). Each detector only
//! masks what it found, so the final answer is built by aligning the
//! detectors' outputs word by word and dropping every position any of
//! them marked. Whitespace between surviving words is taken from the first
//! source, so line breaks and indentation of the answer are kept.

/// Trailing punctuation ignored when classifying a word
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?'];

/// Whether `word` is a redaction marker rather than answer text
///
/// A marker is at least two characters long and is either made only of
/// non-alphanumeric characters, a single repeated non-digit character
/// (`XXXX`, `xx`), or a bracketed placeholder such as `[NAME]`, `<PHONE>`
/// or `{ADDRESS}`. Numbers like `22` or `000` are answer text.
pub fn is_redaction_marker(word: &str) -> bool {
    let word = word.trim_end_matches(TRAILING_PUNCTUATION);
    let chars: Vec<char> = word.chars().collect();
    if chars.len() < 2 {
        return false;
    }

    if chars.iter().all(|c| !c.is_alphanumeric()) {
        return true;
    }
    if !chars[0].is_numeric() && chars.iter().all(|c| *c == chars[0]) {
        return true;
    }

    matches!(
        (chars[0], chars[chars.len() - 1]),
        ('[', ']') | ('<', '>') | ('{', '}')
    )
}

/// Byte ranges of the whitespace-separated words of `text`
fn word_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, text.len()));
    }
    spans
}

/// Compose several masked versions of the same answer into one
///
/// Returns `None` when the sources disagree on the number of words, in
/// which case positions cannot be aligned. Surviving words are joined by
/// the whitespace that followed the previous surviving word in the first
/// source; leading and trailing whitespace of the first source is kept.
pub fn compose_masks(sources: &[&str]) -> Option<String> {
    let base = *sources.first()?;
    let spans: Vec<Vec<(usize, usize)>> = sources.iter().map(|source| word_spans(source)).collect();

    let first = &spans[0];
    if spans.iter().any(|words| words.len() != first.len()) {
        return None;
    }

    let marked = |i: usize| {
        sources
            .iter()
            .zip(&spans)
            .any(|(source, words)| is_redaction_marker(&source[words[i].0..words[i].1]))
    };

    let Some(&(first_start, _)) = first.first() else {
        return Some(base.to_string());
    };
    let mut composed = String::with_capacity(base.len());
    composed.push_str(&base[..first_start]);

    let mut previous: Option<usize> = None;
    for i in (0..first.len()).filter(|&i| !marked(i)) {
        if let Some(p) = previous {
            composed.push_str(&base[first[p].1..first[p + 1].0]);
        }
        composed.push_str(&base[first[i].0..first[i].1]);
        previous = Some(i);
    }

    if let Some(&(_, last_end)) = first.last() {
        composed.push_str(&base[last_end..]);
    }
    Some(composed)
}
