//! Sentence-aware segmentation (§4.1 C1 Block Splitter, first stage).
//!
//! Paragraph boundaries (`\n\s*\n`) are hard splits. Within a paragraph,
//! sentence termination is `[.!?…]` followed by whitespace or end-of-text,
//! suppressed while inside quotation marks. Runs of three or more periods are
//! treated as a single ellipsis terminator (§9 Open Question 2).

use regex::Regex;
use std::sync::OnceLock;

/// A pronounceable text unit with a stable integer index within a
/// conversion. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub index: usize,
    pub text: String,
}

const ABBREVIATIONS: &[&str] = &[
    "Mr", "Mrs", "Ms", "Dr", "Prof", "Sr", "Jr", "Inc", "Ltd", "т", "п", "д", "г", "гг", "др",
    "пр", "ул", "и",
];

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").unwrap())
}

fn is_opening_quote(c: char) -> bool {
    matches!(c, '"' | '\u{201C}' | '\u{00AB}')
}

fn is_closing_quote(c: char) -> bool {
    matches!(c, '"' | '\u{201D}' | '\u{00BB}')
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '\u{2026}')
}

fn contains_letter_or_digit(s: &str) -> bool {
    s.chars().any(|c| c.is_alphanumeric())
}

/// Returns true if `word` (the run of non-whitespace immediately preceding
/// the terminator, without trailing punctuation) is a known abbreviation.
fn ends_with_abbreviation(preceding: &str) -> bool {
    let trimmed = preceding.trim_end_matches(|c: char| !c.is_alphanumeric());
    let last_word = trimmed
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("");
    ABBREVIATIONS.iter().any(|abbr| *abbr == last_word)
}

/// Splits one paragraph (no embedded blank lines) into sentences.
fn split_paragraph_sentences(paragraph: &str, start_index: usize) -> Vec<Sentence> {
    let chars: Vec<char> = paragraph.chars().collect();
    let mut sentences = Vec::new();
    let mut quote_depth: i32 = 0;
    let mut current_start = 0usize;
    let mut index = start_index;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        if is_opening_quote(c) && !is_closing_quote(c) {
            quote_depth += 1;
        } else if is_closing_quote(c) {
            quote_depth = (quote_depth - 1).max(0);
        }

        if is_terminator(c) && quote_depth == 0 {
            // Consume a run of terminators (handles `...` and `.....`).
            let mut j = i + 1;
            while j < chars.len() && is_terminator(chars[j]) {
                j += 1;
            }
            let followed_by_boundary = j >= chars.len() || chars[j].is_whitespace();

            let preceding: String = chars[current_start..i].iter().collect();
            let is_abbrev = c == '.' && ends_with_abbreviation(&preceding);

            if followed_by_boundary && !is_abbrev {
                let text: String = chars[current_start..j].iter().collect();
                let trimmed = text.trim();
                if contains_letter_or_digit(trimmed) {
                    sentences.push(Sentence {
                        index,
                        text: trimmed.to_string(),
                    });
                    index += 1;
                }
                // Skip the whitespace boundary.
                let mut k = j;
                while k < chars.len() && chars[k].is_whitespace() {
                    k += 1;
                }
                current_start = k;
                i = k;
                continue;
            }
            i = j;
            continue;
        }
        i += 1;
    }

    if current_start < chars.len() {
        let text: String = chars[current_start..].iter().collect();
        let trimmed = text.trim();
        if contains_letter_or_digit(trimmed) {
            sentences.push(Sentence {
                index,
                text: trimmed.to_string(),
            });
        }
    }

    sentences
}

/// Splits a raw text blob into sentences with stable, conversion-wide
/// indices, honoring paragraph boundaries as hard splits.
pub fn split_sentences(text: &str) -> Vec<Sentence> {
    let mut sentences = Vec::new();
    let mut next_index = 0usize;
    let mut last_end = 0usize;

    for m in paragraph_re().find_iter(text) {
        let paragraph = &text[last_end..m.start()];
        let mut batch = split_paragraph_sentences(paragraph, next_index);
        next_index += batch.len();
        sentences.append(&mut batch);
        last_end = m.end();
    }
    let tail = &text[last_end..];
    let mut batch = split_paragraph_sentences(tail, next_index);
    sentences.append(&mut batch);

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_sentences() {
        let s = split_sentences("Hello. I am Alice. \"Hi,\" said Bob.");
        let texts: Vec<&str> = s.iter().map(|x| x.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello.", "I am Alice.", "\"Hi,\" said Bob."]);
        assert_eq!(s[0].index, 0);
        assert_eq!(s[2].index, 2);
    }

    #[test]
    fn suppresses_terminators_inside_quotes() {
        let s = split_sentences("\"Wait. Stop!\" she said. Then she left.");
        let texts: Vec<&str> = s.iter().map(|x| x.text.as_str()).collect();
        assert_eq!(texts, vec!["\"Wait. Stop!\" she said.", "Then she left."]);
    }

    #[test]
    fn abbreviations_do_not_terminate() {
        let s = split_sentences("Dr. Smith arrived. He was late.");
        let texts: Vec<&str> = s.iter().map(|x| x.text.as_str()).collect();
        assert_eq!(texts, vec!["Dr. Smith arrived.", "He was late."]);
    }

    #[test]
    fn ellipsis_runs_are_single_terminator() {
        let s = split_sentences("Well..... I suppose so. Truly.");
        let texts: Vec<&str> = s.iter().map(|x| x.text.as_str()).collect();
        assert_eq!(texts, vec!["Well.....", "I suppose so.", "Truly."]);
    }

    #[test]
    fn paragraph_boundaries_are_hard_splits() {
        let s = split_sentences("First part no terminator\n\nSecond part no terminator");
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].text, "First part no terminator");
        assert_eq!(s[1].text, "Second part no terminator");
    }

    #[test]
    fn sentences_without_letters_or_digits_are_dropped() {
        let s = split_sentences("Hello. ... ! More text.");
        let texts: Vec<&str> = s.iter().map(|x| x.text.as_str()).collect();
        assert_eq!(texts, vec!["Hello.", "More text."]);
    }

    #[test]
    fn indices_are_stable_and_contiguous() {
        let s = split_sentences("A. B. C.");
        let indices: Vec<usize> = s.iter().map(|x| x.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
