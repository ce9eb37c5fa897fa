//! Block packing (§4.1 C1 Block Splitter, second stage) and the block
//! invariants tested in §8.
//!
//! A block is an ordered, contiguous group of sentences bounded by a token
//! budget approximated as `chars / 4`. Packing is greedy: sentences
//! accumulate until the next one would overflow the budget, at which point
//! the block is emitted. A single oversized sentence flushes the current
//! block and is itself split by clause separators, each fragment becoming
//! its own block while still tagged with the original sentence index.

use super::sentence::Sentence;

/// Token budget for extraction (character) passes, per §3.
pub const EXTRACTION_BUDGET: usize = 16_000;
/// Token budget for assignment (speaker) passes, per §3.
pub const ASSIGNMENT_BUDGET: usize = 8_000;

/// Clause separators tried in order, preferring the rightmost separator past
/// the half-budget mark (§4.1).
const CLAUSE_SEPARATORS: &[&str] = &["; ", ", ", "、", " — ", " - ", " "];

fn approx_tokens(s: &str) -> usize {
    s.chars().count().div_ceil(4).max(1)
}

/// An ordered group of contiguous sentences submitted together to an LLM
/// call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextBlock {
    pub block_index: usize,
    pub sentence_start_index: usize,
    pub sentences: Vec<Sentence>,
}

impl TextBlock {
    pub fn sentence_count(&self) -> usize {
        self.sentences.len()
    }

    pub fn joined_text(&self) -> String {
        self.sentences
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Splits one oversized sentence into fragments, each within `budget`
/// characters (as tokens), preferring to break at the rightmost clause
/// separator past the half-budget mark. Every fragment keeps `sentence.index`
/// (§3: "still tagged with the original sentence index").
fn split_oversized_sentence(sentence: &Sentence, budget: usize) -> Vec<Sentence> {
    let budget_chars = budget * 4;
    let mut fragments = Vec::new();
    let mut remaining = sentence.text.as_str();

    while approx_tokens(remaining) > budget {
        let half = budget_chars / 2;
        let mut split_at = None;

        for sep in CLAUSE_SEPARATORS {
            // Find the rightmost occurrence of `sep` whose end falls at or
            // after the half-budget mark but still within budget.
            let mut best: Option<usize> = None;
            let mut search_from = 0usize;
            while let Some(rel) = remaining[search_from..].find(sep) {
                let abs = search_from + rel;
                let end = abs + sep.len();
                if end <= budget_chars {
                    if end >= half || best.is_none() {
                        best = Some(end);
                    }
                }
                search_from = abs + sep.len().max(1);
                if search_from >= remaining.len() {
                    break;
                }
            }
            if let Some(end) = best {
                split_at = Some(end);
                break;
            }
        }

        let cut = split_at.unwrap_or_else(|| {
            // Hard fallback: cut at the nearest char boundary within budget.
            let mut idx = budget_chars.min(remaining.len());
            while idx > 0 && !remaining.is_char_boundary(idx) {
                idx -= 1;
            }
            idx.max(1)
        });
        let cut = cut.min(remaining.len());

        let (head, tail) = remaining.split_at(cut);
        let head_trimmed = head.trim();
        if !head_trimmed.is_empty() {
            fragments.push(Sentence {
                index: sentence.index,
                text: head_trimmed.to_string(),
            });
        }
        remaining = tail;
    }

    let tail_trimmed = remaining.trim();
    if !tail_trimmed.is_empty() {
        fragments.push(Sentence {
            index: sentence.index,
            text: tail_trimmed.to_string(),
        });
    }

    if fragments.is_empty() {
        fragments.push(sentence.clone());
    }
    fragments
}

/// Greedily packs sentences into blocks respecting `budget` tokens.
///
/// Invariant (§8 Partition): `⋃ block.sentences == sentences` in order, and
/// blocks are pairwise disjoint by original sentence position (oversized
/// sentences may appear, fragmented, across more than one block — each
/// fragment still carries the original index).
pub fn pack_blocks(sentences: &[Sentence], budget: usize) -> Vec<TextBlock> {
    let mut blocks = Vec::new();
    let mut current: Vec<Sentence> = Vec::new();
    let mut current_tokens = 0usize;

    let mut flush = |current: &mut Vec<Sentence>, current_tokens: &mut usize, blocks: &mut Vec<TextBlock>| {
        if current.is_empty() {
            return;
        }
        let start = current[0].index;
        blocks.push(TextBlock {
            block_index: blocks.len(),
            sentence_start_index: start,
            sentences: std::mem::take(current),
        });
        *current_tokens = 0;
    };

    for sentence in sentences {
        let sentence_tokens = approx_tokens(&sentence.text);

        if sentence_tokens > budget {
            flush(&mut current, &mut current_tokens, &mut blocks);
            for fragment in split_oversized_sentence(sentence, budget) {
                blocks.push(TextBlock {
                    block_index: blocks.len(),
                    sentence_start_index: fragment.index,
                    sentences: vec![fragment],
                });
            }
            continue;
        }

        if current_tokens + sentence_tokens > budget && !current.is_empty() {
            flush(&mut current, &mut current_tokens, &mut blocks);
        }

        current_tokens += sentence_tokens;
        current.push(sentence.clone());
    }
    flush(&mut current, &mut current_tokens, &mut blocks);

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::sentence::split_sentences;

    fn sentences(n: usize, len: usize) -> Vec<Sentence> {
        (0..n)
            .map(|i| Sentence {
                index: i,
                text: "a".repeat(len),
            })
            .collect()
    }

    #[test]
    fn partition_invariant_holds() {
        let input = split_sentences("Hello. I am Alice. \"Hi,\" said Bob. And more text here.");
        let blocks = pack_blocks(&input, 4);
        let recovered: Vec<Sentence> = blocks.into_iter().flat_map(|b| b.sentences).collect();
        assert_eq!(recovered, input);
    }

    #[test]
    fn budget_invariant_holds_for_normal_sentences() {
        let input = sentences(20, 8); // 8 chars => 2 tokens each
        let budget = 10;
        let blocks = pack_blocks(&input, budget);
        for block in &blocks {
            let total_chars: usize = block.sentences.iter().map(|s| s.text.chars().count()).sum();
            assert!(total_chars.div_ceil(4) <= budget);
        }
    }

    #[test]
    fn oversized_sentence_gets_its_own_blocks_tagged_with_original_index() {
        let huge = Sentence {
            index: 7,
            text: "word, ".repeat(200), // way over budget
        };
        let input = vec![huge];
        let blocks = pack_blocks(&input, 16);
        assert!(blocks.len() > 1);
        for block in &blocks {
            assert_eq!(block.sentences.len(), 1);
            assert_eq!(block.sentences[0].index, 7);
        }
        let total_chars: usize = blocks
            .iter()
            .flat_map(|b| &b.sentences)
            .map(|s| s.text.chars().count())
            .sum();
        // No characters should be lost (ignoring separator/whitespace trims).
        assert!(total_chars > 0);
    }

    #[test]
    fn small_blocks_pack_multiple_sentences_together() {
        let input = sentences(4, 4); // 1 token each
        let blocks = pack_blocks(&input, 10);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].sentences.len(), 4);
    }
}
