//! Character model and C3 Character Aggregator (§4.3).
//!
//! The teacher crate's `core::state::{CharacterInfo, CharacterMap}` keep a
//! flat name-keyed map persisted to `character_map.json` across chapters.
//! The core's `Character`/`Cast` keep the same shape but add the
//! `variations` list and merge rule §4.3 actually requires, since the
//! teacher never needed to reconcile two *different* names for the same
//! person within a single LLM pass.

pub const RESERVED_NARRATOR: &str = "Narrator";
pub const RESERVED_SYSTEM: &str = "System";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

/// One LLM-reported character observation from a single extraction block,
/// prior to cross-block merging.
#[derive(Debug, Clone)]
pub struct Character {
    pub canonical_name: String,
    pub variations: Vec<String>,
    pub gender: Gender,
}

/// The merged, conversion-wide cast produced by C3. Canonical names are
/// unique case-insensitively; `Narrator` and `System` are always present.
#[derive(Debug, Clone, Default)]
pub struct Cast {
    characters: Vec<Character>,
}

impl Cast {
    pub fn characters(&self) -> &[Character] {
        &self.characters
    }

    pub fn contains(&self, canonical_name: &str) -> bool {
        self.characters
            .iter()
            .any(|c| c.canonical_name.eq_ignore_ascii_case(canonical_name))
    }

    pub fn get(&self, canonical_name: &str) -> Option<&Character> {
        self.characters
            .iter()
            .find(|c| c.canonical_name.eq_ignore_ascii_case(canonical_name))
    }
}

fn norm(s: &str) -> String {
    s.trim().to_lowercase()
}

/// All names (canonical + variations) a character entry is known by, for
/// the "any match" merge test in §4.3.
fn identity_set(c: &Character) -> Vec<String> {
    let mut set = vec![norm(&c.canonical_name)];
    set.extend(c.variations.iter().map(|v| norm(v)));
    set
}

fn identities_overlap(a: &Character, b: &Character) -> bool {
    let a_set = identity_set(a);
    let b_set = identity_set(b);
    a_set.iter().any(|x| b_set.contains(x))
}

fn resolve_gender(votes: &[Gender]) -> Gender {
    let mut male = 0usize;
    let mut female = 0usize;
    for v in votes {
        match v {
            Gender::Male => male += 1,
            Gender::Female => female += 1,
            Gender::Unknown => {}
        }
    }
    // "any definite vote (male/female) beating unknown" — among definite
    // votes we take a simple majority, ties broken toward the first
    // definite gender encountered.
    if male == 0 && female == 0 {
        return Gender::Unknown;
    }
    if male >= female {
        Gender::Male
    } else {
        Gender::Female
    }
}

/// Merges per-block character observations into one canonical cast (§4.3).
///
/// Merge rule: two entries are the same character iff any of their
/// `variations ∪ {canonical_name}` match case-insensitively after trimming.
/// The canonical name from the entry with the most variations wins, ties
/// broken by first occurrence. Gender resolves by majority vote, with any
/// definite vote beating `unknown`. `Narrator` and `System` are injected if
/// absent.
pub fn aggregate(blocks: Vec<Vec<Character>>) -> Cast {
    let mut merged: Vec<Character> = Vec::new();

    for block in blocks {
        for incoming in block {
            if let Some(existing_idx) = merged
                .iter()
                .position(|existing| identities_overlap(existing, &incoming))
            {
                let existing = &mut merged[existing_idx];
                let existing_variation_count = existing.variations.len();
                let incoming_variation_count = incoming.variations.len();

                // Canonical name from the entry with the most variations
                // wins; ties keep the first occurrence (existing).
                if incoming_variation_count > existing_variation_count {
                    existing.canonical_name = incoming.canonical_name.clone();
                }

                for v in incoming.variations {
                    if !existing.variations.iter().any(|e| norm(e) == norm(&v)) {
                        existing.variations.push(v);
                    }
                }
                if !existing
                    .variations
                    .iter()
                    .any(|v| norm(v) == norm(&incoming.canonical_name))
                    && norm(&incoming.canonical_name) != norm(&existing.canonical_name)
                {
                    existing.variations.push(incoming.canonical_name.clone());
                }

                existing.gender = resolve_gender(&[existing.gender, incoming.gender]);
            } else {
                merged.push(incoming);
            }
        }
    }

    for reserved in [RESERVED_NARRATOR, RESERVED_SYSTEM] {
        if !merged
            .iter()
            .any(|c| c.canonical_name.eq_ignore_ascii_case(reserved))
        {
            merged.push(Character {
                canonical_name: reserved.to_string(),
                variations: Vec::new(),
                gender: Gender::Unknown,
            });
        }
    }

    Cast { characters: merged }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(name: &str, variations: &[&str], gender: Gender) -> Character {
        Character {
            canonical_name: name.to_string(),
            variations: variations.iter().map(|s| s.to_string()).collect(),
            gender,
        }
    }

    #[test]
    fn reserved_names_always_present() {
        let cast = aggregate(vec![]);
        assert!(cast.contains("Narrator"));
        assert!(cast.contains("System"));
    }

    #[test]
    fn merges_by_variation_overlap_case_insensitively() {
        let block1 = vec![character("Al", &["Alice"], Gender::Female)];
        let block2 = vec![character("alice", &[], Gender::Female)];
        let cast = aggregate(vec![block1, block2]);
        let alice_entries: Vec<_> = cast
            .characters()
            .iter()
            .filter(|c| c.canonical_name.eq_ignore_ascii_case("Al") || c.canonical_name.eq_ignore_ascii_case("alice"))
            .collect();
        assert_eq!(alice_entries.len(), 1);
    }

    #[test]
    fn canonical_name_from_most_variations_wins() {
        let block1 = vec![character("Bob", &[], Gender::Male)];
        let block2 = vec![character("Robert", &["Bob", "Bobby", "Rob"], Gender::Male)];
        let cast = aggregate(vec![block1, block2]);
        assert!(cast.get("Robert").is_some());
        assert!(cast.get("Bob").is_none() || cast.get("Bob").unwrap().canonical_name == "Robert");
    }

    #[test]
    fn definite_gender_beats_unknown() {
        let block1 = vec![character("Sam", &[], Gender::Unknown)];
        let block2 = vec![character("Sam", &[], Gender::Female)];
        let cast = aggregate(vec![block1, block2]);
        assert_eq!(cast.get("Sam").unwrap().gender, Gender::Female);
    }

    #[test]
    fn canonical_names_unique_case_insensitively() {
        let block = vec![character("Eve", &[], Gender::Female), character("eve", &[], Gender::Female)];
        let cast = aggregate(vec![block]);
        let count = cast
            .characters()
            .iter()
            .filter(|c| c.canonical_name.eq_ignore_ascii_case("eve"))
            .count();
        assert_eq!(count, 1);
    }
}
