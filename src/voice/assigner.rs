//! C4 Voice Assigner (§4.4).
//!
//! Grounded on the teacher's character/voice wiring in
//! `services::workflow::WorkflowManager::process_chapter`, which builds a
//! speaker-to-voice prompt from `character_map` and the enabled voice list —
//! here split out into its own assignment algorithm with the prominence
//! ordering, round-robin reuse, and insufficient-voice failure §4.4 spells
//! out explicitly.

use std::collections::HashMap;

use crate::cast::{Cast, Gender, RESERVED_NARRATOR};
use crate::error::{ConversionError, ErrorKind};
use crate::voice::{AssignmentGender, Voice, VoicePool};

/// The conversion-wide character name (canonical, case-preserved) to voice
/// assignment, produced by [`assign_voices`] and mutated in place by
/// [`swap`].
#[derive(Debug, Clone, Default)]
pub struct VoiceAssignment {
    map: HashMap<String, Voice>,
    /// Prominence (variation count) recorded alongside each assignment, used
    /// to find the "less prominent character" in a swap.
    prominence: HashMap<String, usize>,
}

impl VoiceAssignment {
    pub fn voice_for(&self, canonical_name: &str) -> Option<&Voice> {
        self.map.get(&key(canonical_name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Voice)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Every `voice_id` here appears in `pool`'s enabled set — the §8 Voice
    /// closure invariant, checkable directly against the pool that produced
    /// this assignment.
    pub fn voice_closure_holds(&self, pool: &VoicePool) -> bool {
        self.map.values().all(|v| pool.contains(&v.full_value))
    }
}

fn key(name: &str) -> String {
    name.trim().to_lowercase()
}

fn to_assignment_gender(g: Gender) -> AssignmentGender {
    match g {
        Gender::Male => AssignmentGender::Male,
        Gender::Female => AssignmentGender::Female,
        Gender::Unknown => AssignmentGender::Unknown,
    }
}

/// Assigns a voice to every character in `cast` (§4.4).
///
/// Fails with `INSUFFICIENT_VOICES` if the enabled pool has fewer than five
/// voices total, or fewer than two male-capable or two female-capable
/// voices (multilingual voices count toward either, §9 Open Question 1).
pub fn assign_voices(
    cast: &Cast,
    mut pool: VoicePool,
    narrator_voice: Voice,
) -> Result<VoiceAssignment, ConversionError> {
    if pool.total_enabled() < 5 || pool.male_capable_count() < 2 || pool.female_capable_count() < 2 {
        return Err(ConversionError::new(
            ErrorKind::InsufficientVoices,
            format!(
                "need at least 5 voices with 2 male and 2 female, got {} total, {} male, {} female",
                pool.total_enabled(),
                pool.male_capable_count(),
                pool.female_capable_count()
            ),
        )
        .with_context("male", pool.male_capable_count().to_string())
        .with_context("female", pool.female_capable_count().to_string()));
    }

    let mut assignment = VoiceAssignment::default();

    let mut characters: Vec<_> = cast
        .characters()
        .iter()
        .filter(|c| !c.canonical_name.eq_ignore_ascii_case(RESERVED_NARRATOR))
        .collect();
    // Descending order of variation count (prominence), §4.4.
    characters.sort_by(|a, b| b.variations.len().cmp(&a.variations.len()));

    assignment.map.insert(key(RESERVED_NARRATOR), narrator_voice);
    assignment
        .prominence
        .insert(key(RESERVED_NARRATOR), usize::MAX);

    for character in characters {
        let voice = pool
            .take(to_assignment_gender(character.gender))
            .expect("round-robin pools never exhaust once non-empty");
        assignment.map.insert(key(&character.canonical_name), voice);
        assignment
            .prominence
            .insert(key(&character.canonical_name), character.variations.len());
    }

    Ok(assignment)
}

/// Review/swap: the user reassigns `character`'s voice to `new_voice`,
/// already held by some other, less prominent character. That character
/// receives `character`'s old voice — a single in-place swap, never a
/// cascade (§4.4). Applying the same swap twice restores the original state
/// (§8 Idempotent assignment swap).
pub fn swap(assignment: &mut VoiceAssignment, character: &str, new_voice_id: &str) {
    let character_key = key(character);
    let Some(current_voice) = assignment.map.get(&character_key).cloned() else {
        return;
    };
    if current_voice.full_value == new_voice_id {
        return;
    }

    // Among every other character currently holding `new_voice_id` (round-robin
    // reuse can mean more than one), the swap goes to the least prominent one.
    let holder = assignment
        .map
        .iter()
        .filter(|(k, v)| **k != character_key && v.full_value == new_voice_id)
        .min_by_key(|(k, _)| assignment.prominence.get(*k).copied().unwrap_or(0))
        .map(|(k, v)| (k.clone(), v.clone()));

    let Some((holder_key, new_voice)) = holder else {
        return;
    };

    assignment.map.insert(holder_key, current_voice);
    assignment.map.insert(character_key, new_voice);
}
