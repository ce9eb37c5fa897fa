//! Voice model and C2 Voice Pool Builder (§4.2).
//!
//! The teacher crate's `services::tts::Voice` + `pick_random_voice` filter
//! a flat voice list by gender/locale/exclusion and hand back a random pick.
//! The pool here keeps the same `Voice` shape but exposes stable
//! `take`/`release` round-robin semantics instead of randomness, since §4.2
//! and the assignment invariants in §8 require deterministic, reusable
//! sub-pools rather than a one-shot random draw.

pub mod assigner;

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VoiceGender {
    Male,
    Female,
    /// A voice the source marks "multilingual" — a wildcard that can
    /// satisfy either gender quota in §4.4 (§9 Open Question 1).
    Multilingual,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voice {
    pub full_value: String,
    pub locale: String,
    pub gender: VoiceGender,
    pub name: String,
}

/// Filters a raw voice catalog by locale prefix and exclusion list before
/// it reaches the pool, the way the teacher's `process_chapter` filters
/// `tts.list_voices()` ahead of gender bucketing.
pub fn filter_voices(catalog: Vec<Voice>, language_prefix: &str, exclude_locales: &[String]) -> Vec<Voice> {
    catalog
        .into_iter()
        .filter(|v| v.locale.starts_with(language_prefix) && !exclude_locales.contains(&v.locale))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignmentGender {
    Male,
    Female,
    Unknown,
}

/// Curated, enabled voices split into gender sub-pools, with round-robin
/// `take`/`release` (§4.2).
#[derive(Debug, Clone)]
pub struct VoicePool {
    male: VecDeque<Voice>,
    female: VecDeque<Voice>,
    multilingual: VecDeque<Voice>,
    use_count: std::collections::HashMap<String, usize>,
}

impl VoicePool {
    pub fn new(enabled: Vec<Voice>) -> Self {
        let mut male = VecDeque::new();
        let mut female = VecDeque::new();
        let mut multilingual = VecDeque::new();
        let mut use_count = std::collections::HashMap::new();

        for voice in enabled {
            use_count.insert(voice.full_value.clone(), 0);
            match voice.gender {
                VoiceGender::Male => male.push_back(voice),
                VoiceGender::Female => female.push_back(voice),
                VoiceGender::Multilingual => multilingual.push_back(voice),
            }
        }

        Self {
            male,
            female,
            multilingual,
            use_count,
        }
    }

    pub fn total_enabled(&self) -> usize {
        self.male.len() + self.female.len() + self.multilingual.len()
    }

    /// Male voices plus multilingual wildcards, which satisfy either quota.
    pub fn male_capable_count(&self) -> usize {
        self.male.len() + self.multilingual.len()
    }

    pub fn female_capable_count(&self) -> usize {
        self.female.len() + self.multilingual.len()
    }

    fn rotate_take(pool: &mut VecDeque<Voice>) -> Option<Voice> {
        let voice = pool.pop_front()?;
        pool.push_back(voice.clone());
        Some(voice)
    }

    /// Returns the next voice for `gender` in round-robin order. `unknown`
    /// prefers the least-used voice across the whole pool (§4.2).
    pub fn take(&mut self, gender: AssignmentGender) -> Option<Voice> {
        let voice = match gender {
            AssignmentGender::Male => Self::rotate_take(&mut self.male)
                .or_else(|| Self::rotate_take(&mut self.multilingual)),
            AssignmentGender::Female => Self::rotate_take(&mut self.female)
                .or_else(|| Self::rotate_take(&mut self.multilingual)),
            AssignmentGender::Unknown => self.take_least_used(),
        }?;
        *self.use_count.entry(voice.full_value.clone()).or_insert(0) += 1;
        Some(voice)
    }

    fn take_least_used(&mut self) -> Option<Voice> {
        let least_used_id = self
            .use_count
            .iter()
            .min_by_key(|(_, count)| **count)
            .map(|(id, _)| id.clone())?;

        for pool in [&mut self.male, &mut self.female, &mut self.multilingual] {
            if let Some(pos) = pool.iter().position(|v| v.full_value == least_used_id) {
                let voice = pool.remove(pos).unwrap();
                pool.push_back(voice.clone());
                return Some(voice);
            }
        }
        None
    }

    /// Marks `voice_id` as free for reuse. Round-robin pools are never
    /// exhausted in practice (§4.4's reuse), so release is purely
    /// bookkeeping for `take(unknown)`'s least-used preference.
    pub fn release(&mut self, voice_id: &str) {
        if let Some(count) = self.use_count.get_mut(voice_id) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn contains(&self, voice_id: &str) -> bool {
        self.use_count.contains_key(voice_id)
    }
}
