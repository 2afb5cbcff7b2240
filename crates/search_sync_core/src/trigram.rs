//! pg_trgm-compatible trigram scoring for the in-memory ranking store.
//!
//! Words are runs of alphanumeric characters, lower-cased and padded as
//! `"  word "`, exactly as pg_trgm does before extracting trigrams.

use std::collections::HashSet;

type Trigram = [char; 3];

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

fn word_trigrams(word: &str) -> Vec<Trigram> {
    let padded: Vec<char> = "  ".chars().chain(word.chars()).chain([' ']).collect();
    padded.windows(3).map(|w| [w[0], w[1], w[2]]).collect()
}

/// Trigrams of `text` in order of appearance, duplicates kept.
fn ordered_trigrams(text: &str) -> Vec<Trigram> {
    words(text).flat_map(|w| word_trigrams(&w)).collect()
}

fn trigram_set(text: &str) -> HashSet<Trigram> {
    ordered_trigrams(text).into_iter().collect()
}

/// `similarity(a, b)`: shared trigrams over the union of both sets.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a = trigram_set(a);
    let b = trigram_set(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(&b).count();
    shared as f64 / (a.len() + b.len() - shared) as f64
}

/// `word_similarity(query, text)`: best [`similarity`] between the query's
/// trigram set and any contiguous extent of `text`'s ordered trigrams.
pub fn word_similarity(query: &str, text: &str) -> f64 {
    let query = trigram_set(query);
    let text = ordered_trigrams(text);
    if query.is_empty() || text.is_empty() {
        return 0.0;
    }

    let mut best = 0.0_f64;
    for start in 0..text.len() {
        if !query.contains(&text[start]) {
            continue;
        }
        let mut seen: HashSet<Trigram> = HashSet::new();
        let mut shared = 0usize;
        for trigram in &text[start..] {
            if seen.insert(*trigram) && query.contains(trigram) {
                shared += 1;
            }
            let union = query.len() + seen.len() - shared;
            best = best.max(shared as f64 / union as f64);
            if shared == query.len() && best >= 1.0 {
                return 1.0;
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn word_similarity_matches_pg_trgm_docs() {
        // SELECT word_similarity('word', 'two words') → 0.8
        assert!(approx(word_similarity("word", "two words"), 0.8));
    }

    #[test]
    fn prefix_of_a_word_scores_high() {
        let score = word_similarity("baro", "barossa valley shiraz");
        assert!(approx(score, 0.8), "got {score}");
        assert_eq!(word_similarity("zzz999", "barossa valley shiraz"), 0.0);
    }

    #[test]
    fn similarity_is_symmetric_and_bounded() {
        let a = similarity("sassicaia", "sasicaia");
        let b = similarity("sasicaia", "sassicaia");
        assert!(approx(a, b));
        assert!(a > 0.5 && a < 1.0);
        assert!(approx(similarity("Tuscany", "tuscany"), 1.0));
        assert_eq!(similarity("", "tuscany"), 0.0);
    }

    #[test]
    fn cyrillic_is_alphanumeric() {
        assert!(word_similarity("красн", "красное сухое") > 0.5);
    }
}
