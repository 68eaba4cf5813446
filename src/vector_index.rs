//! In-memory cosine-similarity index over track metadata, with flat-file
//! persistence.
//!
//! Tokens are normalized words plus namespaced 3-char n-grams so the index
//! tolerates minor misspellings without a full catalog scan per lookup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use log::{debug, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::matching::clean_string;
use crate::protocol::{Candidate, SongReference};

const TOKEN_WEIGHTS: [(&str, f64); 3] = [("title", 3.0), ("artist", 2.0), ("album", 1.0)];
const CHAR_NGRAM_SIZE: usize = 3;
pub const MIN_SCORE_DEFAULT: f64 = 0.35;
pub const LIMIT_DEFAULT: usize = 25;

/// One indexed item: weighted token counts, the vector norm, and the source
/// metadata needed to score and surface the item without a backend call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct IndexEntry {
    pub item_id: String,
    pub counts: HashMap<String, f64>,
    pub norm: f64,
    pub metadata: IndexMetadata,
}

/// Track metadata stored alongside each index entry.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct IndexMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    #[serde(default)]
    pub provider_ids: HashMap<String, String>,
}

impl IndexMetadata {
    pub fn from_candidate(candidate: &Candidate) -> Self {
        Self {
            title: candidate.title.clone(),
            artist: candidate.artist.clone(),
            album: candidate.album.clone(),
            provider_ids: candidate.provider_ids.clone(),
        }
    }

    pub fn to_candidate(&self, item_id: &str) -> Candidate {
        Candidate {
            title: self.title.clone(),
            artist: self.artist.clone(),
            album: self.album.clone(),
            backend_id: item_id.to_string(),
            provider_ids: self.provider_ids.clone(),
        }
    }
}

/// Weighted token vector for a query.
#[derive(Debug, Clone, Default)]
pub struct QueryVector {
    pub counts: HashMap<String, f64>,
    pub norm: f64,
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct SavedIndex {
    entries: BTreeMap<String, IndexEntry>,
    token_index: BTreeMap<String, Vec<String>>,
}

/// Normalizes a value for tokenization: matching-engine cleanup plus NFKD
/// accent stripping.
fn normalize_token_text(value: &str) -> String {
    if value.is_empty() {
        return String::new();
    }
    let cleaned = clean_string(value);
    if cleaned.is_empty() {
        return String::new();
    }
    cleaned.nfkd().filter(|ch| !is_combining_mark(*ch)).collect()
}

fn char_ngrams(text: &str, size: usize) -> Vec<String> {
    let compact: Vec<char> = text.chars().filter(|ch| !ch.is_whitespace()).collect();
    if size == 0 || compact.len() < size {
        return Vec::new();
    }
    (0..=compact.len() - size)
        .map(|start| compact[start..start + size].iter().collect())
        .collect()
}

fn tokenize_metadata(title: &str, artist: &str, album: &str) -> HashMap<String, f64> {
    let mut counts: HashMap<String, f64> = HashMap::new();
    for (field, weight) in TOKEN_WEIGHTS {
        let raw = match field {
            "title" => title,
            "artist" => artist,
            _ => album,
        };
        let normalized = normalize_token_text(raw);
        if normalized.is_empty() {
            continue;
        }

        for token in normalized.split_whitespace() {
            *counts.entry(token.to_string()).or_insert(0.0) += weight;
        }

        // Lightweight char n-grams to tolerate minor misspellings.
        let ngram_weight = (weight - 1.0).max(1.0);
        for ngram in char_ngrams(&normalized, CHAR_NGRAM_SIZE) {
            *counts.entry(format!("ng:{ngram}")).or_insert(0.0) += ngram_weight;
        }
    }
    counts
}

fn vector_norm(counts: &HashMap<String, f64>) -> f64 {
    counts.values().map(|value| value * value).sum::<f64>().sqrt()
}

/// Cosine-similarity index with an inverted token -> item-id map.
#[derive(Debug, Default)]
pub struct VectorIndex {
    entries: HashMap<String, IndexEntry>,
    token_index: HashMap<String, HashSet<String>>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.entries.contains_key(item_id)
    }

    /// Adds an item; returns false when it produced no indexable tokens.
    pub fn add_item(&mut self, item_id: &str, metadata: IndexMetadata) -> bool {
        let counts = tokenize_metadata(&metadata.title, &metadata.artist, &metadata.album);
        if counts.is_empty() {
            return false;
        }
        let norm = vector_norm(&counts);
        if norm == 0.0 {
            return false;
        }

        for token in counts.keys() {
            self.token_index
                .entry(token.clone())
                .or_default()
                .insert(item_id.to_string());
        }
        self.entries.insert(
            item_id.to_string(),
            IndexEntry {
                item_id: item_id.to_string(),
                counts,
                norm,
                metadata,
            },
        );
        true
    }

    /// Removes an item and its postings if present.
    pub fn remove_item(&mut self, item_id: &str) -> bool {
        let Some(entry) = self.entries.remove(item_id) else {
            return false;
        };
        for token in entry.counts.keys() {
            if let Some(bucket) = self.token_index.get_mut(token) {
                bucket.remove(item_id);
                if bucket.is_empty() {
                    self.token_index.remove(token);
                }
            }
        }
        true
    }

    /// Replaces an item atomically (remove then add).
    pub fn upsert_item(&mut self, item_id: &str, metadata: IndexMetadata) -> bool {
        self.remove_item(item_id);
        self.add_item(item_id, metadata)
    }

    pub fn build_query_vector(&self, query: &SongReference) -> QueryVector {
        let counts = tokenize_metadata(query.title(), query.artist(), query.album());
        let norm = vector_norm(&counts);
        QueryVector { counts, norm }
    }

    /// Ranked candidates for a query vector.
    ///
    /// The candidate set is the union of postings for the query's tokens, so
    /// lookup cost is bounded by token overlap, not catalog size.
    pub fn candidate_scores(
        &self,
        query: &QueryVector,
        limit: usize,
        min_score: f64,
    ) -> Vec<(&IndexEntry, f64)> {
        if query.counts.is_empty() || query.norm == 0.0 {
            return Vec::new();
        }

        let mut candidate_ids: HashSet<&String> = HashSet::new();
        for token in query.counts.keys() {
            if let Some(bucket) = self.token_index.get(token) {
                candidate_ids.extend(bucket.iter());
            }
        }

        let mut scored: Vec<(&IndexEntry, f64)> = Vec::new();
        for item_id in candidate_ids {
            let Some(entry) = self.entries.get(item_id) else {
                continue;
            };
            if entry.norm == 0.0 {
                continue;
            }

            let dot: f64 = query
                .counts
                .iter()
                .filter(|(_, weight)| **weight != 0.0)
                .map(|(token, weight)| weight * entry.counts.get(token).copied().unwrap_or(0.0))
                .sum();
            if dot <= 0.0 {
                continue;
            }

            let score = dot / (query.norm * entry.norm);
            if score < min_score {
                continue;
            }
            scored.push((entry, score));
        }

        // Secondary key keeps ordering deterministic across identical scores.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.item_id.cmp(&b.0.item_id))
        });
        scored.truncate(limit);
        scored
    }

    /// Saves the index to a flat JSON file.
    pub fn save_to_file(&self, path: &Path) -> bool {
        let saved = SavedIndex {
            entries: self
                .entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.clone()))
                .collect(),
            token_index: self
                .token_index
                .iter()
                .map(|(token, ids)| {
                    let mut sorted: Vec<String> = ids.iter().cloned().collect();
                    sorted.sort();
                    (token.clone(), sorted)
                })
                .collect(),
        };

        let write = || -> Result<(), String> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|err| err.to_string())?;
            }
            let payload = serde_json::to_vec(&saved).map_err(|err| err.to_string())?;
            std::fs::write(path, payload).map_err(|err| err.to_string())
        };

        match write() {
            Ok(()) => {
                debug!("Vector index saved to {}", path.display());
                true
            }
            Err(err) => {
                warn!("Failed to save vector index: {err}");
                false
            }
        }
    }

    /// Loads the index from a saved file, fully replacing the in-memory state.
    pub fn load_from_file(&mut self, path: &Path) -> bool {
        if !path.exists() {
            return false;
        }

        let read = || -> Result<SavedIndex, String> {
            let payload = std::fs::read(path).map_err(|err| err.to_string())?;
            serde_json::from_slice(&payload).map_err(|err| err.to_string())
        };

        let saved = match read() {
            Ok(saved) => saved,
            Err(err) => {
                warn!("Failed to load vector index: {err}");
                return false;
            }
        };

        self.entries.clear();
        self.token_index.clear();
        for (item_id, entry) in saved.entries {
            self.entries.insert(item_id, entry);
        }
        for (token, ids) in saved.token_index {
            self.token_index.insert(token, ids.into_iter().collect());
        }

        debug!(
            "Vector index loaded from {} ({} items)",
            path.display(),
            self.entries.len()
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(title: &str, artist: &str, album: &str) -> IndexMetadata {
        IndexMetadata {
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            provider_ids: Default::default(),
        }
    }

    fn sample_index() -> VectorIndex {
        let mut index = VectorIndex::new();
        index.add_item("10", metadata("Kesariya", "Arijit Singh", "Brahmastra"));
        index.add_item("11", metadata("Chaleya", "Anirudh Ravichander", "Jawan"));
        index.add_item("12", metadata("Apna Bana Le", "Arijit Singh", "Bhediya"));
        index
    }

    #[test]
    fn test_add_and_retrieve_ranks_exact_match_first() {
        let index = sample_index();
        let query = index.build_query_vector(&SongReference::new(
            "Kesariya",
            "Arijit Singh",
            "Brahmastra",
        ));
        let results = index.candidate_scores(&query, LIMIT_DEFAULT, MIN_SCORE_DEFAULT);
        assert!(!results.is_empty());
        assert_eq!(results[0].0.item_id, "10");
        assert!(results[0].1 > 0.99);
    }

    #[test]
    fn test_ngrams_tolerate_misspelling() {
        let index = sample_index();
        let query = index.build_query_vector(&SongReference::new("Kesarya", "Arijit Singh", ""));
        let results = index.candidate_scores(&query, LIMIT_DEFAULT, MIN_SCORE_DEFAULT);
        assert!(!results.is_empty());
        assert_eq!(results[0].0.item_id, "10");
    }

    #[test]
    fn test_empty_metadata_is_never_indexed() {
        let mut index = VectorIndex::new();
        assert!(!index.add_item("1", metadata("", "", "")));
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn test_remove_drops_postings() {
        let mut index = sample_index();
        assert!(index.remove_item("10"));
        assert!(!index.remove_item("10"));
        let query = index.build_query_vector(&SongReference::new(
            "Kesariya",
            "Arijit Singh",
            "Brahmastra",
        ));
        let results = index.candidate_scores(&query, LIMIT_DEFAULT, MIN_SCORE_DEFAULT);
        assert!(results.iter().all(|(entry, _)| entry.item_id != "10"));
    }

    #[test]
    fn test_upsert_replaces_entry() {
        let mut index = sample_index();
        index.upsert_item("10", metadata("Completely Different", "Someone", "Nothing"));
        assert_eq!(index.len(), 3);
        let query = index.build_query_vector(&SongReference::new("Completely Different", "", ""));
        let results = index.candidate_scores(&query, LIMIT_DEFAULT, MIN_SCORE_DEFAULT);
        assert_eq!(results[0].0.item_id, "10");
    }

    #[test]
    fn test_save_load_round_trip_preserves_scores() {
        let index = sample_index();
        let query_ref = SongReference::new("Chaleya", "Anirudh", "");
        let query = index.build_query_vector(&query_ref);
        let before: Vec<(String, f64)> = index
            .candidate_scores(&query, LIMIT_DEFAULT, 0.0)
            .into_iter()
            .map(|(entry, score)| (entry.item_id.clone(), score))
            .collect();

        let path = std::env::temp_dir().join(format!(
            "tunebridge-index-test-{}.json",
            std::process::id()
        ));
        assert!(index.save_to_file(&path));

        let mut restored = VectorIndex::new();
        assert!(restored.load_from_file(&path));
        let _ = std::fs::remove_file(&path);

        assert_eq!(restored.len(), index.len());
        let query = restored.build_query_vector(&query_ref);
        let after: Vec<(String, f64)> = restored
            .candidate_scores(&query, LIMIT_DEFAULT, 0.0)
            .into_iter()
            .map(|(entry, score)| (entry.item_id.clone(), score))
            .collect();
        assert_eq!(before.len(), after.len());
        for ((id_before, score_before), (id_after, score_after)) in before.iter().zip(&after) {
            assert_eq!(id_before, id_after);
            assert!((score_before - score_after).abs() < 1e-9);
        }
    }

    #[test]
    fn test_accent_folding_matches_ascii_query() {
        let mut index = VectorIndex::new();
        index.add_item("20", metadata("Beyoncé Halo", "Beyoncé", ""));
        let query = index.build_query_vector(&SongReference::new("Beyonce Halo", "Beyonce", ""));
        let results = index.candidate_scores(&query, LIMIT_DEFAULT, MIN_SCORE_DEFAULT);
        assert!(!results.is_empty());
        assert_eq!(results[0].0.item_id, "20");
    }
}
