//! Human confirmation of sub-threshold candidates and the free-form manual
//! search sub-flow.

use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use log::{debug, info, warn};

use crate::backends::MusicBackend;
use crate::cache_manager::CacheManager;
use crate::matching;
use crate::protocol::{Candidate, QueuedCandidate, SongReference};

/// Action chosen while reviewing a candidate list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmAction {
    /// Zero-based index into the presented list.
    Select(usize),
    Abort,
    Skip,
    Manual,
    Refresh,
}

/// Terminal state of the manual search sub-flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualOutcome {
    Selected(Candidate),
    Refresh,
    Aborted,
    Skipped,
}

/// Interaction seam so the resolver can be exercised without a terminal.
pub trait ConfirmationUi: Send + Sync {
    /// Presents a reviewed candidate list, highest similarity first.
    fn review(&self, candidates: &[QueuedCandidate], query: &SongReference) -> ConfirmAction;

    /// Prompts for free-form search fields. `None` means the user declined.
    fn manual_query(&self, original: &SongReference) -> Option<SongReference>;

    fn confirm_retry(&self, prompt: &str) -> bool;
}

/// Collapses duplicate queue entries and orders the survivors for review.
///
/// Entries sharing a dedup key merge into one candidate carrying the union of
/// their source labels and the maximum of their similarities.
pub fn merge_candidate_queue(queue: Vec<QueuedCandidate>) -> Vec<QueuedCandidate> {
    let mut merged: HashMap<String, QueuedCandidate> = HashMap::new();
    let mut order: Vec<String> = Vec::new();

    for entry in queue {
        let key = entry.dedup_key();
        // All-empty candidates carry nothing worth reviewing.
        if key == "||" {
            continue;
        }
        match merged.get_mut(&key) {
            Some(existing) => {
                for source in &entry.sources {
                    if !existing.sources.contains(source) {
                        existing.sources.push(source.clone());
                    }
                }
                if entry.similarity > existing.similarity {
                    existing.similarity = entry.similarity;
                }
            }
            None => {
                merged.insert(key.clone(), entry);
                order.push(key);
            }
        }
    }

    let mut result: Vec<QueuedCandidate> = order
        .into_iter()
        .filter_map(|key| merged.remove(&key))
        .collect();
    result.sort_by(|left, right| {
        right
            .similarity
            .partial_cmp(&left.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    result
}

/// Interactive free-form search against the backend. Cascades
/// artist+title, album+title, then title-only queries; the user reviews the
/// scored results with the same action set as the confirmation queue.
pub fn manual_track_search(
    backend: &dyn MusicBackend,
    cache: &CacheManager,
    ui: &dyn ConfirmationUi,
    original_query: &SongReference,
) -> ManualOutcome {
    loop {
        let Some(entered) = ui.manual_query(original_query) else {
            return ManualOutcome::Skipped;
        };
        if !entered.has_title() && !entered.has_artist() && !entered.has_album() {
            return ManualOutcome::Skipped;
        }

        let tracks = run_manual_search_queries(backend, &entered);
        if tracks.is_empty() {
            info!("No matching tracks found");
            if ui.confirm_retry("No matches found. Try again?") {
                continue;
            }
            return ManualOutcome::Skipped;
        }

        let mut scored: Vec<QueuedCandidate> = tracks
            .into_iter()
            .map(|candidate| {
                let similarity = matching::score(&entered, &candidate).similarity;
                QueuedCandidate {
                    candidate,
                    similarity,
                    sources: vec!["manual".to_string()],
                    original_query: original_query.clone(),
                    cache_key: cache.make_key(original_query),
                }
            })
            .collect();
        scored.sort_by(|left, right| {
            right
                .similarity
                .partial_cmp(&left.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        match ui.review(&scored, &entered) {
            ConfirmAction::Select(index) => {
                let Some(chosen) = scored.get(index) else {
                    warn!("Selection index out of range");
                    continue;
                };
                if chosen.candidate.backend_id.is_empty() {
                    warn!("Selected track has no backend id");
                    return ManualOutcome::Skipped;
                }
                if original_query.has_title() {
                    cache.set(
                        original_query,
                        Some(&chosen.candidate.backend_id),
                        Some(&chosen.candidate.as_reference()),
                        None,
                    );
                    debug!(
                        "Cached manual selection for original query: {original_query} -> {}",
                        chosen.candidate.backend_id
                    );
                }
                return ManualOutcome::Selected(chosen.candidate.clone());
            }
            ConfirmAction::Abort => return ManualOutcome::Aborted,
            ConfirmAction::Skip => {
                if original_query.has_title() {
                    cache.set(original_query, None, None, None);
                    debug!("Stored negative record for original query: {original_query}");
                }
                return ManualOutcome::Skipped;
            }
            ConfirmAction::Manual => continue,
            ConfirmAction::Refresh => return ManualOutcome::Refresh,
        }
    }
}

fn run_manual_search_queries(backend: &dyn MusicBackend, query: &SongReference) -> Vec<Candidate> {
    let mut tracks = Vec::new();

    if query.has_title() && query.has_artist() {
        match backend.search_tracks(Some(query.title()), Some(query.artist()), None, 50) {
            Ok(found) => {
                debug!("Artist+Title search found {} tracks", found.len());
                tracks = found;
            }
            Err(err) => debug!("Artist+Title search failed: {err}"),
        }
    }

    if tracks.is_empty() && query.has_title() && query.has_album() {
        match backend.search_tracks(Some(query.title()), None, Some(query.album()), 50) {
            Ok(found) => {
                debug!("Album+Title search found {} tracks", found.len());
                tracks = found;
            }
            Err(err) => debug!("Album+Title search failed: {err}"),
        }
    }

    if tracks.is_empty() && query.has_title() {
        match backend.search_tracks(Some(query.title()), None, None, 100) {
            Ok(found) => {
                debug!("Title-only search found {} tracks", found.len());
                tracks = found;
            }
            Err(err) => debug!("Title-only search failed: {err}"),
        }
    }

    tracks
}

/// Stdin/stdout implementation of the review prompt.
pub struct TerminalConfirmation;

impl TerminalConfirmation {
    fn read_line(prompt: &str) -> String {
        print!("{prompt}");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(_) => line.trim().to_string(),
            Err(_) => String::new(),
        }
    }
}

impl ConfirmationUi for TerminalConfirmation {
    fn review(&self, candidates: &[QueuedCandidate], query: &SongReference) -> ConfirmAction {
        println!("\nReview candidate matches for: {query}");
        for (index, entry) in candidates.iter().enumerate() {
            let sources = if entry.sources.is_empty() {
                "direct".to_string()
            } else {
                entry.sources.join(", ")
            };
            println!(
                "{}. {} - {} - {} (Match: {:.2}, Sources: {})",
                index + 1,
                entry.candidate.album,
                entry.candidate.title,
                entry.candidate.artist,
                entry.similarity,
                sources
            );
        }

        loop {
            let input =
                Self::read_line("\n[number] select, [b]ort, [s]kip, [e]nter manually, [r]efresh: ")
                    .to_lowercase();
            match input.as_str() {
                "" => return ConfirmAction::Select(0),
                "b" => return ConfirmAction::Abort,
                "s" => return ConfirmAction::Skip,
                "e" => return ConfirmAction::Manual,
                "r" => return ConfirmAction::Refresh,
                other => {
                    if let Ok(number) = other.parse::<usize>() {
                        if number >= 1 && number <= candidates.len() {
                            return ConfirmAction::Select(number - 1);
                        }
                    }
                    println!("Invalid choice: {other}");
                }
            }
        }
    }

    fn manual_query(&self, original: &SongReference) -> Option<SongReference> {
        println!("\nManual Search");
        println!("Original: {original}");
        println!("Enter search criteria (empty to skip):");
        let title = Self::read_line("Title: ");
        let album = Self::read_line("Album: ");
        let artist = Self::read_line("Artist: ");
        if title.is_empty() && album.is_empty() && artist.is_empty() {
            return None;
        }
        Some(SongReference::new(&title, &artist, &album))
    }

    fn confirm_retry(&self, prompt: &str) -> bool {
        let answer = Self::read_line(&format!("{prompt} (y/N): ")).to_lowercase();
        matches!(answer.as_str(), "y" | "yes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(backend_id: &str, similarity: f64, source: &str) -> QueuedCandidate {
        QueuedCandidate {
            candidate: Candidate {
                title: "Track".to_string(),
                artist: "Artist".to_string(),
                album: "Album".to_string(),
                backend_id: backend_id.to_string(),
                provider_ids: HashMap::new(),
            },
            similarity,
            sources: vec![source.to_string()],
            original_query: SongReference::new("Track", "Artist", "Album"),
            cache_key: "track|artist|album".to_string(),
        }
    }

    #[test]
    fn test_merge_unions_sources_and_keeps_max_similarity() {
        let merged = merge_candidate_queue(vec![
            queued("id-1", 0.55, "backend"),
            queued("id-1", 0.62, "aux"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].sources, vec!["backend", "aux"]);
        assert!((merged[0].similarity - 0.62).abs() < f64::EPSILON);
    }

    #[test]
    fn test_merge_sorts_by_similarity_descending() {
        let merged = merge_candidate_queue(vec![
            queued("low", 0.2, "backend"),
            queued("high", 0.7, "backend"),
            queued("mid", 0.5, "aux"),
        ]);
        let ids: Vec<&str> = merged
            .iter()
            .map(|entry| entry.candidate.backend_id.as_str())
            .collect();
        assert_eq!(ids, vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_merge_falls_back_to_composite_key() {
        let mut left = queued("", 0.4, "backend");
        let mut right = queued("", 0.5, "aux");
        left.candidate.title = "Same".to_string();
        right.candidate.title = "Same".to_string();
        let merged = merge_candidate_queue(vec![left, right]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].sources.len(), 2);
    }
}
