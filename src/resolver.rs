//! Multi-stage resolution of noisy song references to library tracks.
//!
//! Each request runs the same cascade: cache lookup, local index scan,
//! multi-strategy backend search, optional metadata cleanup, optional human
//! confirmation. Stages either return a terminal outcome or fall through to
//! the next one; any unresolved path ends with a negative cache record so the
//! item is not re-searched on every run.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::backends::MusicBackend;
use crate::cache_manager::{CacheLookup, CacheManager};
use crate::cleanup::MetadataCleanup;
use crate::confirm::{
    manual_track_search, merge_candidate_queue, ConfirmAction, ConfirmationUi, ManualOutcome,
};
use crate::matching;
use crate::protocol::{Candidate, QueuedCandidate, ResolveOutcome, SongReference};
use crate::vector_index::{IndexMetadata, VectorIndex, LIMIT_DEFAULT, MIN_SCORE_DEFAULT};

/// A match at or above this similarity is accepted without confirmation.
const HIGH_CONFIDENCE_THRESHOLD: f64 = 0.75;
/// Acceptance bar for the best of several scored search results.
const MULTI_RESULT_THRESHOLD: f64 = 0.70;
/// Candidates below this similarity are noise and are never queued.
const QUEUE_FLOOR: f64 = 0.05;
const LOCAL_CANDIDATE_LIMIT: usize = 5;
const LOCAL_QUEUE_CAP: usize = 3;
const SEARCH_WORKERS: usize = 4;
const REFRESH_LIMIT: usize = 100;

static ARTIST_JOINER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*(?:,|;|&| and |\+|/)\s*").expect("invalid joiner pattern"));
static FEATURE_SPLIT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s*(?:feat\.?|ft\.?|featuring|with)\s+").expect("invalid feature pattern")
});

/// Per-request state threaded through the cascade. Never shared across
/// requests; the one-shot flags bound every re-entry path.
#[derive(Default)]
struct ResolveContext {
    queue: Vec<QueuedCandidate>,
    cleanup_attempted: bool,
    refresh_attempted: bool,
    negative_written: bool,
}

pub struct Resolver {
    backend: Arc<dyn MusicBackend>,
    cache: Arc<CacheManager>,
    index: Arc<Mutex<VectorIndex>>,
    aux_index: Option<Arc<Mutex<VectorIndex>>>,
    cleanup: Option<Arc<dyn MetadataCleanup>>,
    confirmation: Option<Arc<dyn ConfirmationUi>>,
    index_min_score: f64,
    index_limit: usize,
}

impl Resolver {
    pub fn new(
        backend: Arc<dyn MusicBackend>,
        cache: Arc<CacheManager>,
        index: Arc<Mutex<VectorIndex>>,
    ) -> Self {
        Self {
            backend,
            cache,
            index,
            aux_index: None,
            cleanup: None,
            confirmation: None,
            index_min_score: MIN_SCORE_DEFAULT,
            index_limit: LIMIT_DEFAULT,
        }
    }

    pub fn with_index_params(mut self, min_score: f64, limit: usize) -> Self {
        self.index_min_score = min_score;
        self.index_limit = limit;
        self
    }

    /// Secondary index built from an auxiliary catalog; scanned before the
    /// primary one.
    pub fn with_aux_index(mut self, aux_index: Arc<Mutex<VectorIndex>>) -> Self {
        self.aux_index = Some(aux_index);
        self
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn MetadataCleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// Enables the human confirmation stage.
    pub fn with_confirmation(mut self, confirmation: Arc<dyn ConfirmationUi>) -> Self {
        self.confirmation = Some(confirmation);
        self
    }

    pub fn resolve(&self, query: &SongReference) -> ResolveOutcome {
        let mut ctx = ResolveContext::default();
        self.resolve_inner(query, &mut ctx, true, true)
    }

    fn resolve_inner(
        &self,
        query: &SongReference,
        ctx: &mut ResolveContext,
        use_local_candidates: bool,
        allow_confirmation: bool,
    ) -> ResolveOutcome {
        let cache_key = self.cache.make_key(query);
        debug!("Generated cache key: \"{cache_key}\" for song: {query}");

        // Stage 1: cache lookup.
        match self.cache.get(query) {
            Some(CacheLookup::Resolved(backend_id)) => {
                match self.backend.get_track(&backend_id) {
                    Ok(Some(track)) => {
                        debug!("Found cached match for: {query} -> {}", track.title);
                        return ResolveOutcome::Resolved(track);
                    }
                    Ok(None) => {
                        debug!("Cached item {backend_id} no longer exists, invalidating");
                        self.cache.set_key(&cache_key, None, None, None);
                    }
                    Err(err) => {
                        debug!("Failed to fetch cached item {backend_id}: {err}");
                        self.cache.set_key(&cache_key, None, None, None);
                    }
                }
            }
            Some(CacheLookup::Negative(salvaged)) => {
                if let Some(cleaned) = salvaged {
                    if !ctx.cleanup_attempted {
                        ctx.cleanup_attempted = true;
                        debug!("Using cached cleaned metadata: {cleaned}");
                        if let ResolveOutcome::Resolved(track) =
                            self.resolve_inner(&cleaned, ctx, false, false)
                        {
                            self.cache_match(&cache_key, &track);
                            return ResolveOutcome::Resolved(track);
                        }
                    }
                }
                debug!("Found cached negative result for: {query}");
                return ResolveOutcome::NotFound;
            }
            None => {}
        }

        if !query.has_title() {
            warn!("Cannot search without a title, skipping: {query}");
            self.cache.set_key(&cache_key, None, None, None);
            return ResolveOutcome::NotFound;
        }

        // Stage 2: local index candidates.
        if use_local_candidates {
            if let Some(aux_index) = &self.aux_index {
                if let Some(track) = self.scan_local_index(aux_index, "aux", query, &cache_key, ctx)
                {
                    return ResolveOutcome::Resolved(track);
                }
            }
            if let Some(track) = self.scan_local_index(&self.index, "backend", query, &cache_key, ctx)
            {
                return ResolveOutcome::Resolved(track);
            }
        }

        // Stage 3: multi-strategy backend search.
        if let Some(track) = self.run_search_strategies(query, &cache_key, ctx) {
            return ResolveOutcome::Resolved(track);
        }

        // Stage 4: external metadata cleanup.
        let has_good_candidates = ctx
            .queue
            .iter()
            .any(|queued| queued.similarity >= MULTI_RESULT_THRESHOLD);
        if !ctx.cleanup_attempted && !has_good_candidates {
            if let Some(cleanup) = self.cleanup.clone() {
                ctx.cleanup_attempted = true;
                let mut raw_query = format!("{} by {}", query.title(), query.artist());
                if query.has_album() {
                    raw_query.push_str(&format!(" from {}", query.album()));
                }
                if let Some(cleaned) = cleanup.clean_track_query(&raw_query) {
                    debug!("Cleanup returned metadata: {cleaned}");
                    match self.resolve_inner(&cleaned, ctx, true, false) {
                        ResolveOutcome::Resolved(track) => {
                            debug!("Cleaned search succeeded, caching for original query");
                            self.cache_match(&cache_key, &track);
                            return ResolveOutcome::Resolved(track);
                        }
                        _ => {
                            debug!("Cleaned search also failed, caching negative with metadata");
                            self.cache.set_key(&cache_key, None, Some(&cleaned), None);
                            ctx.negative_written = true;
                        }
                    }
                }
            }
        }

        // Stage 5: human confirmation.
        if allow_confirmation {
            if let Some(ui) = self.confirmation.clone() {
                match self.run_confirmation(ui.as_ref(), query, &cache_key, ctx) {
                    Some(outcome) => return outcome,
                    None => {}
                }
            }
        }

        debug!("All search strategies failed for: {query}");
        if !ctx.negative_written {
            self.cache.set_key(&cache_key, None, None, None);
        }
        ResolveOutcome::NotFound
    }

    fn cache_match(&self, cache_key: &str, track: &Candidate) {
        self.cache.set_key(
            cache_key,
            Some(&track.backend_id),
            Some(&track.as_reference()),
            None,
        );
    }

    /// Maps an index candidate back to an id the backend can fetch.
    fn resolve_candidate_id(&self, candidate: &Candidate, from_aux: bool) -> Option<String> {
        let provider_key = candidate
            .provider_ids
            .get(self.backend.provider_name())
            .filter(|value| !value.is_empty())
            .cloned();
        let direct = Some(candidate.backend_id.clone()).filter(|value| !value.is_empty());
        if from_aux {
            // Auxiliary item ids live in a different namespace; the
            // cross-reference is authoritative when present.
            provider_key.or(direct)
        } else {
            direct.or(provider_key)
        }
    }

    fn scan_local_index(
        &self,
        index: &Mutex<VectorIndex>,
        source_label: &str,
        query: &SongReference,
        cache_key: &str,
        ctx: &mut ResolveContext,
    ) -> Option<Candidate> {
        // Collect under the lock, score and fetch outside it.
        let candidates: Vec<Candidate> = {
            let guard = match index.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    error!("Similarity index lock poisoned, skipping local scan");
                    return None;
                }
            };
            let query_vector = guard.build_query_vector(query);
            guard
                .candidate_scores(
                    &query_vector,
                    self.index_limit.min(LOCAL_CANDIDATE_LIMIT),
                    self.index_min_score,
                )
                .into_iter()
                .take(LOCAL_QUEUE_CAP)
                .map(|(entry, _)| entry.metadata.to_candidate(&entry.item_id))
                .collect()
        };

        for candidate in candidates {
            let match_score = matching::score(query, &candidate);
            debug!(
                "Local {source_label} candidate \"{}\" similarity {:.2}",
                candidate.title, match_score.similarity
            );

            if match_score.similarity >= HIGH_CONFIDENCE_THRESHOLD {
                let Some(resolved_id) = self.resolve_candidate_id(&candidate, source_label == "aux")
                else {
                    continue;
                };
                match self.backend.get_track(&resolved_id) {
                    Ok(Some(fetched)) => {
                        debug!(
                            "Resolved {query} via {source_label} index with similarity {:.2}",
                            match_score.similarity
                        );
                        self.cache_match(cache_key, &fetched);
                        return Some(fetched);
                    }
                    Ok(None) => {
                        debug!("High-confidence match {resolved_id} no longer exists");
                    }
                    Err(err) => {
                        debug!("Failed to fetch high-confidence candidate {resolved_id}: {err}");
                    }
                }
            } else if match_score.similarity > QUEUE_FLOOR {
                debug!(
                    "Queueing {source_label} candidate \"{}\" with similarity {:.2}",
                    candidate.title, match_score.similarity
                );
                ctx.queue.push(QueuedCandidate {
                    candidate,
                    similarity: match_score.similarity,
                    sources: vec![source_label.to_string()],
                    original_query: query.clone(),
                    cache_key: cache_key.to_string(),
                });
            }
        }
        None
    }

    fn search_or_empty(
        &self,
        title: Option<&str>,
        artist: Option<&str>,
        album: Option<&str>,
        limit: usize,
        label: &str,
    ) -> Vec<Candidate> {
        match self.backend.search_tracks(title, artist, album, limit) {
            Ok(found) => {
                debug!("{label}: found {} tracks", found.len());
                found
            }
            Err(err) => {
                debug!("{label} failed: {err}");
                Vec::new()
            }
        }
    }

    /// Runs the strategy cascade: each strategy only fires when every earlier
    /// one produced zero results, and later strategies narrow the memoized
    /// title-only result set in-process instead of re-querying when they can.
    fn run_search_strategies(
        &self,
        query: &SongReference,
        cache_key: &str,
        ctx: &mut ResolveContext,
    ) -> Option<Candidate> {
        let title = query.title();
        let artist = query.artist();
        let album = query.album();
        let has_artist = query.has_artist();
        let has_album = query.has_album();

        let mut tracks: Vec<Candidate> = Vec::new();
        let mut title_only_tracks: Vec<Candidate> = Vec::new();

        // Strategy 1: album + title.
        if has_album {
            tracks = self.search_or_empty(Some(title), None, Some(album), 50, "album_title");
        }

        // Strategy 2: title only, memoized for reuse below.
        if tracks.is_empty() {
            title_only_tracks = self.search_or_empty(Some(title), None, None, 50, "title_only");
            tracks = title_only_tracks.clone();
        }

        // Strategy 3: artist + title across artist-name variants.
        if has_artist && tracks.is_empty() {
            let variants = split_artist_variants(artist);
            if !title_only_tracks.is_empty() {
                debug!("Reusing title-only results for artist_title");
                tracks = dedup_by_backend_id(
                    title_only_tracks
                        .iter()
                        .filter(|track| track_matches_artist_variants(track, &variants))
                        .cloned(),
                );
            } else {
                tracks = self.parallel_variant_search(title, &variants, 50, "artist_title");
            }
        }

        // Strategy 4: artist + fuzzy title.
        if has_artist && tracks.is_empty() {
            let fuzzy_query = matching::clean_text_for_matching(title);
            let variants = split_artist_variants(artist);
            if !title_only_tracks.is_empty() {
                debug!("Reusing title-only results for artist_fuzzy_title");
                tracks = dedup_by_backend_id(
                    title_only_tracks
                        .iter()
                        .filter(|track| {
                            track_matches_artist_variants(track, &variants)
                                && fuzzy_title_score(&fuzzy_query, track)
                                    >= MULTI_RESULT_THRESHOLD
                        })
                        .cloned(),
                );
            } else {
                tracks =
                    self.parallel_variant_search(&fuzzy_query, &variants, 100, "artist_fuzzy_title");
            }

            // Relaxed fallback: artist agreement alone.
            if tracks.is_empty() && !variants.is_empty() && !title_only_tracks.is_empty() {
                debug!("Reusing title-only results for artist_fuzzy_title relaxed pass");
                tracks = title_only_tracks
                    .iter()
                    .filter(|track| track_matches_artist_variants(track, &variants))
                    .cloned()
                    .collect();
            }
        }

        // Strategy 5: album only.
        if has_album && tracks.is_empty() {
            if !title_only_tracks.is_empty() {
                debug!("Reusing title-only results for album_only");
                let wanted_album = album.to_lowercase();
                tracks = title_only_tracks
                    .iter()
                    .filter(|track| track.album.to_lowercase() == wanted_album)
                    .cloned()
                    .collect();
            } else {
                tracks = self.search_or_empty(None, None, Some(album), 150, "album_only");
            }
        }

        // Strategy 6: fuzzy title.
        if tracks.is_empty() {
            let fuzzy_query = matching::clean_text_for_matching(title);
            if !title_only_tracks.is_empty() {
                debug!("Reusing title-only results for fuzzy_title");
                tracks = title_only_tracks
                    .iter()
                    .filter(|track| fuzzy_title_score(&fuzzy_query, track) >= MULTI_RESULT_THRESHOLD)
                    .cloned()
                    .collect();
            } else {
                tracks = self.search_or_empty(Some(&fuzzy_query), None, None, 100, "fuzzy_title");
            }
        }

        // Accept, queue, or give up.
        if tracks.len() == 1 {
            let result = tracks.remove(0);
            let similarity = matching::score(query, &result).similarity;
            debug!(
                "Single search result similarity for \"{title}\" -> {similarity:.2}"
            );
            if similarity >= HIGH_CONFIDENCE_THRESHOLD {
                self.cache_match(cache_key, &result);
                return Some(result);
            }
            debug!("Rejecting single result for \"{title}\" due to low similarity");
            if similarity > QUEUE_FLOOR {
                ctx.queue.push(QueuedCandidate {
                    candidate: result,
                    similarity,
                    sources: vec!["single".to_string()],
                    original_query: query.clone(),
                    cache_key: cache_key.to_string(),
                });
            }
        } else if tracks.len() > 1 {
            let mut scored: Vec<(Candidate, f64)> = tracks
                .into_iter()
                .map(|track| {
                    let similarity = matching::score(query, &track).similarity;
                    (track, similarity)
                })
                .collect();
            scored.sort_by(|left, right| {
                right
                    .1
                    .partial_cmp(&left.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });

            if scored[0].1 >= MULTI_RESULT_THRESHOLD {
                let (best, similarity) = scored.remove(0);
                debug!("Accepting best match for \"{title}\" at {similarity:.2}");
                self.cache_match(cache_key, &best);
                return Some(best);
            }
            debug!(
                "Best match score {:.2} below threshold for: \"{title}\"",
                scored[0].1
            );
            for (candidate, similarity) in scored.into_iter().take(LOCAL_QUEUE_CAP) {
                if similarity > QUEUE_FLOOR {
                    ctx.queue.push(QueuedCandidate {
                        candidate,
                        similarity,
                        sources: vec!["search".to_string()],
                        original_query: query.clone(),
                        cache_key: cache_key.to_string(),
                    });
                }
            }
        }
        None
    }

    /// Fans the artist variants out across a bounded worker pool. Worker
    /// failures degrade to empty results; aggregation is keyed by backend id
    /// so duplicates collapse deterministically.
    fn parallel_variant_search(
        &self,
        title: &str,
        variants: &[String],
        limit: usize,
        label: &str,
    ) -> Vec<Candidate> {
        if variants.is_empty() {
            return Vec::new();
        }

        let (variant_tx, variant_rx) = crossbeam_channel::unbounded::<String>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<Vec<Candidate>>();
        for variant in variants {
            if !variant.is_empty() {
                let _ = variant_tx.send(variant.clone());
            }
        }
        drop(variant_tx);

        let backend = self.backend.as_ref();
        let workers = SEARCH_WORKERS.min(variants.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let variant_rx = variant_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok(variant) = variant_rx.recv() {
                        match backend.search_tracks(Some(title), Some(&variant), None, limit) {
                            Ok(found) => {
                                debug!(
                                    "{label}: artist \"{variant}\" -> {} tracks",
                                    found.len()
                                );
                                let _ = result_tx.send(found);
                            }
                            Err(err) => {
                                debug!("{label} artist variant \"{variant}\" failed: {err}");
                            }
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut unique: BTreeMap<String, Candidate> = BTreeMap::new();
        for batch in result_rx.iter() {
            for track in batch {
                unique.entry(track.backend_id.clone()).or_insert(track);
            }
        }
        unique.into_values().collect()
    }

    /// Confirmation stage. `Some` is a terminal outcome; `None` falls through
    /// to the final negative record.
    fn run_confirmation(
        &self,
        ui: &dyn ConfirmationUi,
        query: &SongReference,
        cache_key: &str,
        ctx: &mut ResolveContext,
    ) -> Option<ResolveOutcome> {
        if !ctx.queue.is_empty() {
            let merged = merge_candidate_queue(std::mem::take(&mut ctx.queue));
            if !merged.is_empty() {
                match ui.review(&merged, query) {
                    ConfirmAction::Select(index) => {
                        if let Some(chosen) = merged.get(index) {
                            if !chosen.candidate.backend_id.is_empty() {
                                debug!(
                                    "User accepted queued candidate \"{}\" for {}",
                                    chosen.candidate.title, chosen.original_query
                                );
                                self.cache_match(&chosen.cache_key, &chosen.candidate);
                                return Some(ResolveOutcome::Resolved(chosen.candidate.clone()));
                            }
                            warn!("Selected candidate has no backend id");
                        }
                    }
                    ConfirmAction::Abort => return Some(ResolveOutcome::Aborted),
                    // Skip falls through to the manual-search prompt.
                    ConfirmAction::Skip => {}
                    ConfirmAction::Manual => {
                        return self.run_manual_flow(ui, query, cache_key, ctx);
                    }
                    ConfirmAction::Refresh => {
                        if let Some(outcome) = self.refresh_and_retry(query, ctx) {
                            return Some(outcome);
                        }
                        return None;
                    }
                }
            }
        }

        info!("Track {query} not found in backend");
        if ui.confirm_retry("Search manually?") {
            return self.run_manual_flow(ui, query, cache_key, ctx);
        }
        None
    }

    fn run_manual_flow(
        &self,
        ui: &dyn ConfirmationUi,
        query: &SongReference,
        cache_key: &str,
        ctx: &mut ResolveContext,
    ) -> Option<ResolveOutcome> {
        match manual_track_search(self.backend.as_ref(), self.cache.as_ref(), ui, query) {
            ManualOutcome::Selected(track) => {
                debug!("Manual search succeeded, caching for original query: {query}");
                self.cache_match(cache_key, &track);
                Some(ResolveOutcome::Resolved(track))
            }
            ManualOutcome::Refresh => self.refresh_and_retry(query, ctx),
            ManualOutcome::Aborted => Some(ResolveOutcome::Aborted),
            ManualOutcome::Skipped => {
                self.cache.set_key(cache_key, None, None, None);
                ctx.negative_written = true;
                None
            }
        }
    }

    fn refresh_and_retry(
        &self,
        query: &SongReference,
        ctx: &mut ResolveContext,
    ) -> Option<ResolveOutcome> {
        if ctx.refresh_attempted {
            return None;
        }
        ctx.refresh_attempted = true;
        info!("Refreshing similarity index with new backend tracks...");
        let added = self.refresh_index_from_backend(REFRESH_LIMIT);
        if added > 0 {
            info!("Added {added} new tracks to index. Retrying search...");
            return Some(self.resolve_inner(query, ctx, true, true));
        }
        info!("No new tracks found.");
        None
    }

    /// Adds backend tracks the index has not seen yet, up to `limit`.
    pub fn refresh_index_from_backend(&self, limit: usize) -> usize {
        let fetched = match self.backend.fetch_all_tracks() {
            Ok(tracks) => tracks,
            Err(err) => {
                error!("Index refresh fetch failed: {err}");
                return 0;
            }
        };
        let mut index = match self.index.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!("Similarity index lock poisoned, skipping refresh");
                return 0;
            }
        };
        let mut added = 0usize;
        for track in fetched {
            if added >= limit {
                break;
            }
            if track.backend_id.is_empty() || index.contains(&track.backend_id) {
                continue;
            }
            if index.add_item(&track.backend_id, IndexMetadata::from_candidate(&track)) {
                added += 1;
            }
        }
        added
    }
}

/// Builds a fresh similarity index from the backend's full catalog.
pub fn build_index_from_backend(backend: &dyn MusicBackend) -> Result<VectorIndex, String> {
    let tracks = backend.fetch_all_tracks()?;
    let mut index = VectorIndex::new();
    for track in &tracks {
        if track.backend_id.is_empty() {
            continue;
        }
        index.add_item(&track.backend_id, IndexMetadata::from_candidate(track));
    }
    info!("Built similarity index with {} tracks", index.len());
    Ok(index)
}

fn dedup_by_backend_id(tracks: impl Iterator<Item = Candidate>) -> Vec<Candidate> {
    let mut unique: BTreeMap<String, Candidate> = BTreeMap::new();
    for track in tracks {
        unique.entry(track.backend_id.clone()).or_insert(track);
    }
    unique.into_values().collect()
}

fn fuzzy_title_score(fuzzy_query: &str, track: &Candidate) -> f64 {
    matching::score(&SongReference::new(fuzzy_query, "", ""), track).similarity
}

fn push_variant(value: &str, variants: &mut Vec<String>, seen: &mut HashSet<String>) {
    let candidate = value.trim();
    if candidate.is_empty() {
        return;
    }
    let key = candidate.to_lowercase();
    if seen.insert(key) {
        variants.push(candidate.to_string());
    }
}

/// Candidate artist strings for relaxed matching: the full credit, the main
/// section before any featuring clause, and the individual names split on
/// common joiners.
fn split_artist_variants(artist: &str) -> Vec<String> {
    let normalized = artist.trim();
    if normalized.is_empty() {
        return Vec::new();
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut variants: Vec<String> = Vec::new();

    push_variant(normalized, &mut variants, &mut seen);

    let main_section = FEATURE_SPLIT_RE
        .splitn(normalized, 2)
        .next()
        .unwrap_or("")
        .trim()
        .to_string();
    push_variant(&main_section, &mut variants, &mut seen);

    for source in [normalized, main_section.as_str()] {
        if source.is_empty() {
            continue;
        }
        for part in ARTIST_JOINER_RE.split(source) {
            push_variant(part, &mut variants, &mut seen);
        }
    }

    variants
}

/// Whether any artist variant appears in the track's artist credit, by
/// substring first and a fuzzy pass second.
fn track_matches_artist_variants(track: &Candidate, variants: &[String]) -> bool {
    if variants.is_empty() {
        return true;
    }
    if track.artist.is_empty() {
        return false;
    }

    let lower_artist = track.artist.to_lowercase();
    for variant in variants {
        if !variant.is_empty() && lower_artist.contains(&variant.to_lowercase()) {
            return true;
        }
    }
    for variant in variants {
        if !variant.is_empty() && matching::string_similarity(variant, &track.artist) >= 0.85 {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockBackend {
        tracks: Vec<Candidate>,
        calls: Mutex<Vec<String>>,
    }

    impl MockBackend {
        fn new(tracks: Vec<Candidate>) -> Self {
            Self {
                tracks,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn search_calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|call| call.starts_with("search"))
                .cloned()
                .collect()
        }
    }

    impl MusicBackend for MockBackend {
        fn provider_name(&self) -> &str {
            "mock"
        }

        fn test_connection(&self) -> Result<(), String> {
            Ok(())
        }

        fn search_tracks(
            &self,
            title: Option<&str>,
            artist: Option<&str>,
            album: Option<&str>,
            _limit: usize,
        ) -> Result<Vec<Candidate>, String> {
            self.calls.lock().unwrap().push(format!(
                "search title={} artist={} album={}",
                title.unwrap_or(""),
                artist.unwrap_or(""),
                album.unwrap_or("")
            ));
            Ok(self.tracks.clone())
        }

        fn get_track(&self, backend_id: &str) -> Result<Option<Candidate>, String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("get {backend_id}"));
            Ok(self
                .tracks
                .iter()
                .find(|track| track.backend_id == backend_id)
                .cloned())
        }

        fn fetch_all_tracks(&self) -> Result<Vec<Candidate>, String> {
            Ok(self.tracks.clone())
        }
    }

    struct FixedUi {
        action: ConfirmAction,
    }

    impl ConfirmationUi for FixedUi {
        fn review(&self, _candidates: &[QueuedCandidate], _query: &SongReference) -> ConfirmAction {
            self.action.clone()
        }

        fn manual_query(&self, _original: &SongReference) -> Option<SongReference> {
            None
        }

        fn confirm_retry(&self, _prompt: &str) -> bool {
            false
        }
    }

    fn track(backend_id: &str, title: &str, artist: &str, album: &str) -> Candidate {
        Candidate {
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            backend_id: backend_id.to_string(),
            provider_ids: HashMap::new(),
        }
    }

    fn make_resolver(backend: Arc<MockBackend>) -> (Resolver, Arc<CacheManager>) {
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let index = Arc::new(Mutex::new(VectorIndex::new()));
        let resolver = Resolver::new(backend, Arc::clone(&cache), index);
        (resolver, cache)
    }

    #[test]
    fn test_exact_match_resolves_and_caches() {
        let backend = Arc::new(MockBackend::new(vec![track(
            "id-1",
            "Unique Song",
            "Some Artist",
            "Some Album",
        )]));
        let (resolver, cache) = make_resolver(Arc::clone(&backend));

        let query = SongReference::new("Unique Song", "Some Artist", "Some Album");
        match resolver.resolve(&query) {
            ResolveOutcome::Resolved(found) => assert_eq!(found.backend_id, "id-1"),
            other => panic!("expected resolution, got {other:?}"),
        }
        assert!(matches!(cache.get(&query), Some(CacheLookup::Resolved(id)) if id == "id-1"));
    }

    #[test]
    fn test_cascade_short_circuits_after_first_matching_strategy() {
        let backend = Arc::new(MockBackend::new(vec![track(
            "id-1",
            "Unique Song",
            "Some Artist",
            "Some Album",
        )]));
        let (resolver, _cache) = make_resolver(Arc::clone(&backend));

        // No album, so the cascade starts at the title-only strategy.
        let query = SongReference::new("Unique Song", "Some Artist", "");
        assert!(matches!(
            resolver.resolve(&query),
            ResolveOutcome::Resolved(_)
        ));

        let searches = backend.search_calls();
        assert_eq!(
            searches,
            vec!["search title=Unique Song artist= album="],
            "later strategies must not run once one yields an accepted result"
        );
    }

    #[test]
    fn test_not_found_writes_exactly_one_negative_record() {
        let backend = Arc::new(MockBackend::new(Vec::new()));
        let (resolver, cache) = make_resolver(backend);

        let query = SongReference::new("Unknown Track", "", "");
        assert_eq!(resolver.resolve(&query), ResolveOutcome::NotFound);
        assert_eq!(cache.len(), 1);
        assert!(matches!(
            cache.get(&query),
            Some(CacheLookup::Negative(None))
        ));
    }

    #[test]
    fn test_abort_caches_nothing() {
        // A single weak result lands in the confirmation queue; aborting the
        // review must leave the cache untouched so the item can be retried.
        let backend = Arc::new(MockBackend::new(vec![track(
            "id-9", "Target", "Band", "Album",
        )]));
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let index = Arc::new(Mutex::new(VectorIndex::new()));
        let resolver = Resolver::new(Arc::clone(&backend) as Arc<dyn MusicBackend>, Arc::clone(&cache), index)
            .with_confirmation(Arc::new(FixedUi {
                action: ConfirmAction::Abort,
            }));

        let query = SongReference::new("Target Song", "Band", "");
        assert_eq!(resolver.resolve(&query), ResolveOutcome::Aborted);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_confirmation_selection_caches_under_original_key() {
        let backend = Arc::new(MockBackend::new(vec![track(
            "id-9", "Target", "Band", "Album",
        )]));
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let index = Arc::new(Mutex::new(VectorIndex::new()));
        let resolver = Resolver::new(Arc::clone(&backend) as Arc<dyn MusicBackend>, Arc::clone(&cache), index)
            .with_confirmation(Arc::new(FixedUi {
                action: ConfirmAction::Select(0),
            }));

        let query = SongReference::new("Target Song", "Band", "");
        match resolver.resolve(&query) {
            ResolveOutcome::Resolved(found) => assert_eq!(found.backend_id, "id-9"),
            other => panic!("expected resolution, got {other:?}"),
        }
        assert!(matches!(cache.get(&query), Some(CacheLookup::Resolved(id)) if id == "id-9"));
    }

    #[test]
    fn test_local_index_hit_skips_backend_search() {
        let library_track = track("id-5", "Indexed Song", "Indexed Artist", "Indexed Album");
        let backend = Arc::new(MockBackend::new(vec![library_track.clone()]));
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let mut index = VectorIndex::new();
        index.add_item("id-5", IndexMetadata::from_candidate(&library_track));
        let resolver = Resolver::new(
            Arc::clone(&backend) as Arc<dyn MusicBackend>,
            Arc::clone(&cache),
            Arc::new(Mutex::new(index)),
        );

        let query = SongReference::new("Indexed Song", "Indexed Artist", "Indexed Album");
        assert!(matches!(
            resolver.resolve(&query),
            ResolveOutcome::Resolved(_)
        ));
        assert!(
            backend.search_calls().is_empty(),
            "index hit must resolve without a backend search"
        );
    }

    #[test]
    fn test_cached_negative_with_metadata_triggers_salvage() {
        let real = track("id-3", "Real Song", "Real Band", "Real Album");
        let backend = Arc::new(MockBackend::new(vec![real]));
        let (resolver, cache) = make_resolver(Arc::clone(&backend));

        let noisy = SongReference::new("R3al S0ng official video", "", "");
        let cleaned = SongReference::new("Real Song", "Real Band", "Real Album");
        cache.set(&noisy, None, Some(&cleaned), None);

        match resolver.resolve(&noisy) {
            ResolveOutcome::Resolved(found) => assert_eq!(found.backend_id, "id-3"),
            other => panic!("expected salvage resolution, got {other:?}"),
        }
        // The original noisy key now resolves directly.
        assert!(matches!(cache.get(&noisy), Some(CacheLookup::Resolved(id)) if id == "id-3"));
    }

    #[test]
    fn test_split_artist_variants() {
        let variants = split_artist_variants("Main Act feat. Guest, Other");
        assert!(variants.contains(&"Main Act feat. Guest, Other".to_string()));
        assert!(variants.contains(&"Main Act".to_string()));
        assert!(variants.contains(&"Other".to_string()));
    }

    #[test]
    fn test_track_matches_artist_variants_substring_and_fuzzy() {
        let candidate = track("id", "Song", "The Main Act Orchestra", "Album");
        assert!(track_matches_artist_variants(
            &candidate,
            &["Main Act".to_string()]
        ));
        let close = track("id", "Song", "Mein Act", "Album");
        assert!(track_matches_artist_variants(
            &close,
            &["Main Act".to_string()]
        ));
        let unrelated = track("id", "Song", "Somebody Else", "Album");
        assert!(!track_matches_artist_variants(
            &unrelated,
            &["Main Act".to_string()]
        ));
    }

    #[test]
    fn test_refresh_index_adds_unseen_tracks() {
        let backend = Arc::new(MockBackend::new(vec![
            track("id-1", "One", "A", "X"),
            track("id-2", "Two", "B", "Y"),
        ]));
        let cache = Arc::new(CacheManager::in_memory().unwrap());
        let mut index = VectorIndex::new();
        index.add_item(
            "id-1",
            IndexMetadata::from_candidate(&track("id-1", "One", "A", "X")),
        );
        let resolver = Resolver::new(
            Arc::clone(&backend) as Arc<dyn MusicBackend>,
            cache,
            Arc::new(Mutex::new(index)),
        );
        assert_eq!(resolver.refresh_index_from_backend(100), 1);
        assert_eq!(resolver.refresh_index_from_backend(100), 0);
    }
}
