//! Matching engine: pure similarity scoring between a noisy song reference
//! and a library candidate.
//!
//! No state, no I/O. The normalization pipeline is shared with the cache key
//! derivation and the similarity index tokenizer.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::protocol::{Candidate, MatchScore, SongReference};

static LEADING_THE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*the\s+").unwrap());
static PAREN_SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*[\(\[][^\)\]]*[\)\]]").unwrap());
static FEAT_CLAUSE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(?:feat\.?|ft\.?|featuring|with)\s+.*$").unwrap());
static EDITION_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\s*-\s*(?:remaster(?:ed)?(?:\s+\d{4})?|radio edit|single version|album version|deluxe edition|expanded edition|clean version|explicit version)\b.*$",
    )
    .unwrap()
});
static SEPARATOR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[&,/\\]").unwrap());
static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());
static TRAILING_YEAR_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*\S)\s+\d{4}$").unwrap());
static YEAR_TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{4}\b").unwrap());
static FEAT_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)[\(\[]+(?:feat|ft|with)[.\)]| featuring").unwrap());
static ARTIST_JOINER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[,;&/]|\s+and\s+|\s+&\s+").unwrap());
static FEAT_SPLIT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\s*(?:feat\.?|ft\.?|featuring|with)\s+").unwrap());
static NON_WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());
static AMP_COMMA_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*[&,]\s*").unwrap());
static OST_MARKER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)original\s+(?:motion\s+picture\s+)?soundtrack").unwrap());

/// Soundtrack patterns, tried in order; the first match wins.
static SOUNDTRACK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Song - From "Movie" (quotes optional)
        r#"(?i)^(.*?)\s*[-–]\s*from\s+["“”]?(.+?)["“”]?$"#,
        // Song (From "Movie") or [From "Movie"]
        r#"(?i)^(.*?)\s*[\(\[]\s*from\s+["“”]?(.+?)["“”]?\s*[\)\]]"#,
        // Song (Soundtrack from "Movie")
        r#"(?i)^(.*?)\s*[\(\[]\s*soundtrack\s+from\s+["“”]?(.+?)["“”]?\s*[\)\]]"#,
        // Song (Music from "Movie")
        r#"(?i)^(.*?)\s*[\(\[]\s*music\s+from\s+["“”]?(.+?)["“”]?\s*[\)\]]"#,
        // Song (From the movie "Movie")
        r#"(?i)^(.*?)\s*[\(\[]\s*from\s+the\s+movie\s+["“”]?(.+?)["“”]?\s*[\)\]]"#,
        // Song - From Movie (no quotes)
        r"(?i)^(.*?)\s*[-–]\s*from\s+(.+)$",
        // Song (From Movie) (no quotes)
        r"(?i)^(.*?)\s*[\(\[]\s*from\s+(.+?)\s*[\)\]]",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

/// Normalizes a string for comparison by removing common variations.
///
/// Pipeline: lowercase/trim, cosmetic quote stripping, leading "the",
/// parenthetical/bracketed segments, trailing featuring clauses, dash-suffixed
/// edition markers, separator punctuation to spaces, whitespace collapse,
/// trailing bare year tokens. Idempotent.
pub fn clean_string(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }

    let mut text = s.trim().to_lowercase();
    text = text
        .replace(['“', '”'], "\"")
        .replace('’', "'")
        .replace(['"', '\''], "");

    text = LEADING_THE_RE.replace(&text, "").into_owned();
    text = PAREN_SEGMENT_RE.replace_all(&text, "").into_owned();
    text = FEAT_CLAUSE_RE.replace(&text, "").into_owned();
    text = EDITION_SUFFIX_RE.replace(&text, "").into_owned();
    text = SEPARATOR_RE.replace_all(&text, " ").into_owned();
    text = WHITESPACE_RE.replace_all(&text, " ").into_owned();
    text = text.trim().to_string();

    // Strip trailing bare year tokens, but never the whole string.
    while let Some(caps) = TRAILING_YEAR_RE.captures(&text) {
        text = caps[1].to_string();
    }

    text.trim().to_string()
}

/// Looser cleanup used to build fuzzy-title backend queries.
pub fn clean_text_for_matching(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let mut cleaned = text.to_lowercase();
    cleaned = PAREN_SEGMENT_RE.replace_all(&cleaned, "").into_owned();
    cleaned = OST_MARKER_RE.replace_all(&cleaned, "").into_owned();
    cleaned = NON_WORD_RE.replace_all(&cleaned, " ").into_owned();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits a title/album string into (main part, soundtrack name).
///
/// The soundtrack name is empty when no `From <Movie>` pattern applies.
pub fn extract_soundtrack_info(s: &str) -> (String, String) {
    if s.is_empty() {
        return (String::new(), String::new());
    }
    let text = s.trim();
    for pattern in SOUNDTRACK_PATTERNS.iter() {
        if let Some(caps) = pattern.captures(text) {
            let main = caps[1].trim().to_string();
            let soundtrack = caps[2].trim().trim_matches(['"', '“', '”']).trim().to_string();
            return (main, soundtrack);
        }
    }
    (s.to_string(), String::new())
}

/// Similarity between two already-normalized strings.
///
/// Exact match beats containment beats edit distance, so short noisy strings
/// cannot outrank an identical candidate.
pub fn string_similarity(source: &str, target: &str) -> f64 {
    if source.is_empty() || target.is_empty() {
        return 0.0;
    }
    let source = source.trim().to_lowercase();
    let target = target.trim().to_lowercase();
    if source == target {
        return 1.0;
    }
    if source.contains(&target) || target.contains(&source) {
        let shorter = source.chars().count().min(target.chars().count()) as f64;
        let longer = source.chars().count().max(target.chars().count()) as f64;
        return 0.9 * (shorter / longer);
    }
    strsim::normalized_levenshtein(&source, &target)
}

pub fn string_dist(source: &str, target: &str) -> f64 {
    1.0 - string_similarity(source, target)
}

fn normalize_artist_name(artist: &str) -> String {
    let mut name = artist.to_lowercase();
    name = AMP_COMMA_RE.replace_all(&name, " and ").into_owned();
    name = FEAT_SPLIT_RE
        .splitn(&name, 2)
        .next()
        .unwrap_or("")
        .to_string();
    name = NON_WORD_RE.replace_all(&name, "").into_owned();
    WHITESPACE_RE.replace_all(name.trim(), " ").into_owned()
}

/// Main and featured artist name sets for one artist string.
fn split_artist_sets(artist: &str) -> (HashSet<String>, HashSet<String>) {
    let mut parts = FEAT_SPLIT_RE.splitn(artist, 2);
    let main_section = parts.next().unwrap_or("").to_string();
    let featured_section = parts.next().unwrap_or("").to_string();

    let split_names = |section: &str| -> HashSet<String> {
        ARTIST_JOINER_RE
            .split(section)
            .map(normalize_artist_name)
            .filter(|name| !name.is_empty())
            .collect()
    };

    (split_names(&main_section), split_names(&featured_section))
}

/// Artist distance with main/featured handling.
///
/// Exact-name-set overlap ratio when any normalized name matches exactly,
/// otherwise word-token Jaccard scaled by 0.8; a 10% distance bonus applies
/// when the main-artist sets intersect.
pub fn artist_distance(query_artist: &str, candidate_artist: &str) -> f64 {
    if query_artist.trim().is_empty() || candidate_artist.trim().is_empty() {
        return 1.0;
    }

    let (query_main, query_feat) = split_artist_sets(query_artist);
    let (cand_main, cand_feat) = split_artist_sets(candidate_artist);

    let query_all: HashSet<&String> = query_main.union(&query_feat).collect();
    let cand_all: HashSet<&String> = cand_main.union(&cand_feat).collect();
    if query_all.is_empty() || cand_all.is_empty() {
        return 1.0;
    }

    let exact_matches = query_all.intersection(&cand_all).count();
    let similarity = if exact_matches > 0 {
        exact_matches as f64 / query_all.len().max(cand_all.len()) as f64
    } else {
        let tokens = |names: &HashSet<&String>| -> HashSet<String> {
            names
                .iter()
                .flat_map(|name| name.split_whitespace().map(str::to_string))
                .collect()
        };
        let query_tokens = tokens(&query_all);
        let cand_tokens = tokens(&cand_all);
        let intersection = query_tokens.intersection(&cand_tokens).count();
        let union = query_tokens.union(&cand_tokens).count();
        if union == 0 {
            0.0
        } else {
            0.8 * (intersection as f64 / union as f64)
        }
    };

    let mut distance = 1.0 - similarity;
    if query_main.intersection(&cand_main).next().is_some() {
        distance *= 0.9;
    }
    distance
}

/// Dynamic weight for a query field based on its content.
fn field_weight(field_value: &str, field_type: &str) -> f64 {
    let field_value = field_value.trim();
    if field_value.is_empty() {
        return 0.0;
    }

    let mut weight: f64 = match field_type {
        "title" => 0.45,
        "artist" => 0.35,
        "album" => 0.20,
        _ => 0.33,
    };

    let word_count = field_value.split_whitespace().count();
    if word_count > 5 {
        weight *= 1.2;
    } else if word_count < 2 {
        weight *= 0.8;
    }

    if YEAR_TOKEN_RE.is_match(field_value) {
        weight *= 1.1;
    }
    if FEAT_MARKER_RE.is_match(field_value) {
        weight *= 1.05;
    }

    weight.min(0.9)
}

/// Quality of a query field value, used by the confidence model.
fn field_quality(field_value: &str) -> f64 {
    let field_value = field_value.trim();
    if field_value.is_empty() {
        return 0.0;
    }

    let mut quality: f64 = 0.5;
    let word_count = field_value.split_whitespace().count();
    if word_count > 10 {
        quality += 0.3;
    } else if word_count > 5 {
        quality += 0.2;
    } else if word_count > 2 {
        quality += 0.1;
    }

    if YEAR_TOKEN_RE.is_match(field_value) {
        quality += 0.1;
    }
    if field_value.contains('"') || field_value.contains('\'') {
        quality += 0.1;
    }

    let lowered = field_value.to_lowercase();
    for generic in ["unknown", "track", "song", "untitled"] {
        if lowered.contains(generic) {
            quality -= 0.2;
            break;
        }
    }

    quality.clamp(0.0, 1.0)
}

fn is_placeholder(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "" | "none" | "unknown" | "null")
}

/// Combines all fields of one side into a single normalized string, keeping
/// extracted soundtrack names that plain normalization would drop.
///
/// Handles sources with misassigned fields (e.g. a scraped title string of the
/// form "Song | Artist | Album").
fn whole_query_text(title: &str, artist: &str, album: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for value in [title, artist, album] {
        if is_placeholder(value) {
            continue;
        }
        let cleaned = clean_string(value);
        if !cleaned.is_empty() {
            parts.push(cleaned);
        }
        let (_, soundtrack) = extract_soundtrack_info(value);
        let soundtrack_cleaned = clean_string(&soundtrack);
        if !soundtrack_cleaned.is_empty() && !parts.iter().any(|p| p.contains(&soundtrack_cleaned))
        {
            parts.push(soundtrack_cleaned);
        }
    }
    parts.join(" ")
}

/// Soundtrack-aware distance between two title or album values.
///
/// When both sides expose a soundtrack name that agrees (distance < 0.3) the
/// main portions are compared instead and rewarded; a disagreeing soundtrack
/// name is penalized; one-sided containment is rewarded.
fn soundtrack_aware_title_dist(query_value: &str, candidate_value: &str) -> f64 {
    let query_cleaned = clean_string(query_value);
    let cand_cleaned = clean_string(candidate_value);

    let (query_main, query_soundtrack) = extract_soundtrack_info(query_value);
    let (cand_main, cand_soundtrack) = extract_soundtrack_info(candidate_value);
    let query_soundtrack = clean_string(&query_soundtrack);
    let cand_soundtrack = clean_string(&cand_soundtrack);

    if !query_soundtrack.is_empty() && !cand_soundtrack.is_empty() {
        if string_dist(&query_soundtrack, &cand_soundtrack) < 0.3 {
            let dist = string_dist(&clean_string(&query_main), &clean_string(&cand_main));
            (dist - 0.4).max(0.0)
        } else {
            (string_dist(&query_cleaned, &cand_cleaned) + 0.2).min(1.0)
        }
    } else if !query_cleaned.is_empty()
        && !cand_cleaned.is_empty()
        && (query_cleaned.contains(&cand_cleaned) || cand_cleaned.contains(&query_cleaned))
    {
        (string_dist(&query_cleaned, &cand_cleaned) - 0.2).max(0.0)
    } else {
        string_dist(&query_cleaned, &cand_cleaned)
    }
}

fn album_dist(query_album: &str, candidate_album: &str) -> f64 {
    let album1 = clean_string(query_album);
    let album2 = clean_string(candidate_album);
    let mut dist = string_dist(&album1, &album2);

    let (main1, soundtrack1) = extract_soundtrack_info(query_album);
    let (main2, soundtrack2) = extract_soundtrack_info(candidate_album);
    let soundtrack1 = clean_string(&soundtrack1);
    let soundtrack2 = clean_string(&soundtrack2);

    if !soundtrack1.is_empty() && !soundtrack2.is_empty() {
        if string_dist(&soundtrack1, &soundtrack2) < 0.3 {
            dist = string_dist(&clean_string(&main1), &clean_string(&main2));
            dist = (dist - 0.4).max(0.0);
        } else {
            dist = (dist + 0.2).min(1.0);
        }
    } else if !soundtrack1.is_empty() && soundtrack1 == album2 {
        dist = (dist - 0.3).max(0.0);
    } else if !soundtrack2.is_empty() && soundtrack2 == album1 {
        dist = (dist - 0.3).max(0.0);
    }

    if !album1.is_empty()
        && !album2.is_empty()
        && (album1.contains(&album2) || album2.contains(&album1))
    {
        dist = (dist - 0.3).max(0.0);
    }

    dist
}

/// Scores a query against a candidate. Pure and deterministic.
pub fn score(query: &SongReference, candidate: &Candidate) -> MatchScore {
    let query_title = query.title();
    let query_artist = query.artist();
    let mut query_album = query.album().to_string();

    // A soundtrack name inside the title stands in for a missing album field,
    // so "Song (From \"Movie\")" can meet a candidate filed under "Movie".
    if query_album.is_empty() {
        let (_, soundtrack) = extract_soundtrack_info(query_title);
        if !soundtrack.is_empty() {
            query_album = soundtrack;
        }
    }

    let has_title = !query_title.is_empty();
    let has_artist = !query_artist.is_empty();
    let has_album = !query_album.is_empty();

    if !has_title && !has_artist && !has_album {
        return MatchScore {
            similarity: 0.0,
            confidence: 0.0,
            distance: 1.0,
            details: HashMap::new(),
        };
    }

    let mut weights: Vec<(&str, f64)> = Vec::new();
    let mut qualities: Vec<f64> = Vec::new();
    if has_title {
        weights.push(("title", field_weight(query_title, "title")));
        qualities.push(field_quality(query_title));
    }
    if has_artist {
        weights.push(("artist", field_weight(query_artist, "artist")));
        qualities.push(field_quality(query_artist));
    }
    if has_album {
        weights.push(("album", field_weight(&query_album, "album")));
        qualities.push(field_quality(&query_album));
    }

    let total_weight: f64 = weights.iter().map(|(_, w)| w).sum();
    let field_count = weights.len();
    let normalized: Vec<(&str, f64)> = if total_weight > 0.0 {
        weights
            .iter()
            .map(|(field, w)| (*field, w / total_weight))
            .collect()
    } else {
        weights
            .iter()
            .map(|(field, _)| (*field, 1.0 / field_count as f64))
            .collect()
    };

    let mut details: HashMap<String, f64> = HashMap::new();
    if has_album {
        details.insert(
            "album".to_string(),
            1.0 - album_dist(&query_album, &candidate.album),
        );
    }
    if has_title {
        details.insert(
            "title".to_string(),
            1.0 - soundtrack_aware_title_dist(query_title, &candidate.title),
        );
    }
    if has_artist {
        details.insert(
            "artist".to_string(),
            1.0 - artist_distance(query_artist, &candidate.artist),
        );
    }

    let total_distance: f64 = normalized
        .iter()
        .map(|(field, weight)| weight * (1.0 - details.get(*field).copied().unwrap_or(0.0)))
        .sum();
    let field_similarity_score = 1.0 - total_distance;

    // Whole-query fallback for misaligned fields; the 0.85 factor keeps a
    // correctly-fielded match ahead unless the flat-string evidence is
    // substantially stronger.
    let query_combined = whole_query_text(query_title, query_artist, &query_album);
    let track_combined = whole_query_text(&candidate.title, &candidate.artist, &candidate.album);
    let whole_query_similarity = if !query_combined.is_empty() && !track_combined.is_empty() {
        string_similarity(&query_combined, &track_combined)
    } else {
        0.0
    };

    let raw_score = field_similarity_score.max(whole_query_similarity * 0.85);
    details.insert("field_similarity".to_string(), field_similarity_score);
    details.insert("whole_query_similarity".to_string(), whole_query_similarity);

    let base_confidence = field_count as f64 / 3.0;
    let avg_quality = if qualities.is_empty() {
        0.5
    } else {
        qualities.iter().sum::<f64>() / qualities.len() as f64
    };
    let confidence = base_confidence * (0.5 + 0.5 * avg_quality);

    // When the whole-query path wins, the 0.85 factor already served as the
    // penalty; only the field-by-field path gets confidence dampening.
    let mut final_score = if raw_score > field_similarity_score {
        raw_score
    } else {
        (raw_score * confidence).max(raw_score * 0.5)
    };

    // Near-exact matches are never rejected by low confidence.
    if raw_score >= 0.99 {
        final_score = final_score.max(0.95);
    }

    MatchScore {
        similarity: final_score,
        confidence,
        distance: total_distance,
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(title: &str, artist: &str, album: &str) -> Candidate {
        Candidate {
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            backend_id: "1".to_string(),
            provider_ids: Default::default(),
        }
    }

    #[test]
    fn test_clean_string_strips_noise() {
        assert_eq!(clean_string("The Song Name (Remastered 2011)"), "song name");
        assert_eq!(clean_string("Track feat. Someone Else"), "track");
        assert_eq!(clean_string("Song - Radio Edit"), "song");
        assert_eq!(clean_string("One & Two / Three"), "one two three");
        assert_eq!(clean_string("Title 1999"), "title");
    }

    #[test]
    fn test_clean_string_is_idempotent() {
        let samples = [
            "The Song Name (Remastered 2011)",
            "Track feat. Someone Else",
            "  “Quoted”  Title  ",
            "One & Two / Three 2004",
            "Song - Deluxe Edition",
            "plain title",
            "1999",
            "Best Of 1999 2000",
        ];
        for sample in samples {
            let once = clean_string(sample);
            assert_eq!(clean_string(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn test_extract_soundtrack_info_variants() {
        let (main, soundtrack) = extract_soundtrack_info("Chaleya (From \"Jawan\")");
        assert_eq!(main, "Chaleya");
        assert_eq!(soundtrack, "Jawan");

        let (main, soundtrack) = extract_soundtrack_info("Song - From Movie Name");
        assert_eq!(main, "Song");
        assert_eq!(soundtrack, "Movie Name");

        let (main, soundtrack) = extract_soundtrack_info("Plain Title");
        assert_eq!(main, "Plain Title");
        assert_eq!(soundtrack, "");
    }

    #[test]
    fn test_string_similarity_tiers() {
        assert_eq!(string_similarity("abc", "abc"), 1.0);
        let contained = string_similarity("song", "song extended");
        assert!(contained > 0.2 && contained < 0.9);
        assert!(string_similarity("", "abc") == 0.0);
        assert!(string_similarity("kite", "kites") > 0.7);
    }

    #[test]
    fn test_artist_distance_exact_and_partial() {
        assert_eq!(artist_distance("Artist", "Artist"), 0.0);
        let multi = artist_distance("A, B", "A");
        assert!(multi < 0.6, "partial overlap should stay close: {multi}");
        let featured = artist_distance("Main feat. Guest", "Main");
        assert!(featured < 0.5, "main artist match dominates: {featured}");
        assert_eq!(artist_distance("", "Artist"), 1.0);
    }

    #[test]
    fn test_exact_triple_scores_high() {
        let query = SongReference::new("Kesariya", "Arijit Singh", "Brahmastra");
        let result = score(&query, &candidate("Kesariya", "Arijit Singh", "Brahmastra"));
        assert!(result.similarity >= 0.95, "got {}", result.similarity);
    }

    #[test]
    fn test_no_usable_fields_scores_zero() {
        let query = SongReference::default();
        let result = score(&query, &candidate("Anything", "Anyone", "Anywhere"));
        assert_eq!(result.similarity, 0.0);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn test_soundtrack_collapse_prefers_matching_album() {
        let query = SongReference::new("Song (From \"Movie\")", "", "");
        let matching = score(&query, &candidate("Song", "Composer", "Movie"));
        let unrelated = score(&query, &candidate("Song", "Composer", "Elsewhere"));
        assert!(
            matching.similarity > unrelated.similarity + 0.2,
            "matching {} vs unrelated {}",
            matching.similarity,
            unrelated.similarity
        );
    }

    #[test]
    fn test_chaleya_scenario_meets_threshold() {
        let query = SongReference::new("Chaleya", "Anirudh Ravichander", "");
        let result = score(
            &query,
            &candidate("Chaleya (From \"Jawan\")", "Anirudh Ravichander", "Jawan"),
        );
        assert!(result.similarity >= 0.75, "got {}", result.similarity);
    }

    #[test]
    fn test_whole_query_fallback_handles_merged_fields() {
        let query = SongReference::new("Some Song Some Artist Some Album", "", "");
        let structured = score(&query, &candidate("Some Song", "Some Artist", "Some Album"));
        let unrelated = score(&query, &candidate("Different", "Other", "Elsewhere"));
        assert!(structured.similarity > unrelated.similarity + 0.3);
    }

    #[test]
    fn test_whole_query_never_beats_equal_structured_match() {
        let query = SongReference::new("Alpha", "Beta", "Gamma");
        let result = score(&query, &candidate("Alpha", "Beta", "Gamma"));
        let field = result.details["field_similarity"];
        let whole = result.details["whole_query_similarity"];
        assert!(field >= whole * 0.85);
    }

    #[test]
    fn test_clean_text_for_matching() {
        assert_eq!(
            clean_text_for_matching("Song Title (Original Motion Picture Soundtrack)"),
            "song title"
        );
        assert_eq!(clean_text_for_matching("A.B.C! Song?"), "a b c song");
    }
}
