//! Shared data types passed between the matching engine, cache, index and
//! resolver components.

use std::collections::HashMap;

/// A noisy, externally sourced song reference (scraped playlist metadata).
///
/// Every field is optional and untrusted; only the title gates searchability.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SongReference {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
}

impl SongReference {
    pub fn new(title: &str, artist: &str, album: &str) -> Self {
        let opt = |value: &str| {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        };
        Self {
            title: opt(title),
            artist: opt(artist),
            album: opt(album),
        }
    }

    pub fn title(&self) -> &str {
        self.title.as_deref().unwrap_or("").trim()
    }

    pub fn artist(&self) -> &str {
        self.artist.as_deref().unwrap_or("").trim()
    }

    pub fn album(&self) -> &str {
        self.album.as_deref().unwrap_or("").trim()
    }

    pub fn has_title(&self) -> bool {
        !self.title().is_empty()
    }

    pub fn has_artist(&self) -> bool {
        !self.artist().is_empty()
    }

    pub fn has_album(&self) -> bool {
        !self.album().is_empty()
    }
}

impl std::fmt::Display for SongReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {} ({})", self.artist(), self.title(), self.album())
    }
}

/// A resolved library track surfaced during matching.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Candidate {
    pub title: String,
    pub artist: String,
    pub album: String,
    /// The library backend's opaque, stable identifier.
    pub backend_id: String,
    /// External-service name -> external id, for cross-referencing auxiliary
    /// catalogs back to the primary backend.
    #[serde(default)]
    pub provider_ids: HashMap<String, String>,
}

impl Candidate {
    pub fn as_reference(&self) -> SongReference {
        SongReference::new(&self.title, &self.artist, &self.album)
    }
}

/// Similarity verdict for one query/candidate pair.
///
/// `similarity` is the ranking key; `confidence` only ever dampens it.
#[derive(Debug, Clone, Default)]
pub struct MatchScore {
    pub similarity: f64,
    pub confidence: f64,
    pub distance: f64,
    pub details: HashMap<String, f64>,
}

/// A sub-threshold candidate deferred for human review.
#[derive(Debug, Clone)]
pub struct QueuedCandidate {
    pub candidate: Candidate,
    pub similarity: f64,
    pub sources: Vec<String>,
    pub original_query: SongReference,
    pub cache_key: String,
}

impl QueuedCandidate {
    /// Key used to collapse duplicate queue entries: the backend id when the
    /// candidate has one, otherwise a composite of the visible fields.
    pub fn dedup_key(&self) -> String {
        if !self.candidate.backend_id.is_empty() {
            return self.candidate.backend_id.clone();
        }
        format!(
            "{}|{}|{}",
            self.candidate.title.to_lowercase().trim(),
            self.candidate.artist.to_lowercase().trim(),
            self.candidate.album.to_lowercase().trim()
        )
    }
}

/// Terminal state of one resolution request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveOutcome {
    Resolved(Candidate),
    NotFound,
    /// The user aborted the confirmation flow; nothing was cached so the item
    /// can be retried later.
    Aborted,
}
