//! Persistent resolution cache backed by SQLite.
//!
//! Two namespaces: query-key -> resolved backend id (or a negative record
//! with optional salvaged cleaned metadata), and playlist-id/source -> raw
//! provider payloads with source-dependent expiry. Storage failures degrade
//! to cache misses / no-ops so a broken cache never aborts a resolution.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, error, info};
use rand::RngExt;
use rusqlite::{params, Connection, OptionalExtension};

use crate::matching::clean_string;
use crate::protocol::SongReference;

const KEY_SEPARATOR: char = '|';
const DEFAULT_NEGATIVE_TTL_DAYS: u32 = 30;
const DEFAULT_PLAYLIST_TTL_HOURS: u64 = 168;
const JITTER_TTL_MIN_HOURS: u64 = 60;
const JITTER_TTL_MAX_HOURS: u64 = 200;
const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
const SECONDS_PER_HOUR: i64 = 60 * 60;

/// Result of a cache lookup. A missing row is `None` at the call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// A previously resolved backend id.
    Resolved(String),
    /// A confirmed non-match, possibly carrying cleaned metadata salvaged
    /// from an earlier cleanup attempt.
    Negative(Option<SongReference>),
}

pub struct CacheManager {
    conn: Mutex<Connection>,
    negative_ttl_days: u32,
    playlist_ttl_hours: u64,
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

fn escape_like(fragment: &str) -> String {
    fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

impl CacheManager {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        debug!("Initializing resolution cache at: {}", db_path.display());
        Self::with_connection(Connection::open(db_path)?)
    }

    /// In-memory cache, used by tests.
    #[allow(dead_code)]
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        let manager = Self {
            conn: Mutex::new(conn),
            negative_ttl_days: DEFAULT_NEGATIVE_TTL_DAYS,
            playlist_ttl_hours: DEFAULT_PLAYLIST_TTL_HOURS,
        };
        manager.initialize_schema()?;
        manager.sweep_expired(now_secs());
        manager.purge_legacy_keys();
        Ok(manager)
    }

    pub fn set_negative_ttl_days(&mut self, days: u32) {
        self.negative_ttl_days = days;
    }

    pub fn set_playlist_ttl_hours(&mut self, hours: u64) {
        self.playlist_ttl_hours = hours;
    }

    fn initialize_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().expect("cache connection poisoned");
        conn.execute(
            "CREATE TABLE IF NOT EXISTS cache (
                query TEXT PRIMARY KEY,
                backend_id TEXT,
                cleaned_metadata TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cache_created_at ON cache(created_at)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS playlist_cache (
                playlist_id TEXT,
                source TEXT,
                data TEXT,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (playlist_id, source)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_playlist_cache_created
             ON playlist_cache(created_at)",
            [],
        )?;
        Ok(())
    }

    /// Deletes records that have passed their expiry. Runs eagerly at startup;
    /// reads also delete lazily.
    fn sweep_expired(&self, now: i64) {
        let conn = self.conn.lock().expect("cache connection poisoned");
        let swept = conn.execute(
            "DELETE FROM cache WHERE expires_at IS NOT NULL AND expires_at < ?1",
            params![now],
        );
        // Negative records written before TTLs existed carry no expiry.
        let legacy = conn.execute(
            "DELETE FROM cache WHERE backend_id IS NULL AND expires_at IS NULL
             AND created_at < ?1",
            params![now - i64::from(DEFAULT_NEGATIVE_TTL_DAYS) * SECONDS_PER_DAY],
        );
        match (swept, legacy) {
            (Ok(expired), Ok(old)) if expired + old > 0 => {
                debug!("Cleaned up {} expired cache entries ({expired} TTL, {old} legacy)", expired + old);
            }
            (Err(err), _) | (_, Err(err)) => {
                error!("Failed to sweep expired cache entries: {err}");
            }
            _ => {}
        }
    }

    /// Drops pre-pipe-format keys; only normalized `title|artist|album` keys
    /// are supported going forward.
    fn purge_legacy_keys(&self) {
        let conn = self.conn.lock().expect("cache connection poisoned");
        match conn.execute(
            "DELETE FROM cache WHERE query NOT LIKE '%|%' OR query LIKE '{%' OR query LIKE '[%'",
            [],
        ) {
            Ok(0) => {}
            Ok(purged) => info!("Cleared {purged} legacy-format cache entries"),
            Err(err) => error!("Failed to purge legacy cache entries: {err}"),
        }
    }

    /// Derives the deterministic lookup key for a query.
    pub fn make_key(&self, query: &SongReference) -> String {
        format!(
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            clean_string(query.title()),
            clean_string(query.artist()),
            clean_string(query.album())
        )
    }

    pub fn get(&self, query: &SongReference) -> Option<CacheLookup> {
        self.get_at(query, now_secs())
    }

    fn get_at(&self, query: &SongReference, now: i64) -> Option<CacheLookup> {
        let key = self.make_key(query);
        match self.lookup_key(&key, now) {
            Ok(Some(hit)) => return Some(hit),
            Ok(None) => {}
            Err(err) => {
                error!("Cache lookup failed: {err}");
                return None;
            }
        }

        // Flexible fallback: same normalized title and artist, any album.
        let prefix = format!(
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}",
            clean_string(query.title()),
            clean_string(query.artist())
        );
        match self.lookup_flexible(&prefix, &key, now) {
            Ok(hit) => hit,
            Err(err) => {
                error!("Flexible cache lookup failed: {err}");
                None
            }
        }
    }

    fn lookup_key(&self, key: &str, now: i64) -> Result<Option<CacheLookup>, rusqlite::Error> {
        let conn = self.conn.lock().expect("cache connection poisoned");
        let row: Option<(Option<String>, Option<String>, Option<i64>)> = conn
            .query_row(
                "SELECT backend_id, cleaned_metadata, expires_at FROM cache WHERE query = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((backend_id, cleaned_json, expires_at)) = row else {
            return Ok(None);
        };

        if let Some(expiry) = expires_at {
            if now > expiry {
                debug!("Cache entry expired for: {key}");
                conn.execute("DELETE FROM cache WHERE query = ?1", params![key])?;
                return Ok(None);
            }
        }

        Ok(Some(Self::row_to_lookup(backend_id, cleaned_json)))
    }

    fn lookup_flexible(
        &self,
        prefix: &str,
        exact_key: &str,
        now: i64,
    ) -> Result<Option<CacheLookup>, rusqlite::Error> {
        let conn = self.conn.lock().expect("cache connection poisoned");
        let mut stmt = conn.prepare(
            "SELECT query, backend_id, cleaned_metadata, expires_at FROM cache
             WHERE query LIKE ?1 ESCAPE '\\' AND query != ?2",
        )?;
        let pattern = format!("{}%", escape_like(prefix));
        let rows: Vec<(String, Option<String>, Option<String>, Option<i64>)> = stmt
            .query_map(params![pattern, exact_key], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<_, _>>()?;

        for (cached_key, backend_id, cleaned_json, expires_at) in rows {
            if let Some(expiry) = expires_at {
                if now > expiry {
                    debug!("Cache entry expired for: {cached_key}");
                    conn.execute("DELETE FROM cache WHERE query = ?1", params![cached_key])?;
                    continue;
                }
            }
            debug!("Found flexible cache match: \"{cached_key}\"");
            return Ok(Some(Self::row_to_lookup(backend_id, cleaned_json)));
        }
        Ok(None)
    }

    fn row_to_lookup(backend_id: Option<String>, cleaned_json: Option<String>) -> CacheLookup {
        match backend_id {
            Some(id) => CacheLookup::Resolved(id),
            None => {
                let cleaned = cleaned_json
                    .as_deref()
                    .and_then(|payload| serde_json::from_str::<SongReference>(payload).ok());
                CacheLookup::Negative(cleaned)
            }
        }
    }

    /// Stores a result under an already-derived key. `None` backend id writes
    /// a negative record (default 30-day TTL when none is given); positive
    /// records default to no expiry.
    pub fn set_key(
        &self,
        key: &str,
        backend_id: Option<&str>,
        cleaned_metadata: Option<&SongReference>,
        ttl_days: Option<u32>,
    ) {
        self.set_key_at(key, backend_id, cleaned_metadata, ttl_days, now_secs());
    }

    fn set_key_at(
        &self,
        key: &str,
        backend_id: Option<&str>,
        cleaned_metadata: Option<&SongReference>,
        ttl_days: Option<u32>,
        now: i64,
    ) {
        let effective_ttl = match (backend_id, ttl_days) {
            (None, None) => Some(self.negative_ttl_days),
            (_, ttl) => ttl,
        };
        let expires_at = effective_ttl.map(|days| now + i64::from(days) * SECONDS_PER_DAY);
        let cleaned_json = cleaned_metadata.and_then(|meta| serde_json::to_string(meta).ok());

        let conn = self.conn.lock().expect("cache connection poisoned");
        let result = conn.execute(
            "REPLACE INTO cache (query, backend_id, cleaned_metadata, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, backend_id, cleaned_json, now, expires_at],
        );
        match result {
            Ok(_) => debug!(
                "Cached result: \"{key}\" -> {}, expires_at: {expires_at:?}",
                backend_id.unwrap_or("NEGATIVE")
            ),
            Err(err) => error!("Cache storage failed: {err}"),
        }
    }

    pub fn set(
        &self,
        query: &SongReference,
        backend_id: Option<&str>,
        cleaned_metadata: Option<&SongReference>,
        ttl_days: Option<u32>,
    ) {
        let key = self.make_key(query);
        self.set_key(&key, backend_id, cleaned_metadata, ttl_days);
    }

    /// Cached bulk payload for an import-provider playlist, if still fresh.
    /// Import providers are external to this binary, so nothing here calls
    /// the playlist namespace yet.
    #[allow(dead_code)]
    pub fn get_playlist_cache(&self, playlist_id: &str, source: &str) -> Option<serde_json::Value> {
        self.get_playlist_cache_at(playlist_id, source, now_secs())
    }

    fn get_playlist_cache_at(
        &self,
        playlist_id: &str,
        source: &str,
        now: i64,
    ) -> Option<serde_json::Value> {
        self.sweep_playlist_cache(now);

        let conn = self.conn.lock().expect("cache connection poisoned");
        let row: Result<Option<String>, rusqlite::Error> = conn
            .query_row(
                "SELECT data FROM playlist_cache WHERE playlist_id = ?1 AND source = ?2",
                params![playlist_id, source],
                |row| row.get(0),
            )
            .optional();

        match row {
            Ok(Some(payload)) => {
                debug!("Cache hit for {source} playlist: {playlist_id}");
                serde_json::from_str(&payload).ok()
            }
            Ok(None) => {
                debug!("Cache miss for {source} playlist: {playlist_id}");
                None
            }
            Err(err) => {
                error!("{source} playlist cache lookup failed: {err}");
                None
            }
        }
    }

    #[allow(dead_code)]
    pub fn set_playlist_cache(&self, playlist_id: &str, source: &str, data: &serde_json::Value) {
        let payload = match serde_json::to_string(data) {
            Ok(payload) => payload,
            Err(err) => {
                error!("{source} playlist cache serialization failed: {err}");
                return;
            }
        };
        let conn = self.conn.lock().expect("cache connection poisoned");
        let result = conn.execute(
            "REPLACE INTO playlist_cache (playlist_id, source, data, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![playlist_id, source, payload, now_secs()],
        );
        match result {
            Ok(_) => debug!("Cached {source} playlist data for: {playlist_id}"),
            Err(err) => error!("{source} playlist cache storage failed: {err}"),
        }
    }

    /// Expires playlist payloads. Sources whose name signals the
    /// thundering-herd-prone case get a fresh 60-200h random TTL on every
    /// sweep so entries never mass-expire in sync; other sources use the
    /// fixed TTL.
    fn sweep_playlist_cache(&self, now: i64) {
        let conn = self.conn.lock().expect("cache connection poisoned");
        let rows: Result<Vec<(String, String, i64)>, rusqlite::Error> = conn
            .prepare("SELECT playlist_id, source, created_at FROM playlist_cache")
            .and_then(|mut stmt| {
                stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect()
            });
        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                error!("Failed to scan playlist cache: {err}");
                return;
            }
        };

        let mut rng = rand::rng();
        let mut deleted = 0usize;
        for (playlist_id, source, created_at) in rows {
            let ttl_hours = if source.to_lowercase().contains("spotify") {
                rng.random_range(JITTER_TTL_MIN_HOURS..=JITTER_TTL_MAX_HOURS)
            } else {
                self.playlist_ttl_hours
            };
            let expiry = created_at + ttl_hours as i64 * SECONDS_PER_HOUR;
            if now > expiry {
                let result = conn.execute(
                    "DELETE FROM playlist_cache WHERE playlist_id = ?1 AND source = ?2",
                    params![playlist_id, source],
                );
                match result {
                    Ok(_) => deleted += 1,
                    Err(err) => error!("Failed to expire playlist cache entry: {err}"),
                }
            }
        }
        if deleted > 0 {
            debug!("Cleaned {deleted} expired playlist cache entries");
        }
    }

    /// Removes every query-cache record.
    pub fn clear(&self) {
        let conn = self.conn.lock().expect("cache connection poisoned");
        match conn.execute("DELETE FROM cache", []) {
            Ok(count) => info!("Cleared {count} entries from cache"),
            Err(err) => error!("Failed to clear cache: {err}"),
        }
    }

    /// Removes negative records, optionally only those whose key contains the
    /// given fragment. Returns the number of removed rows.
    pub fn clear_negative_entries(&self, pattern: Option<&str>) -> usize {
        let conn = self.conn.lock().expect("cache connection poisoned");
        let result = match pattern {
            Some(fragment) => conn.execute(
                "DELETE FROM cache WHERE backend_id IS NULL AND query LIKE ?1 ESCAPE '\\'",
                params![format!("%{}%", escape_like(fragment))],
            ),
            None => conn.execute("DELETE FROM cache WHERE backend_id IS NULL", []),
        };
        match result {
            Ok(count) => {
                debug!("Cleared {count} negative cache entries");
                count
            }
            Err(err) => {
                error!("Failed to clear negative cache entries: {err}");
                0
            }
        }
    }

    /// Number of query-cache records, for diagnostics and tests.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        let conn = self.conn.lock().expect("cache connection poisoned");
        conn.query_row("SELECT COUNT(*) FROM cache", [], |row| row.get::<_, i64>(0))
            .map(|count| count as usize)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(title: &str, artist: &str, album: &str) -> SongReference {
        SongReference::new(title, artist, album)
    }

    #[test]
    fn test_positive_round_trip() {
        let cache = CacheManager::in_memory().unwrap();
        let query = reference("Kesariya", "Arijit Singh", "Brahmastra");
        cache.set(&query, Some("track-42"), None, None);
        assert_eq!(
            cache.get(&query),
            Some(CacheLookup::Resolved("track-42".to_string()))
        );
    }

    #[test]
    fn test_negative_record_expires_after_ttl() {
        let cache = CacheManager::in_memory().unwrap();
        let query = reference("Missing Song", "Nobody", "");
        let now = now_secs();
        cache.set_key_at(&cache.make_key(&query), None, None, Some(1), now);

        assert!(matches!(
            cache.get_at(&query, now),
            Some(CacheLookup::Negative(None))
        ));
        // One simulated day later the record is a miss, not a negative hit.
        assert_eq!(cache.get_at(&query, now + SECONDS_PER_DAY + 1), None);
        // The expired row was lazily deleted.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_positive_record_without_ttl_never_expires() {
        let cache = CacheManager::in_memory().unwrap();
        let query = reference("Evergreen", "Artist", "Album");
        let now = now_secs();
        cache.set_key_at(&cache.make_key(&query), Some("id-1"), None, None, now);
        let far_future = now + 10_000 * SECONDS_PER_DAY;
        assert_eq!(
            cache.get_at(&query, far_future),
            Some(CacheLookup::Resolved("id-1".to_string()))
        );
    }

    #[test]
    fn test_negative_record_defaults_to_thirty_day_ttl() {
        let cache = CacheManager::in_memory().unwrap();
        let query = reference("Gone", "Nobody", "");
        let now = now_secs();
        cache.set_key_at(&cache.make_key(&query), None, None, None, now);
        assert!(cache.get_at(&query, now + 29 * SECONDS_PER_DAY).is_some());
        assert_eq!(cache.get_at(&query, now + 31 * SECONDS_PER_DAY), None);
    }

    #[test]
    fn test_flexible_lookup_matches_across_albums() {
        let cache = CacheManager::in_memory().unwrap();
        let stored = reference("Chaleya", "Anirudh Ravichander", "Jawan");
        cache.set(&stored, Some("track-7"), None, None);

        let query = reference("Chaleya", "Anirudh Ravichander", "Jawan (Original Soundtrack)");
        // Different normalized album key, same title and artist.
        assert_eq!(
            cache.get(&query),
            Some(CacheLookup::Resolved("track-7".to_string()))
        );
    }

    #[test]
    fn test_negative_record_carries_cleaned_metadata() {
        let cache = CacheManager::in_memory().unwrap();
        let query = reference("S0ng Titl3 xx", "", "");
        let cleaned = reference("Song Title", "Real Artist", "Real Album");
        cache.set(&query, None, Some(&cleaned), None);
        match cache.get(&query) {
            Some(CacheLookup::Negative(Some(salvaged))) => assert_eq!(salvaged, cleaned),
            other => panic!("expected negative with metadata, got {other:?}"),
        }
    }

    #[test]
    fn test_playlist_cache_fixed_ttl() {
        let cache = CacheManager::in_memory().unwrap();
        let now = now_secs();
        let payload = serde_json::json!({"tracks": [1, 2, 3]});
        cache.set_playlist_cache("pl-1", "youtube", &payload);
        assert_eq!(
            cache.get_playlist_cache_at("pl-1", "youtube", now + 167 * SECONDS_PER_HOUR),
            Some(payload)
        );
        assert_eq!(
            cache.get_playlist_cache_at("pl-1", "youtube", now + 169 * SECONDS_PER_HOUR),
            None
        );
    }

    #[test]
    fn test_playlist_cache_jittered_ttl_bounds() {
        let cache = CacheManager::in_memory().unwrap();
        let now = now_secs();
        let payload = serde_json::json!([{"id": "a"}]);
        cache.set_playlist_cache("pl-2", "spotify_tracks", &payload);
        // Below the jitter floor the entry always survives.
        assert!(cache
            .get_playlist_cache_at("pl-2", "spotify_tracks", now + 59 * SECONDS_PER_HOUR)
            .is_some());
        // Past the jitter ceiling it is always expired.
        assert!(cache
            .get_playlist_cache_at("pl-2", "spotify_tracks", now + 201 * SECONDS_PER_HOUR)
            .is_none());
    }

    #[test]
    fn test_clear_negative_entries() {
        let cache = CacheManager::in_memory().unwrap();
        cache.set(&reference("A", "B", "C"), Some("1"), None, None);
        cache.set(&reference("X", "Y", "Z"), None, None, None);
        assert_eq!(cache.clear_negative_entries(None), 1);
        assert_eq!(cache.len(), 1);
    }
}
