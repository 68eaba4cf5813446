//! OpenSubsonic backend implementation.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::Value;

use crate::backends::{BackendAuth, MusicBackend};
use crate::protocol::Candidate;

const API_VERSION: &str = "1.16.1";
const CLIENT_ID: &str = "tunebridge";
const PROVIDER_NAME: &str = "opensubsonic";

/// OpenSubsonic backend backed by `ureq`.
pub struct OpenSubsonicBackend {
    http_client: ureq::Agent,
    auth: BackendAuth,
}

impl OpenSubsonicBackend {
    pub fn new(auth: BackendAuth) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(15))
            .timeout_write(Duration::from_secs(15))
            .build();
        Self { http_client, auth }
    }

    fn make_salt() -> String {
        let mut bytes = [0u8; 8];
        let _ = getrandom::fill(&mut bytes);
        bytes.iter().map(|value| format!("{value:02x}")).collect()
    }

    fn auth_params(&self) -> Vec<(String, String)> {
        let salt = Self::make_salt();
        let token = format!(
            "{:x}",
            md5::compute(format!("{}{}", self.auth.password, salt))
        );
        vec![
            ("u".to_string(), self.auth.username.clone()),
            ("t".to_string(), token),
            ("s".to_string(), salt),
            ("f".to_string(), "json".to_string()),
            ("v".to_string(), API_VERSION.to_string()),
            ("c".to_string(), CLIENT_ID.to_string()),
        ]
    }

    fn endpoint_base(endpoint: &str) -> String {
        endpoint.trim().trim_end_matches('/').to_string()
    }

    fn api_url(&self, method: &str, params: &[(String, String)]) -> String {
        let mut query_parts: Vec<String> = self
            .auth_params()
            .into_iter()
            .map(|(key, value)| format!("{key}={}", urlencoding::encode(&value)))
            .collect();
        query_parts.extend(
            params
                .iter()
                .map(|(key, value)| format!("{key}={}", urlencoding::encode(value))),
        );
        format!(
            "{}/rest/{}.view?{}",
            Self::endpoint_base(&self.auth.endpoint),
            method,
            query_parts.join("&")
        )
    }

    fn request_json(&self, method: &str, params: &[(String, String)]) -> Result<Value, String> {
        let url = self.api_url(method, params);
        let response = self
            .http_client
            .get(&url)
            .call()
            .map_err(|err| format!("OpenSubsonic request failed ({method}): {err}"))?;
        let parsed: Value = response
            .into_json()
            .map_err(|err| format!("OpenSubsonic response parse failed ({method}): {err}"))?;
        let status = parsed
            .get("subsonic-response")
            .and_then(|value| value.get("status"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if status != "ok" {
            let error_message = parsed
                .get("subsonic-response")
                .and_then(|value| value.get("error"))
                .and_then(|value| value.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("OpenSubsonic returned an error");
            return Err(error_message.to_string());
        }
        Ok(parsed)
    }

    fn array_or_single(value: Option<&Value>) -> Vec<&Value> {
        match value {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(item @ Value::Object(_)) => vec![item],
            _ => Vec::new(),
        }
    }

    fn parse_track(song: &Value) -> Option<Candidate> {
        let backend_id = song.get("id")?.as_str()?.to_string();
        let title = song
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let artist = song
            .get("artist")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let album = song
            .get("album")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let mut provider_ids = HashMap::new();
        provider_ids.insert(PROVIDER_NAME.to_string(), backend_id.clone());
        Some(Candidate {
            title,
            artist,
            album,
            backend_id,
            provider_ids,
        })
    }

    fn search3(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, String> {
        let payload = self.request_json(
            "search3",
            &[
                ("query".to_string(), query.to_string()),
                ("songCount".to_string(), limit.to_string()),
                ("artistCount".to_string(), "0".to_string()),
                ("albumCount".to_string(), "0".to_string()),
            ],
        )?;
        let songs = Self::array_or_single(
            payload
                .get("subsonic-response")
                .and_then(|value| value.get("searchResult3"))
                .and_then(|value| value.get("song")),
        );
        Ok(songs.into_iter().filter_map(Self::parse_track).collect())
    }

    fn fetch_albums_page(&self, offset: usize, page_size: usize) -> Result<Vec<String>, String> {
        let payload = self.request_json(
            "getAlbumList2",
            &[
                ("type".to_string(), "alphabeticalByName".to_string()),
                ("size".to_string(), page_size.to_string()),
                ("offset".to_string(), offset.to_string()),
            ],
        )?;
        let albums = Self::array_or_single(
            payload
                .get("subsonic-response")
                .and_then(|value| value.get("albumList2"))
                .and_then(|value| value.get("album")),
        );
        Ok(albums
            .into_iter()
            .filter_map(|album| {
                album
                    .get("id")
                    .and_then(Value::as_str)
                    .map(ToOwned::to_owned)
            })
            .collect())
    }

    fn fetch_album_tracks(&self, album_id: &str) -> Result<Vec<Candidate>, String> {
        let payload =
            self.request_json("getAlbum", &[("id".to_string(), album_id.to_string())])?;
        let songs = Self::array_or_single(
            payload
                .get("subsonic-response")
                .and_then(|value| value.get("album"))
                .and_then(|value| value.get("song")),
        );
        Ok(songs.into_iter().filter_map(Self::parse_track).collect())
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl MusicBackend for OpenSubsonicBackend {
    fn provider_name(&self) -> &str {
        PROVIDER_NAME
    }

    fn test_connection(&self) -> Result<(), String> {
        let _ = self.request_json("ping", &[])?;
        Ok(())
    }

    fn search_tracks(
        &self,
        title: Option<&str>,
        artist: Option<&str>,
        album: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>, String> {
        // search3 takes one free-text query. Query on the most specific field
        // present and narrow the rest client-side with substring checks.
        let query = title.or(album).or(artist).map(str::trim).unwrap_or("");
        if query.is_empty() {
            return Ok(Vec::new());
        }

        // Over-fetch so that the client-side filters still leave `limit` hits.
        let fetched = self.search3(query, limit.saturating_mul(3).max(limit))?;
        let filtered: Vec<Candidate> = fetched
            .into_iter()
            .filter(|track| {
                let artist_ok = artist
                    .map(|wanted| contains_ignore_case(&track.artist, wanted))
                    .unwrap_or(true);
                let album_ok = album
                    .map(|wanted| title.is_none() || contains_ignore_case(&track.album, wanted))
                    .unwrap_or(true);
                artist_ok && album_ok
            })
            .take(limit)
            .collect();
        Ok(filtered)
    }

    fn get_track(&self, backend_id: &str) -> Result<Option<Candidate>, String> {
        let payload =
            match self.request_json("getSong", &[("id".to_string(), backend_id.to_string())]) {
                Ok(payload) => payload,
                // Unknown id comes back as a protocol error, which is a
                // not-found here rather than a failure.
                Err(_) => return Ok(None),
            };
        let song = payload
            .get("subsonic-response")
            .and_then(|value| value.get("song"));
        Ok(song.and_then(Self::parse_track))
    }

    fn fetch_all_tracks(&self) -> Result<Vec<Candidate>, String> {
        const PAGE_SIZE: usize = 300;
        let mut offset = 0usize;
        let mut album_ids: Vec<String> = Vec::new();
        loop {
            let next_page = self.fetch_albums_page(offset, PAGE_SIZE)?;
            if next_page.is_empty() {
                break;
            }
            offset = offset.saturating_add(next_page.len());
            let reached_end = next_page.len() < PAGE_SIZE;
            album_ids.extend(next_page);
            if reached_end {
                break;
            }
        }

        let mut seen_song_ids = HashSet::new();
        let mut tracks = Vec::new();
        for album_id in album_ids {
            let album_tracks = self.fetch_album_tracks(&album_id)?;
            for track in album_tracks {
                if seen_song_ids.insert(track.backend_id.clone()) {
                    tracks.push(track);
                }
            }
        }
        Ok(tracks)
    }
}
