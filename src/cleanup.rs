//! Metadata cleanup via an OpenAI-compatible chat endpoint.
//!
//! Scraped titles often bundle the artist, edition tags and channel noise
//! into one string. The cleanup service asks a language model to split such
//! a string back into structured fields; its reply is free text from which
//! the first JSON object is extracted.

use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::protocol::SongReference;

static JSON_OBJECT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("invalid JSON-object pattern"));

const SYSTEM_PROMPT: &str = "You are a music metadata parser. Given a raw, \
messy track string, extract the song title, artist and album. Respond with a \
single JSON object with keys \"title\", \"artist\" and \"album\". Use an \
empty string for a field you cannot determine. Do not add commentary.";

/// Capability seam for structured-metadata recovery from a raw track string.
pub trait MetadataCleanup: Send + Sync {
    /// Returns `None` when no usable metadata could be recovered. A usable
    /// result always has a non-empty title.
    fn clean_track_query(&self, raw_query: &str) -> Option<SongReference>;
}

pub struct HttpCleanupService {
    http_client: ureq::Agent,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpCleanupService {
    pub fn new(endpoint: &str, api_key: &str, model: &str) -> Self {
        let http_client = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout_read(Duration::from_secs(30))
            .timeout_write(Duration::from_secs(15))
            .build();
        Self {
            http_client,
            endpoint: endpoint.trim().trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }

    fn request_completion(&self, raw_query: &str) -> Result<String, String> {
        let url = format!("{}/chat/completions", self.endpoint);
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": raw_query},
            ],
            "temperature": 0.0,
        });
        let response = self
            .http_client
            .post(&url)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(body)
            .map_err(|err| format!("Cleanup request failed: {err}"))?;
        let parsed: Value = response
            .into_json()
            .map_err(|err| format!("Cleanup response parse failed: {err}"))?;
        parsed
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| "Cleanup response has no message content".to_string())
    }
}

/// Pulls the first JSON object out of a free-text reply and validates it.
fn parse_cleanup_reply(reply: &str) -> Option<SongReference> {
    let object_text = JSON_OBJECT_RE.find(reply)?.as_str();
    let parsed: Value = serde_json::from_str(object_text).ok()?;

    let field = |name: &str| {
        parsed
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_string()
    };
    let cleaned = SongReference::new(&field("title"), &field("artist"), &field("album"));
    if cleaned.has_title() {
        Some(cleaned)
    } else {
        None
    }
}

impl MetadataCleanup for HttpCleanupService {
    fn clean_track_query(&self, raw_query: &str) -> Option<SongReference> {
        let raw_query = raw_query.trim();
        if raw_query.is_empty() {
            return None;
        }
        debug!("Requesting metadata cleanup for: \"{raw_query}\"");
        match self.request_completion(raw_query) {
            Ok(reply) => {
                let cleaned = parse_cleanup_reply(&reply);
                if cleaned.is_none() {
                    warn!("Cleanup reply had no usable metadata for: \"{raw_query}\"");
                }
                cleaned
            }
            Err(err) => {
                warn!("{err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply_extracts_embedded_object() {
        let reply = "Sure, here is the parsed metadata:\n\
            {\"title\": \"Kesariya\", \"artist\": \"Arijit Singh\", \"album\": \"Brahmastra\"}\n\
            Let me know if you need anything else.";
        let cleaned = parse_cleanup_reply(reply).unwrap();
        assert_eq!(cleaned.title(), "Kesariya");
        assert_eq!(cleaned.artist(), "Arijit Singh");
        assert_eq!(cleaned.album(), "Brahmastra");
    }

    #[test]
    fn test_parse_reply_rejects_missing_title() {
        let reply = "{\"title\": \"\", \"artist\": \"Someone\", \"album\": \"\"}";
        assert!(parse_cleanup_reply(reply).is_none());
    }

    #[test]
    fn test_parse_reply_rejects_non_json() {
        assert!(parse_cleanup_reply("I could not parse that track.").is_none());
    }

    #[test]
    fn test_parse_reply_tolerates_partial_fields() {
        let reply = "{\"title\": \"Levitating\"}";
        let cleaned = parse_cleanup_reply(reply).unwrap();
        assert_eq!(cleaned.title(), "Levitating");
        assert!(!cleaned.has_artist());
    }
}
