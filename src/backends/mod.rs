//! Library backend abstractions and concrete implementations.

pub mod opensubsonic;

use crate::protocol::Candidate;

/// Connection profile used by backend implementations.
#[derive(Debug, Clone)]
pub struct BackendAuth {
    pub endpoint: String,
    pub username: String,
    pub password: String,
}

/// Interface implemented by concrete media library backends.
///
/// Search is best-effort: a track that is not in the library is an `Ok` with
/// an empty result, never an `Err`. Errors are reserved for transport and
/// protocol failures.
pub trait MusicBackend: Send + Sync {
    /// Stable provider name, used as the key in `Candidate::provider_ids`.
    fn provider_name(&self) -> &str;

    fn test_connection(&self) -> Result<(), String>;

    /// Searches the library on whichever fields are provided.
    fn search_tracks(
        &self,
        title: Option<&str>,
        artist: Option<&str>,
        album: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>, String>;

    /// Fetches a single track by its backend id.
    fn get_track(&self, backend_id: &str) -> Result<Option<Candidate>, String>;

    /// Enumerates the whole library, for index bootstrap.
    fn fetch_all_tracks(&self) -> Result<Vec<Candidate>, String>;
}
