mod backends;
mod cache_manager;
mod cleanup;
mod config;
mod confirm;
mod matching;
mod protocol;
mod resolver;
mod vector_index;

use std::sync::{Arc, Mutex};

use log::{error, info, warn};

use backends::opensubsonic::OpenSubsonicBackend;
use backends::{BackendAuth, MusicBackend};
use cache_manager::CacheManager;
use cleanup::HttpCleanupService;
use config::Config;
use confirm::TerminalConfirmation;
use protocol::{ResolveOutcome, SongReference};
use resolver::{build_index_from_backend, Resolver};
use vector_index::VectorIndex;

fn usage() -> ! {
    eprintln!("Usage: tunebridge <references.json>");
    eprintln!("       tunebridge --clear-cache");
    eprintln!("       tunebridge --clear-negative [pattern]");
    eprintln!("  references.json: a JSON array of {{title, artist, album}} objects");
    std::process::exit(2);
}

fn load_references(path: &str) -> Result<Vec<SongReference>, String> {
    let contents = std::fs::read_to_string(path)
        .map_err(|err| format!("Failed to read {path}: {err}"))?;
    serde_json::from_str(&contents).map_err(|err| format!("Failed to parse {path}: {err}"))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Info);
    clog.init();

    let first_arg = match std::env::args().nth(1) {
        Some(arg) => arg,
        None => usage(),
    };
    let config = Config::load();

    match first_arg.as_str() {
        "--clear-cache" => {
            let cache = CacheManager::new(&config.cache_db_path())?;
            cache.clear();
            return Ok(());
        }
        "--clear-negative" => {
            let cache = CacheManager::new(&config.cache_db_path())?;
            let pattern = std::env::args().nth(2);
            let removed = cache.clear_negative_entries(pattern.as_deref());
            info!("Removed {removed} negative cache entries");
            return Ok(());
        }
        other if other.starts_with("--") => usage(),
        _ => {}
    }

    let references = load_references(&first_arg)?;
    info!("Loaded {} song references", references.len());

    let backend: Arc<dyn MusicBackend> = Arc::new(OpenSubsonicBackend::new(BackendAuth {
        endpoint: config.backend.endpoint.clone(),
        username: config.backend.username.clone(),
        password: config.backend.password.clone(),
    }));
    // Connectivity failure at startup is fatal; nothing downstream can work.
    backend
        .test_connection()
        .map_err(|err| format!("Backend connection failed: {err}"))?;
    info!("Connected to backend at {}", config.backend.endpoint);

    let mut cache = CacheManager::new(&config.cache_db_path())?;
    cache.set_negative_ttl_days(config.cache.negative_ttl_days);
    cache.set_playlist_ttl_hours(config.cache.playlist_ttl_hours);
    let cache = Arc::new(cache);

    let index_path = config.index_file_path();
    let mut index = VectorIndex::new();
    if !index.load_from_file(&index_path) {
        info!("Building similarity index from backend catalog...");
        index = build_index_from_backend(backend.as_ref())
            .map_err(|err| format!("Index bootstrap failed: {err}"))?;
        if let Some(parent) = index_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if !index.save_to_file(&index_path) {
            warn!("Could not persist similarity index to {}", index_path.display());
        }
    } else {
        info!(
            "Loaded similarity index with {} tracks from {}",
            index.len(),
            index_path.display()
        );
    }
    let index = Arc::new(Mutex::new(index));

    let mut resolver = Resolver::new(Arc::clone(&backend), Arc::clone(&cache), Arc::clone(&index))
        .with_index_params(config.index.min_score, config.index.limit);
    if config.cleanup.enabled {
        resolver = resolver.with_cleanup(Arc::new(HttpCleanupService::new(
            &config.cleanup.endpoint,
            &config.cleanup.api_key,
            &config.cleanup.model,
        )));
    }
    if config.confirmation.manual_search {
        resolver = resolver.with_confirmation(Arc::new(TerminalConfirmation));
    }

    let mut resolved = 0usize;
    let mut not_found = 0usize;
    let mut aborted = 0usize;
    for reference in &references {
        match resolver.resolve(reference) {
            ResolveOutcome::Resolved(track) => {
                resolved += 1;
                println!(
                    "RESOLVED  {reference} -> {} - {} [{}]",
                    track.artist, track.title, track.backend_id
                );
            }
            ResolveOutcome::NotFound => {
                not_found += 1;
                println!("NOT FOUND {reference}");
            }
            ResolveOutcome::Aborted => {
                aborted += 1;
                warn!("Resolution aborted for: {reference}");
                println!("ABORTED   {reference}");
            }
        }
    }

    // Refreshes during confirmation may have grown the index.
    match index.lock() {
        Ok(guard) => {
            if !guard.save_to_file(&index_path) {
                warn!("Could not persist similarity index to {}", index_path.display());
            }
        }
        Err(_) => error!("Similarity index lock poisoned, skipping save"),
    }

    info!(
        "Done: {resolved} resolved, {not_found} not found, {aborted} aborted of {}",
        references.len()
    );
    Ok(())
}
