pub mod bridge;
pub mod context;
pub mod error;
pub mod organizer;
pub mod readiness;
pub mod services;
pub mod settings;

use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tracing_subscriber::EnvFilter;

use context::{ContextEvent, ContextStore};
use organizer::OrganizerEvent;
use services::WatcherService;
use settings::Settings;

pub use error::{OrganizerError, Result};

/// How long shutdown waits for downloads that are already being processed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub fn run() {
    // Load .env file - current directory first, then the parent
    if dotenvy::dotenv().is_err() {
        let _ = dotenvy::from_path("../.env");
    }

    // Default: warn for most crates, info for ours (moves and context changes visible)
    // Use RUST_LOG=download_organizer=debug for per-poll readiness logs
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,download_organizer=info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            std::process::exit(1);
        }
    };

    runtime.block_on(serve());
}

/// Start watching the configured folder.
///
/// Failure is logged, not fatal: the organizer keeps running without a
/// watch until the folder is redirected with [`WatcherService::update_path`].
fn start_configured_watch(watcher: &WatcherService, folder: Result<PathBuf>) -> bool {
    match folder.and_then(|folder| watcher.update_path(&folder)) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(error = %e, "Not watching any folder");
            false
        }
    }
}

async fn serve() {
    let settings = Settings::load().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Falling back to default settings");
        Settings::default()
    });
    let watch_folder = settings.resolve_watch_folder();

    let store = ContextStore::new();
    let mut context_events = store.subscribe();
    let (events_tx, mut events) = unbounded_channel();

    let watcher = WatcherService::new(tokio::runtime::Handle::current(), settings, store, events_tx);
    start_configured_watch(&watcher, watch_folder);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "Failed to listen for shutdown signal");
                }
                break;
            }
            Some(event) = events.recv() => match event {
                OrganizerEvent::FileProcessed { source, destination } => {
                    tracing::debug!(from = %source.display(), to = %destination.display(), "File processed");
                }
                OrganizerEvent::Skipped { path, reason } => {
                    tracing::info!(path = %path.display(), reason = %reason, "Download left in place");
                }
            },
            Some(event) = context_events.recv() => match event {
                ContextEvent::Updated(context) => {
                    tracing::debug!(folder = %context.folder_name, "Routing downloads");
                }
                ContextEvent::Cleared => tracing::debug!("No routing target"),
            },
        }
    }

    tracing::info!("Shutting down");
    watcher.stop();
    watcher.drain(SHUTDOWN_GRACE).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn watcher() -> WatcherService {
        let (tx, _rx) = unbounded_channel();
        WatcherService::new(tokio::runtime::Handle::current(), Settings::default(), ContextStore::new(), tx)
    }

    #[tokio::test]
    async fn test_unresolvable_watch_folder_is_not_fatal() {
        let watcher = watcher();
        let started = start_configured_watch(&watcher, Err(OrganizerError::MissingDirectory("downloads")));

        assert!(!started);
        assert!(!watcher.is_running());
    }

    #[tokio::test]
    async fn test_rejected_watch_folder_is_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("downloads.txt");
        std::fs::write(&file, b"x").unwrap();
        let watcher = watcher();

        assert!(!start_configured_watch(&watcher, Ok(file)));
        assert!(!start_configured_watch(&watcher, Ok(Path::new("/").to_path_buf())));
        assert!(!watcher.is_running());
    }
}
