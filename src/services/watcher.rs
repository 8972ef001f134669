use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, RecommendedCache};
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::context::ContextStore;
use crate::error::{OrganizerError, Result};
use crate::organizer::{Organizer, OrganizerEvent};
use crate::settings::Settings;

/// Quiet period before the debouncer hands events over
const DEBOUNCE: Duration = Duration::from_millis(500);

/// System directories that should never be watched
#[cfg(target_os = "macos")]
const FORBIDDEN_PREFIXES: &[&str] = &[
    "/System", "/Library", "/private", "/usr", "/bin", "/sbin", "/var", "/etc", "/dev", "/tmp", "/cores",
];

#[cfg(target_os = "windows")]
const FORBIDDEN_PREFIXES: &[&str] = &[
    "C:\\Windows",
    "C:\\Program Files",
    "C:\\Program Files (x86)",
    "C:\\ProgramData",
];

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const FORBIDDEN_PREFIXES: &[&str] = &[
    "/usr", "/bin", "/sbin", "/var", "/etc", "/dev", "/proc", "/sys", "/tmp", "/boot",
];

/// Mount points accepted outside the home directory
const ALLOWED_OUTSIDE_HOME: &[&str] = &["/Volumes", "/mnt", "/media"];

/// Check that a user-chosen directory is safe to watch.
///
/// Returns the canonical path on success.
pub fn validate_watch_path(path: &Path) -> Result<PathBuf> {
    let invalid = |reason: &str| OrganizerError::InvalidWatchPath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let canonical = path.canonicalize().map_err(|e| invalid(&format!("cannot resolve path: {}", e)))?;

    if !canonical.is_dir() {
        return Err(invalid("not a directory"));
    }

    if canonical.parent().is_none() {
        return Err(invalid("cannot watch the root directory"));
    }

    let home = dirs::home_dir().and_then(|home| home.canonicalize().ok());
    if home.as_ref().is_some_and(|home| canonical.starts_with(home)) {
        return Ok(canonical);
    }

    if let Some(forbidden) = FORBIDDEN_PREFIXES
        .iter()
        .find(|prefix| canonical.starts_with(prefix))
    {
        return Err(invalid(&format!("cannot watch system directory {}", forbidden)));
    }

    if home.is_some()
        && !ALLOWED_OUTSIDE_HOME
            .iter()
            .any(|prefix| canonical.starts_with(prefix))
    {
        return Err(invalid("only directories in the home folder or on mounted volumes can be watched"));
    }

    Ok(canonical)
}

/// An active subscription on one directory
struct ActiveWatch {
    /// Dropping the debouncer ends the OS subscription
    _debouncer: Debouncer<RecommendedWatcher, RecommendedCache>,
    path: PathBuf,
    shutdown: oneshot::Sender<()>,
    dispatcher: JoinHandle<()>,
}

#[derive(Default)]
struct WatcherState {
    active: Option<ActiveWatch>,
    /// Dispatchers of stopped watches whose units may still be running
    draining: Vec<JoinHandle<()>>,
}

/// Owns the directory subscription and the per-file units it spawns.
///
/// Cheap to clone; clones control the same watch.
#[derive(Clone)]
pub struct WatcherService {
    state: Arc<Mutex<WatcherState>>,
    settings: Arc<Settings>,
    store: ContextStore,
    events: UnboundedSender<OrganizerEvent>,
    runtime: Handle,
}

impl WatcherService {
    pub fn new(
        runtime: Handle,
        settings: Settings,
        store: ContextStore,
        events: UnboundedSender<OrganizerEvent>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(WatcherState::default())),
            settings: Arc::new(settings),
            store,
            events,
            runtime,
        }
    }

    fn lock(&self) -> MutexGuard<'_, WatcherState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Watcher state mutex was poisoned, recovering...");
            poisoned.into_inner()
        })
    }

    /// Start watching `path`. Already watching the same path is a no-op;
    /// watching another path replaces the old watch.
    pub fn start(&self, path: &Path) -> Result<()> {
        let mut state = self.lock();

        if state.active.as_ref().is_some_and(|active| active.path == path) {
            tracing::debug!(path = %path.display(), "Already watching");
            return Ok(());
        }

        // A failed start leaves the previous watch in place
        let active = self.spawn_watch(path)?;
        tracing::info!(path = %path.display(), "Watching for downloads");

        if let Some(previous) = state.active.replace(active) {
            let handle = shut_down(previous);
            state.draining.push(handle);
        }
        Ok(())
    }

    /// Stop watching. In-flight units keep running; see [`Self::drain`].
    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some(active) = state.active.take() {
            tracing::info!(path = %active.path.display(), "Stopped watching");
            let handle = shut_down(active);
            state.draining.push(handle);
        }
    }

    /// Redirect the watch to a user-chosen `path`.
    ///
    /// The path goes through [`validate_watch_path`] first; a rejected path
    /// leaves the current watch untouched.
    pub fn update_path(&self, path: &Path) -> Result<()> {
        let path = validate_watch_path(path)?;
        self.stop();
        self.start(&path)
    }

    pub fn is_running(&self) -> bool {
        self.lock().active.is_some()
    }

    pub fn watching_path(&self) -> Option<PathBuf> {
        self.lock().active.as_ref().map(|active| active.path.clone())
    }

    /// Wait up to `timeout` for units of stopped watches to finish.
    ///
    /// Returns `false` if some were still running when the time ran out.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let handles = std::mem::take(&mut self.lock().draining);
        if handles.is_empty() {
            return true;
        }

        let wait_all = async {
            for handle in handles {
                if let Err(e) = handle.await {
                    log_join_error(&e);
                }
            }
        };

        match tokio::time::timeout(timeout, wait_all).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Gave up waiting for in-flight downloads");
                false
            }
        }
    }

    fn spawn_watch(&self, path: &Path) -> Result<ActiveWatch> {
        let (path_tx, path_rx) = unbounded_channel();

        let mut debouncer = new_debouncer(DEBOUNCE, None, move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    for path in candidate_paths(&event) {
                        // Receiver gone means the watch is shutting down
                        let _ = path_tx.send(path);
                    }
                }
            }
            Err(errors) => {
                for error in errors {
                    tracing::warn!(error = %error, "Watcher error");
                }
            }
        })?;

        debouncer.watch(path, RecursiveMode::NonRecursive)?;

        let organizer = Arc::new(Organizer::new(
            self.settings.as_ref().clone(),
            self.store.clone(),
            path,
            self.events.clone(),
        ));
        let limit = self.settings.max_concurrent_files.max(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let dispatcher = self
            .runtime
            .spawn(dispatch(path_rx, shutdown_rx, organizer, limit));

        Ok(ActiveWatch {
            _debouncer: debouncer,
            path: path.to_path_buf(),
            shutdown: shutdown_tx,
            dispatcher,
        })
    }
}

fn shut_down(active: ActiveWatch) -> JoinHandle<()> {
    let ActiveWatch {
        _debouncer,
        shutdown,
        dispatcher,
        ..
    } = active;
    drop(_debouncer);
    let _ = shutdown.send(());
    dispatcher
}

/// Paths worth looking at: created files and the destination of renames,
/// since browsers finish a download by renaming the partial file.
fn candidate_paths(event: &DebouncedEvent) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Create(_) => event.paths.clone(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event.paths.last().cloned().into_iter().collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.clone(),
        // Platforms that can't tell which side of a rename this is
        EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
            event.paths.iter().filter(|p| p.exists()).cloned().collect()
        }
        _ => Vec::new(),
    }
}

/// Fan detected paths out to blocking units, at most `limit` at a time.
///
/// After shutdown no new paths are taken, but units already started run to
/// completion.
async fn dispatch(
    mut paths: UnboundedReceiver<PathBuf>,
    mut shutdown: oneshot::Receiver<()>,
    organizer: Arc<Organizer>,
    limit: usize,
) {
    let semaphore = Arc::new(Semaphore::new(limit));
    let mut units: JoinSet<std::result::Result<PathBuf, JoinError>> = JoinSet::new();
    let mut in_flight: HashSet<PathBuf> = HashSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            received = paths.recv() => {
                let Some(path) = received else { break };
                // The same download often shows up as create plus rename
                if !in_flight.insert(path.clone()) {
                    tracing::debug!(path = %path.display(), "Already processing");
                    continue;
                }

                let organizer = Arc::clone(&organizer);
                let semaphore = Arc::clone(&semaphore);
                units.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    tokio::task::spawn_blocking(move || run_unit(path, |p| organizer.process(p))).await
                });
            }
            Some(finished) = units.join_next(), if !units.is_empty() => {
                reap(finished, &mut in_flight);
            }
        }
    }

    while let Some(finished) = units.join_next().await {
        reap(finished, &mut in_flight);
    }
}

/// Run `work` on `path`, containing a panic to this one file.
///
/// Always hands the path back so the dispatcher can forget it.
fn run_unit(path: PathBuf, work: impl FnOnce(&Path)) -> PathBuf {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| work(&path))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(path = %path.display(), panic = %message, "File processing unit panicked");
    }
    path
}

fn reap(
    finished: std::result::Result<std::result::Result<PathBuf, JoinError>, JoinError>,
    in_flight: &mut HashSet<PathBuf>,
) {
    match finished {
        Ok(Ok(path)) => {
            in_flight.remove(&path);
        }
        Ok(Err(e)) | Err(e) => log_join_error(&e),
    }
}

fn log_join_error(e: &JoinError) {
    if e.is_panic() {
        tracing::error!(error = %e, "File processing unit panicked");
    } else {
        tracing::warn!(error = %e, "File processing unit was cancelled");
    }
}
