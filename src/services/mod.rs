pub mod watcher;

pub use watcher::{validate_watch_path, WatcherService};
