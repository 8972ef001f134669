//! Context side-channel through the focused window's title.
//!
//! The browser extension prefixes the page title with
//! `[PLM_CTX:<id>|<title>]`, which shows up in the browser's window title.
//! Polling the foreground window picks the context up even when the
//! extension cannot reach the local listener.

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::context::{has_defect_prefix, ContextPayload, ContextStore};

/// Id of 1-30 characters, title greedy up to the last `]`
static TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[PLM_CTX:([^|]{1,30})\|(.*)\](?:\s|$)").expect("Invalid regex"));

/// Source recorded on contexts coming from this bridge
pub const BRIDGE_SOURCE: &str = "window-title";

/// Executables treated as browsers (lowercase)
pub const BROWSER_PROCESSES: &[&str] = &[
    "chrome.exe",
    "msedge.exe",
    "whale.exe",
    "firefox.exe",
    "brave.exe",
    "chrome",
    "msedge",
    "firefox",
    "brave",
    "google chrome",
    "microsoft edge",
];

/// The currently focused top-level window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundWindow {
    pub title: String,
    /// Executable name of the owning process
    pub process_name: String,
}

/// Platform hook for reading the focused window.
pub trait WindowProbe: Send {
    /// `None` when nothing is focused or the query failed
    fn foreground_window(&mut self) -> Option<ForegroundWindow>;
}

/// A parsed `[PLM_CTX:...]` tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleTag {
    pub id: String,
    pub title: String,
    /// The full matched tag, used to suppress repeats
    pub raw: String,
}

impl TitleTag {
    pub fn to_payload(&self) -> ContextPayload {
        let (defect_id, plm_id) = if has_defect_prefix(&self.id) {
            (Some(self.id.clone()), None)
        } else {
            (None, Some(self.id.clone()))
        };
        ContextPayload {
            defect_id,
            plm_id,
            title: Some(self.title.clone()),
            url: Some(BRIDGE_SOURCE.to_string()),
        }
    }
}

pub fn parse_title_tag(window_title: &str) -> Option<TitleTag> {
    let captures = TAG_PATTERN.captures(window_title)?;
    Some(TitleTag {
        id: captures[1].to_string(),
        title: captures[2].to_string(),
        raw: captures[0].trim_end().to_string(),
    })
}

pub fn is_browser_process(process_name: &str) -> bool {
    let name = process_name.trim().to_lowercase();
    BROWSER_PROCESSES.contains(&name.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LastSync {
    Nothing,
    Tag(String),
    Cleared,
}

/// Feeds tags seen in the focused window into a [`ContextStore`].
pub struct TitleBridge {
    store: ContextStore,
    last: LastSync,
}

impl TitleBridge {
    pub fn new(store: ContextStore) -> Self {
        Self {
            store,
            last: LastSync::Nothing,
        }
    }

    /// Apply one observation of the focused window.
    ///
    /// A new tag updates the store; the same tag again does nothing. A
    /// browser in front without a tag means the user left the tracked page,
    /// which clears the store once until the next tag shows up. Non-browser
    /// windows are ignored.
    pub fn observe(&mut self, window: &ForegroundWindow) {
        if let Some(tag) = parse_title_tag(&window.title) {
            if self.last == LastSync::Tag(tag.raw.clone()) {
                return;
            }
            tracing::info!(id = %tag.id, "Context synced from window title");
            self.store.update(&tag.to_payload());
            self.last = LastSync::Tag(tag.raw);
            return;
        }

        if is_browser_process(&window.process_name) && self.last != LastSync::Cleared {
            tracing::info!(process = %window.process_name, "Browser focused without context tag, clearing");
            self.store.clear();
            self.last = LastSync::Cleared;
        }
    }

    pub fn poll_once(&mut self, probe: &mut dyn WindowProbe) {
        if let Some(window) = probe.foreground_window() {
            if !window.title.is_empty() {
                self.observe(&window);
            }
        }
    }

    /// Poll every `interval` until `shutdown` fires or its sender is dropped.
    pub async fn run(mut self, mut probe: impl WindowProbe, interval: Duration, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => self.poll_once(&mut probe),
            }
        }
        tracing::debug!("Title bridge stopped");
    }
}
