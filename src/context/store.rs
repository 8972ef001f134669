use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use super::normalize::{folder_name, sanitize_id};
use super::payload::ContextPayload;

/// The live routing target, as handed to readers.
///
/// Snapshots are owned copies; a reader never observes a half-applied update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingContext {
    pub primary_id: String,
    pub secondary_id: Option<String>,
    pub raw_title: String,
    pub source: String,
    /// Destination folder name, derived once at update time
    pub folder_name: String,
    pub last_update: DateTime<Utc>,
}

impl RoutingContext {
    fn from_payload(payload: &ContextPayload) -> Self {
        let (primary, secondary) = payload.select_ids();
        let primary_id = sanitize_id(&primary);
        let raw_title = payload.title().unwrap_or_default().to_string();
        Self {
            folder_name: folder_name(&primary_id, &raw_title),
            primary_id,
            secondary_id: secondary,
            raw_title,
            source: payload.source().unwrap_or("unknown").to_string(),
            last_update: Utc::now(),
        }
    }
}

/// Notification sent to subscribers after every store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    Updated(RoutingContext),
    Cleared,
}

#[derive(Default)]
struct StoreState {
    current: Option<RoutingContext>,
    subscribers: Vec<UnboundedSender<ContextEvent>>,
}

impl StoreState {
    /// Deliver to every subscriber in registration order, pruning closed ones.
    fn notify(&mut self, event: &ContextEvent) {
        self.subscribers.retain(|tx| match tx.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!("Context subscriber dropped, removing");
                false
            }
        });
    }
}

/// Shared holder of the single live [`RoutingContext`].
///
/// Cheap to clone; every clone refers to the same state.
#[derive(Clone, Default)]
pub struct ContextStore {
    state: Arc<Mutex<StoreState>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Context store mutex was poisoned, recovering...");
            poisoned.into_inner()
        })
    }

    /// Replace the live context wholesale.
    ///
    /// An empty payload is the "no active context" signal and empties the
    /// store. Subscribers are notified either way.
    pub fn update(&self, payload: &ContextPayload) {
        let mut state = self.lock();

        if payload.is_empty() {
            state.current = None;
            tracing::info!(source = payload.source().unwrap_or("unknown"), "Context emptied");
            state.notify(&ContextEvent::Cleared);
            return;
        }

        let context = RoutingContext::from_payload(payload);
        tracing::info!(
            id = %context.primary_id,
            folder = %context.folder_name,
            source = %context.source,
            "Context updated"
        );
        state.current = Some(context.clone());
        state.notify(&ContextEvent::Updated(context));
    }

    /// Drop the live context. No-op (and no notification) if already empty.
    pub fn clear(&self) {
        let mut state = self.lock();
        if state.current.take().is_some() {
            tracing::info!("Context cleared");
            state.notify(&ContextEvent::Cleared);
        }
    }

    /// Owned copy of the live context, if any.
    pub fn snapshot(&self) -> Option<RoutingContext> {
        self.lock().current.clone()
    }

    /// Register for change notifications.
    pub fn subscribe(&self) -> UnboundedReceiver<ContextEvent> {
        let (tx, rx) = unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}
