//! One-shot key watches.
//!
//! A watch is armed on a key and fires exactly once, on the first committed
//! change to that key after registration. Firing consumes the watch; callers
//! re-arm after handling the event if they want to keep observing.

use chorus_core::Zxid;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(Uuid);

impl WatchId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// What happened to the watched key, at which point in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Set {
        key: String,
        value: String,
        zxid: Zxid,
    },
    Deleted {
        key: String,
        zxid: Zxid,
    },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. } => key,
            Self::Deleted { key, .. } => key,
        }
    }

    pub fn zxid(&self) -> Zxid {
        match self {
            Self::Set { zxid, .. } => *zxid,
            Self::Deleted { zxid, .. } => *zxid,
        }
    }
}

#[derive(Default)]
pub struct WatchRegistry {
    armed: Mutex<HashMap<String, Vec<(WatchId, oneshot::Sender<WatchEvent>)>>>,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a watch on `key`. The receiver resolves with the next committed
    /// change and never again.
    pub fn register(&self, key: &str) -> (WatchId, oneshot::Receiver<WatchEvent>) {
        let (tx, rx) = oneshot::channel();
        let id = WatchId::new();
        self.armed
            .lock()
            .entry(key.to_string())
            .or_default()
            .push((id, tx));
        (id, rx)
    }

    /// Disarm a watch that has not fired yet.
    pub fn cancel(&self, key: &str, id: WatchId) {
        let mut armed = self.armed.lock();
        if let Some(watchers) = armed.get_mut(key) {
            watchers.retain(|(watch_id, _)| *watch_id != id);
            if watchers.is_empty() {
                armed.remove(key);
            }
        }
    }

    /// Fire and consume every watch armed on the event's key.
    pub fn fire(&self, event: WatchEvent) {
        let watchers = self.armed.lock().remove(event.key());
        if let Some(watchers) = watchers {
            for (_, tx) in watchers {
                // A dropped receiver just means nobody is listening anymore.
                let _ = tx.send(event.clone());
            }
        }
    }

    pub fn armed_count(&self, key: &str) -> usize {
        self.armed.lock().get(key).map_or(0, Vec::len)
    }
}
