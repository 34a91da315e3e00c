//! Registry of in-flight relay sessions.
//!
//! Sessions live in a slot arena keyed by `SessionKey`. The registry carries no
//! relay data; it exists so teardown can wait until every relay has exited.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Index of a session slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(usize);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Snapshot of one in-flight session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: SessionKey,
    pub peer: SocketAddr,
    pub age: Duration,
}

#[derive(Debug)]
struct SessionEntry {
    peer: SocketAddr,
    opened_at: Instant,
}

#[derive(Debug, Default)]
struct Slots {
    entries: Vec<Option<SessionEntry>>,
    free: Vec<usize>,
    live: usize,
}

#[derive(Debug)]
pub struct SessionRegistry {
    slots: Mutex<Slots>,
    live_tx: watch::Sender<usize>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        let (live_tx, _) = watch::channel(0);
        Arc::new(Self {
            slots: Mutex::new(Slots::default()),
            live_tx,
        })
    }

    /// Add a session. It stays registered until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> SessionGuard {
        let mut slots = self.lock();
        let entry = SessionEntry {
            peer,
            opened_at: Instant::now(),
        };
        let index = match slots.free.pop() {
            Some(index) => {
                slots.entries[index] = Some(entry);
                index
            }
            None => {
                slots.entries.push(Some(entry));
                slots.entries.len() - 1
            }
        };
        slots.live += 1;
        self.live_tx.send_replace(slots.live);

        SessionGuard {
            registry: Arc::clone(self),
            key: SessionKey(index),
        }
    }

    fn deregister(&self, key: SessionKey) {
        let mut slots = self.lock();
        if let Some(slot) = slots.entries.get_mut(key.0) {
            if slot.take().is_some() {
                slots.free.push(key.0);
                slots.live -= 1;
                self.live_tx.send_replace(slots.live);
            }
        }
    }

    /// Number of in-flight sessions
    pub fn len(&self) -> usize {
        self.lock().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let slots = self.lock();
        let now = Instant::now();
        slots
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.as_ref().map(|entry| SessionInfo {
                    key: SessionKey(index),
                    peer: entry.peer,
                    age: now.saturating_duration_since(entry.opened_at),
                })
            })
            .collect()
    }

    /// Resolve once no session is registered
    pub async fn wait_idle(&self) {
        let mut live_rx = self.live_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = live_rx.wait_for(|live| *live == 0).await;
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deregisters its session when dropped
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    key: SessionKey,
}

impl SessionGuard {
    pub fn key(&self) -> SessionKey {
        self.key
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.key);
    }
}
