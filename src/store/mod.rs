//! Message Store: process-global cache of message bodies.
//!
//! Bodies are deduplicated by message id and shared between channels as
//! `Arc<Message>`. The store keeps a per-body count of channel references so
//! a body can be evicted the moment no channel needs it in memory anymore
//! (a paged-out or acknowledged reference releases its count).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub priority: u8,
    /// Advisory flag from the producer. Delivery reliability is a
    /// per-reference attribute; channels never read this after routing.
    pub reliable: bool,
    pub payload: Bytes,
}

impl Message {
    pub fn new(payload: Bytes, priority: u8, reliable: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority,
            reliable,
            payload,
        }
    }
}

struct CacheEntry {
    message: Arc<Message>,
    ref_count: usize,
}

pub struct MessageStore {
    bodies: Mutex<HashMap<Uuid, CacheEntry>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            bodies: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the body for an already-known message, bumping its count.
    pub fn acquire(&self, id: Uuid) -> Option<Arc<Message>> {
        let mut bodies = self.bodies.lock();
        bodies.get_mut(&id).map(|entry| {
            entry.ref_count += 1;
            entry.message.clone()
        })
    }

    /// Registers a newly created or newly loaded body. If the body is
    /// already cached the existing instance wins and its count is bumped.
    pub fn insert(&self, message: Message) -> Arc<Message> {
        let mut bodies = self.bodies.lock();
        let entry = bodies.entry(message.id).or_insert_with(|| CacheEntry {
            message: Arc::new(message),
            ref_count: 0,
        });
        entry.ref_count += 1;
        entry.message.clone()
    }

    /// Signals that one channel reference no longer needs the body in
    /// memory. At count zero the body is evicted.
    pub fn release(&self, id: Uuid) {
        let mut bodies = self.bodies.lock();
        if let Some(entry) = bodies.get_mut(&id) {
            entry.ref_count -= 1;
            if entry.ref_count == 0 {
                bodies.remove(&id);
            }
        }
    }

    /// Number of bodies currently cached.
    pub fn cached(&self) -> usize {
        self.bodies.lock().len()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}
