//! Down Cache: bounded write-behind buffer of references awaiting page-out.
//!
//! Batching only; the channel core decides when to flush and performs the
//! store calls. Entries keep their assigned page order, so a failed flush
//! simply leaves them here for the next attempt.

use crate::channel::reference::MessageReference;

pub struct DownCache {
    entries: Vec<MessageReference>,
    capacity: usize,
}

impl DownCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, reference: MessageReference) {
        self.entries.push(reference);
    }

    pub fn entries(&self) -> &[MessageReference] {
        &self.entries
    }

    pub fn drain(&mut self) -> Vec<MessageReference> {
        std::mem::take(&mut self.entries)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::channel::reference::MessageReference;
    use crate::store::Message;

    fn make_ref(tag: &str) -> MessageReference {
        let msg = Message::new(Bytes::from(tag.to_string()), 0, false);
        MessageReference::new(Arc::new(msg), false)
    }

    #[test]
    fn test_fills_to_capacity() {
        let mut cache = DownCache::new(2);
        assert!(!cache.is_full());
        cache.push(make_ref("a"));
        assert!(!cache.is_full());
        cache.push(make_ref("b"));
        assert!(cache.is_full());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_drain_preserves_order_and_empties() {
        let mut cache = DownCache::new(4);
        cache.push(make_ref("a"));
        cache.push(make_ref("b"));
        cache.push(make_ref("c"));

        let drained = cache.drain();
        let tags: Vec<_> = drained.iter().map(|r| r.message().payload.clone()).collect();
        assert_eq!(tags, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
        assert!(cache.is_empty());
    }
}
