//! In-memory persistence, for non-recoverable channels and tests.

use std::collections::HashMap;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::channel::reference::{InitialLoadInfo, MessageReference, ReferenceInfo};
use crate::error::{ChannelError, ChannelResult};
use crate::persistence::PersistenceManager;
use crate::store::Message;

#[derive(Clone)]
struct StoredRef {
    delivery_count: u32,
    reliable: bool,
    page_order: Option<i64>,
    /// Insertion order, stands in for the sqlite rowid.
    seq: u64,
}

#[derive(Default)]
struct Inner {
    next_channel_id: u64,
    channels: HashMap<String, u64>,
    messages: HashMap<Uuid, Message>,
    refs: HashMap<(u64, Uuid), StoredRef>,
    next_seq: u64,
}

pub struct MemoryPersistenceManager {
    inner: Mutex<Inner>,
}

impl MemoryPersistenceManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Total reference rows for a channel (test introspection).
    pub fn reference_rows(&self, channel_id: u64) -> usize {
        let inner = self.inner.lock();
        inner.refs.keys().filter(|(ch, _)| *ch == channel_id).count()
    }

    /// Paged reference rows for a channel (test introspection).
    pub fn paged_rows(&self, channel_id: u64) -> usize {
        let inner = self.inner.lock();
        inner
            .refs
            .iter()
            .filter(|((ch, _), row)| *ch == channel_id && row.page_order.is_some())
            .count()
    }

    pub fn stored_messages(&self) -> usize {
        self.inner.lock().messages.len()
    }
}

impl Default for MemoryPersistenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn upsert_ref(&mut self, channel_id: u64, reference: &MessageReference, page_order: Option<i64>) {
        let message = reference.message();
        self.messages
            .entry(message.id)
            .or_insert_with(|| message.clone());
        let seq = self.next_seq;
        let entry = self
            .refs
            .entry((channel_id, message.id))
            .or_insert_with(|| StoredRef {
                delivery_count: 0,
                reliable: false,
                page_order: None,
                seq,
            });
        if entry.seq == seq {
            self.next_seq += 1;
        }
        entry.delivery_count = reference.delivery_count();
        entry.reliable = reference.is_reliable();
        entry.page_order = page_order;
    }

    fn drop_orphaned_message(&mut self, message_id: Uuid) {
        let still_referenced = self.refs.keys().any(|(_, id)| *id == message_id);
        if !still_referenced {
            self.messages.remove(&message_id);
        }
    }
}

impl PersistenceManager for MemoryPersistenceManager {
    fn channel_id_for(&self, name: &str) -> ChannelResult<u64> {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.channels.get(name) {
            return Ok(id);
        }
        let id = inner.next_channel_id;
        inner.next_channel_id += 1;
        inner.channels.insert(name.to_string(), id);
        Ok(id)
    }

    fn add_reference(&self, channel_id: u64, reference: &MessageReference) -> ChannelResult<()> {
        let mut inner = self.inner.lock();
        inner.upsert_ref(channel_id, reference, None);
        Ok(())
    }

    fn remove_reference(&self, channel_id: u64, message_id: Uuid) -> ChannelResult<()> {
        let mut inner = self.inner.lock();
        inner.refs.remove(&(channel_id, message_id));
        inner.drop_orphaned_message(message_id);
        Ok(())
    }

    fn get_initial_reference_infos(
        &self,
        channel_id: u64,
        limit: usize,
    ) -> ChannelResult<InitialLoadInfo> {
        let mut inner = self.inner.lock();

        let mut unpaged: Vec<(Uuid, StoredRef)> = inner
            .refs
            .iter()
            .filter(|((ch, _), row)| *ch == channel_id && row.page_order.is_none())
            .map(|((_, id), row)| (*id, row.clone()))
            .collect();
        unpaged.sort_by_key(|(_, row)| row.seq);

        let overflow: Vec<Uuid> = unpaged
            .iter()
            .skip(limit)
            .map(|(id, _)| *id)
            .collect();
        unpaged.truncate(limit);

        if !overflow.is_empty() {
            let mut order = inner
                .refs
                .iter()
                .filter(|((ch, _), row)| *ch == channel_id && row.page_order.is_some())
                .filter_map(|(_, row)| row.page_order)
                .max()
                .map(|max| max + 1)
                .unwrap_or(0);
            for id in overflow {
                if let Some(row) = inner.refs.get_mut(&(channel_id, id)) {
                    row.page_order = Some(order);
                    order += 1;
                }
            }
        }

        let orders: Vec<i64> = inner
            .refs
            .iter()
            .filter(|((ch, _), _)| *ch == channel_id)
            .filter_map(|(_, row)| row.page_order)
            .collect();
        let page_window = match (orders.iter().min(), orders.iter().max()) {
            (Some(&min), Some(&max)) => Some((min, max)),
            _ => None,
        };

        let refs = unpaged
            .into_iter()
            .map(|(message_id, row)| ReferenceInfo {
                message_id,
                delivery_count: row.delivery_count,
                reliable: row.reliable,
                paging_order: None,
            })
            .collect();

        Ok(InitialLoadInfo { refs, page_window })
    }

    fn get_paged_reference_infos(
        &self,
        channel_id: u64,
        from_order: i64,
        count: usize,
    ) -> ChannelResult<Vec<ReferenceInfo>> {
        let to_order = from_order + count as i64 - 1;
        let inner = self.inner.lock();
        let mut rows: Vec<ReferenceInfo> = inner
            .refs
            .iter()
            .filter(|((ch, _), row)| {
                *ch == channel_id
                    && row
                        .page_order
                        .map(|o| o >= from_order && o <= to_order)
                        .unwrap_or(false)
            })
            .map(|((_, id), row)| ReferenceInfo {
                message_id: *id,
                delivery_count: row.delivery_count,
                reliable: row.reliable,
                paging_order: row.page_order,
            })
            .collect();
        rows.sort_by_key(|info| info.paging_order);
        Ok(rows)
    }

    fn get_messages(&self, ids: &[Uuid]) -> ChannelResult<Vec<Message>> {
        let inner = self.inner.lock();
        Ok(ids
            .iter()
            .filter_map(|id| inner.messages.get(id).cloned())
            .collect())
    }

    fn page_references(&self, channel_id: u64, refs: &[&MessageReference]) -> ChannelResult<()> {
        let mut inner = self.inner.lock();
        for reference in refs {
            inner.upsert_ref(channel_id, reference, reference.paging_order());
        }
        Ok(())
    }

    fn update_page_order(&self, channel_id: u64, refs: &[&MessageReference]) -> ChannelResult<()> {
        let mut inner = self.inner.lock();
        for reference in refs {
            let row = inner
                .refs
                .get_mut(&(channel_id, reference.message_id()))
                .ok_or_else(|| {
                    ChannelError::store(
                        "update_page_order",
                        format!("no persisted row for message {}", reference.message_id()),
                    )
                })?;
            row.page_order = reference.paging_order();
        }
        Ok(())
    }

    fn remove_depaged_references(&self, channel_id: u64, message_ids: &[Uuid]) -> ChannelResult<()> {
        let mut inner = self.inner.lock();
        for id in message_ids {
            inner.refs.remove(&(channel_id, *id));
            inner.drop_orphaned_message(*id);
        }
        Ok(())
    }

    fn update_reliable_refs_not_paged_in_range(
        &self,
        channel_id: u64,
        from_order: i64,
        to_order: i64,
        expected_count: usize,
    ) -> ChannelResult<()> {
        let mut inner = self.inner.lock();
        let matching: Vec<(u64, Uuid)> = inner
            .refs
            .iter()
            .filter(|((ch, _), row)| {
                *ch == channel_id
                    && row.reliable
                    && row
                        .page_order
                        .map(|o| o >= from_order && o <= to_order)
                        .unwrap_or(false)
            })
            .map(|(key, _)| *key)
            .collect();
        if matching.len() != expected_count {
            return Err(ChannelError::store(
                "update_reliable_refs_not_paged_in_range",
                format!(
                    "expected {} reliable rows in [{}, {}], found {}",
                    expected_count,
                    from_order,
                    to_order,
                    matching.len()
                ),
            ));
        }
        for key in matching {
            if let Some(row) = inner.refs.get_mut(&key) {
                row.page_order = None;
            }
        }
        Ok(())
    }
}
