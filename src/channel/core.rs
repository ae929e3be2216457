//! Channel Core: the paging state machine.
//!
//! Pure sequential logic without concurrency primitives; the channel actor
//! owns one of these and drives it one operation at a time. Producers fill
//! the ordered multiset until the memory budget is reached, then references
//! spill through the down cache into the persistence manager. Consumer
//! drains trigger conditional reloads of the paged segment.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, trace};
use uuid::Uuid;

use crate::channel::down_cache::DownCache;
use crate::channel::multiset::OrderedMultiset;
use crate::channel::paging::PageWindow;
use crate::channel::reference::{MessageReference, ReferenceInfo};
use crate::config::Config;
use crate::error::{ChannelError, ChannelResult};
use crate::persistence::PersistenceManager;
use crate::store::{Message, MessageStore};

#[derive(Debug, Clone, Copy)]
pub struct PagingParams {
    pub full_size: usize,
    pub page_size: usize,
    pub down_cache_size: usize,
}

impl PagingParams {
    pub fn new(full_size: usize, page_size: usize, down_cache_size: usize) -> ChannelResult<Self> {
        if down_cache_size == 0 || down_cache_size > page_size || page_size >= full_size {
            return Err(ChannelError::InvariantViolation(format!(
                "paging params must satisfy 0 < down_cache_size <= page_size < full_size, \
                 got full={} page={} down={}",
                full_size, page_size, down_cache_size
            )));
        }
        Ok(Self {
            full_size,
            page_size,
            down_cache_size,
        })
    }
}

impl Default for PagingParams {
    fn default() -> Self {
        let cfg = &Config::global().paging;
        Self {
            full_size: cfg.full_size,
            page_size: cfg.page_size,
            down_cache_size: cfg.down_cache_size,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelOptions {
    pub params: PagingParams,
    /// Backed by a durable store that honors reliable references.
    pub recoverable: bool,
    pub accept_reliable_messages: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            params: PagingParams::default(),
            recoverable: true,
            accept_reliable_messages: true,
        }
    }
}

pub struct ChannelCore {
    channel_id: u64,
    name: String,
    params: PagingParams,
    refs: OrderedMultiset,
    down_cache: DownCache,
    window: PageWindow,
    paging: bool,
    active: bool,
    recoverable: bool,
    accept_reliable: bool,
    store: Arc<MessageStore>,
    pm: Arc<dyn PersistenceManager>,
}

impl ChannelCore {
    pub fn new(
        channel_id: u64,
        name: impl Into<String>,
        options: ChannelOptions,
        store: Arc<MessageStore>,
        pm: Arc<dyn PersistenceManager>,
    ) -> Self {
        Self {
            channel_id,
            name: name.into(),
            params: options.params,
            refs: OrderedMultiset::new(),
            down_cache: DownCache::new(options.params.down_cache_size),
            window: PageWindow::new(),
            paging: false,
            active: false,
            recoverable: options.recoverable,
            accept_reliable: options.accept_reliable_messages,
            store,
            pm,
        }
    }

    // --- Producer side ---

    /// Registers the body, persists the row for a reliable reference on a
    /// recoverable channel, and routes the reference into the channel.
    pub fn publish(&mut self, message: Message) -> ChannelResult<()> {
        self.ensure_active()?;
        let reliable = message.reliable;
        if reliable && self.paging && !self.accept_reliable {
            return Err(self.reliable_rejected(message.id));
        }
        let message_id = message.id;
        let body = self.store.insert(message);
        let reference = MessageReference::new(body, reliable);
        if reliable && self.recoverable {
            if let Err(e) = self.pm.add_reference(self.channel_id, &reference) {
                self.store.release(message_id);
                return Err(e);
            }
        }
        match self.add(reference) {
            Err(e @ ChannelError::InvariantViolation(_)) => {
                // The reference never entered the channel; its row must not
                // outlive it.
                if reliable && self.recoverable {
                    if let Err(undo) = self.pm.remove_reference(self.channel_id, message_id) {
                        error!(channel = %self.name, %message_id, %undo, "failed to undo reference row");
                    }
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Inserts a reference. While paging, the reference goes through the
    /// down cache; a rejected reference has its body released here.
    pub fn add(&mut self, reference: MessageReference) -> ChannelResult<()> {
        if !self.active {
            self.store.release(reference.message_id());
            return Err(ChannelError::IllegalState("channel is not loaded"));
        }
        if self.paging {
            if reference.reliable && !self.accept_reliable {
                let id = reference.message_id();
                self.store.release(id);
                return Err(self.reliable_rejected(id));
            }
            self.add_to_down_cache(reference, false)
        } else {
            self.refs.add_last(reference);
            if self.refs.len() == self.params.full_size {
                self.enter_paging();
            }
            Ok(())
        }
    }

    // --- Consumer side ---

    /// Dequeues the head reference and refills memory from the paged
    /// segment when there is headroom. If the refill fails the popped
    /// reference is put back and the error surfaces; nothing is lost.
    pub fn remove_first(&mut self) -> ChannelResult<Option<MessageReference>> {
        self.ensure_active()?;
        let popped = self.refs.remove_first();
        match self.check_load() {
            Ok(_) => Ok(popped.map(|mut reference| {
                reference.delivery_count += 1;
                reference
            })),
            Err(e) => {
                if let Some(reference) = popped {
                    self.refs.add_first(reference);
                }
                Err(e)
            }
        }
    }

    /// Restores a delivered reference to the head of its priority class.
    /// While paging at full memory, the displaced tail is evicted to the
    /// down cache with an order below the window start, so it logically
    /// sits at the front of the paged segment.
    pub fn cancel(&mut self, reference: MessageReference) -> ChannelResult<()> {
        if !self.active {
            self.store.release(reference.message_id());
            return Err(ChannelError::IllegalState("channel is not loaded"));
        }
        self.refs.add_first(reference);
        if self.paging {
            if self.refs.len() == self.params.full_size + 1 {
                if let Some(tail) = self.refs.remove_last() {
                    return self.add_to_down_cache(tail, true);
                }
            }
        } else if self.refs.len() == self.params.full_size {
            self.enter_paging();
        }
        Ok(())
    }

    /// Completes delivery: removes the persistent row of a reliable
    /// reference and releases the body.
    pub fn acknowledge(&mut self, reference: MessageReference) -> ChannelResult<()> {
        if !self.active {
            self.store.release(reference.message_id());
            return Err(ChannelError::IllegalState("channel is not loaded"));
        }
        let result = if reference.reliable && self.recoverable {
            self.pm.remove_reference(self.channel_id, reference.message_id())
        } else {
            Ok(())
        };
        self.store.release(reference.message_id());
        result
    }

    // --- Paging machinery ---

    fn add_to_down_cache(&mut self, mut reference: MessageReference, cancelling: bool) -> ChannelResult<()> {
        let order = if cancelling {
            self.window.assign_front()
        } else {
            self.window.assign_next()
        };
        reference.paging_order = Some(order);
        self.down_cache.push(reference);
        if self.down_cache.is_full() {
            self.flush_down_cache()?;
        }
        Ok(())
    }

    /// Persists the batched references. Rows for reliable references on a
    /// recoverable channel already exist unpaged and only get their page
    /// order stamped; everything else is inserted, body included. Bodies
    /// are released only after both store calls succeed; on failure the
    /// cache keeps its contents for the next attempt.
    pub fn flush_down_cache(&mut self) -> ChannelResult<()> {
        if self.down_cache.is_empty() {
            return Ok(());
        }
        let recoverable = self.recoverable;
        let (to_update, to_add): (Vec<&MessageReference>, Vec<&MessageReference>) = self
            .down_cache
            .entries()
            .iter()
            .partition(|r| r.reliable && recoverable);
        if !to_add.is_empty() {
            self.pm.page_references(self.channel_id, &to_add)?;
        }
        if !to_update.is_empty() {
            self.pm.update_page_order(self.channel_id, &to_update)?;
        }
        let flushed = self.down_cache.drain();
        debug!(channel = %self.name, count = flushed.len(), "flushed down cache");
        for reference in flushed {
            self.store.release(reference.message_id());
        }
        Ok(())
    }

    /// Reloads a page when the paged segment is non-empty and memory has
    /// room for a whole page. Returns whether a load happened.
    pub fn check_load(&mut self) -> ChannelResult<bool> {
        let ref_num = self.window.len();
        if ref_num == 0 {
            if self.refs.len() < self.params.full_size {
                self.leave_paging();
            }
            return Ok(false);
        }
        let loadable = ref_num.min(self.params.page_size);
        if self.refs.len() + loadable <= self.params.full_size {
            self.load_paged_references(loadable)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Consumes `number` page orders from the bottom of the window and
    /// brings the corresponding references back into memory. The window is
    /// advanced only after every store call has succeeded.
    fn load_paged_references(&mut self, number: usize) -> ChannelResult<()> {
        self.flush_down_cache()?;
        let from = self.window.first();
        let to = from + number as i64 - 1;
        let infos = self
            .pm
            .get_paged_reference_infos(self.channel_id, from, number)?;
        let loaded = self.materialize(&infos)?;

        let depaged: Vec<Uuid> = infos
            .iter()
            .filter(|info| !(info.reliable && self.recoverable))
            .map(|info| info.message_id)
            .collect();
        let reliable_count = infos.len() - depaged.len();

        if !depaged.is_empty() {
            if let Err(e) = self.pm.remove_depaged_references(self.channel_id, &depaged) {
                self.release_loaded(&loaded);
                return Err(e);
            }
        }
        if reliable_count > 0 {
            if let Err(e) = self.pm.update_reliable_refs_not_paged_in_range(
                self.channel_id,
                from,
                to,
                reliable_count,
            ) {
                self.release_loaded(&loaded);
                return Err(e);
            }
        }

        let count = loaded.len();
        for reference in loaded {
            self.refs.add_last(reference);
        }
        let drained = self.window.advance(number);
        debug!(channel = %self.name, count, from, "loaded paged references");
        if drained && self.refs.len() != self.params.full_size {
            self.leave_paging();
        }
        Ok(())
    }

    /// Turns store rows into live references. Bodies already cached are
    /// re-acquired; the rest are batch-loaded and registered. Delivery
    /// count and reliability come from the row, not the body.
    fn materialize(&mut self, infos: &[ReferenceInfo]) -> ChannelResult<Vec<MessageReference>> {
        let mut bodies: HashMap<Uuid, Arc<Message>> = HashMap::with_capacity(infos.len());
        let mut missing: Vec<Uuid> = Vec::new();
        for info in infos {
            match self.store.acquire(info.message_id) {
                Some(body) => {
                    bodies.insert(info.message_id, body);
                }
                None => missing.push(info.message_id),
            }
        }

        if !missing.is_empty() {
            let messages = match self.pm.get_messages(&missing) {
                Ok(messages) => messages,
                Err(e) => {
                    self.release_bodies(&bodies);
                    return Err(e);
                }
            };
            if messages.len() != missing.len() {
                self.release_bodies(&bodies);
                return Err(ChannelError::InvariantViolation(format!(
                    "requested {} message bodies, store returned {}",
                    missing.len(),
                    messages.len()
                )));
            }
            for message in messages {
                bodies.insert(message.id, self.store.insert(message));
            }
        }

        let mut out = Vec::with_capacity(infos.len());
        for info in infos {
            match bodies.get(&info.message_id) {
                Some(body) => out.push(MessageReference {
                    message: body.clone(),
                    delivery_count: info.delivery_count,
                    reliable: info.reliable,
                    paging_order: None,
                }),
                None => {
                    self.release_bodies(&bodies);
                    return Err(ChannelError::InvariantViolation(format!(
                        "store returned no body for message {}",
                        info.message_id
                    )));
                }
            }
        }
        Ok(out)
    }

    // --- Boundary operations ---

    /// Recovery: rebuilds the channel from the store and activates it.
    pub fn load(&mut self) -> ChannelResult<()> {
        if self.active {
            return Err(ChannelError::IllegalState("load requires an unloaded channel"));
        }
        self.unload()?;
        let info = self
            .pm
            .get_initial_reference_infos(self.channel_id, self.params.full_size)?;
        if let Some((min, max)) = info.page_window {
            self.window.restore(min, max);
            self.enter_paging();
        }
        let loaded = self.materialize(&info.refs)?;
        for reference in loaded {
            self.refs.add_last(reference);
        }
        if self.refs.len() >= self.params.full_size {
            self.enter_paging();
        }
        while self.check_load()? {}
        self.active = true;
        info!(
            channel = %self.name,
            in_memory = self.refs.len(),
            paged = self.window.len(),
            "channel loaded"
        );
        Ok(())
    }

    /// Clears all in-memory state. The store is untouched.
    pub fn unload(&mut self) -> ChannelResult<()> {
        if self.active {
            return Err(ChannelError::IllegalState("unload requires an inactive channel"));
        }
        while let Some(reference) = self.refs.remove_first() {
            self.store.release(reference.message_id());
        }
        for reference in self.down_cache.drain() {
            self.store.release(reference.message_id());
        }
        self.window.reset();
        self.paging = false;
        Ok(())
    }

    /// Flushes the down cache and marks the channel inactive, so it can be
    /// unloaded or reloaded.
    pub fn deactivate(&mut self) -> ChannelResult<()> {
        self.ensure_active()?;
        self.flush_down_cache()?;
        self.active = false;
        debug!(channel = %self.name, "channel deactivated");
        Ok(())
    }

    pub fn set_paging_params(
        &mut self,
        full_size: usize,
        page_size: usize,
        down_cache_size: usize,
    ) -> ChannelResult<()> {
        if self.active {
            return Err(ChannelError::IllegalState(
                "set_paging_params requires an inactive channel",
            ));
        }
        self.params = PagingParams::new(full_size, page_size, down_cache_size)?;
        self.down_cache.set_capacity(down_cache_size);
        Ok(())
    }

    // --- Inspectors ---

    /// Total references in the channel: in memory plus the page-order
    /// window. Down-cache entries carry window orders from the moment they
    /// are buffered, so the window term covers them too.
    pub fn message_count(&self) -> usize {
        self.refs.len() + self.window.len()
    }

    pub fn memory_count(&self) -> usize {
        self.refs.len()
    }

    pub fn paged_count(&self) -> usize {
        self.window.len()
    }

    pub fn down_cache_count(&self) -> usize {
        self.down_cache.len()
    }

    pub fn is_paging(&self) -> bool {
        self.paging
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    pub fn channel_id(&self) -> u64 {
        self.channel_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> PagingParams {
        self.params
    }

    // --- Internal helpers ---

    fn ensure_active(&self) -> ChannelResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(ChannelError::IllegalState("channel is not loaded"))
        }
    }

    fn enter_paging(&mut self) {
        if !self.paging {
            self.paging = true;
            trace!(channel = %self.name, "entering paging mode");
        }
    }

    fn leave_paging(&mut self) {
        if self.paging {
            self.paging = false;
            trace!(channel = %self.name, "leaving paging mode");
        }
    }

    fn reliable_rejected(&self, message_id: Uuid) -> ChannelError {
        ChannelError::InvariantViolation(format!(
            "reliable message {} not accepted by channel '{}'",
            message_id, self.name
        ))
    }

    fn release_bodies(&self, bodies: &HashMap<Uuid, Arc<Message>>) {
        for id in bodies.keys() {
            self.store.release(*id);
        }
    }

    fn release_loaded(&self, refs: &[MessageReference]) {
        for reference in refs {
            self.store.release(reference.message_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::channel::reference::InitialLoadInfo;
    use crate::persistence::MemoryPersistenceManager;

    struct Fixture {
        core: ChannelCore,
        store: Arc<MessageStore>,
        pm: Arc<MemoryPersistenceManager>,
    }

    fn options(full: usize, page: usize, down: usize) -> ChannelOptions {
        ChannelOptions {
            params: PagingParams::new(full, page, down).unwrap(),
            recoverable: true,
            accept_reliable_messages: true,
        }
    }

    fn fixture(full: usize, page: usize, down: usize) -> Fixture {
        let store = Arc::new(MessageStore::new());
        let pm = Arc::new(MemoryPersistenceManager::new());
        let channel_id = pm.channel_id_for("test").unwrap();
        let mut core = ChannelCore::new(
            channel_id,
            "test",
            options(full, page, down),
            store.clone(),
            pm.clone(),
        );
        core.load().unwrap();
        Fixture { core, store, pm }
    }

    fn push(f: &mut Fixture, tag: &str, priority: u8, reliable: bool) {
        f.core
            .publish(Message::new(Bytes::from(tag.to_string()), priority, reliable))
            .unwrap();
    }

    fn pop_tag(f: &mut Fixture) -> Option<String> {
        f.core.remove_first().unwrap().map(|r| {
            let tag = String::from_utf8_lossy(&r.message().payload).to_string();
            f.core.acknowledge(r).unwrap();
            tag
        })
    }

    fn assert_mode_invariant(f: &Fixture) {
        let expected = f.core.paged_count() > 0
            || f.core.down_cache_count() > 0
            || f.core.memory_count() == f.core.params().full_size;
        assert_eq!(f.core.is_paging(), expected, "paging flag out of sync");
    }

    // Adds beyond the memory budget spill through the down cache.
    #[test]
    fn test_adds_beyond_full_size_page_out() {
        let mut f = fixture(4, 2, 2);
        for tag in ["a", "b", "c", "d"] {
            push(&mut f, tag, 0, false);
        }
        assert_eq!(f.core.memory_count(), 4);
        assert!(f.core.is_paging());
        assert_eq!(f.pm.paged_rows(f.core.channel_id()), 0);

        push(&mut f, "e", 0, false);
        assert_eq!(f.core.down_cache_count(), 1);
        assert_eq!(f.core.message_count(), 5);

        // Second buffered add reaches capacity and flushes the batch.
        push(&mut f, "f", 0, false);
        assert_eq!(f.core.down_cache_count(), 0);
        assert_eq!(f.pm.paged_rows(f.core.channel_id()), 2);
        assert_eq!(f.core.memory_count(), 4);
        assert_eq!(f.core.paged_count(), 2);
        assert_eq!(f.core.message_count(), 6);
        // Paged-out bodies left the in-memory cache.
        assert_eq!(f.store.cached(), 4);
        assert_mode_invariant(&f);
    }

    // Drains reload the paged segment only when a full page fits.
    #[test]
    fn test_drain_reloads_when_a_page_fits() {
        let mut f = fixture(4, 2, 2);
        for tag in ["a", "b", "c", "d", "e", "f"] {
            push(&mut f, tag, 0, false);
        }

        // 3 in memory, page of 2 does not fit yet.
        assert_eq!(pop_tag(&mut f).unwrap(), "a");
        assert_eq!(f.core.memory_count(), 3);
        assert_eq!(f.core.paged_count(), 2);

        // Now it fits: e and f come back, their rows are removed.
        assert_eq!(pop_tag(&mut f).unwrap(), "b");
        assert_eq!(f.core.memory_count(), 4);
        assert_eq!(f.core.paged_count(), 0);
        assert_eq!(f.pm.reference_rows(f.core.channel_id()), 0);
        // Memory is back at the budget, so the channel is still paging.
        assert!(f.core.is_paging());
        assert_mode_invariant(&f);

        assert_eq!(pop_tag(&mut f).unwrap(), "c");
        assert!(!f.core.is_paging());
        assert_eq!(pop_tag(&mut f).unwrap(), "d");
        assert_eq!(pop_tag(&mut f).unwrap(), "e");
        assert_eq!(pop_tag(&mut f).unwrap(), "f");
        assert!(pop_tag(&mut f).is_none());
        assert_eq!(f.core.message_count(), 0);
        assert_eq!(f.store.cached(), 0);
    }

    // Cancelling at full memory evicts the tail below the window start.
    #[test]
    fn test_cancel_at_full_memory_evicts_tail_to_front_of_paged_segment() {
        let mut f = fixture(4, 2, 2);
        for tag in ["a", "b", "c", "d", "e", "f"] {
            push(&mut f, tag, 0, false);
        }
        // Drain two so e and f reload; memory is full and paging persists.
        let delivered_a = f.core.remove_first().unwrap().unwrap();
        let _ = pop_tag(&mut f); // b
        assert_eq!(f.core.memory_count(), 4);
        assert!(f.core.is_paging());

        // Redelivery of a: transient full_size + 1, tail f is displaced.
        f.core.cancel(delivered_a).unwrap();
        assert_eq!(f.core.memory_count(), 4);
        assert_eq!(f.core.down_cache_count(), 1);
        assert_eq!(f.core.paged_count(), 1);
        assert_mode_invariant(&f);

        // A later add takes the next order above the window.
        push(&mut f, "g", 0, false);
        assert_eq!(f.core.down_cache_count(), 0, "cache reached capacity and flushed");
        assert_eq!(f.core.paged_count(), 2);

        // The cancelled reference is redelivered first, and the displaced
        // tail comes back before the later add.
        assert_eq!(pop_tag(&mut f).unwrap(), "a");
        assert_eq!(pop_tag(&mut f).unwrap(), "c");
        assert_eq!(pop_tag(&mut f).unwrap(), "d");
        assert_eq!(pop_tag(&mut f).unwrap(), "e");
        assert_eq!(pop_tag(&mut f).unwrap(), "f");
        assert_eq!(pop_tag(&mut f).unwrap(), "g");
        assert!(pop_tag(&mut f).is_none());
    }

    #[test]
    fn test_cancel_on_flowing_channel_reenters_at_head() {
        let mut f = fixture(10, 4, 2);
        push(&mut f, "first", 5, false);
        push(&mut f, "second", 5, false);

        let delivered = f.core.remove_first().unwrap().unwrap();
        assert_eq!(delivered.delivery_count(), 1);
        f.core.cancel(delivered).unwrap();

        assert_eq!(pop_tag(&mut f).unwrap(), "first");
        assert_eq!(pop_tag(&mut f).unwrap(), "second");
    }

    #[test]
    fn test_priority_ordering_across_paging() {
        let mut f = fixture(4, 2, 2);
        push(&mut f, "low_1", 0, false);
        push(&mut f, "low_2", 0, false);
        push(&mut f, "low_3", 0, false);
        push(&mut f, "low_4", 0, false);
        // Paged adds keep arrival order within the paged segment.
        push(&mut f, "high_1", 9, false);
        push(&mut f, "high_2", 9, false);

        // In-memory low refs are delivered first: the paged segment only
        // re-enters ordering once it is reloaded.
        assert_eq!(pop_tag(&mut f).unwrap(), "low_1");
        assert_eq!(pop_tag(&mut f).unwrap(), "low_2");
        // The high-priority refs are back in memory now and win.
        assert_eq!(pop_tag(&mut f).unwrap(), "high_1");
        assert_eq!(pop_tag(&mut f).unwrap(), "high_2");
        assert_eq!(pop_tag(&mut f).unwrap(), "low_3");
        assert_eq!(pop_tag(&mut f).unwrap(), "low_4");
    }

    #[test]
    fn test_set_paging_params_validation() {
        let mut f = fixture(4, 2, 2);
        assert!(matches!(
            f.core.set_paging_params(100, 10, 5),
            Err(ChannelError::IllegalState(_))
        ));

        f.core.deactivate().unwrap();
        assert!(matches!(
            f.core.set_paging_params(100, 100, 10),
            Err(ChannelError::InvariantViolation(_))
        ));
        f.core.set_paging_params(100, 50, 10).unwrap();
    }

    #[test]
    fn test_ops_require_loaded_channel() {
        let store = Arc::new(MessageStore::new());
        let pm = Arc::new(MemoryPersistenceManager::new());
        let mut core = ChannelCore::new(0, "cold", options(4, 2, 2), store.clone(), pm);

        assert!(matches!(
            core.publish(Message::new(Bytes::from("x"), 0, false)),
            Err(ChannelError::IllegalState(_))
        ));
        assert!(matches!(core.remove_first(), Err(ChannelError::IllegalState(_))));
        assert_eq!(store.cached(), 0);
    }

    #[test]
    fn test_reliable_rejected_while_paging_when_not_accepted() {
        let store = Arc::new(MessageStore::new());
        let pm = Arc::new(MemoryPersistenceManager::new());
        let channel_id = pm.channel_id_for("no-reliable").unwrap();
        let mut core = ChannelCore::new(
            channel_id,
            "no-reliable",
            ChannelOptions {
                params: PagingParams::new(2, 1, 1).unwrap(),
                recoverable: true,
                accept_reliable_messages: false,
            },
            store.clone(),
            pm.clone(),
        );
        core.load().unwrap();

        // Reliable refs are fine in memory.
        core.publish(Message::new(Bytes::from("r1"), 0, true)).unwrap();
        core.publish(Message::new(Bytes::from("r2"), 0, true)).unwrap();
        assert!(core.is_paging());

        // But they cannot be paged out.
        let err = core
            .publish(Message::new(Bytes::from("r3"), 0, true))
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvariantViolation(_)));
        assert_eq!(core.message_count(), 2);
        // The rejected reference left no body and no row behind.
        assert_eq!(store.cached(), 2);
        assert_eq!(pm.reference_rows(channel_id), 2);
    }

    #[test]
    fn test_reliable_refs_update_rows_instead_of_inserting() {
        let mut f = fixture(2, 1, 1);
        push(&mut f, "r1", 0, true);
        assert_eq!(f.pm.reference_rows(f.core.channel_id()), 1);
        assert_eq!(f.pm.paged_rows(f.core.channel_id()), 0);

        push(&mut f, "r2", 0, true);
        assert!(f.core.is_paging());

        // Down cache capacity is 1: the third add pages out immediately,
        // stamping the page order onto the existing row.
        push(&mut f, "r3", 0, true);
        assert_eq!(f.pm.reference_rows(f.core.channel_id()), 3);
        assert_eq!(f.pm.paged_rows(f.core.channel_id()), 1);
        assert_eq!(f.store.cached(), 2, "paged-out body released");
    }

    #[test]
    fn test_message_count_matches_adds_minus_removes() {
        let mut f = fixture(4, 2, 2);
        let mut expected = 0usize;
        for i in 0..20 {
            push(&mut f, &format!("m{}", i), (i % 3) as u8, i % 2 == 0);
            expected += 1;
            assert_eq!(f.core.message_count(), expected);
            assert_mode_invariant(&f);
        }
        while pop_tag(&mut f).is_some() {
            expected -= 1;
            assert_eq!(f.core.message_count(), expected);
            assert_mode_invariant(&f);
        }
        assert_eq!(expected, 0);
        assert_eq!(f.store.cached(), 0);
        assert_eq!(f.pm.reference_rows(f.core.channel_id()), 0);
        assert_eq!(f.pm.stored_messages(), 0);
    }

    #[test]
    fn test_recovery_restores_reliable_refs_in_order() {
        let store = Arc::new(MessageStore::new());
        let pm = Arc::new(MemoryPersistenceManager::new());
        let channel_id = pm.channel_id_for("durable").unwrap();
        let opts = options(4, 2, 2);

        {
            let mut core =
                ChannelCore::new(channel_id, "durable", opts, store.clone(), pm.clone());
            core.load().unwrap();
            for i in 0..8 {
                core.publish(Message::new(
                    Bytes::from(format!("r{}", i)),
                    0,
                    true,
                ))
                .unwrap();
            }
            // Crash: core dropped without deactivate or flush.
        }

        let fresh_store = Arc::new(MessageStore::new());
        let mut core = ChannelCore::new(channel_id, "durable", opts, fresh_store.clone(), pm.clone());
        core.load().unwrap();
        assert_eq!(core.message_count(), 8);
        assert!(core.is_paging());

        let mut tags = Vec::new();
        while let Some(r) = core.remove_first().unwrap() {
            tags.push(String::from_utf8_lossy(&r.message().payload).to_string());
            core.acknowledge(r).unwrap();
        }
        let expected: Vec<String> = (0..8).map(|i| format!("r{}", i)).collect();
        assert_eq!(tags, expected);
        assert_eq!(pm.reference_rows(channel_id), 0);
    }

    #[test]
    fn test_unreliable_refs_do_not_survive_restart_unless_paged() {
        let store = Arc::new(MessageStore::new());
        let pm = Arc::new(MemoryPersistenceManager::new());
        let channel_id = pm.channel_id_for("mixed").unwrap();
        let opts = options(4, 2, 2);

        {
            let mut core = ChannelCore::new(channel_id, "mixed", opts, store.clone(), pm.clone());
            core.load().unwrap();
            // u0..u3 stay in memory and die with the process; u4, u5 are
            // flushed to the store and survive.
            for i in 0..6 {
                core.publish(Message::new(Bytes::from(format!("u{}", i)), 0, false))
                    .unwrap();
            }
        }

        let fresh_store = Arc::new(MessageStore::new());
        let mut core = ChannelCore::new(channel_id, "mixed", opts, fresh_store, pm.clone());
        core.load().unwrap();
        assert_eq!(core.message_count(), 2);

        let mut tags = Vec::new();
        while let Some(r) = core.remove_first().unwrap() {
            tags.push(String::from_utf8_lossy(&r.message().payload).to_string());
            core.acknowledge(r).unwrap();
        }
        assert_eq!(tags, vec!["u4".to_string(), "u5".to_string()]);
        // Loaded unreliable rows were depage-removed.
        assert_eq!(pm.reference_rows(channel_id), 0);
    }

    #[test]
    fn test_load_is_idempotent_for_reliable_refs() {
        let mut f = fixture(4, 2, 2);
        for i in 0..8 {
            push(&mut f, &format!("r{}", i), 0, true);
        }
        f.core.deactivate().unwrap();
        f.core.load().unwrap();
        let first_count = f.core.message_count();

        f.core.deactivate().unwrap();
        f.core.load().unwrap();
        assert_eq!(f.core.message_count(), first_count);

        let mut tags = Vec::new();
        while let Some(tag) = pop_tag(&mut f) {
            tags.push(tag);
        }
        let expected: Vec<String> = (0..8).map(|i| format!("r{}", i)).collect();
        assert_eq!(tags, expected);
    }

    #[test]
    fn test_load_rejected_while_active() {
        let mut f = fixture(4, 2, 2);
        assert!(matches!(f.core.load(), Err(ChannelError::IllegalState(_))));
        assert!(matches!(f.core.unload(), Err(ChannelError::IllegalState(_))));
    }

    #[test]
    fn test_unload_clears_memory_and_releases_bodies() {
        let mut f = fixture(4, 2, 2);
        for i in 0..6 {
            push(&mut f, &format!("m{}", i), 0, false);
        }
        f.core.deactivate().unwrap();
        f.core.unload().unwrap();
        assert_eq!(f.core.message_count(), 0);
        assert!(!f.core.is_paging());
        assert_eq!(f.store.cached(), 0);
    }

    // A store that returns fewer bodies than requested fails the load and
    // leaves the channel exactly as it was.
    struct TruncatingStore {
        inner: MemoryPersistenceManager,
    }

    impl PersistenceManager for TruncatingStore {
        fn channel_id_for(&self, name: &str) -> ChannelResult<u64> {
            self.inner.channel_id_for(name)
        }
        fn add_reference(&self, channel_id: u64, reference: &MessageReference) -> ChannelResult<()> {
            self.inner.add_reference(channel_id, reference)
        }
        fn remove_reference(&self, channel_id: u64, message_id: Uuid) -> ChannelResult<()> {
            self.inner.remove_reference(channel_id, message_id)
        }
        fn get_initial_reference_infos(
            &self,
            channel_id: u64,
            limit: usize,
        ) -> ChannelResult<InitialLoadInfo> {
            self.inner.get_initial_reference_infos(channel_id, limit)
        }
        fn get_paged_reference_infos(
            &self,
            channel_id: u64,
            from_order: i64,
            count: usize,
        ) -> ChannelResult<Vec<ReferenceInfo>> {
            self.inner.get_paged_reference_infos(channel_id, from_order, count)
        }
        fn get_messages(&self, ids: &[Uuid]) -> ChannelResult<Vec<Message>> {
            let mut messages = self.inner.get_messages(ids)?;
            messages.pop();
            Ok(messages)
        }
        fn page_references(&self, channel_id: u64, refs: &[&MessageReference]) -> ChannelResult<()> {
            self.inner.page_references(channel_id, refs)
        }
        fn update_page_order(&self, channel_id: u64, refs: &[&MessageReference]) -> ChannelResult<()> {
            self.inner.update_page_order(channel_id, refs)
        }
        fn remove_depaged_references(
            &self,
            channel_id: u64,
            message_ids: &[Uuid],
        ) -> ChannelResult<()> {
            self.inner.remove_depaged_references(channel_id, message_ids)
        }
        fn update_reliable_refs_not_paged_in_range(
            &self,
            channel_id: u64,
            from_order: i64,
            to_order: i64,
            expected_count: usize,
        ) -> ChannelResult<()> {
            self.inner.update_reliable_refs_not_paged_in_range(
                channel_id,
                from_order,
                to_order,
                expected_count,
            )
        }
    }

    #[test]
    fn test_short_body_load_fails_without_state_change() {
        let store = Arc::new(MessageStore::new());
        let pm = Arc::new(TruncatingStore {
            inner: MemoryPersistenceManager::new(),
        });
        let channel_id = pm.channel_id_for("flaky").unwrap();
        let mut core = ChannelCore::new(
            channel_id,
            "flaky",
            options(4, 2, 2),
            store.clone(),
            pm.clone(),
        );
        core.load().unwrap();

        for i in 0..6 {
            core.publish(Message::new(Bytes::from(format!("m{}", i)), 0, false))
                .unwrap();
        }
        let first = core.remove_first().unwrap().unwrap();
        core.acknowledge(first).unwrap();
        assert_eq!(core.memory_count(), 3);

        // The next drain wants a reload; the truncated body batch fails it.
        let err = core.remove_first().unwrap_err();
        assert!(matches!(err, ChannelError::InvariantViolation(_)));

        // Nothing moved: same counts, same window, same head on retry.
        assert_eq!(core.memory_count(), 3);
        assert_eq!(core.paged_count(), 2);
        assert_eq!(core.message_count(), 5);
        let err = core.remove_first().unwrap_err();
        assert!(matches!(err, ChannelError::InvariantViolation(_)));
    }
}
