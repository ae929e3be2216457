//! Persistence contract for channel references.
//!
//! The channel core calls these operations through a shared manager; each
//! implementation decides its own atomicity (the sqlite store wraps every
//! batch in one transaction). Page-order reads are range reads: rows come
//! back ordered by page order, and holes in the range are allowed.

pub mod memory;
pub mod sqlite;

use uuid::Uuid;

use crate::channel::reference::{InitialLoadInfo, MessageReference, ReferenceInfo};
use crate::error::ChannelResult;
use crate::store::Message;

pub use memory::MemoryPersistenceManager;
pub use sqlite::SqlitePersistenceManager;

pub trait PersistenceManager: Send + Sync {
    /// Resolves a channel name to its stable numeric id, allocating one on
    /// first use. Ids survive restarts.
    fn channel_id_for(&self, name: &str) -> ChannelResult<u64>;

    /// Persists a reference as an unpaged row, body included. Called for
    /// reliable references on recoverable channels when they enter the
    /// channel, before any routing.
    fn add_reference(&self, channel_id: u64, reference: &MessageReference) -> ChannelResult<()>;

    /// Removes a reference row on acknowledge. Orphaned bodies go with it.
    fn remove_reference(&self, channel_id: u64, message_id: Uuid) -> ChannelResult<()>;

    /// Loads up to `limit` unpaged rows in insertion order. Unpaged rows
    /// beyond the limit are re-paged (assigned fresh orders past the current
    /// maximum) so recovery never overfills memory. Reports the inclusive
    /// (min, max) page-order bounds when paged rows exist.
    fn get_initial_reference_infos(
        &self,
        channel_id: u64,
        limit: usize,
    ) -> ChannelResult<InitialLoadInfo>;

    /// Rows with page order in `[from_order, from_order + count)`, ordered
    /// by page order. May return fewer than `count` rows if the range has
    /// holes.
    fn get_paged_reference_infos(
        &self,
        channel_id: u64,
        from_order: i64,
        count: usize,
    ) -> ChannelResult<Vec<ReferenceInfo>>;

    /// Bodies for the given ids, input order preserved. Ids without a stored
    /// body are skipped; the caller is responsible for comparing counts.
    fn get_messages(&self, ids: &[Uuid]) -> ChannelResult<Vec<Message>>;

    /// Inserts rows for freshly paged references at their assigned page
    /// order, bodies included. Upsert semantics: retrying a partially failed
    /// flush must not duplicate rows.
    fn page_references(&self, channel_id: u64, refs: &[&MessageReference]) -> ChannelResult<()>;

    /// Stamps the assigned page order onto rows that already exist unpaged
    /// (reliable references being paged out).
    fn update_page_order(&self, channel_id: u64, refs: &[&MessageReference]) -> ChannelResult<()>;

    /// Deletes rows for loaded references that do not stay persistent.
    fn remove_depaged_references(&self, channel_id: u64, message_ids: &[Uuid]) -> ChannelResult<()>;

    /// Clears the page-order column for reliable rows in the inclusive
    /// order range, so they are not re-loaded. The number of rows touched
    /// must equal `expected_count`; a mismatch is an error and must leave
    /// the rows untouched.
    fn update_reliable_refs_not_paged_in_range(
        &self,
        channel_id: u64,
        from_order: i64,
        to_order: i64,
        expected_count: usize,
    ) -> ChannelResult<()>;
}
