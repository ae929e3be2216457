//! Per-channel reference records and their compact store rows.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Message;

/// A per-channel handle to a message body.
///
/// The body is shared with the `MessageStore`; the reference carries the
/// delivery metadata that belongs to this channel alone. A reference is
/// created when a producer adds it or when recovery loads it, and destroyed
/// when it is acknowledged or depage-removed.
#[derive(Debug)]
pub struct MessageReference {
    pub(crate) message: Arc<Message>,
    pub(crate) delivery_count: u32,
    /// Whether this reference must survive a restart. Taken from the
    /// `ReferenceInfo` on load, never from the message body.
    pub(crate) reliable: bool,
    /// Position in the paged segment. `None` while the reference is not
    /// paged. Cancel evictions assign orders below the window start, so
    /// negative values are legitimate.
    pub(crate) paging_order: Option<i64>,
}

impl MessageReference {
    pub(crate) fn new(message: Arc<Message>, reliable: bool) -> Self {
        Self {
            message,
            delivery_count: 0,
            reliable,
            paging_order: None,
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_id(&self) -> Uuid {
        self.message.id
    }

    pub fn priority(&self) -> u8 {
        self.message.priority
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn is_reliable(&self) -> bool {
        self.reliable
    }

    pub fn paging_order(&self) -> Option<i64> {
        self.paging_order
    }
}

/// Compact store row for a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceInfo {
    pub message_id: Uuid,
    pub delivery_count: u32,
    pub reliable: bool,
    pub paging_order: Option<i64>,
}

/// Result of loading the unpaged prefix of a channel: the prefix rows plus,
/// when paged rows exist, the inclusive (min, max) page-order bounds.
#[derive(Debug, Clone)]
pub struct InitialLoadInfo {
    pub refs: Vec<ReferenceInfo>,
    pub page_window: Option<(i64, i64)>,
}
