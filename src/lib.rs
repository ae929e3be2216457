//! pagemq: the paging channel core of a message broker.
//!
//! A channel holds arbitrarily many message references while bounding how
//! many live in memory. Overflow spills through a write-behind down cache
//! into the persistence manager and is reloaded page by page as consumers
//! drain, preserving FIFO-by-priority order. Reliable references survive a
//! restart; unreliable ones are best-effort.

pub mod channel;
pub mod config;
pub mod error;
pub mod persistence;
pub mod store;

use std::path::Path;
use std::sync::Arc;

pub use channel::{
    Channel, ChannelManager, ChannelOptions, ChannelSnapshot, ChannelStats, MessageReference,
    PagingParams,
};
pub use error::{ChannelError, ChannelResult};
pub use persistence::{MemoryPersistenceManager, PersistenceManager, SqlitePersistenceManager};
pub use store::{Message, MessageStore};

use crate::config::Config;

// ========================================
// BROKER (The Singleton)
// ========================================

#[derive(Clone)]
pub struct Broker {
    pub store: Arc<MessageStore>,
    pub channels: ChannelManager,
}

impl Broker {
    /// Durable broker over a sqlite reference store.
    pub fn open(db_path: impl AsRef<Path>) -> ChannelResult<Self> {
        let pm: Arc<dyn PersistenceManager> = Arc::new(SqlitePersistenceManager::open(db_path)?);
        Ok(Self::with_persistence(pm))
    }

    /// Broker over the in-memory store; nothing survives the process.
    pub fn ephemeral() -> Self {
        Self::with_persistence(Arc::new(MemoryPersistenceManager::new()))
    }

    pub fn with_persistence(pm: Arc<dyn PersistenceManager>) -> Self {
        let store = Arc::new(MessageStore::new());
        let channels = ChannelManager::new(store.clone(), pm);
        Self { store, channels }
    }
}

/// Installs the global tracing subscriber, honoring `RUST_LOG` and falling
/// back to the configured `LOG_LEVEL`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&Config::global().log_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
