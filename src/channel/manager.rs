//! Channel Manager: router from channel names to channel actors.
//!
//! A single manager task owns the name map, so concurrent declarations of
//! the same channel resolve to one actor. Channels share the process-global
//! message store and persistence manager.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::channel::actor::{Channel, ChannelStats};
use crate::channel::core::{ChannelCore, ChannelOptions};
use crate::config::Config;
use crate::error::{ChannelError, ChannelResult};
use crate::persistence::PersistenceManager;
use crate::store::MessageStore;

enum ManagerCommand {
    DeclareChannel {
        name: String,
        options: ChannelOptions,
        reply: oneshot::Sender<ChannelResult<Channel>>,
    },
    GetChannel {
        name: String,
        reply: oneshot::Sender<Option<Channel>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ChannelSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub name: String,
    pub stats: ChannelStats,
}

#[derive(Clone)]
pub struct ChannelManager {
    tx: mpsc::Sender<ManagerCommand>,
}

impl ChannelManager {
    pub fn new(store: Arc<MessageStore>, pm: Arc<dyn PersistenceManager>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(Self::run_manager_loop(rx, store, pm));
        Self { tx }
    }

    async fn run_manager_loop(
        mut rx: mpsc::Receiver<ManagerCommand>,
        store: Arc<MessageStore>,
        pm: Arc<dyn PersistenceManager>,
    ) {
        let mut channels: HashMap<String, Channel> = HashMap::new();

        while let Some(cmd) = rx.recv().await {
            match cmd {
                ManagerCommand::DeclareChannel { name, options, reply } => {
                    if let Some(channel) = channels.get(&name) {
                        let _ = reply.send(Ok(channel.clone()));
                        continue;
                    }
                    let result = Self::create_channel(&store, &pm, &name, options).await;
                    if let Ok(channel) = &result {
                        channels.insert(name, channel.clone());
                    }
                    let _ = reply.send(result);
                }

                ManagerCommand::GetChannel { name, reply } => {
                    let _ = reply.send(channels.get(&name).cloned());
                }

                ManagerCommand::Snapshot { reply } => {
                    let snapshot = channels
                        .values()
                        .map(|channel| ChannelSnapshot {
                            name: channel.name().to_string(),
                            stats: channel.stats(),
                        })
                        .collect();
                    let _ = reply.send(snapshot);
                }

                ManagerCommand::Shutdown { reply } => {
                    for channel in channels.values() {
                        if let Err(e) = channel.deactivate().await {
                            debug!(channel = channel.name(), %e, "deactivate on shutdown");
                        }
                        channel.stop().await;
                    }
                    channels.clear();
                    let _ = reply.send(());
                }
            }
        }
    }

    async fn create_channel(
        store: &Arc<MessageStore>,
        pm: &Arc<dyn PersistenceManager>,
        name: &str,
        options: ChannelOptions,
    ) -> ChannelResult<Channel> {
        let channel_id = pm.channel_id_for(name)?;
        let core = ChannelCore::new(channel_id, name, options, store.clone(), pm.clone());
        let channel = Channel::spawn(core, Config::global().paging.actor_channel_capacity);
        if let Err(e) = channel.load().await {
            error!(channel = name, %e, "channel failed to load");
            channel.stop().await;
            return Err(e);
        }
        Ok(channel)
    }

    // --- Public API ---

    /// Creates the channel if needed, recovers it from the store, and
    /// returns a handle. Declaring an existing channel returns the same
    /// actor.
    pub async fn declare_channel(
        &self,
        name: impl Into<String>,
        options: ChannelOptions,
    ) -> ChannelResult<Channel> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::DeclareChannel {
                name: name.into(),
                options,
                reply,
            })
            .await
            .map_err(|_| ChannelError::IllegalState("channel manager stopped"))?;
        rx.await
            .map_err(|_| ChannelError::IllegalState("channel manager dropped reply"))?
    }

    pub async fn channel(&self, name: &str) -> Option<Channel> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(ManagerCommand::GetChannel {
                name: name.to_string(),
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()?
    }

    pub async fn snapshot(&self) -> Vec<ChannelSnapshot> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::Snapshot { reply }).await.is_ok() {
            rx.await.unwrap_or_default()
        } else {
            Vec::new()
        }
    }

    /// Deactivates (flushing down caches) and stops every channel.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}
