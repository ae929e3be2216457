//! Channel Actor: async wrapper around ChannelCore.
//!
//! One actor task per channel is the serializer: every state-mutating
//! operation arrives as a command and is processed one at a time, so
//! producers, consumers and cancellations are linearized. Store calls block
//! the task, which is the intended backpressure when persistence is slow.
//!
//! Read-only inspectors never touch the serializer; they read a snapshot
//! the actor refreshes after every operation.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use crate::channel::core::ChannelCore;
use crate::channel::reference::MessageReference;
use crate::error::{ChannelError, ChannelResult};
use crate::store::Message;

pub enum ChannelCommand {
    Push {
        payload: Bytes,
        priority: u8,
        reliable: bool,
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    Pop {
        reply: oneshot::Sender<ChannelResult<Option<MessageReference>>>,
    },
    Cancel {
        reference: MessageReference,
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    Acknowledge {
        reference: MessageReference,
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    Load {
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    Unload {
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    Deactivate {
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    SetPagingParams {
        full_size: usize,
        page_size: usize,
        down_cache_size: usize,
        reply: oneshot::Sender<ChannelResult<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ChannelStats {
    pub message_count: usize,
    pub memory_count: usize,
    pub down_cache_count: usize,
    pub paging: bool,
    pub active: bool,
}

pub struct ChannelActor {
    core: ChannelCore,
    rx: mpsc::Receiver<ChannelCommand>,
    stats: Arc<RwLock<ChannelStats>>,
}

impl ChannelActor {
    fn new(
        core: ChannelCore,
        rx: mpsc::Receiver<ChannelCommand>,
        stats: Arc<RwLock<ChannelStats>>,
    ) -> Self {
        Self { core, rx, stats }
    }

    async fn run(mut self) {
        self.publish_stats();
        while let Some(cmd) = self.rx.recv().await {
            let keep_running = self.handle(cmd);
            self.publish_stats();
            if !keep_running {
                break;
            }
        }
    }

    fn handle(&mut self, cmd: ChannelCommand) -> bool {
        match cmd {
            ChannelCommand::Push {
                payload,
                priority,
                reliable,
                reply,
            } => {
                let _ = reply.send(self.core.publish(Message::new(payload, priority, reliable)));
                true
            }
            ChannelCommand::Pop { reply } => {
                let _ = reply.send(self.core.remove_first());
                true
            }
            ChannelCommand::Cancel { reference, reply } => {
                let _ = reply.send(self.core.cancel(reference));
                true
            }
            ChannelCommand::Acknowledge { reference, reply } => {
                let _ = reply.send(self.core.acknowledge(reference));
                true
            }
            ChannelCommand::Load { reply } => {
                let _ = reply.send(self.core.load());
                true
            }
            ChannelCommand::Unload { reply } => {
                let _ = reply.send(self.core.unload());
                true
            }
            ChannelCommand::Deactivate { reply } => {
                let _ = reply.send(self.core.deactivate());
                true
            }
            ChannelCommand::SetPagingParams {
                full_size,
                page_size,
                down_cache_size,
                reply,
            } => {
                let _ = reply.send(self.core.set_paging_params(full_size, page_size, down_cache_size));
                true
            }
            ChannelCommand::Stop { reply } => {
                let _ = reply.send(());
                false
            }
        }
    }

    fn publish_stats(&self) {
        *self.stats.write() = ChannelStats {
            message_count: self.core.message_count(),
            memory_count: self.core.memory_count(),
            down_cache_count: self.core.down_cache_count(),
            paging: self.core.is_paging(),
            active: self.core.is_active(),
        };
    }
}

/// Handle to a channel actor. Cheap to clone; all mutating calls go through
/// the serializer, inspectors read the shared snapshot.
#[derive(Clone)]
pub struct Channel {
    name: String,
    tx: mpsc::Sender<ChannelCommand>,
    stats: Arc<RwLock<ChannelStats>>,
}

impl Channel {
    pub(crate) fn spawn(core: ChannelCore, capacity: usize) -> Channel {
        let name = core.name().to_string();
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(RwLock::new(ChannelStats::default()));
        let actor = ChannelActor::new(core, rx, stats.clone());
        tokio::spawn(actor.run());
        Channel { name, tx, stats }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn push(&self, payload: Bytes, priority: u8, reliable: bool) -> ChannelResult<()> {
        self.request(|reply| ChannelCommand::Push {
            payload,
            priority,
            reliable,
            reply,
        })
        .await
    }

    pub async fn pop(&self) -> ChannelResult<Option<MessageReference>> {
        self.request(|reply| ChannelCommand::Pop { reply }).await
    }

    pub async fn cancel(&self, reference: MessageReference) -> ChannelResult<()> {
        self.request(|reply| ChannelCommand::Cancel { reference, reply })
            .await
    }

    pub async fn acknowledge(&self, reference: MessageReference) -> ChannelResult<()> {
        self.request(|reply| ChannelCommand::Acknowledge { reference, reply })
            .await
    }

    pub async fn load(&self) -> ChannelResult<()> {
        self.request(|reply| ChannelCommand::Load { reply }).await
    }

    pub async fn unload(&self) -> ChannelResult<()> {
        self.request(|reply| ChannelCommand::Unload { reply }).await
    }

    pub async fn deactivate(&self) -> ChannelResult<()> {
        self.request(|reply| ChannelCommand::Deactivate { reply }).await
    }

    pub async fn set_paging_params(
        &self,
        full_size: usize,
        page_size: usize,
        down_cache_size: usize,
    ) -> ChannelResult<()> {
        self.request(|reply| ChannelCommand::SetPagingParams {
            full_size,
            page_size,
            down_cache_size,
            reply,
        })
        .await
    }

    pub async fn stop(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(ChannelCommand::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    // --- Inspectors ---

    pub fn is_active(&self) -> bool {
        self.stats.read().active
    }

    pub fn message_count(&self) -> ChannelResult<usize> {
        self.loaded_stats().map(|s| s.message_count)
    }

    pub fn memory_count(&self) -> ChannelResult<usize> {
        self.loaded_stats().map(|s| s.memory_count)
    }

    pub fn down_cache_count(&self) -> ChannelResult<usize> {
        self.loaded_stats().map(|s| s.down_cache_count)
    }

    pub fn is_paging(&self) -> ChannelResult<bool> {
        self.loaded_stats().map(|s| s.paging)
    }

    pub fn stats(&self) -> ChannelStats {
        *self.stats.read()
    }

    fn loaded_stats(&self) -> ChannelResult<ChannelStats> {
        let stats = *self.stats.read();
        if stats.active {
            Ok(stats)
        } else {
            Err(ChannelError::IllegalState("channel is not loaded"))
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<ChannelResult<T>>) -> ChannelCommand,
    ) -> ChannelResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ChannelError::IllegalState("channel actor stopped"))?;
        rx.await
            .map_err(|_| ChannelError::IllegalState("channel actor dropped reply"))?
    }
}
