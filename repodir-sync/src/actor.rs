//! This contains an actor spawned on a separate thread that performs every mutation of the
//! directory store.

use std::{sync::Arc, thread::JoinHandle};

use anyhow::{anyhow, Context, Result};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error_span, trace, warn};

use crate::{
    config::PendingTombstoneConfig,
    directory::{Directory, IngestOutcome},
    incoming::{IncomingRecord, Origin, TombstoneMarker},
    merge::LocalEdit,
    record::DirectoryKey,
    store::DirectoryStore,
    tombstone::AppliedTombstone,
};

const ACTION_CAP: usize = 1024;

#[derive(derive_more::Debug, derive_more::Display)]
enum Action {
    #[display("Ingest")]
    Ingest {
        record: Box<IncomingRecord>,
        origin: Origin,
        #[debug("reply")]
        reply: oneshot::Sender<Result<IngestOutcome>>,
    },
    #[display("Tombstone")]
    Tombstone {
        marker: TombstoneMarker,
        #[debug("reply")]
        reply: oneshot::Sender<Result<AppliedTombstone>>,
    },
    #[display("EditLocal")]
    EditLocal {
        key: DirectoryKey,
        edit: LocalEdit,
        #[debug("reply")]
        reply: oneshot::Sender<Result<Option<IngestOutcome>>>,
    },
    #[display("Shutdown")]
    Shutdown {
        #[debug("reply")]
        reply: Option<oneshot::Sender<()>>,
    },
}

/// The [`SyncHandle`] controls an actor thread which executes all store mutations.
///
/// The [`SyncHandle`] exposes async methods which all send messages into the actor thread and
/// await the reply. The actor thread is a regular [`std::thread`] which processes messages
/// sequentially, so every read-modify-write of a record is serialized against every other one.
///
/// The handle is cheaply cloneable. Once the last clone is dropped, the actor thread is joined.
/// The thread finishes processing all queued messages first. To keep this last drop from
/// blocking, call [`SyncHandle::shutdown`] and await it before dropping the last handle.
///
/// After [`SyncHandle::shutdown`], every call on any clone returns an error.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: flume::Sender<Action>,
    closed: watch::Receiver<bool>,
    join_handle: Arc<Option<JoinHandle<()>>>,
}

impl SyncHandle {
    /// Spawn a sync actor owning `store` and return a handle.
    pub fn spawn<S: DirectoryStore>(
        store: S,
        pending: PendingTombstoneConfig,
        me: String,
    ) -> Result<SyncHandle> {
        let (action_tx, action_rx) = flume::bounded(ACTION_CAP);
        let (closed_tx, closed) = watch::channel(false);
        let actor = Actor {
            directory: Directory::new(store, pending),
            action_rx,
            closed: closed_tx,
        };
        let join_handle = std::thread::Builder::new()
            .name("directory-actor".to_string())
            .spawn(move || {
                let span = error_span!("sync", %me);
                let _enter = span.enter();
                actor.run();
            })
            .context("failed to spawn directory actor thread")?;
        Ok(SyncHandle {
            tx: action_tx,
            closed,
            join_handle: Arc::new(Some(join_handle)),
        })
    }

    /// Validate, normalize and merge one record.
    pub async fn ingest(&self, record: IncomingRecord, origin: Origin) -> Result<IngestOutcome> {
        self.request(|reply| Action::Ingest {
            record: Box::new(record),
            origin,
            reply,
        })
        .await?
    }

    /// Apply a tombstone.
    pub async fn apply_tombstone(&self, marker: TombstoneMarker) -> Result<AppliedTombstone> {
        self.request(|reply| Action::Tombstone { marker, reply }).await?
    }

    /// Apply a local edit to the record stored for `key`.
    pub async fn edit_local(
        &self,
        key: DirectoryKey,
        edit: LocalEdit,
    ) -> Result<Option<IngestOutcome>> {
        self.request(|reply| Action::EditLocal { key, edit, reply }).await?
    }

    /// Stop the actor after the messages queued before this one.
    ///
    /// Messages queued after it are dropped and their callers get an error.
    pub async fn shutdown(&self) -> Result<()> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.send(Action::Shutdown { reply: Some(reply) }).await?;
        // answered once the queue is drained
        rx.await.context("directory actor is shut down")?;
        Ok(())
    }

    /// Whether the actor has stopped accepting messages.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn request<T>(&self, action: impl FnOnce(oneshot::Sender<T>) -> Action) -> Result<T> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.send(action(reply)).await?;
        let mut closed = self.closed.clone();
        tokio::select! {
            biased;
            res = rx => res.context("directory actor dropped the reply"),
            // a message that raced with shutdown is dropped unanswered
            _ = closed.wait_for(|closed| *closed) => {
                Err(anyhow!("directory actor is shut down"))
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(anyhow!("directory actor is shut down"));
        }
        Ok(())
    }

    async fn send(&self, action: Action) -> Result<()> {
        self.tx
            .send_async(action)
            .await
            .context("sending to directory actor failed")?;
        Ok(())
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        // this means we're dropping the last reference
        if let Some(handle) = Arc::get_mut(&mut self.join_handle) {
            self.tx.send(Action::Shutdown { reply: None }).ok();
            if let Some(handle) = handle.take() {
                if let Err(err) = handle.join() {
                    warn!(?err, "Failed to join directory actor");
                }
            }
        }
    }
}

struct Actor<S> {
    directory: Directory<S>,
    action_rx: flume::Receiver<Action>,
    closed: watch::Sender<bool>,
}

impl<S: DirectoryStore> Actor<S> {
    fn run(mut self) {
        let mut shutdown_reply = None;
        while let Ok(action) = self.action_rx.recv() {
            trace!(%action, "tick");
            match action {
                Action::Shutdown { reply } => {
                    shutdown_reply = reply;
                    break;
                }
                action => {
                    if self.on_action(action).is_err() {
                        warn!("failed to send reply: receiver dropped");
                    }
                }
            }
        }
        self.closed.send_replace(true);
        let Actor { action_rx, .. } = self;
        let dropped = action_rx.drain().count();
        drop(action_rx);
        if dropped > 0 {
            debug!(dropped, "dropped messages queued after shutdown");
        }
        if let Some(reply) = shutdown_reply {
            reply.send(()).ok();
        }
        debug!("shutdown");
    }

    fn on_action(&mut self, action: Action) -> Result<(), SendReplyError> {
        match action {
            Action::Shutdown { .. } => {
                unreachable!("Shutdown action should be handled in run()")
            }
            Action::Ingest {
                record,
                origin,
                reply,
            } => send_reply(reply, self.directory.ingest(&record, origin)),
            Action::Tombstone { marker, reply } => {
                send_reply(reply, self.directory.apply_tombstone(&marker))
            }
            Action::EditLocal { key, edit, reply } => {
                send_reply(reply, self.directory.edit_local(&key, &edit))
            }
        }
    }
}

#[derive(Debug)]
struct SendReplyError;

fn send_reply<T>(sender: oneshot::Sender<T>, value: T) -> Result<(), SendReplyError> {
    sender.send(value).map_err(|_| SendReplyError)
}
