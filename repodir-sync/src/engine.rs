//! The sync engine: subscribes to sources, feeds their records through the store actor and
//! keeps track of when the directory has settled.
//!
//! The engine is made of two actors. The [`SyncHandle`] thread owns the store and performs
//! every mutation. The live actor, a tokio task, owns the [`SourceManager`](crate::sources)
//! and the per-source subscription tasks. Reads do not go through either actor; they open a
//! read transaction on a clone of the store.

use std::{fmt, sync::Arc};

use anyhow::{Context, Result};
use futures_lite::{stream::Boxed, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, error_span, Instrument};

use crate::{
    actor::SyncHandle,
    config::SyncConfig,
    directory::IngestOutcome,
    error::{DiscoveryBoundExceeded, SourceUnavailable},
    incoming::{IncomingRecord, Origin, TombstoneMarker},
    merge::LocalEdit,
    query::{list, ListFilter},
    record::{DirectoryKey, RepositoryRecord},
    sources::SourceUri,
    store::DirectoryStore,
    tombstone::AppliedTombstone,
};

use self::live::{LiveActor, ToLiveActor};

mod live;

/// Capacity of the channel for the [`ToLiveActor`] messages.
const ACTOR_CHANNEL_CAP: usize = 64;
/// Capacity for the channels for [`Engine::subscribe`].
const SUBSCRIBE_CHANNEL_CAP: usize = 256;

/// What a subscription asks of a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Maximum number of records to deliver for the initial batch. `None` for no limit.
    pub limit: Option<usize>,
}

/// A message delivered by a source.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceMessage {
    /// A record.
    Record(IncomingRecord),
    /// A deletion marker.
    Tombstone(TombstoneMarker),
    /// The source delivered its initial batch. It may keep delivering afterwards.
    Complete,
}

/// The stream of messages from one source subscription.
pub type SourceStream = Boxed<Result<SourceMessage, SourceUnavailable>>;

/// Connects to sources.
///
/// Implementations speak whatever transport a source uses. The stream ends when the source
/// closes the subscription; an error item means the source failed and the subscription is
/// dropped.
pub trait SourceClient: fmt::Debug + Send + Sync + 'static {
    /// Subscribe to `uri`.
    fn subscribe(&self, uri: &SourceUri, request: SubscriptionRequest) -> SourceStream;
}

/// Events informing about changes to the directory.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq, strum::Display)]
pub enum Event {
    /// A record was stored or updated.
    RecordStored(DirectoryKey),
    /// A record was marked removed.
    RecordRemoved(DirectoryKey),
    /// The settled indicator changed.
    SettledChanged(bool),
}

/// Event subscribers. Closed subscribers are dropped on the next send.
#[derive(Debug, Clone, Default)]
pub(crate) struct Subscribers(Arc<Mutex<Vec<flume::Sender<Event>>>>);

impl Subscribers {
    pub(crate) fn subscribe(&self, sender: flume::Sender<Event>) {
        self.0.lock().push(sender)
    }

    /// Send without waiting. A subscriber that does not keep up misses events.
    pub(crate) fn send(&self, event: Event) {
        self.0.lock().retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) | Err(flume::TrySendError::Full(_)) => true,
            Err(flume::TrySendError::Disconnected(_)) => false,
        });
    }

    /// Send the events an ingest outcome implies.
    pub(crate) fn send_outcome(&self, outcome: &IngestOutcome) {
        if let IngestOutcome::Stored(record) = outcome {
            self.send_record(record);
        }
    }

    pub(crate) fn send_record(&self, record: &RepositoryRecord) {
        let key = record.key.clone();
        if record.removed {
            self.send(Event::RecordRemoved(key));
        } else {
            self.send(Event::RecordStored(key));
        }
    }

    pub(crate) fn clear(&self) {
        self.0.lock().clear()
    }
}

/// The sync engine.
///
/// Cheaply cloneable. All clones drive the same actors.
#[derive(derive_more::Debug, Clone)]
pub struct Engine<S> {
    /// Handle to the store actor thread.
    pub sync: SyncHandle,
    store: S,
    to_live_actor: mpsc::Sender<ToLiveActor>,
    subscribers: Subscribers,
    #[debug("watch::Receiver<bool>")]
    settled: watch::Receiver<bool>,
}

impl<S: DirectoryStore + Clone + Sync> Engine<S> {
    /// Start the engine.
    ///
    /// This spawns a thread for the [`SyncHandle`] and a tokio task for the live actor, which
    /// immediately subscribes to the sources in `config`.
    pub fn spawn(
        config: SyncConfig,
        store: S,
        client: Arc<dyn SourceClient>,
        me: impl Into<String>,
    ) -> Result<Self> {
        let me = me.into();
        let (live_actor_tx, to_live_actor_recv) = mpsc::channel(ACTOR_CHANNEL_CAP);
        let (settled_tx, settled) = watch::channel(false);
        let subscribers = Subscribers::default();
        let sync = SyncHandle::spawn(
            store.clone(),
            config.pending_tombstones.clone(),
            me.clone(),
        )?;

        let actor = LiveActor::new(
            config,
            sync.clone(),
            client,
            subscribers.clone(),
            settled_tx,
            to_live_actor_recv,
            live_actor_tx.clone(),
        );
        tokio::task::spawn(
            async move {
                if let Err(err) = actor.run().await {
                    error!("live actor failed: {err:?}");
                }
            }
            .instrument(error_span!("sync", %me)),
        );

        Ok(Self {
            sync,
            store,
            to_live_actor: live_actor_tx,
            subscribers,
            settled,
        })
    }

    /// Subscribe to a configured source. Returns `false` if it is known already.
    pub async fn add_source(&self, uri: SourceUri, priority: bool) -> Result<bool> {
        let (reply, reply_rx) = oneshot::channel();
        self.to_live_actor
            .send(ToLiveActor::AddSource {
                uri,
                priority,
                reply,
            })
            .await?;
        let added: Result<bool, DiscoveryBoundExceeded> = reply_rx.await?;
        Ok(added?)
    }

    /// Ingest a record that did not arrive through a subscription.
    pub async fn ingest(&self, record: IncomingRecord, origin: Origin) -> Result<IngestOutcome> {
        let outcome = self.sync.ingest(record, origin.clone()).await?;
        self.subscribers.send_outcome(&outcome);
        if let Some(record) = outcome.record() {
            let msg = ToLiveActor::RecordStored {
                origin,
                record: Box::new(record.clone()),
            };
            if self.to_live_actor.send(msg).await.is_err() {
                debug!("live actor stopped, not tracking stored record");
            }
        }
        Ok(outcome)
    }

    /// Apply a local edit to the record stored for `key`.
    ///
    /// The edited fields become locally owned and survive later network updates.
    pub async fn edit_local(&self, key: DirectoryKey, edit: LocalEdit) -> Result<IngestOutcome> {
        let outcome = self
            .sync
            .edit_local(key.clone(), edit)
            .await?
            .with_context(|| format!("no record for {key}"))?;
        self.subscribers.send_outcome(&outcome);
        Ok(outcome)
    }

    /// Apply a tombstone.
    pub async fn apply_tombstone(&self, marker: TombstoneMarker) -> Result<AppliedTombstone> {
        let applied = self.sync.apply_tombstone(marker).await?;
        for record in &applied.removed {
            self.subscribers.send_record(record);
        }
        Ok(applied)
    }

    /// Get the record stored for `key`.
    pub fn get(&self, key: &DirectoryKey) -> Result<Option<RepositoryRecord>> {
        self.store.get(key)
    }

    /// List records.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<RepositoryRecord>> {
        Ok(list(self.store.records()?, filter))
    }

    /// Subscribe to directory events.
    pub fn subscribe(&self) -> impl Stream<Item = Event> + Unpin + 'static {
        let (s, r) = flume::bounded(SUBSCRIBE_CHANNEL_CAP);
        self.subscribers.subscribe(s);
        r.into_stream()
    }

    /// Whether the directory has settled.
    ///
    /// Advisory only: records keep being ingested after settling.
    pub fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }

    /// Wait until the directory has settled.
    pub async fn settled(&self) -> Result<()> {
        let mut settled = self.settled.clone();
        settled
            .wait_for(|settled| *settled)
            .await
            .context("live actor stopped")?;
        Ok(())
    }

    /// Shutdown the engine.
    ///
    /// Cancels every source subscription, then stops the store actor once the mutation it is
    /// processing is done.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.to_live_actor
            .send(ToLiveActor::Shutdown { reply })
            .await?;
        reply_rx.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_drop_closed_receivers() {
        let subscribers = Subscribers::default();
        let (a_tx, a_rx) = flume::unbounded();
        let (b_tx, b_rx) = flume::bounded(1);
        subscribers.subscribe(a_tx);
        subscribers.subscribe(b_tx);
        drop(a_rx);
        subscribers.send(Event::SettledChanged(true));
        // full, but still subscribed
        subscribers.send(Event::SettledChanged(true));
        assert_eq!(subscribers.0.lock().len(), 1);
        assert_eq!(b_rx.try_recv(), Ok(Event::SettledChanged(true)));
        assert!(b_rx.try_recv().is_err());
        subscribers.clear();
        assert!(subscribers.0.lock().is_empty());
    }
}
