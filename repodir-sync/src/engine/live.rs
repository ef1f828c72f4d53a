use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures_lite::StreamExt;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, debug_span, error, info, trace, warn, Instrument};

use crate::{
    actor::SyncHandle,
    config::SyncConfig,
    error::DiscoveryBoundExceeded,
    incoming::{IncomingRecord, Origin},
    record::RepositoryRecord,
    sources::{SourceManager, SourceUri},
};

use super::{Event, SourceClient, SourceMessage, SourceStream, Subscribers, SubscriptionRequest};

/// Messages to the live actor.
#[derive(derive_more::Debug, strum::Display)]
pub enum ToLiveActor {
    AddSource {
        uri: SourceUri,
        priority: bool,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<bool, DiscoveryBoundExceeded>>,
    },
    RecordStored {
        origin: Origin,
        record: Box<RepositoryRecord>,
    },
    SourceQuiescent {
        uri: SourceUri,
    },
    Shutdown {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
}

/// Owns the set of sources and the subscription task of each.
pub struct LiveActor {
    inbox: mpsc::Receiver<ToLiveActor>,
    /// Handed to source tasks so they can report back.
    to_self: mpsc::Sender<ToLiveActor>,
    sync: SyncHandle,
    client: Arc<dyn SourceClient>,
    subscribers: Subscribers,
    sources: SourceManager,
    config: SyncConfig,
    running: JoinSet<(SourceUri, Result<()>)>,
    settled: watch::Sender<bool>,
}

impl LiveActor {
    pub fn new(
        config: SyncConfig,
        sync: SyncHandle,
        client: Arc<dyn SourceClient>,
        subscribers: Subscribers,
        settled: watch::Sender<bool>,
        inbox: mpsc::Receiver<ToLiveActor>,
        to_self: mpsc::Sender<ToLiveActor>,
    ) -> Self {
        let sources = SourceManager::new(&config, Instant::now());
        Self {
            inbox,
            to_self,
            sync,
            client,
            subscribers,
            sources,
            config,
            running: JoinSet::new(),
            settled,
        }
    }

    /// Run the actor loop.
    pub async fn run(mut self) -> Result<()> {
        let configured = self
            .config
            .priority_sources
            .iter()
            .map(|uri| (uri.clone(), true))
            .chain(self.config.sources.iter().map(|uri| (uri.clone(), false)))
            .collect::<Vec<_>>();
        for (uri, priority) in configured {
            if let Err(err) = self.add_source(uri, priority) {
                warn!(%err, "configured source refused");
            }
        }

        let shutdown_reply = self.run_inner().await;
        if let Err(err) = self.shutdown().await {
            error!(?err, "Error during shutdown");
        }
        drop(self);
        match shutdown_reply {
            Ok(reply) => {
                reply.send(()).ok();
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn run_inner(&mut self) -> Result<oneshot::Sender<()>> {
        let mut i = 0;
        loop {
            i += 1;
            trace!(?i, "tick wait");
            let settle_deadline = self.sources.settle_deadline();
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let msg = msg.context("to_actor closed")?;
                    trace!(?i, %msg, "tick: to_actor");
                    match msg {
                        ToLiveActor::Shutdown { reply } => {
                            break Ok(reply);
                        }
                        msg => self.on_actor_message(msg),
                    }
                }
                Some(res) = self.running.join_next(), if !self.running.is_empty() => {
                    trace!(?i, "tick: running");
                    let (uri, res) = res.context("running sources closed")?;
                    self.on_source_finished(uri, res);
                }
                _ = tokio::time::sleep_until(settle_deadline), if !self.sources.is_settled() => {
                    trace!(?i, "tick: settle timeout");
                    self.update_settled();
                }
            }
        }
    }

    fn on_actor_message(&mut self, msg: ToLiveActor) {
        match msg {
            ToLiveActor::Shutdown { .. } => {
                unreachable!("Shutdown is handled in run_inner()")
            }
            ToLiveActor::AddSource {
                uri,
                priority,
                reply,
            } => {
                reply.send(self.add_source(uri, priority)).ok();
            }
            ToLiveActor::RecordStored { origin, record } => {
                let added = self.sources.on_record_stored(&origin, &record);
                let request = SubscriptionRequest {
                    limit: Some(self.config.discovery_limit),
                };
                for uri in added {
                    debug!(%uri, from = ?origin.source(), "discovered source");
                    self.spawn_source(uri, request);
                }
                self.update_settled();
            }
            ToLiveActor::SourceQuiescent { uri } => {
                if self.sources.on_quiescent(&uri) {
                    debug!(%uri, "source quiescent");
                    self.update_settled();
                }
            }
        }
    }

    fn add_source(
        &mut self,
        uri: SourceUri,
        priority: bool,
    ) -> Result<bool, DiscoveryBoundExceeded> {
        let added = self.sources.add_static(uri.clone(), priority)?;
        if added {
            self.spawn_source(uri, SubscriptionRequest::default());
        }
        Ok(added)
    }

    fn spawn_source(&mut self, uri: SourceUri, request: SubscriptionRequest) {
        let stream = self.client.subscribe(&uri, request);
        let task = SourceTask {
            uri: uri.clone(),
            limit: request.limit,
            timeout: self.config.source_timeout,
            sync: self.sync.clone(),
            subscribers: self.subscribers.clone(),
            to_actor: self.to_self.clone(),
            quiescent: false,
        };
        let span = debug_span!("source", %uri);
        self.running.spawn(
            async move {
                let res = task.run(stream).await;
                (uri, res)
            }
            .instrument(span),
        );
    }

    fn on_source_finished(&mut self, uri: SourceUri, res: Result<()>) {
        match res {
            Ok(()) => debug!(%uri, "source closed"),
            Err(err) => {
                warn!(%uri, ?err, "source failed");
                self.sources.on_failed(&uri);
            }
        }
    }

    fn update_settled(&mut self) {
        if self.sources.check_settled(Instant::now()) {
            info!(
                sources = self.sources.len(),
                stored = self.sources.stored(),
                "directory settled"
            );
            self.settled.send_replace(true);
            self.subscribers.send(Event::SettledChanged(true));
        }
    }

    async fn shutdown(&mut self) -> Result<()> {
        // cancel all source subscriptions
        self.running.shutdown().await;
        self.subscribers.clear();
        // shutdown sync thread, after the merge it is processing
        self.sync.shutdown().await?;
        Ok(())
    }
}

/// Consumes the stream of one source subscription.
struct SourceTask {
    uri: SourceUri,
    /// Set for discovered sources, which are only queried once.
    limit: Option<usize>,
    timeout: Duration,
    sync: SyncHandle,
    subscribers: Subscribers,
    to_actor: mpsc::Sender<ToLiveActor>,
    quiescent: bool,
}

impl SourceTask {
    async fn run(mut self, mut stream: SourceStream) -> Result<()> {
        let timeout = tokio::time::sleep(self.timeout);
        tokio::pin!(timeout);
        let mut received = 0usize;
        loop {
            tokio::select! {
                biased;
                msg = stream.next() => {
                    let msg = match msg {
                        None => {
                            debug!("stream closed");
                            self.set_quiescent().await?;
                            return Ok(());
                        }
                        Some(msg) => msg?,
                    };
                    match msg {
                        SourceMessage::Record(record) => {
                            received += 1;
                            self.on_record(record).await?;
                            if self.limit.is_some_and(|limit| received >= limit) {
                                debug!(received, "query limit reached");
                                self.set_quiescent().await?;
                                return Ok(());
                            }
                        }
                        SourceMessage::Tombstone(marker) => {
                            let applied = self.sync.apply_tombstone(marker).await?;
                            for record in &applied.removed {
                                self.subscribers.send_record(record);
                            }
                        }
                        SourceMessage::Complete => {
                            debug!(received, "initial batch complete");
                            self.set_quiescent().await?;
                            if self.limit.is_some() {
                                return Ok(());
                            }
                        }
                    }
                }
                _ = &mut timeout, if !self.quiescent => {
                    debug!(received, "no completion within timeout");
                    self.set_quiescent().await?;
                }
            }
        }
    }

    async fn on_record(&self, record: IncomingRecord) -> Result<()> {
        let origin = Origin::Remote(self.uri.clone());
        let outcome = self.sync.ingest(record, origin.clone()).await?;
        self.subscribers.send_outcome(&outcome);
        if let Some(record) = outcome.record() {
            self.to_actor
                .send(ToLiveActor::RecordStored {
                    origin,
                    record: Box::new(record.clone()),
                })
                .await
                .context("live actor closed")?;
        }
        Ok(())
    }

    async fn set_quiescent(&mut self) -> Result<()> {
        if self.quiescent {
            return Ok(());
        }
        self.quiescent = true;
        self.to_actor
            .send(ToLiveActor::SourceQuiescent {
                uri: self.uri.clone(),
            })
            .await
            .context("live actor closed")?;
        Ok(())
    }
}
