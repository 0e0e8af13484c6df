//! Runs the aggregate, build, translate and publish pipeline for each group
//! whose inputs change.
//!
//! The [`Scheduler`] runs at most one pass per group at a time. Changes that
//! arrive while a pass is running are coalesced into exactly one follow-up
//! pass. A group that is removed has its running pass aborted, and the abort
//! is awaited before the group's snapshot is cleared, so that a cancelled
//! pass never publishes after removal.

use crate::{
    core::{
        status::{Outcome, SnapshotOutcome},
        GroupId, RoutePrecedence,
    },
    index::{self, GroupEvent, SharedStore},
    xds::{self, SnapshotCache},
};
use ahash::AHashMap as HashMap;
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{info_span, Instrument};

/// A reconciliation step run for one group at a time.
#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Brings the group's published configuration up to date.
    async fn reconcile(&self, group: GroupId);

    /// Forgets a group once no pass for it can run.
    fn remove(&self, group: &GroupId);
}

/// Reconciles groups from the store into the snapshot cache.
#[derive(Clone, Debug)]
pub struct Pipeline {
    store: SharedStore,
    cache: Arc<SnapshotCache>,
    outcomes: mpsc::UnboundedSender<Outcome>,
    precedence: RoutePrecedence,
}

pub struct Scheduler<R> {
    reconciler: Arc<R>,
    events: mpsc::UnboundedReceiver<GroupEvent>,
    passes: HashMap<GroupId, Pass>,
    done_tx: mpsc::UnboundedSender<(GroupId, u64)>,
    done_rx: mpsc::UnboundedReceiver<(GroupId, u64)>,
    next_pass: u64,
    metrics: SchedulerMetrics,
}

#[derive(Clone, Debug, Default)]
pub struct SchedulerMetrics {
    passes: Counter,
    coalesced: Counter,
    cancelled: Counter,
}

#[derive(Debug)]
struct Pass {
    id: u64,
    handle: JoinHandle<()>,

    /// Set when the group changed after the pass started.
    dirty: bool,
}

// === impl Pipeline ===

impl Pipeline {
    pub fn new(
        store: SharedStore,
        cache: Arc<SnapshotCache>,
        outcomes: mpsc::UnboundedSender<Outcome>,
        precedence: RoutePrecedence,
    ) -> Self {
        Self {
            store,
            cache,
            outcomes,
            precedence,
        }
    }
}

#[async_trait::async_trait]
impl Reconcile for Pipeline {
    async fn reconcile(&self, group: GroupId) {
        let aggregated = self.store.write().aggregate(&group);
        let aggregated = match aggregated {
            Ok(Some(aggregated)) => aggregated,
            Ok(None) => {
                tracing::debug!("Group no longer exists");
                return;
            }
            Err(error) => {
                tracing::debug!(%error, "Skipping");
                return;
            }
        };

        // Each stage ends at an await point so that an aborted pass stops
        // before it publishes.
        tokio::task::yield_now().await;
        let built = index::build(&aggregated, &self.precedence);

        tokio::task::yield_now().await;
        let snapshot = match &built.ir {
            None => SnapshotOutcome::Invalid {
                message: "the gateway has no valid listeners".to_string(),
            },
            Some(ir) => match xds::translate(ir) {
                Ok(resources) => {
                    let publish = self.cache.publish(&group, resources);
                    tracing::debug!(?publish, "Translated");
                    SnapshotOutcome::Published {
                        version: publish.version(),
                    }
                }
                Err(error) => {
                    tracing::error!(%error, "Keeping the last published snapshot");
                    SnapshotOutcome::Frozen {
                        message: error.to_string(),
                    }
                }
            },
        };

        let _ = self
            .outcomes
            .send(Outcome::Group(Box::new(built.into_outcome(snapshot))));
    }

    fn remove(&self, group: &GroupId) {
        self.cache.remove(group);
        self.store.write().forget(group);
        let _ = self.outcomes.send(Outcome::GroupRemoved(group.clone()));
    }
}

// === impl Scheduler ===

impl<R: Reconcile> Scheduler<R> {
    pub fn new(
        reconciler: Arc<R>,
        events: mpsc::UnboundedReceiver<GroupEvent>,
        metrics: SchedulerMetrics,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            reconciler,
            events,
            passes: HashMap::default(),
            done_tx,
            done_rx,
            next_pass: 0,
            metrics,
        }
    }

    /// Processes group events until the event channel closes or shutdown is
    /// signaled. Running passes complete before this returns.
    pub async fn run(mut self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);

        let release = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.on_event(event).await,
                    None => break None,
                },

                Some((group, id)) = self.done_rx.recv() => self.on_done(group, id),

                release = &mut shutdown => break Some(release),
            }
        };

        tracing::debug!(passes = self.passes.len(), "Waiting for running passes");
        for (group, pass) in self.passes.drain() {
            if let Err(error) = pass.handle.await {
                tracing::warn!(%group, %error, "Pass failed");
            }
        }
        drop(release);
    }

    async fn on_event(&mut self, event: GroupEvent) {
        match event {
            GroupEvent::Changed(group) => match self.passes.get_mut(&group) {
                Some(pass) => {
                    if !pass.dirty {
                        tracing::trace!(%group, "Coalescing change into a follow-up pass");
                    }
                    pass.dirty = true;
                    self.metrics.coalesced.inc();
                }
                None => self.spawn(group),
            },

            GroupEvent::Removed(group) => {
                if let Some(pass) = self.passes.remove(&group) {
                    tracing::debug!(%group, "Cancelling pass");
                    pass.handle.abort();
                    match pass.handle.await {
                        Err(error) if error.is_cancelled() => {
                            self.metrics.cancelled.inc();
                        }
                        Err(error) => tracing::warn!(%group, %error, "Pass failed"),
                        Ok(()) => {}
                    }
                }
                tracing::info!(%group, "Removing group");
                self.reconciler.remove(&group);
            }
        }
    }

    fn on_done(&mut self, group: GroupId, id: u64) {
        let dirty = match self.passes.get(&group) {
            // Removed, or superseded by a pass started after removal.
            None => return,
            Some(pass) if pass.id != id => return,
            Some(pass) => pass.dirty,
        };
        self.passes.remove(&group);
        if dirty {
            self.spawn(group);
        }
    }

    fn spawn(&mut self, group: GroupId) {
        self.next_pass += 1;
        let id = self.next_pass;
        self.metrics.passes.inc();

        let reconciler = self.reconciler.clone();
        let done = self.done_tx.clone();
        let span = info_span!("reconcile", %group, pass = id);
        let handle = tokio::spawn({
            let group = group.clone();
            async move {
                reconciler.reconcile(group.clone()).await;
                let _ = done.send((group, id));
            }
            .instrument(span)
        });
        self.passes.insert(
            group,
            Pass {
                id,
                handle,
                dirty: false,
            },
        );
    }
}

// === impl SchedulerMetrics ===

impl SchedulerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let passes = Counter::default();
        prom.register(
            "passes",
            "Number of reconciliation passes started",
            passes.clone(),
        );

        let coalesced = Counter::default();
        prom.register(
            "coalesced",
            "Number of changes folded into a pending follow-up pass",
            coalesced.clone(),
        );

        let cancelled = Counter::default();
        prom.register(
            "cancelled",
            "Number of passes aborted because their group was removed",
            cancelled.clone(),
        );

        Self {
            passes,
            coalesced,
            cancelled,
        }
    }
}

#[cfg(test)]
mod tests;
