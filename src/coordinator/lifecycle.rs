// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: the event loop and shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::{EngineState, HandleOptions, RunStats, SyncEngine};
use crate::event::InboundEvent;

/// Single-writer queue feeding one lead's worker.
struct LeadQueue {
    tx: mpsc::UnboundedSender<InboundEvent>,
    /// Events sent but not yet fully handled
    pending: Arc<AtomicUsize>,
}

impl SyncEngine {
    /// Consume events until the channel closes or the engine is cancelled.
    ///
    /// Each lead gets its own queue and worker, so a lead's events are
    /// handled one at a time in arrival order while different leads proceed
    /// in parallel (bounded by `max_concurrent_events`). Idle queues are
    /// reclaimed every `lead_queue_prune_ms`.
    ///
    /// When the channel closes, queued events are drained before returning.
    /// On cancellation, queued events are answered with
    /// [`SyncError::ShuttingDown`](super::SyncError::ShuttingDown) and left to
    /// the source's redelivery.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<InboundEvent>) -> RunStats {
        self.set_state(EngineState::Running);
        info!(
            max_concurrent = self.config.max_concurrent_events,
            "Sync engine running"
        );

        let limiter = Arc::new(Semaphore::new(self.config.max_concurrent_events.max(1)));
        let mut queues: HashMap<String, LeadQueue> = HashMap::new();
        let mut workers: JoinSet<RunStats> = JoinSet::new();
        let mut stats = RunStats::default();

        let mut prune = tokio::time::interval(Duration::from_millis(self.config.lead_queue_prune_ms.max(1)));
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Cancellation requested, stopping intake");
                    self.set_state(EngineState::ShuttingDown);
                    break;
                }

                maybe_event = events.recv() => {
                    let Some(event) = maybe_event else {
                        info!("Event source closed, draining lead queues");
                        break;
                    };
                    stats.received += 1;

                    let queue = queues.entry(event.lead_id.clone()).or_insert_with(|| {
                        let (tx, rx) = mpsc::unbounded_channel();
                        let pending = Arc::new(AtomicUsize::new(0));
                        workers.spawn(lead_worker(
                            Arc::clone(&self),
                            rx,
                            Arc::clone(&pending),
                            Arc::clone(&limiter),
                        ));
                        LeadQueue { tx, pending }
                    });
                    queue.pending.fetch_add(1, Ordering::SeqCst);
                    if let Err(mpsc::error::SendError(event)) = queue.tx.send(event) {
                        // Worker gone (panicked); drop the queue so the next event respawns it
                        error!(lead_id = %event.lead_id, "Lead worker unavailable, event dropped");
                        stats.errors += 1;
                        queues.remove(&event.lead_id);
                    }
                    crate::metrics::set_active_lead_queues(queues.len());
                }

                Some(done) = workers.join_next() => {
                    collect(&mut stats, done);
                }

                _ = prune.tick() => {
                    let before = queues.len();
                    queues.retain(|_, q| q.pending.load(Ordering::SeqCst) > 0);
                    if queues.len() != before {
                        debug!(pruned = before - queues.len(), remaining = queues.len(), "Pruned idle lead queues");
                    }
                    crate::metrics::set_active_lead_queues(queues.len());
                }
            }
        }

        // Closing the senders lets each worker finish its backlog and exit
        queues.clear();
        while let Some(done) = workers.join_next().await {
            collect(&mut stats, done);
        }
        crate::metrics::set_active_lead_queues(0);

        self.set_state(EngineState::Stopped);
        info!(
            received = stats.received,
            applied = stats.applied,
            skipped = stats.skipped,
            follow_ups = stats.follow_ups,
            errors = stats.errors,
            "Sync engine stopped"
        );
        stats
    }

    /// Stop accepting events and cancel in-flight retry backoff.
    ///
    /// A running `run()` returns once its workers finish; without one the
    /// engine goes straight to `Stopped`.
    pub fn shutdown(&self) {
        match self.state() {
            EngineState::Stopped | EngineState::ShuttingDown => return,
            EngineState::Created => {
                self.cancel.cancel();
                self.set_state(EngineState::Stopped);
            }
            EngineState::Running => {
                info!("Initiating sync engine shutdown...");
                self.set_state(EngineState::ShuttingDown);
                self.cancel.cancel();
            }
        }
    }
}

async fn lead_worker(
    engine: Arc<SyncEngine>,
    mut rx: mpsc::UnboundedReceiver<InboundEvent>,
    pending: Arc<AtomicUsize>,
    limiter: Arc<Semaphore>,
) -> RunStats {
    let mut stats = RunStats::default();
    while let Some(event) = rx.recv().await {
        let Ok(_permit) = Arc::clone(&limiter).acquire_owned().await else {
            break;
        };
        let result = engine.handle(&event, HandleOptions::default()).await;
        stats.record(&result);
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    stats
}

fn collect(stats: &mut RunStats, done: Result<RunStats, tokio::task::JoinError>) {
    match done {
        Ok(worker) => stats.merge(worker),
        Err(e) => {
            error!(error = %e, "Lead worker failed");
            stats.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crm::InMemoryCrm;
    use crate::event::EventType;
    use crate::status::{StatusKey, StatusModel};

    fn id(key: StatusKey) -> i64 {
        StatusModel::standard().id_of(key)
    }

    #[tokio::test]
    async fn test_run_drains_when_source_closes() {
        let crm = Arc::new(InMemoryCrm::new());
        let engine = Arc::new(SyncEngine::builder(crm.clone()).build());
        let (tx, rx) = mpsc::channel(16);

        tx.send(InboundEvent::new("a", EventType::LeadEnrolled)).await.unwrap();
        tx.send(InboundEvent::new("a", EventType::ReplyReceived)).await.unwrap();
        tx.send(InboundEvent::new("b", EventType::Bounced)).await.unwrap();
        drop(tx);

        let stats = Arc::clone(&engine).run(rx).await;

        assert_eq!(stats.received, 3);
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.handled(), 3);
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(
            crm.history("a"),
            vec![id(StatusKey::InCampaign), id(StatusKey::ShouldBeContacted)]
        );
    }

    #[tokio::test]
    async fn test_shutdown_stops_run() {
        let engine = Arc::new(SyncEngine::builder(Arc::new(InMemoryCrm::new())).build());
        let (_tx, rx) = mpsc::channel(16);
        let mut state = engine.state_receiver();

        let handle = tokio::spawn(Arc::clone(&engine).run(rx));
        state.wait_for(|s| *s == EngineState::Running).await.unwrap();

        engine.shutdown();
        let stats = handle.await.unwrap();
        assert_eq!(stats.received, 0);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[test]
    fn test_shutdown_before_run() {
        let engine = SyncEngine::builder(Arc::new(InMemoryCrm::new())).build();
        engine.shutdown();
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.cancellation_token().is_cancelled());
    }
}
