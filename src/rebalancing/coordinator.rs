//! Controller-side rebalance runner.
//!
//! A run takes the operation barrier, refreshes the index from the storage
//! nodes' own listings, plans the movements, sends each node its `REBALANCE`
//! instructions and applies the effects of every `REBALANCE_COMPLETE` to the
//! index. The barrier guard is released when the run ends, whatever happened.

use crate::cluster::{OperationBarrier, StoreEvent, StoreEventListener, StoreRegistry};
use crate::error::RebalanceError;
use crate::index::{CountdownLatch, FileIndex};
use crate::rebalancing::planner::{plan_rebalance, NodePlan};
use crate::types::{name_key, StorePort};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// What triggered a rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceTrigger {
    /// The periodic timer fired.
    Scheduled,
    /// A storage node joined.
    NodeJoin(StorePort),
}

/// Summary of a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebalanceOutcome {
    /// Nodes dropped because they did not report their listing in time.
    pub lost: Vec<StorePort>,
    /// Nodes that were sent instructions.
    pub notified: usize,
    /// Nodes that reported completion in time.
    pub completed: usize,
    /// Replica copies the planner could not place.
    pub unresolved: usize,
}

struct RefreshRound {
    expected: HashSet<StorePort>,
    reports: HashMap<StorePort, HashSet<String>>,
    latch: Arc<CountdownLatch>,
}

struct ActiveRebalance {
    pending: HashMap<StorePort, NodePlan>,
    /// Nodes that left before reporting completion.
    departed: usize,
    latch: Arc<CountdownLatch>,
}

/// Runs rebalances on the controller.
pub struct RebalanceCoordinator {
    registry: Arc<StoreRegistry>,
    index: Arc<FileIndex>,
    barrier: Arc<OperationBarrier>,
    replication_factor: usize,
    timeout: Duration,
    refresh: Mutex<Option<RefreshRound>>,
    active: Mutex<Option<ActiveRebalance>>,
}

impl std::fmt::Debug for RebalanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebalanceCoordinator")
            .field("replication_factor", &self.replication_factor)
            .field("timeout", &self.timeout)
            .field("rebalancing", &self.barrier.is_rebalancing())
            .finish()
    }
}

impl RebalanceCoordinator {
    pub fn new(
        registry: Arc<StoreRegistry>,
        index: Arc<FileIndex>,
        barrier: Arc<OperationBarrier>,
        replication_factor: usize,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            index,
            barrier,
            replication_factor,
            timeout,
            refresh: Mutex::new(None),
            active: Mutex::new(None),
        })
    }

    /// Start a run in the background. A run already in progress wins.
    pub fn trigger(self: &Arc<Self>, trigger: RebalanceTrigger) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            match coordinator.run_once().await {
                Ok(outcome) => info!(?trigger, ?outcome, "Rebalance finished"),
                Err(RebalanceError::AlreadyRebalancing) => {
                    info!(?trigger, "Refusing to start rebalancing as one is already happening")
                }
                Err(e) => error!(?trigger, error = %e, "Rebalance failed"),
            }
        });
    }

    /// Trigger a run every `period` until `shutdown` is cancelled. The first
    /// run happens one period after the call.
    pub async fn run_periodic(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        info!(period_secs = period.as_secs_f64(), "Periodic rebalance scheduled");
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.trigger(RebalanceTrigger::Scheduled),
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Periodic rebalance stopped");
    }

    /// Run one rebalance to completion.
    pub async fn run_once(&self) -> Result<RebalanceOutcome, RebalanceError> {
        let _guard = self.barrier.start_rebalance().await?;
        let mut outcome = RebalanceOutcome {
            lost: self.refresh_listings().await,
            ..Default::default()
        };

        let nodes = self.registry.ports();
        let files = self.index.available_files();
        info!(files = files.len(), nodes = nodes.len(), "Rebalancing");
        let plan = plan_rebalance(&nodes, &files, self.replication_factor);
        outcome.unresolved = plan.unresolved;
        if plan.is_empty() {
            info!("Cluster is balanced, nothing to do");
            return Ok(outcome);
        }

        let mut targets = Vec::with_capacity(plan.plans.len());
        for (port, node_plan) in plan.plans {
            match self.registry.get(port) {
                Some(node) => targets.push((port, node.connection, node_plan)),
                None => warn!(port, "Node left before receiving its rebalance plan"),
            }
        }

        // Plans are registered before any is sent so a fast completion is not lost.
        let latch = Arc::new(CountdownLatch::new(targets.len()));
        *self.active.lock() = Some(ActiveRebalance {
            pending: targets
                .iter()
                .map(|(port, _, node_plan)| (*port, node_plan.clone()))
                .collect(),
            departed: 0,
            latch: latch.clone(),
        });

        outcome.notified = targets.len();
        for (port, connection, node_plan) in targets {
            if let Err(e) = connection.send(&node_plan.to_message()).await {
                warn!(port, error = %e, "Failed to send rebalance plan");
                let withdrawn = self
                    .active
                    .lock()
                    .as_mut()
                    .is_some_and(|a| a.pending.remove(&port).is_some());
                if withdrawn {
                    latch.count_down();
                    outcome.notified -= 1;
                }
            }
        }

        if !latch.wait(self.timeout).await {
            warn!(remaining = latch.count(), "Not all nodes completed the rebalance in time");
        }

        let leftover = self
            .active
            .lock()
            .take()
            .map(|a| a.pending.len() + a.departed)
            .unwrap_or(0);
        outcome.completed = outcome.notified.saturating_sub(leftover);
        Ok(outcome)
    }

    /// Ask every node for its listing and reconcile the index. Nodes that do
    /// not answer in time are dropped from the pool. Returns the dropped ports.
    async fn refresh_listings(&self) -> Vec<StorePort> {
        let nodes = self.registry.nodes();
        if nodes.is_empty() {
            return Vec::new();
        }

        let latch = Arc::new(CountdownLatch::new(nodes.len()));
        *self.refresh.lock() = Some(RefreshRound {
            expected: nodes.iter().map(|n| n.port).collect(),
            reports: HashMap::new(),
            latch: latch.clone(),
        });

        info!(nodes = nodes.len(), "Requesting file listings");
        let request = crate::network::Message::List(Vec::new());
        for node in &nodes {
            if let Err(e) = node.connection.send(&request).await {
                warn!(port = node.port, error = %e, "Failed to request listing");
            }
        }

        if !latch.wait(self.timeout).await {
            warn!("Not all nodes reported their listing in time");
        }

        let Some(round) = self.refresh.lock().take() else {
            return Vec::new();
        };

        let mut lost: Vec<StorePort> = round
            .expected
            .iter()
            .filter(|p| !round.reports.contains_key(p))
            .copied()
            .collect();
        lost.sort_unstable();
        for &port in &lost {
            warn!(port, "Node did not report its listing, treating it as lost");
            if let Some(node) = self.registry.get(port) {
                self.registry.leave(port);
                node.connection.close().await;
            }
        }

        for (port, names) in &round.reports {
            if self.registry.contains(*port) {
                self.index.reconcile(*port, names);
            }
        }
        lost
    }

    /// Record a listing reported by the node on `port`.
    pub fn handle_listing(&self, port: StorePort, names: Vec<String>) {
        let mut refresh = self.refresh.lock();
        let Some(round) = refresh.as_mut() else {
            info!(port, "Got a file listing without a refresh to match it to, ignoring");
            return;
        };
        if !round.expected.contains(&port) || round.reports.contains_key(&port) {
            warn!(port, "Unexpected file listing, ignoring");
            return;
        }
        let keys: HashSet<String> = names.iter().map(|n| name_key(n)).collect();
        debug!(port, files = keys.len(), "Got file listing");
        round.reports.insert(port, keys);
        round.latch.count_down();
    }

    /// Stop waiting on the node on `port`, which left the pool mid-run.
    pub fn handle_leave(&self, port: StorePort) {
        if let Some(round) = self.refresh.lock().as_mut() {
            if round.expected.remove(&port) && round.reports.remove(&port).is_none() {
                debug!(port, "Node left before reporting its listing");
                round.latch.count_down();
            }
        }
        if let Some(active) = self.active.lock().as_mut() {
            if active.pending.remove(&port).is_some() {
                warn!(port, "Node left before completing its rebalance");
                active.departed += 1;
                active.latch.count_down();
            }
        }
    }

    /// Apply the completion of the node on `port`: its destinations now hold
    /// the files it sent, and it no longer holds the files it deleted.
    pub fn handle_complete(&self, port: StorePort) {
        let plan = {
            let mut active = self.active.lock();
            let Some(a) = active.as_mut() else {
                info!(port, "Cannot complete a rebalance that is not running");
                return;
            };
            let Some(plan) = a.pending.remove(&port) else {
                warn!(port, "Rebalance completion from a node without a plan, ignoring");
                return;
            };
            a.latch.count_down();
            plan
        };

        for (name, dests) in &plan.sends {
            for &dest in dests {
                self.index.add_replica(name, dest);
            }
        }
        for name in &plan.removes {
            self.index.remove_replica(name, port);
        }
        info!(
            port,
            sent = plan.sends.len(),
            removed = plan.removes.len(),
            "Node completed rebalance"
        );
    }
}

impl StoreEventListener for RebalanceCoordinator {
    fn on_event(&self, event: StoreEvent) {
        if let StoreEvent::Left { port } = event {
            self.handle_leave(port);
        }
    }
}
