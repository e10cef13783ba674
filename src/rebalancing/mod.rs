//! Replica rebalancing across the storage pool.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 RebalanceCoordinator (controller)            │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  Phase 1: Refresh                                      │  │
//! │  │  - Raise the barrier, drain stores and removes         │  │
//! │  │  - LIST every node, drop silent ones, reconcile        │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                          ↓                                   │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  Phase 2: Plan                                         │  │
//! │  │  - Per-node floor/ceiling targets                      │  │
//! │  │  - Restore missing replicas, move overage to shortage  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                          ↓                                   │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │  Phase 3: Execute                                      │  │
//! │  │  - REBALANCE to each node with work                    │  │
//! │  │  - Apply every REBALANCE_COMPLETE to the index         │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!                            │ REBALANCE
//!                            ▼
//!               RebalanceExecutor (storage node)
//!               push to peers, then delete shed files
//! ```

pub mod coordinator;
pub mod executor;
pub mod planner;

pub use coordinator::{RebalanceCoordinator, RebalanceOutcome, RebalanceTrigger};
pub use executor::{RebalanceExecutor, RebalanceReport};
pub use planner::{plan_rebalance, NodePlan, RebalancePlan, ReplicaTargets};
