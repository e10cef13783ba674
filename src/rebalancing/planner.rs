//! Pure rebalance planning over a snapshot of the index.
//!
//! The planner works in three steps:
//!
//! 1. Compute the per-node target range from the number of available files,
//!    the replication factor and the pool size.
//! 2. Build a movement stack. Every under-replicated file contributes one
//!    `(holder, file)` entry per missing replica; every node above the upper
//!    bound contributes `(itself, file)` entries for the files it should shed.
//! 3. Nodes below the lower bound pop entries until satisfied. Whatever is
//!    left, copies owed to under-replicated files and excess a node still has
//!    to shed, then goes to the least loaded node that stays within the upper
//!    bound.
//!
//! A node never receives a file it already holds or is already receiving, and
//! a file is only shed by a node once another node takes it.

use crate::index::IndexedFile;
use crate::network::Message;
use crate::types::StorePort;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{info, warn};

/// Per-node replica count bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaTargets {
    /// `floor(files * replication / nodes)`.
    pub lower: usize,
    /// `ceil(files * replication / nodes)`.
    pub upper: usize,
}

impl ReplicaTargets {
    /// Bounds for `files` available files at `replication` over `nodes` nodes.
    /// Returns `None` for an empty pool.
    pub fn compute(files: usize, replication: usize, nodes: usize) -> Option<Self> {
        if nodes == 0 {
            return None;
        }
        let total = files * replication;
        Some(Self {
            lower: total / nodes,
            upper: total.div_ceil(nodes),
        })
    }
}

/// Instructions for one storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodePlan {
    /// File name to the ports that should receive a copy.
    pub sends: BTreeMap<String, Vec<StorePort>>,
    /// Files to delete locally after every push finished.
    pub removes: Vec<String>,
}

impl NodePlan {
    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.removes.is_empty()
    }

    /// The `REBALANCE` message carrying this plan.
    pub fn to_message(&self) -> Message {
        Message::Rebalance {
            sends: self
                .sends
                .iter()
                .map(|(name, ports)| (name.clone(), ports.clone()))
                .collect(),
            removes: self.removes.clone(),
        }
    }
}

/// The outcome of planning: a plan for every node that has work to do.
#[derive(Debug, Clone, Default)]
pub struct RebalancePlan {
    pub targets: Option<ReplicaTargets>,
    pub plans: BTreeMap<StorePort, NodePlan>,
    /// Replica copies that could not be placed.
    pub unresolved: usize,
}

impl RebalancePlan {
    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Movement {
    source: StorePort,
    file: usize,
    shed: bool,
}

struct Planner<'a> {
    files: &'a [IndexedFile],
    /// Node to the set of file indices it holds or will receive.
    holdings: HashMap<StorePort, HashSet<usize>>,
    /// Projected replica count per node.
    load: HashMap<StorePort, usize>,
    plans: BTreeMap<StorePort, NodePlan>,
}

impl<'a> Planner<'a> {
    fn usable(&self, m: &Movement, dest: StorePort) -> bool {
        m.source != dest && !self.holdings.get(&dest).is_some_and(|h| h.contains(&m.file))
    }

    fn assign(&mut self, m: Movement, dest: StorePort) {
        let name = self.files[m.file].name.clone();
        let plan = self.plans.entry(m.source).or_default();
        plan.sends.entry(name.clone()).or_default().push(dest);
        if m.shed {
            plan.removes.push(name);
            if let Some(h) = self.holdings.get_mut(&m.source) {
                h.remove(&m.file);
            }
            if let Some(l) = self.load.get_mut(&m.source) {
                *l = l.saturating_sub(1);
            }
        }
        self.holdings.entry(dest).or_default().insert(m.file);
        *self.load.entry(dest).or_default() += 1;
    }
}

/// Plan a rebalance of `files` (the available files) across `nodes` (in join order).
pub fn plan_rebalance(
    nodes: &[StorePort],
    files: &[IndexedFile],
    replication: usize,
) -> RebalancePlan {
    let Some(targets) = ReplicaTargets::compute(files.len(), replication, nodes.len()) else {
        return RebalancePlan::default();
    };
    info!(
        files = files.len(),
        nodes = nodes.len(),
        lower = targets.lower,
        upper = targets.upper,
        "Planning rebalance"
    );

    let live: HashSet<StorePort> = nodes.iter().copied().collect();
    let mut holdings: HashMap<StorePort, HashSet<usize>> =
        nodes.iter().map(|&p| (p, HashSet::new())).collect();
    for (idx, file) in files.iter().enumerate() {
        for port in file.replicas.iter().filter(|p| live.contains(p)) {
            if let Some(h) = holdings.get_mut(port) {
                h.insert(idx);
            }
        }
    }
    let load: HashMap<StorePort, usize> =
        holdings.iter().map(|(&p, h)| (p, h.len())).collect();

    let mut stack: Vec<Movement> = Vec::new();

    for (idx, file) in files.iter().enumerate() {
        let holders: Vec<StorePort> = file
            .replicas
            .iter()
            .copied()
            .filter(|p| live.contains(p))
            .collect();
        let deficit = replication.saturating_sub(holders.len());
        if deficit == 0 {
            continue;
        }
        match holders.first() {
            Some(&source) => {
                info!(file = %file.name, deficit, "File is under-replicated");
                stack.extend((0..deficit).map(|_| Movement {
                    source,
                    file: idx,
                    shed: false,
                }));
            }
            None => warn!(file = %file.name, "No node holds the file, cannot restore its replicas"),
        }
    }

    let mut shortages: Vec<(StorePort, usize)> = Vec::new();
    for &port in nodes {
        let count = load[&port];
        if count < targets.lower {
            info!(port, shortage = targets.lower - count, "Node has a shortage");
            shortages.push((port, targets.lower - count));
        } else if count > targets.upper {
            let excess = count - targets.upper;
            info!(port, overage = excess, "Node has an overage");
            let mut own: Vec<usize> = holdings[&port].iter().copied().collect();
            own.sort_by(|a, b| files[*a].name.cmp(&files[*b].name));
            stack.extend(own.into_iter().take(excess).map(|file| Movement {
                source: port,
                file,
                shed: true,
            }));
        }
    }

    let mut planner = Planner {
        files,
        holdings,
        load,
        plans: BTreeMap::new(),
    };

    for (dest, mut needed) in shortages {
        while needed > 0 {
            let Some(pos) = stack.iter().rposition(|m| planner.usable(m, dest)) else {
                warn!(port = dest, needed, "No suitable file left for node with a shortage");
                break;
            };
            let m = stack.remove(pos);
            planner.assign(m, dest);
            needed -= 1;
        }
    }

    let mut unresolved = 0;
    while let Some(m) = stack.pop() {
        let dest = nodes
            .iter()
            .copied()
            .filter(|&p| planner.usable(&m, p) && planner.load[&p] < targets.upper)
            .min_by_key(|p| planner.load[p]);
        match dest {
            Some(dest) => planner.assign(m, dest),
            None if m.shed => {
                warn!(
                    port = m.source,
                    file = %files[m.file].name,
                    "No node can take a shed file, node stays above its target"
                );
            }
            None => {
                warn!(file = %files[m.file].name, "Could not place a missing replica");
                unresolved += 1;
            }
        }
    }

    let plans: BTreeMap<StorePort, NodePlan> = planner
        .plans
        .into_iter()
        .filter(|(_, plan)| !plan.is_empty())
        .collect();
    for (port, plan) in &plans {
        info!(
            port,
            sends = plan.sends.len(),
            removes = plan.removes.len(),
            "Node rebalance plan"
        );
    }

    RebalancePlan {
        targets: Some(targets),
        plans,
        unresolved,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::FileState;

    fn files(specs: &[(&str, &[StorePort])]) -> Vec<IndexedFile> {
        specs
            .iter()
            .enumerate()
            .map(|(i, (name, replicas))| {
                let mut f = IndexedFile::new(i as u64, *name, 1, replicas.to_vec());
                f.state = FileState::Available;
                f
            })
            .collect()
    }

    /// Replica sets after applying `plan` the way completion handling does.
    fn apply(files: &[IndexedFile], plan: &RebalancePlan) -> HashMap<String, HashSet<StorePort>> {
        let mut out: HashMap<String, HashSet<StorePort>> = files
            .iter()
            .map(|f| (f.name.clone(), f.replicas.iter().copied().collect()))
            .collect();
        for (source, node) in &plan.plans {
            for (name, dests) in &node.sends {
                out.get_mut(name).unwrap().extend(dests);
            }
            for name in &node.removes {
                out.get_mut(name).unwrap().remove(source);
            }
        }
        out
    }

    fn per_node(state: &HashMap<String, HashSet<StorePort>>, port: StorePort) -> usize {
        state.values().filter(|s| s.contains(&port)).count()
    }

    #[test]
    fn test_targets() {
        assert_eq!(
            ReplicaTargets::compute(2, 3, 4),
            Some(ReplicaTargets { lower: 1, upper: 2 })
        );
        assert_eq!(
            ReplicaTargets::compute(4, 2, 4),
            Some(ReplicaTargets { lower: 2, upper: 2 })
        );
        assert_eq!(ReplicaTargets::compute(3, 2, 0), None);
    }

    #[test]
    fn test_targets_when_replicas_divide_evenly() {
        assert_eq!(
            ReplicaTargets::compute(6, 3, 3),
            Some(ReplicaTargets { lower: 6, upper: 6 })
        );
    }

    #[test]
    fn test_shed_matches_shortage() {
        // Six files at R=1: node 1 holds four, node 2 two, node 3 none.
        let fs = files(&[
            ("a", &[1]),
            ("b", &[1]),
            ("c", &[1]),
            ("d", &[1]),
            ("e", &[2]),
            ("f", &[2]),
        ]);
        let plan = plan_rebalance(&[1, 2, 3], &fs, 1);
        assert_eq!(plan.targets, Some(ReplicaTargets { lower: 2, upper: 2 }));

        let received = |port: StorePort| -> usize {
            plan.plans
                .values()
                .flat_map(|n| n.sends.values())
                .filter(|dests| dests.contains(&port))
                .count()
        };
        let removed: usize = plan.plans.values().map(|n| n.removes.len()).sum();
        let copies: usize = plan
            .plans
            .values()
            .flat_map(|n| n.sends.values())
            .map(|dests| dests.len())
            .sum();

        assert_eq!(plan.plans[&1].removes.len(), 2);
        assert_eq!(received(3), 2);
        assert_eq!(received(2), 0);
        assert_eq!(removed, copies);

        let after = apply(&fs, &plan);
        for port in [1, 2, 3] {
            assert_eq!(per_node(&after, port), 2, "node {port}");
        }
    }

    #[test]
    fn test_overloaded_node_sheds_without_any_shortage() {
        // Eight replicas over three nodes: lower 2, upper 3. Node 1 holds four
        // while the others sit at the lower bound.
        let fs = files(&[
            ("a", &[1, 2]),
            ("b", &[1, 2]),
            ("c", &[1, 3]),
            ("d", &[1, 3]),
        ]);
        let plan = plan_rebalance(&[1, 2, 3], &fs, 2);
        assert_eq!(plan.targets, Some(ReplicaTargets { lower: 2, upper: 3 }));
        assert!(!plan.is_empty());
        assert_eq!(plan.plans[&1].removes.len(), 1);

        let after = apply(&fs, &plan);
        for port in [1, 2, 3] {
            let held = per_node(&after, port);
            assert!((2..=3).contains(&held), "node {port} holds {held}");
        }
        for (name, replicas) in &after {
            assert_eq!(replicas.len(), 2, "file {name}");
        }
    }

    #[test]
    fn test_balanced_cluster_needs_no_plan() {
        let fs = files(&[("a", &[1, 2]), ("b", &[2, 3]), ("c", &[3, 1])]);
        let plan = plan_rebalance(&[1, 2, 3], &fs, 2);
        assert!(plan.is_empty());
        assert_eq!(plan.unresolved, 0);
    }

    #[test]
    fn test_new_node_receives_shed_files() {
        // Four files at R=2 on two nodes; a third and fourth node join empty.
        let fs = files(&[
            ("a", &[1, 2]),
            ("b", &[1, 2]),
            ("c", &[1, 2]),
            ("d", &[1, 2]),
        ]);
        let plan = plan_rebalance(&[1, 2, 3, 4], &fs, 2);
        let after = apply(&fs, &plan);

        for port in [1, 2, 3, 4] {
            assert_eq!(per_node(&after, port), 2, "node {port}");
        }
        for (name, replicas) in &after {
            assert_eq!(replicas.len(), 2, "file {name}");
        }
    }

    #[test]
    fn test_under_replicated_file_is_restored() {
        let fs = files(&[("a", &[1]), ("b", &[2, 3])]);
        let plan = plan_rebalance(&[1, 2, 3], &fs, 2);
        let after = apply(&fs, &plan);

        assert_eq!(after["a"].len(), 2);
        assert_eq!(after["b"].len(), 2);
        assert!(plan.plans[&1].sends["a"].iter().all(|&p| p != 1));
    }

    #[test]
    fn test_never_sends_to_a_holder() {
        let fs = files(&[("a", &[1, 2, 3]), ("b", &[1, 2, 3]), ("c", &[1])]);
        let plan = plan_rebalance(&[1, 2, 3, 4], &fs, 2);

        for (source, node) in &plan.plans {
            for (name, dests) in &node.sends {
                let file = fs.iter().find(|f| &f.name == name).unwrap();
                for dest in dests {
                    assert_ne!(dest, source);
                    assert!(!file.replicas.contains(dest), "{name} sent to holder {dest}");
                }
            }
        }
    }

    #[test]
    fn test_replicas_on_unknown_nodes_are_ignored() {
        // Node 9 is gone; its replicas do not count.
        let fs = files(&[("a", &[9, 1])]);
        let plan = plan_rebalance(&[1, 2], &fs, 2);
        assert_eq!(plan.plans[&1].sends["a"], vec![2]);
    }

    #[test]
    fn test_plan_message_format() {
        let mut node = NodePlan::default();
        node.sends.insert("a".into(), vec![2, 3]);
        node.removes.push("a".into());
        assert_eq!(node.to_message().to_string(), "REBALANCE 1 a 2 2 3 1 a");
    }
}
