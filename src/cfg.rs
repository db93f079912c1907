//! Statement-level control-flow graph over a [`Body`].

use crate::ir::Body;
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::visit::{Dfs, EdgeRef};
use petgraph::{Incoming, Outgoing};
use std::collections::{BTreeSet, VecDeque};

/// Kind of control transfer along an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Fallthrough or jump
    Normal,
    /// From a statement covered by an exception region to its handler
    Exceptional,
}

/// Statement graph: node `i` is statement `i` of the body.
#[derive(Debug, Clone)]
pub struct UnitGraph {
    cfg: StableDiGraph<usize, EdgeKind>,
}

impl UnitGraph {
    pub fn new(body: &Body) -> Self {
        let n = body.stmts.len();
        let mut cfg = StableDiGraph::with_capacity(n, n * 2);
        for i in 0..n {
            cfg.add_node(i);
        }

        for (i, stmt) in body.stmts.iter().enumerate() {
            let node = NodeIndex::new(i);
            let mut succs: Vec<usize> = Vec::new();
            if stmt.falls_through() && i + 1 < n {
                succs.push(i + 1);
            }
            for t in stmt.targets() {
                if t < n && !succs.contains(&t) {
                    succs.push(t);
                }
            }
            for s in succs {
                cfg.add_edge(node, NodeIndex::new(s), EdgeKind::Normal);
            }

            let mut handlers: Vec<usize> = Vec::new();
            for trap in body.traps.iter().filter(|t| t.covers(i)) {
                if trap.handler < n && !handlers.contains(&trap.handler) {
                    handlers.push(trap.handler);
                }
            }
            for h in handlers {
                cfg.add_edge(node, NodeIndex::new(h), EdgeKind::Exceptional);
            }
        }

        Self { cfg }
    }

    pub fn len(&self) -> usize {
        self.cfg.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.cfg.node_count() == 0
    }

    fn node(&self, index: usize) -> Option<NodeIndex> {
        let node = NodeIndex::new(index);
        self.cfg.contains_node(node).then_some(node)
    }

    fn succs_of(&self, index: usize, kind: EdgeKind) -> Vec<usize> {
        let Some(node) = self.node(index) else {
            return Vec::new();
        };
        let mut out: Vec<usize> = self
            .cfg
            .edges_directed(node, Outgoing)
            .filter(|e| *e.weight() == kind)
            .map(|e| e.target().index())
            .collect();
        out.sort_unstable();
        out
    }

    /// Fallthrough and jump successors
    pub fn normal_succs(&self, index: usize) -> Vec<usize> {
        self.succs_of(index, EdgeKind::Normal)
    }

    /// Handlers reachable by an exception raised at `index`
    pub fn exceptional_succs(&self, index: usize) -> Vec<usize> {
        self.succs_of(index, EdgeKind::Exceptional)
    }

    pub fn succs(&self, index: usize) -> Vec<usize> {
        let mut all = self.normal_succs(index);
        all.extend(self.exceptional_succs(index));
        all
    }

    pub fn preds(&self, index: usize) -> Vec<usize> {
        let Some(node) = self.node(index) else {
            return Vec::new();
        };
        let mut preds: Vec<usize> = self
            .cfg
            .neighbors_directed(node, Incoming)
            .map(|n| n.index())
            .collect();
        preds.sort_unstable();
        preds.dedup();
        preds
    }

    /// Statements reachable from the entry
    pub fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.len()];
        if let Some(entry) = self.node(0) {
            let mut dfs = Dfs::new(&self.cfg, entry);
            while let Some(node) = dfs.next(&self.cfg) {
                seen[node.index()] = true;
            }
        }
        seen
    }
}

/// Locals definitely assigned on entry to each statement.
///
/// `None` marks statements unreachable from the entry.
pub fn assigned_before(body: &Body) -> Vec<Option<BTreeSet<String>>> {
    let graph = UnitGraph::new(body);
    let n = graph.len();
    let mut state: Vec<Option<BTreeSet<String>>> = vec![None; n];
    if n == 0 {
        return state;
    }
    state[0] = Some(BTreeSet::new());
    let mut work: VecDeque<NodeIndex> = VecDeque::from([NodeIndex::new(0)]);

    while let Some(node) = work.pop_front() {
        let i = node.index();
        let Some(before) = state[i].clone() else {
            continue;
        };
        let mut after = before.clone();
        if let Some(name) = body.stmts[i].writes() {
            after.insert(name.to_string());
        }

        // a handler sees the state before the faulting statement's write
        for edge in graph.cfg.edges_directed(node, Outgoing) {
            let incoming = match edge.weight() {
                EdgeKind::Normal => &after,
                EdgeKind::Exceptional => &before,
            };
            let succ = edge.target();
            let merged = match &state[succ.index()] {
                None => incoming.clone(),
                Some(existing) => existing.intersection(incoming).cloned().collect(),
            };
            if state[succ.index()].as_ref() != Some(&merged) {
                state[succ.index()] = Some(merged);
                work.push_back(succ);
            }
        }
    }
    state
}

/// Reads of locals that are not assigned on every path reaching them.
pub fn uninitialized_reads(body: &Body) -> Vec<(usize, String)> {
    let state = assigned_before(body);
    let mut reads = Vec::new();
    for (i, stmt) in body.stmts.iter().enumerate() {
        let Some(assigned) = &state[i] else {
            continue;
        };
        for name in stmt.reads() {
            if !assigned.contains(name) {
                reads.push((i, name.to_string()));
            }
        }
    }
    reads
}
