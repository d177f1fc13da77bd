use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::error::Result;
use crate::interval::Interval;
use crate::tree::node::{ChildPointer, Node, NodeKind};

/// Resolves a sequence number to a node, wherever it currently lives: the
/// in-memory current branch, the node cache, or the tree file.
pub(crate) trait NodeSource {
    fn node(&self, seq: u32) -> Result<Arc<Node>>;
}

/// Children that can contain `t`: their start times are non-decreasing, so
/// only those starting at or before `t` qualify.
fn candidates(children: &[ChildPointer], t: i64) -> &[ChildPointer] {
    let idx = children.partition_point(|c| c.start <= t);
    &children[..idx]
}

/// Snapshot query: the latest interval per attribute key valid at `t`,
/// sorted by key. Overlapping coverage resolves last-write-wins.
pub(crate) fn query_at(src: &dyn NodeSource, root: u32, t: i64) -> Result<Vec<Interval>> {
    let mut latest = BTreeMap::new();
    collect_at(src, root, t, &mut latest)?;
    Ok(latest.into_values().collect())
}

fn collect_at(
    src: &dyn NodeSource,
    seq: u32,
    t: i64,
    latest: &mut BTreeMap<i32, Interval>,
) -> Result<()> {
    let node = src.node(seq)?;
    if t < node.min_time() || t > node.max_time() {
        return Ok(());
    }
    for interval in node.intervals() {
        if interval.contains(t) {
            latest.insert(interval.attribute(), interval.clone());
        }
    }
    for child in candidates(node.children(), t) {
        collect_at(src, child.seq, t, latest)?;
    }
    Ok(())
}

/// Single-attribute point query. Descends latest-sibling-first so the first
/// match found is the last-written one and the walk can short-circuit.
pub(crate) fn query_attribute_at(
    src: &dyn NodeSource,
    root: u32,
    attribute: i32,
    t: i64,
) -> Result<Option<Interval>> {
    let node = src.node(root)?;
    if t < node.min_time() || t > node.max_time() {
        return Ok(None);
    }
    for child in candidates(node.children(), t).iter().rev() {
        if let Some(found) = query_attribute_at(src, child.seq, attribute, t)? {
            return Ok(Some(found));
        }
    }
    for interval in node.intervals().iter().rev() {
        if interval.attribute() == attribute && interval.contains(t) {
            return Ok(Some(interval.clone()));
        }
    }
    Ok(None)
}

/// Lazy depth-first walk over every interval of one attribute overlapping
/// `[t0, t1]`, ordered by start time. Leaves are visited in child-pointer
/// order and intervals are stored in insertion order, so no sort is needed.
pub struct RangeIterator<'a> {
    src: &'a dyn NodeSource,
    root: Option<u32>,
    attribute: i32,
    t0: i64,
    t1: i64,
    /// Nodes still to visit; the top of the stack is next.
    stack: Vec<u32>,
    /// Matches from the leaf most recently visited.
    pending: VecDeque<Interval>,
}

impl<'a> RangeIterator<'a> {
    pub(crate) fn new(
        src: &'a dyn NodeSource,
        root: Option<u32>,
        attribute: i32,
        t0: i64,
        t1: i64,
    ) -> Self {
        Self {
            src,
            root,
            attribute,
            t0,
            t1,
            stack: root.into_iter().collect(),
            pending: VecDeque::new(),
        }
    }

    /// Resets the iterator to yield the full sequence again.
    pub fn rewind(&mut self) {
        self.stack = self.root.into_iter().collect();
        self.pending.clear();
    }

    fn visit(&mut self, seq: u32) -> Result<()> {
        let node = self.src.node(seq)?;
        if node.max_time() < self.t0 || node.min_time() > self.t1 {
            return Ok(());
        }
        match node.kind() {
            NodeKind::Leaf => {
                for interval in node.intervals() {
                    if interval.attribute() == self.attribute
                        && interval.overlaps(self.t0, self.t1)
                    {
                        self.pending.push_back(interval.clone());
                    }
                }
            }
            NodeKind::Branch => {
                // Reverse push so the earliest child is popped first.
                let upper = node.children().partition_point(|c| c.start <= self.t1);
                for child in node.children()[..upper].iter().rev() {
                    self.stack.push(child.seq);
                }
            }
        }
        Ok(())
    }
}

impl Iterator for RangeIterator<'_> {
    type Item = Result<Interval>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(interval) = self.pending.pop_front() {
                return Some(Ok(interval));
            }
            let seq = self.stack.pop()?;
            if let Err(e) = self.visit(seq) {
                return Some(Err(e));
            }
        }
    }
}
