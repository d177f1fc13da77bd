use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::interval::Interval;

/// Sentinel sequence number for "no node" (root parent, empty tree root).
pub const NO_NODE: u32 = u32::MAX;

/// Fixed per-block header: kind u8, seq u32, parent u32, min i64, max i64,
/// interval count u32, child count u16.
pub const NODE_HEADER_SIZE: usize = 31;

/// Child pointer record: child seq u32, child start time i64.
pub const CHILD_POINTER_SIZE: usize = 12;

const KIND_LEAF: u8 = 0;
const KIND_BRANCH: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Leaf,
    Branch,
}

/// Pointer from a branch node to one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildPointer {
    pub seq: u32,
    /// Start time of the child's span; non-decreasing across siblings.
    pub start: i64,
}

/// A fixed-capacity disk block: a leaf holds a run of intervals in insertion
/// order, a branch holds child pointers. Mutable only while part of the
/// current branch; byte-identical to its on-disk form once sealed.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    kind: NodeKind,
    seq: u32,
    parent_seq: u32,
    min_time: i64,
    max_time: i64,
    intervals: Vec<Interval>,
    children: Vec<ChildPointer>,
}

impl Node {
    pub fn new(kind: NodeKind, seq: u32, parent_seq: u32, start: i64) -> Self {
        Self {
            kind,
            seq,
            parent_seq,
            min_time: start,
            max_time: start,
            intervals: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn parent_seq(&self) -> u32 {
        self.parent_seq
    }

    pub fn min_time(&self) -> i64 {
        self.min_time
    }

    pub fn max_time(&self) -> i64 {
        self.max_time
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    pub fn children(&self) -> &[ChildPointer] {
        &self.children
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub(crate) fn set_parent_seq(&mut self, parent_seq: u32) {
        self.parent_seq = parent_seq;
    }

    /// Folds a sealed child's span into this node. Branch spans are the
    /// union of all descendant spans.
    pub(crate) fn widen(&mut self, min: i64, max: i64) {
        self.min_time = self.min_time.min(min);
        self.max_time = self.max_time.max(max);
    }

    /// Bytes this node occupies when serialized into a block. Branches
    /// reserve the full child table up front so linking never overflows.
    pub fn used_bytes(&self, max_children: u16) -> usize {
        let reserved = match self.kind {
            NodeKind::Leaf => 0,
            NodeKind::Branch => max_children as usize * CHILD_POINTER_SIZE,
        };
        NODE_HEADER_SIZE
            + reserved
            + self
                .intervals
                .iter()
                .map(Interval::serialized_size)
                .sum::<usize>()
    }

    /// Appends an interval if this is a leaf with enough free bytes.
    /// Returns false without mutating on overflow; the caller must split.
    pub fn try_add(&mut self, interval: &Interval, block_size: u32, max_children: u16) -> bool {
        if self.kind != NodeKind::Leaf {
            return false;
        }
        if self.used_bytes(max_children) + interval.serialized_size() > block_size as usize {
            return false;
        }
        self.min_time = self.min_time.min(interval.start());
        self.max_time = self.max_time.max(interval.end());
        self.intervals.push(interval.clone());
        true
    }

    /// Links a new child into this branch. Returns false when the fan-out
    /// limit is reached; the caller must open a new sibling.
    pub fn add_child(&mut self, child: ChildPointer, max_children: u16) -> bool {
        if self.kind != NodeKind::Branch {
            return false;
        }
        if self.children.len() >= max_children as usize {
            return false;
        }
        self.min_time = self.min_time.min(child.start);
        self.children.push(child);
        true
    }

    pub fn is_full_branch(&self, max_children: u16) -> bool {
        self.kind == NodeKind::Branch && self.children.len() >= max_children as usize
    }

    /// Serializes into a block of exactly `block_size` bytes, zero-padded.
    pub fn serialize(&self, block_size: u32) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(block_size as usize);
        let kind = match self.kind {
            NodeKind::Leaf => KIND_LEAF,
            NodeKind::Branch => KIND_BRANCH,
        };
        buf.write_u8(kind)
            .map_err(|e| Error::Encode("node kind", e))?;
        buf.write_u32::<BigEndian>(self.seq)
            .map_err(|e| Error::Encode("node seq", e))?;
        buf.write_u32::<BigEndian>(self.parent_seq)
            .map_err(|e| Error::Encode("parent seq", e))?;
        buf.write_i64::<BigEndian>(self.min_time)
            .map_err(|e| Error::Encode("node min time", e))?;
        buf.write_i64::<BigEndian>(self.max_time)
            .map_err(|e| Error::Encode("node max time", e))?;
        buf.write_u32::<BigEndian>(self.intervals.len() as u32)
            .map_err(|e| Error::Encode("interval count", e))?;
        buf.write_u16::<BigEndian>(self.children.len() as u16)
            .map_err(|e| Error::Encode("child count", e))?;

        for child in &self.children {
            buf.write_u32::<BigEndian>(child.seq)
                .map_err(|e| Error::Encode("child seq", e))?;
            buf.write_i64::<BigEndian>(child.start)
                .map_err(|e| Error::Encode("child start", e))?;
        }

        for interval in &self.intervals {
            interval.encode(&mut buf)?;
        }

        if buf.len() > block_size as usize {
            return Err(Error::Corrupted(format!(
                "node {} serialized to {} bytes, block size is {}",
                self.seq,
                buf.len(),
                block_size
            )));
        }
        buf.resize(block_size as usize, 0);
        Ok(buf)
    }

    /// Decodes a block; trailing zero padding is ignored.
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(buf);

        let kind = match cursor.read_u8().map_err(|e| Error::Decode("node kind", e))? {
            KIND_LEAF => NodeKind::Leaf,
            KIND_BRANCH => NodeKind::Branch,
            other => {
                return Err(Error::Corrupted(format!("unknown node kind {}", other)));
            }
        };
        let seq = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("node seq", e))?;
        let parent_seq = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("parent seq", e))?;
        let min_time = cursor
            .read_i64::<BigEndian>()
            .map_err(|e| Error::Decode("node min time", e))?;
        let max_time = cursor
            .read_i64::<BigEndian>()
            .map_err(|e| Error::Decode("node max time", e))?;
        let interval_count = cursor
            .read_u32::<BigEndian>()
            .map_err(|e| Error::Decode("interval count", e))? as usize;
        let child_count = cursor
            .read_u16::<BigEndian>()
            .map_err(|e| Error::Decode("child count", e))? as usize;

        if kind == NodeKind::Leaf && child_count > 0 {
            return Err(Error::Corrupted(format!(
                "leaf node {} claims {} children",
                seq, child_count
            )));
        }

        let mut children = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            let child_seq = cursor
                .read_u32::<BigEndian>()
                .map_err(|e| Error::Decode("child seq", e))?;
            let start = cursor
                .read_i64::<BigEndian>()
                .map_err(|e| Error::Decode("child start", e))?;
            children.push(ChildPointer {
                seq: child_seq,
                start,
            });
        }

        let mut intervals = Vec::with_capacity(interval_count);
        for _ in 0..interval_count {
            intervals.push(Interval::decode(&mut cursor)?);
        }

        Ok(Self {
            kind,
            seq,
            parent_seq,
            min_time,
            max_time,
            intervals,
            children,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::StateValue;

    const BLOCK: u32 = 4096;
    const FANOUT: u16 = 8;

    fn interval(attr: i32, start: i64, end: i64) -> Interval {
        Interval::new(attr, start, end, StateValue::Int32(attr)).expect("valid interval")
    }

    #[test]
    fn test_leaf_roundtrip() {
        let mut node = Node::new(NodeKind::Leaf, 3, 1, 100);
        assert!(node.try_add(&interval(1, 100, 150), BLOCK, FANOUT));
        assert!(node.try_add(&interval(2, 120, 400), BLOCK, FANOUT));

        let block = node.serialize(BLOCK).expect("serialize failed");
        assert_eq!(block.len(), BLOCK as usize);
        let decoded = Node::deserialize(&block).expect("deserialize failed");
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_empty_node_roundtrip() {
        for kind in [NodeKind::Leaf, NodeKind::Branch] {
            let node = Node::new(kind, 0, NO_NODE, 0);
            let block = node.serialize(BLOCK).expect("serialize failed");
            let decoded = Node::deserialize(&block).expect("deserialize failed");
            assert_eq!(decoded, node);
        }
    }

    #[test]
    fn test_branch_roundtrip() {
        let mut node = Node::new(NodeKind::Branch, 5, NO_NODE, 0);
        for i in 0..FANOUT {
            let added = node.add_child(
                ChildPointer {
                    seq: i as u32,
                    start: i as i64 * 10,
                },
                FANOUT,
            );
            assert!(added);
        }
        assert!(node.is_full_branch(FANOUT));

        let block = node.serialize(BLOCK).expect("serialize failed");
        let decoded = Node::deserialize(&block).expect("deserialize failed");
        assert_eq!(decoded, node);
    }

    #[test]
    fn test_try_add_widens_span() {
        let mut node = Node::new(NodeKind::Leaf, 0, NO_NODE, 50);
        assert!(node.try_add(&interval(1, 50, 200), BLOCK, FANOUT));
        assert_eq!(node.min_time(), 50);
        assert_eq!(node.max_time(), 200);
    }

    #[test]
    fn test_leaf_at_exact_capacity() {
        let iv = interval(1, 0, 1);
        let per_interval = iv.serialized_size();
        let block = (NODE_HEADER_SIZE + 3 * per_interval) as u32;

        let mut node = Node::new(NodeKind::Leaf, 0, NO_NODE, 0);
        for _ in 0..3 {
            assert!(node.try_add(&iv, block, FANOUT));
        }
        // Exactly full: nothing more fits, and the failed add did not mutate.
        assert!(!node.try_add(&iv, block, FANOUT));
        assert_eq!(node.intervals().len(), 3);

        // One byte under capacity still rejects; at capacity accepts.
        let mut node = Node::new(NodeKind::Leaf, 0, NO_NODE, 0);
        let tight = (NODE_HEADER_SIZE + per_interval) as u32;
        assert!(!node.try_add(&iv, tight - 1, FANOUT));
        assert!(node.try_add(&iv, tight, FANOUT));
    }

    #[test]
    fn test_branch_rejects_intervals_and_leaf_rejects_children() {
        let mut branch = Node::new(NodeKind::Branch, 0, NO_NODE, 0);
        assert!(!branch.try_add(&interval(1, 0, 1), BLOCK, FANOUT));

        let mut leaf = Node::new(NodeKind::Leaf, 1, 0, 0);
        assert!(!leaf.add_child(ChildPointer { seq: 2, start: 0 }, FANOUT));
    }

    #[test]
    fn test_branch_fanout_limit() {
        let mut node = Node::new(NodeKind::Branch, 0, NO_NODE, 0);
        for i in 0..2 {
            assert!(node.add_child(
                ChildPointer {
                    seq: i,
                    start: i as i64,
                },
                2
            ));
        }
        assert!(!node.add_child(ChildPointer { seq: 9, start: 9 }, 2));
        assert_eq!(node.child_count(), 2);
    }

    #[test]
    fn test_deserialize_rejects_bad_kind() {
        let node = Node::new(NodeKind::Leaf, 0, NO_NODE, 0);
        let mut block = node.serialize(BLOCK).expect("serialize failed");
        block[0] = 7;
        match Node::deserialize(&block) {
            Err(Error::Corrupted(_)) => {}
            other => panic!("Expected Corrupted, got {:?}", other),
        }
    }

    #[test]
    fn test_deserialize_rejects_leaf_with_children() {
        let mut node = Node::new(NodeKind::Branch, 0, NO_NODE, 0);
        assert!(node.add_child(ChildPointer { seq: 1, start: 0 }, FANOUT));
        let mut block = node.serialize(BLOCK).expect("serialize failed");
        block[0] = KIND_LEAF;
        assert!(Node::deserialize(&block).is_err());
    }
}
