pub mod file;
pub mod node;
pub mod query;

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};

use crate::cache::Cache;
use crate::config::TreeConfig;
use crate::error::{Error, Result};
use crate::interval::Interval;
use file::TreeFile;
use node::{ChildPointer, Node, NodeKind, NO_NODE, NODE_HEADER_SIZE};
use query::{NodeSource, RangeIterator};

const DEFAULT_CACHE_CAPACITY: usize = 256;

/// A history tree, either under construction or sealed on disk.
///
/// The tree starts writable, accepts intervals in non-decreasing start-time
/// order, and becomes read-only once closed. Queries work in both states;
/// against a writable tree they also consult the in-memory current branch.
pub enum Tree {
    Writable(WritableTree),
    Readable(ReadableTree),
}

impl Tree {
    /// Starts building a new tree file, truncating any previous one.
    pub fn create(path: &Path, config: TreeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Tree::Writable(WritableTree::create(path, config)?))
    }

    /// Opens an existing, closed tree read-only. The stored provider version
    /// must match the caller's expectation.
    pub fn open(path: &Path, expected_provider_version: u32) -> Result<Self> {
        Ok(Tree::Readable(ReadableTree::open(
            path,
            expected_provider_version,
        )?))
    }

    /// Inserts an interval; the start time must be non-decreasing across
    /// calls.
    pub fn insert(&mut self, interval: &Interval) -> Result<()> {
        match self {
            Tree::Writable(writable) => writable.insert(interval),
            Tree::Readable(_) => Err(Error::InvalidOperation(
                "cannot insert into a closed tree".to_string(),
            )),
        }
    }

    /// Seals the remaining branch, writes the final header durably, and
    /// turns this handle read-only. Closing a closed tree is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self {
            Tree::Readable(_) => Ok(()),
            Tree::Writable(writable) => {
                let readable = writable.close()?;
                *self = Tree::Readable(readable);
                Ok(())
            }
        }
    }

    /// Abandons an in-flight build and deletes the partial file.
    pub fn abort(self) -> Result<()> {
        match self {
            Tree::Writable(writable) => writable.abort(),
            Tree::Readable(_) => Err(Error::InvalidOperation(
                "cannot abort a closed tree".to_string(),
            )),
        }
    }

    /// Snapshot query: the latest interval per attribute key valid at `t`.
    pub fn query_at(&self, t: i64) -> Result<Vec<Interval>> {
        match self {
            Tree::Writable(writable) => writable.query_at(t),
            Tree::Readable(readable) => readable.query_at(t),
        }
    }

    /// The interval covering `t` for one attribute key.
    pub fn query_attribute_at(&self, attribute: i32, t: i64) -> Result<Interval> {
        match self {
            Tree::Writable(writable) => writable.query_attribute_at(attribute, t),
            Tree::Readable(readable) => readable.query_attribute_at(attribute, t),
        }
    }

    /// Lazy iterator over one attribute's intervals overlapping `[t0, t1]`,
    /// ordered by start time.
    pub fn query_range(&self, attribute: i32, t0: i64, t1: i64) -> Result<RangeIterator<'_>> {
        match self {
            Tree::Writable(writable) => writable.query_range(attribute, t0, t1),
            Tree::Readable(readable) => readable.query_range(attribute, t0, t1),
        }
    }

    pub fn start_time(&self) -> i64 {
        match self {
            Tree::Writable(writable) => writable.start_time,
            Tree::Readable(readable) => readable.file.header().start_time,
        }
    }

    pub fn end_time(&self) -> i64 {
        match self {
            Tree::Writable(writable) => writable.end_time,
            Tree::Readable(readable) => readable.file.header().end_time,
        }
    }

    /// Number of nodes created so far (writable) or persisted (readable).
    pub fn node_count(&self) -> u32 {
        match self {
            Tree::Writable(writable) => writable.next_seq,
            Tree::Readable(readable) => readable.file.header().node_count,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Tree::Readable(_))
    }

    /// Releases the file handle and node cache.
    pub fn dispose(self) {}
}

/// Write path: owns the tree file during construction along with the
/// current branch, the in-memory root-to-leaf path of unsealed nodes.
///
/// Mutations require `&mut self`, so queries (which take `&self`) can never
/// observe a half-sealed node.
pub struct WritableTree {
    file: TreeFile,
    cache: Mutex<Cache<u32, Arc<Node>>>,
    /// Root-to-leaf path of not-yet-sealed nodes; one per depth level.
    branch: Vec<Node>,
    /// Next sequence number; doubles as the count of nodes created.
    next_seq: u32,
    block_size: u32,
    max_children: u16,
    cache_capacity: usize,
    provider_version: u32,
    start_time: i64,
    /// Latest interval end seen so far; the tree's end time at close.
    end_time: i64,
    /// Start of the most recent insertion, for the monotonicity contract.
    last_start: i64,
}

impl WritableTree {
    fn create(path: &Path, config: TreeConfig) -> Result<Self> {
        let file = TreeFile::create(path, &config)?;
        let root = Node::new(NodeKind::Leaf, 0, NO_NODE, config.start_time);
        Ok(Self {
            file,
            cache: Mutex::new(Cache::new(config.cache_capacity)),
            branch: vec![root],
            next_seq: 1,
            block_size: config.block_size,
            max_children: config.max_children,
            cache_capacity: config.cache_capacity,
            provider_version: config.provider_version,
            start_time: config.start_time,
            end_time: config.start_time,
            last_start: config.start_time,
        })
    }

    pub fn insert(&mut self, interval: &Interval) -> Result<()> {
        if interval.start() < self.last_start {
            return Err(Error::OutOfOrderInsertion {
                last: self.last_start,
                got: interval.start(),
            });
        }
        let size = interval.serialized_size();
        let capacity = self.block_size as usize - NODE_HEADER_SIZE;
        if size > capacity {
            return Err(Error::IntervalTooLarge { size, capacity });
        }

        let added = match self.branch.last_mut() {
            Some(leaf) => leaf.try_add(interval, self.block_size, self.max_children),
            None => {
                return Err(Error::InvalidOperation(
                    "tree already closed".to_string(),
                ))
            }
        };
        if !added {
            self.split(interval.start())?;
            let leaf = self
                .branch
                .last_mut()
                .ok_or_else(|| Error::Corrupted("empty current branch".to_string()))?;
            if !leaf.try_add(interval, self.block_size, self.max_children) {
                return Err(Error::IntervalTooLarge { size, capacity });
            }
        }

        // Branch nodes are still growing: keep their spans covering the
        // active leaf so queries against the open tree see fresh data.
        for node in &mut self.branch {
            node.widen(interval.start(), interval.end());
        }
        self.last_start = interval.start();
        self.end_time = self.end_time.max(interval.end());
        Ok(())
    }

    /// The active leaf is full. Seal the deepest run of full nodes and open
    /// fresh siblings starting at `start`, growing the tree upward when the
    /// root itself is out of capacity.
    fn split(&mut self, start: i64) -> Result<()> {
        let depth = self.branch.len();
        let mut level = depth - 1;
        while level > 0 && self.branch[level - 1].is_full_branch(self.max_children) {
            level -= 1;
        }
        if level == 0 {
            self.add_new_root(start)
        } else {
            self.add_sibling(level, start)
        }
    }

    /// Seals `branch[level..]` and recreates those levels with new nodes;
    /// the parent at `level - 1` is known to have child capacity.
    fn add_sibling(&mut self, level: usize, start: i64) -> Result<()> {
        let old_depth = self.branch.len();
        let sealed = self.branch.split_off(level);
        self.seal_run(sealed, Some(level - 1))?;
        for lvl in level..old_depth {
            let kind = if lvl == old_depth - 1 {
                NodeKind::Leaf
            } else {
                NodeKind::Branch
            };
            self.push_child_node(kind, start)?;
        }
        Ok(())
    }

    /// Every level is full: put a new branch root above the old one, seal
    /// the entire old branch, and rebuild one fresh node per level below.
    fn add_new_root(&mut self, start: i64) -> Result<()> {
        let mut old_branch = std::mem::take(&mut self.branch);
        let root_seq = self.next_seq;
        self.next_seq += 1;
        let mut new_root = Node::new(NodeKind::Branch, root_seq, NO_NODE, self.start_time);

        let old_root_seq = old_branch[0].seq();
        let old_root_start = old_branch[0].min_time();
        old_branch[0].set_parent_seq(root_seq);
        if !new_root.add_child(
            ChildPointer {
                seq: old_root_seq,
                start: old_root_start,
            },
            self.max_children,
        ) {
            return Err(Error::Corrupted(
                "fresh root rejected its first child".to_string(),
            ));
        }

        let old_depth = old_branch.len();
        self.branch.push(new_root);
        self.seal_run(old_branch, Some(0))?;
        for lvl in 1..=old_depth {
            let kind = if lvl == old_depth {
                NodeKind::Leaf
            } else {
                NodeKind::Branch
            };
            self.push_child_node(kind, start)?;
        }
        trace!(depth = self.branch.len(), "tree depth increased");
        Ok(())
    }

    /// Creates a node under the current last branch node and links it there.
    fn push_child_node(&mut self, kind: NodeKind, start: i64) -> Result<()> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let parent = self
            .branch
            .last_mut()
            .ok_or_else(|| Error::Corrupted("empty current branch".to_string()))?;
        let node = Node::new(kind, seq, parent.seq(), start);
        if !parent.add_child(ChildPointer { seq, start }, self.max_children) {
            return Err(Error::Corrupted(
                "branch fan-out overflow during split".to_string(),
            ));
        }
        self.branch.push(node);
        Ok(())
    }

    /// Seals a root-to-leaf run of nodes: folds each node's span into its
    /// parent (child spans seal before parents), then writes bottom-up.
    /// `parent_index` is the branch index of the run's parent, if any.
    fn seal_run(&mut self, mut nodes: Vec<Node>, parent_index: Option<usize>) -> Result<()> {
        for j in (0..nodes.len()).rev() {
            let (min, max) = (nodes[j].min_time(), nodes[j].max_time());
            if j > 0 {
                nodes[j - 1].widen(min, max);
            } else if let Some(p) = parent_index {
                self.branch[p].widen(min, max);
            }
        }
        for node in nodes.into_iter().rev() {
            self.seal_node(node)?;
        }
        Ok(())
    }

    /// Durable first, then published: the block hits the file before the
    /// node becomes visible through the cache.
    fn seal_node(&mut self, node: Node) -> Result<()> {
        self.file.write_node(&node)?;
        trace!(seq = node.seq(), "sealed node");
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.insert(node.seq(), Arc::new(node));
        Ok(())
    }

    fn close(&mut self) -> Result<ReadableTree> {
        let branch = std::mem::take(&mut self.branch);
        let root_seq = match branch.first() {
            Some(root) => root.seq(),
            None => {
                return Err(Error::InvalidOperation(
                    "tree already closed".to_string(),
                ))
            }
        };
        self.seal_run(branch, None)?;
        self.file.finish(root_seq, self.next_seq, self.end_time)?;
        debug!(nodes = self.next_seq, end = self.end_time, "closed tree");
        ReadableTree::open_with_cache(self.file.path(), self.provider_version, self.cache_capacity)
    }

    fn abort(self) -> Result<()> {
        let path = self.file.path().to_path_buf();
        drop(self);
        std::fs::remove_file(&path)?;
        debug!(path = %path.display(), "aborted build, partial file removed");
        Ok(())
    }

    fn check_time(&self, t: i64) -> Result<()> {
        if t < self.start_time || t > self.end_time {
            return Err(Error::TimeOutOfRange {
                time: t,
                start: self.start_time,
                end: self.end_time,
            });
        }
        Ok(())
    }

    fn root_seq(&self) -> Option<u32> {
        self.branch.first().map(Node::seq)
    }

    pub fn query_at(&self, t: i64) -> Result<Vec<Interval>> {
        self.check_time(t)?;
        match self.root_seq() {
            Some(root) => query::query_at(self, root, t),
            None => Ok(Vec::new()),
        }
    }

    pub fn query_attribute_at(&self, attribute: i32, t: i64) -> Result<Interval> {
        self.check_time(t)?;
        let root = self.root_seq().ok_or(Error::NotFound)?;
        query::query_attribute_at(self, root, attribute, t)?.ok_or(Error::NotFound)
    }

    pub fn query_range(&self, attribute: i32, t0: i64, t1: i64) -> Result<RangeIterator<'_>> {
        check_range(t0, t1, self.start_time, self.end_time)?;
        Ok(RangeIterator::new(self, self.root_seq(), attribute, t0, t1))
    }
}

impl NodeSource for WritableTree {
    fn node(&self, seq: u32) -> Result<Arc<Node>> {
        // Unsealed nodes only exist in the current branch.
        if let Some(node) = self.branch.iter().find(|n| n.seq() == seq) {
            return Ok(Arc::new(node.clone()));
        }
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = cache.get(&seq) {
            return Ok(node);
        }
        let node = Arc::new(self.file.read_node(seq)?);
        cache.insert(seq, Arc::clone(&node));
        Ok(node)
    }
}

/// Read path: a closed tree on disk plus a bounded node cache. Safe to
/// share across threads; sealed nodes are immutable `Arc`s.
pub struct ReadableTree {
    file: TreeFile,
    cache: Mutex<Cache<u32, Arc<Node>>>,
}

impl ReadableTree {
    pub fn open(path: &Path, expected_provider_version: u32) -> Result<Self> {
        Self::open_with_cache(path, expected_provider_version, DEFAULT_CACHE_CAPACITY)
    }

    pub fn open_with_cache(
        path: &Path,
        expected_provider_version: u32,
        cache_capacity: usize,
    ) -> Result<Self> {
        let file = TreeFile::open(path)?;
        let found = file.header().provider_version;
        if found != expected_provider_version {
            return Err(Error::IncompatibleVersion {
                expected: expected_provider_version,
                found,
            });
        }
        Ok(Self {
            file,
            cache: Mutex::new(Cache::new(cache_capacity)),
        })
    }

    pub fn start_time(&self) -> i64 {
        self.file.header().start_time
    }

    pub fn end_time(&self) -> i64 {
        self.file.header().end_time
    }

    pub fn node_count(&self) -> u32 {
        self.file.header().node_count
    }

    pub fn provider_version(&self) -> u32 {
        self.file.header().provider_version
    }

    /// (hits, misses) of the node cache.
    pub fn cache_stats(&self) -> (usize, usize) {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .stats()
    }

    fn check_time(&self, t: i64) -> Result<()> {
        if t < self.start_time() || t > self.end_time() {
            return Err(Error::TimeOutOfRange {
                time: t,
                start: self.start_time(),
                end: self.end_time(),
            });
        }
        Ok(())
    }

    fn root_seq(&self) -> Option<u32> {
        let root = self.file.header().root_seq;
        (root != NO_NODE).then_some(root)
    }

    pub fn query_at(&self, t: i64) -> Result<Vec<Interval>> {
        self.check_time(t)?;
        match self.root_seq() {
            Some(root) => query::query_at(self, root, t),
            None => Ok(Vec::new()),
        }
    }

    pub fn query_attribute_at(&self, attribute: i32, t: i64) -> Result<Interval> {
        self.check_time(t)?;
        let root = self.root_seq().ok_or(Error::NotFound)?;
        query::query_attribute_at(self, root, attribute, t)?.ok_or(Error::NotFound)
    }

    pub fn query_range(&self, attribute: i32, t0: i64, t1: i64) -> Result<RangeIterator<'_>> {
        check_range(t0, t1, self.start_time(), self.end_time())?;
        Ok(RangeIterator::new(self, self.root_seq(), attribute, t0, t1))
    }
}

impl NodeSource for ReadableTree {
    fn node(&self, seq: u32) -> Result<Arc<Node>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(node) = cache.get(&seq) {
            return Ok(node);
        }
        let node = Arc::new(self.file.read_node(seq)?);
        cache.insert(seq, Arc::clone(&node));
        Ok(node)
    }
}

fn check_range(t0: i64, t1: i64, start: i64, end: i64) -> Result<()> {
    if t0 > t1 {
        return Err(Error::InvalidOperation(format!(
            "invalid query range [{}, {}]",
            t0, t1
        )));
    }
    if t1 < start || t0 > end {
        return Err(Error::TimeOutOfRange {
            time: t0,
            start,
            end,
        });
    }
    Ok(())
}
