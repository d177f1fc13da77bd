use crate::error::{Error, Result};
use crate::interval::INTERVAL_BASE_SIZE;
use crate::tree::node::{CHILD_POINTER_SIZE, NODE_HEADER_SIZE};

/// Configuration for building a history tree.
///
/// `block_size` and `max_children` are persisted in the file header, so a
/// reader self-configures without needing this struct.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Caller-supplied schema version, checked on reopen (default: 0)
    pub provider_version: u32,

    /// Start of the trace; no interval may begin before it (default: 0)
    pub start_time: i64,

    /// Fixed byte size of every node block (default: 4096)
    pub block_size: u32,

    /// Maximum fan-out of branch nodes (default: 50)
    pub max_children: u16,

    /// Node cache capacity, in nodes (default: 256)
    pub cache_capacity: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            provider_version: 0,
            start_time: 0,
            block_size: 4096,
            max_children: 50,
            cache_capacity: 256,
        }
    }
}

impl TreeConfig {
    pub fn new(provider_version: u32, start_time: i64) -> Self {
        Self {
            provider_version,
            start_time,
            ..Default::default()
        }
    }

    /// Set the node block size in bytes
    pub fn block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }

    /// Set the maximum branch fan-out
    pub fn max_children(mut self, max: u16) -> Self {
        self.max_children = max;
        self
    }

    /// Set the node cache capacity
    pub fn cache_capacity(mut self, nodes: usize) -> Self {
        self.cache_capacity = nodes;
        self
    }

    /// Checks that a block can hold its header, a full child table and at
    /// least one minimal interval.
    pub fn validate(&self) -> Result<()> {
        if self.max_children < 2 {
            return Err(Error::InvalidOperation(format!(
                "max_children must be at least 2, got {}",
                self.max_children
            )));
        }
        // A Null payload makes the base record the smallest interval.
        let min_block = NODE_HEADER_SIZE
            + self.max_children as usize * CHILD_POINTER_SIZE
            + INTERVAL_BASE_SIZE;
        if (self.block_size as usize) < min_block {
            return Err(Error::InvalidOperation(format!(
                "block_size {} too small for max_children {} (minimum {})",
                self.block_size, self.max_children, min_block
            )));
        }
        if self.cache_capacity == 0 {
            return Err(Error::InvalidOperation(
                "cache_capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
