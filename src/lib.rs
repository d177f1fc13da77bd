//! Time-indexed interval storage engine: an on-disk history tree that is
//! append-only while building and immutable, many-reader once closed.

pub mod cache;
pub mod config;
pub mod error;
pub mod interval;
pub mod tree;

pub use config::TreeConfig;
pub use error::{Error, Result};
pub use interval::{Interval, StateValue};
pub use tree::query::RangeIterator;
pub use tree::{ReadableTree, Tree, WritableTree};
