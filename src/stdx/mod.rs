//! Lock-free building blocks for the dispatch core.
//!
//! These are general-purpose structures with no knowledge of the wire
//! protocol or the transport. Each module documents its own safety and
//! memory-ordering contract.

pub mod mpsc_queue;
pub mod object_pool;

pub use mpsc_queue::{channel, MpscConsumer, MpscProducer};
pub use object_pool::{AcquireError, ObjectPool, PoolConfig, PoolThreadGuard, Pooled};
