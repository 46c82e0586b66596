//! # slotpipe Cluster Pipelining Client
//!
//! Purpose: Batch commands for a slot-sharded, Redis-compatible cluster,
//! routing each to the node owning its key's slot and reading all replies
//! back in the order the commands were issued.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections per node across batches.
//! 2. **One Round Trip Per Node**: Commands for a node share one connection
//!    and one flush within a batch.
//! 3. **Pool Hygiene**: No connection returns to its pool with unread replies.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.
//!
//! ## Example
//!
//! ```rust,no_run
//! use slotpipe_client::{ClientConfig, ClusterClient};
//!
//! let client = ClusterClient::connect(ClientConfig::default())?;
//! let mut pipeline = client.pipelined();
//! pipeline.set(b"k1", b"v1")?;
//! pipeline.get(b"k1")?;
//! let replies = pipeline.sync_and_return_all();
//! pipeline.close();
//! assert_eq!(replies?.len(), 2);
//! # Ok::<(), slotpipe_client::ClientError>(())
//! ```

mod client;
mod pipeline;
mod pool;
mod resp;
mod slot;

pub use client::{
    ClientConfig, ClientError, ClientResult, ClusterClient, Pipeline, Redirect, RedirectKind,
};
pub use pipeline::{ClusterPipeline, PendingReply};
pub use pool::{
    ConnectionPool, ConnectionProvider, NodePools, PipelineConnection, PoolConfig,
    PooledConnection,
};
pub use resp::RespValue;
pub use slot::{
    crc16, key_slot, Crc16Hasher, Node, SlotCache, SlotHasher, SlotMap, SlotRouter, SlotTable,
    SLOT_COUNT,
};
