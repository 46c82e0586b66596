//! # Cluster Client API
//!
//! Purpose: Bind the shared slot cache, the per-node connection pools and
//! the slot hasher into one handle that hands out pipelines.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `ClusterClient` hides pooling and topology details.
//! 2. **Explicit Injection**: Pipelines receive their router and pools at
//!    construction instead of reaching into another component's state.
//! 3. **Fail Fast**: Routing and protocol problems surface as typed errors.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::ClusterPipeline;
use crate::pool::{NodePools, PoolConfig};
use crate::slot::{Crc16Hasher, Node, SlotCache, SlotHasher, SlotMap, SlotRouter, SlotTable};

/// Result type for the cluster client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Kind of cluster redirection returned by a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectKind {
    /// Slot permanently owned by another node.
    Moved,
    /// Slot is migrating; only this request should go elsewhere.
    Ask,
}

/// Redirection reply decoded from `MOVED`/`ASK`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub kind: RedirectKind,
    pub slot: u16,
    pub node: Node,
}

/// Errors surfaced by the cluster client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while reading/writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned a non-redirect error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Server redirected the command to another node.
    #[error("{:?} redirect: slot {} is served by {}", .0.kind, .0.slot, .0.node)]
    Redirect(Redirect),
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Address could not be parsed or resolved.
    #[error("invalid address")]
    InvalidAddress,
    /// No node owns the slot in the current slot map.
    #[error("no node owns slot {0}")]
    NoNodeForSlot(u16),
    /// Slot map could not be built or loaded.
    #[error("topology error: {0}")]
    Topology(String),
}

impl ClientError {
    /// Returns the redirection carried by this error, if any.
    pub fn redirect(&self) -> Option<&Redirect> {
        match self {
            ClientError::Redirect(redirect) => Some(redirect),
            _ => None,
        }
    }

    /// Returns true for a `MOVED` redirection.
    pub fn is_moved(&self) -> bool {
        matches!(self.redirect(), Some(r) if r.kind == RedirectKind::Moved)
    }

    /// Returns true for an `ASK` redirection.
    pub fn is_ask(&self) -> bool {
        matches!(self.redirect(), Some(r) if r.kind == RedirectKind::Ask)
    }
}

/// Configuration for the cluster client and its per-node pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Seed nodes used to load the slot map, e.g. "127.0.0.1:7000".
    pub seeds: Vec<String>,
    /// Maximum idle connections kept per node.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use) per node.
    ///
    /// The slot map refresh after a `MOVED` reply runs while the batch still
    /// holds its connections, so keep at least one spare per node or that
    /// refresh fails with `PoolExhausted` and is only logged.
    pub max_total: usize,
    /// Optional TCP read timeout, in milliseconds when serialized.
    #[serde(with = "duration_ms")]
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout, in milliseconds when serialized.
    #[serde(with = "duration_ms")]
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout, in milliseconds when serialized.
    #[serde(with = "duration_ms")]
    pub connect_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            seeds: vec!["127.0.0.1:7000".to_string()],
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
        }
    }
}

impl ClientConfig {
    fn seed_nodes(&self) -> ClientResult<Vec<Node>> {
        self.seeds.iter().map(|seed| seed.parse()).collect()
    }
}

impl From<&ClientConfig> for PoolConfig {
    fn from(config: &ClientConfig) -> Self {
        PoolConfig {
            max_idle: config.max_idle,
            max_total: config.max_total,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            connect_timeout: config.connect_timeout,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Pipeline bound to a `ClusterClient`.
pub type Pipeline = ClusterPipeline<NodePools, SlotCache>;

/// Cluster handle shared by all pipelines created from it.
///
/// Cloning is cheap; clones share the slot cache and the pools.
#[derive(Clone)]
pub struct ClusterClient {
    slots: Arc<SlotCache>,
    pools: Arc<NodePools>,
    hasher: Arc<dyn SlotHasher>,
}

impl ClusterClient {
    /// Creates a client and loads the slot map from the seed nodes.
    ///
    /// # Errors
    /// Returns `ClientError::Topology` when no seed answers `CLUSTER SLOTS`.
    pub fn connect(config: ClientConfig) -> ClientResult<Self> {
        let client = Self::with_slot_map(config, SlotMap::new())?;
        client.refresh_topology()?;
        Ok(client)
    }

    /// Creates a client starting from a known slot map.
    ///
    /// No network traffic happens until the first pipeline acquires a
    /// connection; later refreshes still consult the configured seeds.
    pub fn with_slot_map(config: ClientConfig, map: SlotMap) -> ClientResult<Self> {
        let seeds = config.seed_nodes()?;
        let pools = Arc::new(NodePools::new(PoolConfig::from(&config)));
        let slots = Arc::new(SlotCache::with_map(seeds, pools.clone(), map));
        Ok(ClusterClient {
            slots,
            pools,
            hasher: Arc::new(Crc16Hasher),
        })
    }

    /// Replaces the key-to-slot hasher used by pipelines created afterwards.
    pub fn with_hasher(mut self, hasher: impl SlotHasher + 'static) -> Self {
        self.hasher = Arc::new(hasher);
        self
    }

    /// Starts a new pipeline bound to this cluster.
    pub fn pipelined(&self) -> Pipeline {
        let router = SlotRouter::new(self.slots.clone(), self.hasher.clone());
        ClusterPipeline::new(router, self.pools.clone())
    }

    /// Rebuilds the slot map from the live cluster.
    ///
    /// Call this after a known reconfiguration; pipelines also trigger it on
    /// `MOVED` replies.
    pub fn refresh_topology(&self) -> ClientResult<()> {
        self.slots.refresh()
    }

    /// Returns a copy of the current slot map.
    pub fn slot_map(&self) -> SlotMap {
        self.slots.snapshot()
    }

    /// Per-node pools shared by this client's pipelines.
    pub fn pools(&self) -> &Arc<NodePools> {
        &self.pools
    }
}
