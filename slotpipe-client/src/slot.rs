//! # Slot Routing
//!
//! Map keys to one of the 16384 cluster hash slots and slots to the node that
//! currently owns them.
//!
//! ## Usage
//!
//! - `key_slot` computes the Redis Cluster slot (CRC16/XMODEM, honoring
//!   `{hash tags}`); `Crc16Hasher` exposes it through `SlotHasher`.
//! - `SlotMap` is a sorted list of owned slot ranges with binary-search lookup.
//! - `SlotCache` holds the shared, read-mostly `SlotMap` and rebuilds it from
//!   `CLUSTER SLOTS` on demand.
//! - `SlotRouter` combines a hasher and a `SlotTable` into `key -> node`.
//!
//! ## Design Principles
//!
//! 1. **Read-Mostly**: Lookups take a shared lock; refresh swaps the map whole.
//! 2. **On-Demand Refresh**: Topology is only rebuilt when asked, never per command.
//! 3. **Strategy Pattern**: Hashing and slot ownership sit behind traits so the
//!    pipeline can be driven by synthetic routing tables.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ClientResult};
use crate::pool::NodePools;
use crate::resp::RespValue;

/// Number of hash slots the keyspace is partitioned into.
pub const SLOT_COUNT: u16 = 16384;

/// One server endpoint of the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node {
    host: String,
    port: u16,
}

impl Node {
    /// Creates a node from host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Node {
            host: host.into(),
            port,
        }
    }

    /// Host name or IP address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Node {
    type Err = ClientError;

    /// Parses `host:port`; the last colon separates the port.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s.rsplit_once(':').ok_or(ClientError::InvalidAddress)?;
        if host.is_empty() {
            return Err(ClientError::InvalidAddress);
        }
        let port = port.parse().map_err(|_| ClientError::InvalidAddress)?;
        Ok(Node::new(host, port))
    }
}

/// CRC16/XMODEM as used by Redis Cluster (poly 0x1021, init 0).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Computes the cluster slot for a key.
///
/// When the key contains a non-empty `{...}` section, only the bytes between
/// the first `{` and the following `}` are hashed, so related keys can be
/// forced onto the same slot.
pub fn key_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

fn hash_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|&b| b == b'{') else {
        return key;
    };
    match key[open + 1..].iter().position(|&b| b == b'}') {
        Some(len) if len > 0 => &key[open + 1..open + 1 + len],
        _ => key,
    }
}

/// Partition function from key to slot.
pub trait SlotHasher: Send + Sync {
    /// Returns the slot for `key`, in `0..SLOT_COUNT`.
    fn slot(&self, key: &[u8]) -> u16;
}

/// Default Redis Cluster hasher.
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc16Hasher;

impl SlotHasher for Crc16Hasher {
    #[inline]
    fn slot(&self, key: &[u8]) -> u16 {
        key_slot(key)
    }
}

impl<F> SlotHasher for F
where
    F: Fn(&[u8]) -> u16 + Send + Sync,
{
    #[inline]
    fn slot(&self, key: &[u8]) -> u16 {
        self(key) % SLOT_COUNT
    }
}

/// Ownership lookup consumed by the router.
pub trait SlotTable: Send + Sync {
    /// Returns the node currently owning `slot`.
    fn node_for_slot(&self, slot: u16) -> Option<Node>;

    /// Rebuilds the table from the live cluster topology.
    fn refresh(&self) -> ClientResult<()>;
}

#[derive(Debug, Clone)]
struct SlotRange {
    start: u16,
    end: u16,
    node: Node,
}

/// Slot map: sorted, non-overlapping slot ranges.
#[derive(Debug, Clone, Default)]
pub struct SlotMap {
    ranges: Vec<SlotRange>,
}

impl SlotMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        SlotMap::default()
    }

    /// Assigns the inclusive range `start..=end` to `node`.
    ///
    /// # Errors
    /// Returns `ClientError::Topology` when the range is inverted, exceeds
    /// `SLOT_COUNT`, or overlaps an existing range.
    pub fn assign(&mut self, start: u16, end: u16, node: Node) -> ClientResult<()> {
        if start > end || end >= SLOT_COUNT {
            return Err(ClientError::Topology(format!(
                "invalid slot range {start}-{end}"
            )));
        }
        if self
            .ranges
            .iter()
            .any(|r| start <= r.end && r.start <= end)
        {
            return Err(ClientError::Topology(format!(
                "slot range {start}-{end} overlaps an assigned range"
            )));
        }
        self.ranges.push(SlotRange { start, end, node });
        self.ranges.sort_by_key(|r| r.start);
        Ok(())
    }

    /// Builder-style `assign`.
    pub fn with_range(mut self, start: u16, end: u16, node: Node) -> ClientResult<Self> {
        self.assign(start, end, node)?;
        Ok(self)
    }

    /// Looks up the owner of a slot.
    pub fn node_for_slot(&self, slot: u16) -> Option<&Node> {
        self.ranges
            .binary_search_by(|r| {
                if slot < r.start {
                    Ordering::Greater
                } else if slot > r.end {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            })
            .ok()
            .map(|i| &self.ranges[i].node)
    }

    /// Distinct nodes owning at least one slot, in slot order.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = Vec::new();
        for range in &self.ranges {
            if !nodes.contains(&range.node) {
                nodes.push(range.node.clone());
            }
        }
        nodes
    }

    /// Number of slots with an owner.
    pub fn covered_slots(&self) -> usize {
        self.ranges
            .iter()
            .map(|r| (r.end - r.start) as usize + 1)
            .sum()
    }

    /// Returns true when no slot is assigned.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Parses a `CLUSTER SLOTS` reply.
    ///
    /// Each entry is `[start, end, [host, port, ...], replicas...]`; only the
    /// master is kept since the pipeline always writes to the owner.
    pub fn from_cluster_slots(reply: &RespValue) -> ClientResult<Self> {
        let RespValue::Array(entries) = reply else {
            return Err(ClientError::UnexpectedResponse);
        };

        let mut map = SlotMap::new();
        for entry in entries {
            let RespValue::Array(items) = entry else {
                return Err(ClientError::UnexpectedResponse);
            };
            if items.len() < 3 {
                return Err(ClientError::UnexpectedResponse);
            }
            let start = slot_bound(&items[0])?;
            let end = slot_bound(&items[1])?;
            let node = parse_node_entry(&items[2])?;
            map.assign(start, end, node)?;
        }
        Ok(map)
    }
}

fn slot_bound(value: &RespValue) -> ClientResult<u16> {
    value
        .as_int()
        .and_then(|v| u16::try_from(v).ok())
        .ok_or(ClientError::UnexpectedResponse)
}

fn parse_node_entry(value: &RespValue) -> ClientResult<Node> {
    let RespValue::Array(items) = value else {
        return Err(ClientError::UnexpectedResponse);
    };
    if items.len() < 2 {
        return Err(ClientError::UnexpectedResponse);
    }
    let host = items[0]
        .as_bytes()
        .and_then(|raw| std::str::from_utf8(raw).ok())
        .ok_or(ClientError::UnexpectedResponse)?;
    let port = items[1]
        .as_int()
        .and_then(|v| u16::try_from(v).ok())
        .ok_or(ClientError::UnexpectedResponse)?;
    Ok(Node::new(host, port))
}

/// Shared slot map loaded from the cluster.
pub struct SlotCache {
    map: RwLock<SlotMap>,
    seeds: Vec<Node>,
    pools: Arc<NodePools>,
}

impl SlotCache {
    /// Creates a cache with an empty map; call `refresh` to load it.
    pub fn new(seeds: Vec<Node>, pools: Arc<NodePools>) -> Self {
        Self::with_map(seeds, pools, SlotMap::new())
    }

    /// Creates a cache starting from a known map.
    pub fn with_map(seeds: Vec<Node>, pools: Arc<NodePools>, map: SlotMap) -> Self {
        SlotCache {
            map: RwLock::new(map),
            seeds,
            pools,
        }
    }

    /// Returns a copy of the current map.
    pub fn snapshot(&self) -> SlotMap {
        self.map.read().clone()
    }

    // Seeds first, then every node of the current map not already listed.
    fn candidates(&self) -> Vec<Node> {
        let mut nodes = self.seeds.clone();
        for node in self.map.read().nodes() {
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }
        nodes
    }

    fn fetch_from(&self, node: &Node) -> ClientResult<SlotMap> {
        let mut conn = self.pools.acquire(node)?;
        let reply = conn.exec(&[b"CLUSTER", b"SLOTS"])?.into_result()?;
        SlotMap::from_cluster_slots(&reply)
    }
}

impl SlotTable for SlotCache {
    fn node_for_slot(&self, slot: u16) -> Option<Node> {
        self.map.read().node_for_slot(slot).cloned()
    }

    fn refresh(&self) -> ClientResult<()> {
        for node in self.candidates() {
            match self.fetch_from(&node) {
                Ok(map) if !map.is_empty() => {
                    info!(
                        source = %node,
                        nodes = map.nodes().len(),
                        covered = map.covered_slots(),
                        "slot map refreshed"
                    );
                    *self.map.write() = map;
                    return Ok(());
                }
                Ok(_) => debug!(source = %node, "CLUSTER SLOTS returned no ranges"),
                Err(err) => warn!(source = %node, error = %err, "CLUSTER SLOTS failed"),
            }
        }
        Err(ClientError::Topology(
            "no node returned a usable CLUSTER SLOTS reply".to_string(),
        ))
    }
}

/// Resolves keys to owning nodes.
pub struct SlotRouter<T> {
    table: Arc<T>,
    hasher: Arc<dyn SlotHasher>,
}

impl<T> Clone for SlotRouter<T> {
    fn clone(&self) -> Self {
        SlotRouter {
            table: self.table.clone(),
            hasher: self.hasher.clone(),
        }
    }
}

impl<T: SlotTable> SlotRouter<T> {
    /// Creates a router over `table` using `hasher`.
    pub fn new(table: Arc<T>, hasher: Arc<dyn SlotHasher>) -> Self {
        SlotRouter { table, hasher }
    }

    /// Slot of `key` according to the configured hasher.
    #[inline]
    pub fn slot(&self, key: &[u8]) -> u16 {
        self.hasher.slot(key)
    }

    /// Resolves the slot and owning node for `key`.
    pub fn resolve_node(&self, key: &[u8]) -> ClientResult<(u16, Node)> {
        let slot = self.slot(key);
        let node = self
            .table
            .node_for_slot(slot)
            .ok_or(ClientError::NoNodeForSlot(slot))?;
        Ok((slot, node))
    }

    /// Forces the slot table to rebuild from the live cluster.
    pub fn refresh(&self) -> ClientResult<()> {
        self.table.refresh()
    }

    /// The underlying slot table.
    pub fn table(&self) -> &Arc<T> {
        &self.table
    }
}
