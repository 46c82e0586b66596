//! # Cluster Pipeline
//!
//! Purpose: Batch commands across every node of the cluster, write them
//! without waiting for replies, then drain all replies in issuance order.
//!
//! ## Design Principles
//! 1. **One Connection Per Node**: A batch checks out at most one connection
//!    per node, so all of a node's commands share one round trip.
//! 2. **Global Order**: The command queue records which connection owns each
//!    reply; draining walks it front to back regardless of node.
//! 3. **Clean Return**: Every connection is drained or explicitly discarded
//!    before it is dropped back into its pool, on success and on error.
//! 4. **Per-Batch State**: `BatchState` is taken out of the pipeline for the
//!    drain, so a failed batch always leaves an empty, reusable pipeline.
//!
//! ## Batch Lifecycle
//!
//! ```text
//! Empty --issue--> Issuing --sync--> Draining --> Empty
//!                     |                             ^
//!                     +-----------close-------------+
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::client::ClientResult;
use crate::pool::{ConnectionProvider, PipelineConnection};
use crate::resp::RespValue;
use crate::slot::{Node, SlotRouter, SlotTable};

/// Handle for a command issued into the current batch.
///
/// The handle does not carry the reply. Use `index()` to pick it out of the
/// vector returned by `sync_and_return_all`; after `sync` the value is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingReply {
    index: usize,
    slot: u16,
}

impl PendingReply {
    /// Position of this command in the batch, and of its reply in
    /// `sync_and_return_all`.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Slot the command's key hashed to.
    #[inline]
    pub fn slot(&self) -> u16 {
        self.slot
    }
}

struct CachedConnection<C: PipelineConnection> {
    node: Node,
    conn: C,
    // Replies queued on this connection and not yet read off the wire.
    outstanding: usize,
}

impl<C: PipelineConnection> CachedConnection<C> {
    #[inline]
    fn is_drained(&self) -> bool {
        self.outstanding == 0
    }
}

/// Connections checked out for the current batch, at most one per node.
struct ConnectionCache<C: PipelineConnection> {
    entries: Vec<CachedConnection<C>>,
    by_node: HashMap<Node, usize>,
}

impl<C: PipelineConnection> Default for ConnectionCache<C> {
    fn default() -> Self {
        ConnectionCache {
            entries: Vec::new(),
            by_node: HashMap::new(),
        }
    }
}

impl<C: PipelineConnection> ConnectionCache<C> {
    /// Returns the entry index for `node`, checking a connection out on first use.
    fn acquire<P>(&mut self, provider: &P, node: Node) -> ClientResult<usize>
    where
        P: ConnectionProvider<Conn = C> + ?Sized,
    {
        if let Some(&idx) = self.by_node.get(&node) {
            return Ok(idx);
        }

        let conn = provider.acquire(&node)?;
        debug!(node = %node, "batch acquired connection");
        let idx = self.entries.len();
        self.entries.push(CachedConnection {
            node: node.clone(),
            conn,
            outstanding: 0,
        });
        self.by_node.insert(node, idx);
        Ok(idx)
    }

    /// Discards undrained replies and drops every connection back to its pool.
    fn release_all(&mut self) {
        for mut entry in self.entries.drain(..) {
            if !entry.is_drained() {
                // Errors were already reported by the drain; the pooled
                // connection closes itself if the discard left it dirty.
                if let Err(err) = entry.conn.discard_pending() {
                    debug!(
                        node = %entry.node,
                        outstanding = entry.outstanding,
                        error = %err,
                        "discarding undrained replies failed"
                    );
                }
            }
        }
        self.by_node.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Queue and connections of one batch.
struct BatchState<C: PipelineConnection> {
    // Entry index into `cache` for each issued command, in issuance order.
    queue: Vec<usize>,
    cache: ConnectionCache<C>,
}

impl<C: PipelineConnection> Default for BatchState<C> {
    fn default() -> Self {
        BatchState {
            queue: Vec::new(),
            cache: ConnectionCache::default(),
        }
    }
}

impl<C: PipelineConnection> BatchState<C> {
    fn push(&mut self, entry: usize, args: &[&[u8]]) -> ClientResult<usize> {
        let cached = &mut self.cache.entries[entry];
        cached.conn.send_unflushed(args)?;
        cached.outstanding += 1;
        self.queue.push(entry);
        Ok(self.queue.len() - 1)
    }

    /// Reads every queued reply in order, stopping at the first error.
    fn drain(&mut self, mut collected: Option<&mut Vec<RespValue>>) -> ClientResult<()> {
        for &idx in &self.queue {
            let entry = &mut self.cache.entries[idx];
            let reply = entry.conn.read_reply()?;
            entry.outstanding -= 1;
            let value = reply.into_result()?;
            if let Some(values) = collected.as_mut() {
                values.push(value);
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.queue.clear();
        self.cache.release_all();
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.cache.len() == 0
    }
}

impl<C: PipelineConnection> Drop for BatchState<C> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Pipeline routing each command to the node owning its key's slot.
///
/// Not internally synchronized: a pipeline belongs to one thread of control
/// and runs its batches one after another.
pub struct ClusterPipeline<P, T>
where
    P: ConnectionProvider,
{
    router: SlotRouter<T>,
    provider: Arc<P>,
    batch: BatchState<P::Conn>,
}

impl<P, T> ClusterPipeline<P, T>
where
    P: ConnectionProvider,
    T: SlotTable,
{
    /// Binds a pipeline to a router and a connection provider.
    pub fn new(router: SlotRouter<T>, provider: Arc<P>) -> Self {
        ClusterPipeline {
            router,
            provider,
            batch: BatchState::default(),
        }
    }

    /// Queues a command for the node owning `key`.
    ///
    /// The command is buffered on that node's batch connection and nothing is
    /// read until `sync`. The first command for a node checks a connection
    /// out of its pool.
    pub fn issue(&mut self, key: &[u8], args: &[&[u8]]) -> ClientResult<PendingReply> {
        let (slot, node) = self.router.resolve_node(key)?;
        let entry = self.batch.cache.acquire(self.provider.as_ref(), node)?;
        let index = self.batch.push(entry, args)?;
        Ok(PendingReply { index, slot })
    }

    /// Drains every reply, discarding the values.
    ///
    /// Returns the first error met; the batch is torn down either way.
    pub fn sync(&mut self) -> ClientResult<()> {
        self.drain(None)
    }

    /// Drains every reply and returns the values in issuance order.
    ///
    /// On error no partial result is returned.
    pub fn sync_and_return_all(&mut self) -> ClientResult<Vec<RespValue>> {
        let mut values = Vec::with_capacity(self.batch.queue.len());
        self.drain(Some(&mut values))?;
        Ok(values)
    }

    /// Abandons the current batch, making every connection safe to pool.
    ///
    /// Safe to call any number of times, including after `sync`.
    pub fn close(&mut self) {
        self.batch.release();
    }

    /// Forces a slot map rebuild before the next batch.
    pub fn refresh_topology(&self) -> ClientResult<()> {
        self.router.refresh()
    }

    /// Commands issued in the current batch.
    pub fn pending(&self) -> usize {
        self.batch.queue.len()
    }

    /// Connections checked out by the current batch.
    pub fn connections(&self) -> usize {
        self.batch.cache.len()
    }

    /// Returns true when no batch is in progress.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    fn drain(&mut self, collected: Option<&mut Vec<RespValue>>) -> ClientResult<()> {
        let mut batch = std::mem::take(&mut self.batch);
        let commands = batch.queue.len();
        let result = batch.drain(collected);

        if let Err(err) = &result {
            if err.is_moved() {
                // Slot ownership changed for good: later batches must see it.
                warn!(error = %err, "slot moved, refreshing slot map");
                if let Err(refresh_err) = self.router.refresh() {
                    warn!(error = %refresh_err, "slot map refresh failed");
                }
            }
        }

        debug!(
            commands = commands,
            connections = batch.cache.len(),
            ok = result.is_ok(),
            "pipeline drained"
        );
        batch.release();
        result
    }

    /// `SET key value`.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> ClientResult<PendingReply> {
        self.issue(key, &[b"SET", key, value])
    }

    /// `SET key value EX seconds`.
    pub fn set_with_ttl(
        &mut self,
        key: &[u8],
        value: &[u8],
        ttl: std::time::Duration,
    ) -> ClientResult<PendingReply> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        self.issue(key, &[b"SET", key, value, b"EX", &seconds[..len]])
    }

    /// `GET key`.
    pub fn get(&mut self, key: &[u8]) -> ClientResult<PendingReply> {
        self.issue(key, &[b"GET", key])
    }

    /// `DEL key`.
    pub fn del(&mut self, key: &[u8]) -> ClientResult<PendingReply> {
        self.issue(key, &[b"DEL", key])
    }

    /// `EXISTS key`.
    pub fn exists(&mut self, key: &[u8]) -> ClientResult<PendingReply> {
        self.issue(key, &[b"EXISTS", key])
    }

    /// `EXPIRE key seconds`.
    pub fn expire(&mut self, key: &[u8], ttl: std::time::Duration) -> ClientResult<PendingReply> {
        let (seconds, len) = encode_u64(ttl.as_secs());
        self.issue(key, &[b"EXPIRE", key, &seconds[..len]])
    }

    /// `TTL key`.
    pub fn ttl(&mut self, key: &[u8]) -> ClientResult<PendingReply> {
        self.issue(key, &[b"TTL", key])
    }

    /// `INCR key`.
    pub fn incr(&mut self, key: &[u8]) -> ClientResult<PendingReply> {
        self.issue(key, &[b"INCR", key])
    }

    /// `INCRBY key delta`.
    pub fn incr_by(&mut self, key: &[u8], delta: i64) -> ClientResult<PendingReply> {
        let mut buf = [0u8; 21];
        let (digits, len) = encode_u64(delta.unsigned_abs());
        let mut start = 0;
        if delta < 0 {
            buf[0] = b'-';
            start = 1;
        }
        buf[start..start + len].copy_from_slice(&digits[..len]);
        self.issue(key, &[b"INCRBY", key, &buf[..start + len]])
    }
}

fn encode_u64(mut value: u64) -> ([u8; 20], usize) {
    // Stack buffer keeps conversion allocation-free.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        return (buf, 1);
    }
    while value > 0 {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
    }
    buf[..len].reverse();
    (buf, len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::client::ClientError;
    use crate::slot::SlotMap;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Release {
        node: Node,
        pending: usize,
        discarded: bool,
    }

    #[derive(Default)]
    struct Log {
        acquired: Vec<Node>,
        released: Vec<Release>,
        refreshes: usize,
        sent: Vec<(Node, Vec<Vec<u8>>)>,
    }

    type Store = Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>;

    struct MockConn {
        node: Node,
        store: Store,
        log: Arc<Mutex<Log>>,
        queued: VecDeque<Vec<Vec<u8>>>,
        discarded: bool,
        fail_discard: bool,
    }

    impl MockConn {
        fn execute(&self, args: &[Vec<u8>]) -> ClientResult<RespValue> {
            let key = &args[1];
            let contains = |needle: &[u8]| key.windows(needle.len()).any(|w| w == needle);
            if contains(b"ioerr") {
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "reset",
                )));
            }
            if contains(b"moved") {
                return Ok(RespValue::Error(b"MOVED 100 127.0.0.1:7002".to_vec()));
            }
            if contains(b"ask") {
                return Ok(RespValue::Error(b"ASK 100 127.0.0.1:7002".to_vec()));
            }
            if contains(b"wrongtype") {
                return Ok(RespValue::Error(b"WRONGTYPE wrong kind of value".to_vec()));
            }

            let mut store = self.store.lock();
            match args[0].as_slice() {
                b"SET" => {
                    store.insert(key.clone(), args[2].clone());
                    Ok(RespValue::Simple(b"OK".to_vec()))
                }
                b"GET" => Ok(RespValue::Bulk(store.get(key).cloned())),
                b"INCRBY" => {
                    let delta: i64 = std::str::from_utf8(&args[2]).unwrap().parse().unwrap();
                    let current: i64 = store
                        .get(key)
                        .map(|v| std::str::from_utf8(v).unwrap().parse().unwrap())
                        .unwrap_or(0);
                    store.insert(key.clone(), (current + delta).to_string().into_bytes());
                    Ok(RespValue::Integer(current + delta))
                }
                _ => Ok(RespValue::Error(b"ERR unknown command".to_vec())),
            }
        }
    }

    impl PipelineConnection for MockConn {
        fn send_unflushed(&mut self, args: &[&[u8]]) -> ClientResult<()> {
            let args: Vec<Vec<u8>> = args.iter().map(|a| a.to_vec()).collect();
            self.log.lock().sent.push((self.node.clone(), args.clone()));
            self.queued.push_back(args);
            Ok(())
        }

        fn read_reply(&mut self) -> ClientResult<RespValue> {
            let args = self.queued.pop_front().ok_or(ClientError::Protocol)?;
            self.execute(&args)
        }

        fn discard_pending(&mut self) -> ClientResult<()> {
            self.discarded = true;
            self.queued.clear();
            if self.fail_discard {
                return Err(ClientError::Protocol);
            }
            Ok(())
        }

        fn pending(&self) -> usize {
            self.queued.len()
        }
    }

    impl Drop for MockConn {
        fn drop(&mut self) {
            self.log.lock().released.push(Release {
                node: self.node.clone(),
                pending: self.queued.len(),
                discarded: self.discarded,
            });
        }
    }

    struct MockProvider {
        stores: Mutex<HashMap<Node, Store>>,
        log: Arc<Mutex<Log>>,
        fail_discard: Option<Node>,
    }

    impl ConnectionProvider for MockProvider {
        type Conn = MockConn;

        fn acquire(&self, node: &Node) -> ClientResult<MockConn> {
            self.log.lock().acquired.push(node.clone());
            let store = self.stores.lock().entry(node.clone()).or_default().clone();
            Ok(MockConn {
                node: node.clone(),
                store,
                log: self.log.clone(),
                queued: VecDeque::new(),
                discarded: false,
                fail_discard: self.fail_discard.as_ref() == Some(node),
            })
        }
    }

    struct MockTable {
        map: SlotMap,
        log: Arc<Mutex<Log>>,
    }

    impl SlotTable for MockTable {
        fn node_for_slot(&self, slot: u16) -> Option<Node> {
            self.map.node_for_slot(slot).cloned()
        }

        fn refresh(&self) -> ClientResult<()> {
            self.log.lock().refreshes += 1;
            Ok(())
        }
    }

    fn node_a() -> Node {
        Node::new("127.0.0.1", 7000)
    }

    fn node_b() -> Node {
        Node::new("127.0.0.1", 7001)
    }

    // "k2" and keys starting with 'b' land on slot 9000 (node B), the rest on 100 (node A).
    fn route(key: &[u8]) -> u16 {
        if key == b"k2" || key.first() == Some(&b'b') {
            9000
        } else {
            100
        }
    }

    struct Harness {
        pipeline: ClusterPipeline<MockProvider, MockTable>,
        log: Arc<Mutex<Log>>,
    }

    fn harness_with(map: SlotMap, fail_discard: Option<Node>) -> Harness {
        let log = Arc::new(Mutex::new(Log::default()));
        let table = Arc::new(MockTable {
            map,
            log: log.clone(),
        });
        let provider = Arc::new(MockProvider {
            stores: Mutex::new(HashMap::new()),
            log: log.clone(),
            fail_discard,
        });
        let router = SlotRouter::new(table, Arc::new(route));
        Harness {
            pipeline: ClusterPipeline::new(router, provider),
            log,
        }
    }

    fn two_nodes() -> SlotMap {
        SlotMap::new()
            .with_range(0, 8191, node_a())
            .unwrap()
            .with_range(8192, 16383, node_b())
            .unwrap()
    }

    fn harness() -> Harness {
        harness_with(two_nodes(), None)
    }

    fn ok() -> RespValue {
        RespValue::Simple(b"OK".to_vec())
    }

    fn bulk(data: &[u8]) -> RespValue {
        RespValue::Bulk(Some(data.to_vec()))
    }

    fn assert_all_released_clean(log: &Log) {
        assert_eq!(log.released.len(), log.acquired.len());
        for release in &log.released {
            assert_eq!(release.pending, 0, "{} released with undrained replies", release.node);
        }
    }

    #[test]
    fn two_node_scenario_returns_replies_in_order() {
        let mut h = harness();
        h.pipeline.set(b"k1", b"v1").unwrap();
        h.pipeline.set(b"k2", b"v2").unwrap();
        h.pipeline.get(b"k1").unwrap();
        let last = h.pipeline.get(b"k2").unwrap();
        assert_eq!(last.index(), 3);
        assert_eq!(last.slot(), 9000);

        let values = h.pipeline.sync_and_return_all().unwrap();
        assert_eq!(values, vec![ok(), ok(), bulk(b"v1"), bulk(b"v2")]);

        let log = h.log.lock();
        assert_eq!(log.acquired, vec![node_a(), node_b()]);
        assert_all_released_clean(&log);
    }

    #[test]
    fn interleaved_commands_keep_issuance_order() {
        let mut h = harness();
        let keys: [&[u8]; 6] = [b"a1", b"b1", b"a2", b"b2", b"b3", b"a3"];
        for key in keys {
            h.pipeline.set(key, key).unwrap();
        }
        h.pipeline.sync().unwrap();

        for key in keys.iter().rev() {
            h.pipeline.get(key).unwrap();
        }
        let values = h.pipeline.sync_and_return_all().unwrap();
        let expected: Vec<RespValue> = keys.iter().rev().map(|k| bulk(k)).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn handles_index_into_returned_replies() {
        let mut h = harness();
        h.pipeline.set(b"a1", b"x").unwrap();
        h.pipeline.set(b"b1", b"y").unwrap();
        h.pipeline.sync().unwrap();

        let first = h.pipeline.get(b"b1").unwrap();
        let second = h.pipeline.get(b"a1").unwrap();
        assert_eq!((first.index(), second.index()), (0, 1));
        assert_eq!(first.slot(), route(b"b1"));

        let values = h.pipeline.sync_and_return_all().unwrap();
        assert_eq!(values[first.index()], bulk(b"y"));
        assert_eq!(values[second.index()], bulk(b"x"));
    }

    #[test]
    fn one_connection_per_node_per_batch() {
        let mut h = harness();
        for i in 0..10u8 {
            h.pipeline.set(&[b'a', i], b"x").unwrap();
            h.pipeline.set(&[b'b', i], b"y").unwrap();
        }
        assert_eq!(h.pipeline.pending(), 20);
        assert_eq!(h.pipeline.connections(), 2);
        h.pipeline.sync().unwrap();

        let log = h.log.lock();
        assert_eq!(log.acquired.len(), 2);
        assert_eq!(log.sent.len(), 20);
        assert_all_released_clean(&log);
    }

    #[test]
    fn each_batch_acquires_afresh() {
        let mut h = harness();
        h.pipeline.set(b"a1", b"1").unwrap();
        h.pipeline.sync().unwrap();
        h.pipeline.get(b"a1").unwrap();
        assert_eq!(h.pipeline.sync_and_return_all().unwrap(), vec![bulk(b"1")]);

        let log = h.log.lock();
        assert_eq!(log.acquired, vec![node_a(), node_a()]);
        assert_eq!(log.released.len(), 2);
    }

    #[test]
    fn moved_reply_refreshes_once_and_releases_everything() {
        let mut h = harness();
        h.pipeline.set(b"a1", b"1").unwrap();
        h.pipeline.set(b"b1", b"1").unwrap();
        h.pipeline.set(b"a-moved", b"1").unwrap();
        h.pipeline.set(b"b2", b"1").unwrap();
        h.pipeline.set(b"a2", b"1").unwrap();

        let err = h.pipeline.sync_and_return_all().unwrap_err();
        let redirect = err.redirect().unwrap();
        assert!(err.is_moved());
        assert_eq!(redirect.slot, 100);
        assert_eq!(redirect.node, Node::new("127.0.0.1", 7002));

        let log = h.log.lock();
        assert_eq!(log.refreshes, 1);
        assert_all_released_clean(&log);
        // Both connections still had replies queued behind the failure.
        assert!(log.released.iter().all(|r| r.discarded));
        drop(log);
        assert!(h.pipeline.is_empty());
    }

    #[test]
    fn ask_reply_surfaces_without_refresh() {
        let mut h = harness();
        h.pipeline.set(b"a1", b"1").unwrap();
        h.pipeline.get(b"b-ask").unwrap();

        let err = h.pipeline.sync().unwrap_err();
        assert!(err.is_ask());

        let log = h.log.lock();
        assert_eq!(log.refreshes, 0);
        assert_all_released_clean(&log);
    }

    #[test]
    fn connection_fault_propagates_and_cleans_up() {
        let mut h = harness();
        h.pipeline.set(b"b1", b"1").unwrap();
        h.pipeline.set(b"a-ioerr", b"1").unwrap();
        h.pipeline.set(b"a2", b"1").unwrap();
        h.pipeline.set(b"b2", b"1").unwrap();

        let err = h.pipeline.sync().unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));

        let log = h.log.lock();
        assert_eq!(log.refreshes, 0);
        assert_all_released_clean(&log);
    }

    #[test]
    fn server_error_aborts_drain_without_refresh() {
        let mut h = harness();
        h.pipeline.get(b"a-wrongtype").unwrap();
        h.pipeline.get(b"b1").unwrap();

        let err = h.pipeline.sync_and_return_all().unwrap_err();
        assert!(matches!(err, ClientError::Server { .. }));
        assert_eq!(h.log.lock().refreshes, 0);
    }

    #[test]
    fn discard_failure_does_not_mask_first_error() {
        let mut h = harness_with(two_nodes(), Some(node_b()));
        h.pipeline.set(b"a-moved", b"1").unwrap();
        h.pipeline.set(b"b1", b"1").unwrap();

        let err = h.pipeline.sync().unwrap_err();
        assert!(err.is_moved());

        let log = h.log.lock();
        assert_eq!(log.released.len(), 2);
        let b = log.released.iter().find(|r| r.node == node_b()).unwrap();
        assert!(b.discarded);
    }

    #[test]
    fn pipeline_is_reusable_after_failed_batch() {
        let mut h = harness();
        h.pipeline.set(b"a-moved", b"1").unwrap();
        assert!(h.pipeline.sync().is_err());

        h.pipeline.set(b"a1", b"v").unwrap();
        h.pipeline.get(b"a1").unwrap();
        assert_eq!(
            h.pipeline.sync_and_return_all().unwrap(),
            vec![ok(), bulk(b"v")]
        );
    }

    #[test]
    fn close_is_idempotent() {
        let mut h = harness();
        h.pipeline.set(b"a1", b"1").unwrap();
        h.pipeline.set(b"b1", b"1").unwrap();
        h.pipeline.sync().unwrap();

        let (acquired, released) = {
            let log = h.log.lock();
            (log.acquired.len(), log.released.len())
        };
        h.pipeline.close();
        h.pipeline.close();

        let log = h.log.lock();
        assert_eq!(log.acquired.len(), acquired);
        assert_eq!(log.released.len(), released);
    }

    #[test]
    fn close_mid_batch_discards_before_release() {
        let mut h = harness();
        h.pipeline.set(b"a1", b"1").unwrap();
        h.pipeline.set(b"b1", b"1").unwrap();
        h.pipeline.close();
        assert!(h.pipeline.is_empty());

        let log = h.log.lock();
        assert_all_released_clean(&log);
        assert!(log.released.iter().all(|r| r.discarded));
    }

    #[test]
    fn dropping_pipeline_releases_batch() {
        let mut h = harness();
        h.pipeline.set(b"a1", b"1").unwrap();
        let log = h.log.clone();
        drop(h);

        let log = log.lock();
        assert_all_released_clean(&log);
        assert_eq!(log.released.len(), 1);
    }

    #[test]
    fn empty_batch_touches_no_connection() {
        let mut h = harness();
        assert!(h.pipeline.sync_and_return_all().unwrap().is_empty());
        h.pipeline.sync().unwrap();
        h.pipeline.close();

        let log = h.log.lock();
        assert!(log.acquired.is_empty());
        assert!(log.released.is_empty());
    }

    #[test]
    fn unowned_slot_fails_at_issue() {
        let map = SlotMap::new().with_range(0, 8191, node_a()).unwrap();
        let mut h = harness_with(map, None);
        h.pipeline.set(b"a1", b"1").unwrap();
        assert!(matches!(
            h.pipeline.set(b"b1", b"1"),
            Err(ClientError::NoNodeForSlot(9000))
        ));
        h.pipeline.close();
        assert_all_released_clean(&h.log.lock());
    }

    #[test]
    fn verb_helpers_encode_arguments() {
        let mut h = harness();
        h.pipeline.set_with_ttl(b"a1", b"v", Duration::from_secs(30)).unwrap();
        h.pipeline.expire(b"a1", Duration::from_secs(0)).unwrap();
        h.pipeline.incr_by(b"a-counter", -15).unwrap();
        h.pipeline.close();

        let log = h.log.lock();
        let sent: Vec<&Vec<Vec<u8>>> = log.sent.iter().map(|(_, args)| args).collect();
        assert_eq!(sent[0], &vec![b"SET".to_vec(), b"a1".to_vec(), b"v".to_vec(), b"EX".to_vec(), b"30".to_vec()]);
        assert_eq!(sent[1], &vec![b"EXPIRE".to_vec(), b"a1".to_vec(), b"0".to_vec()]);
        assert_eq!(sent[2], &vec![b"INCRBY".to_vec(), b"a-counter".to_vec(), b"-15".to_vec()]);
    }

    #[test]
    fn incr_by_round_trips_through_mock() {
        let mut h = harness();
        h.pipeline.incr_by(b"a-n", 7).unwrap();
        h.pipeline.incr_by(b"a-n", -2).unwrap();
        assert_eq!(
            h.pipeline.sync_and_return_all().unwrap(),
            vec![RespValue::Integer(7), RespValue::Integer(5)]
        );
    }
}
