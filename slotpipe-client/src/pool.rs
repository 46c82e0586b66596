//! # Connection Pool
//!
//! Purpose: Reuse TCP connections to every cluster node and let a pipeline
//! buffer many commands on one connection before reading any reply.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections per node.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Fail Fast**: Exceeding the pool limit returns an error immediately.
//! 4. **Clean Return**: A connection goes back to its pool only when every
//!    queued reply has been read; anything else is closed instead.

use std::collections::{HashMap, VecDeque};
use std::io::{BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::client::{ClientError, ClientResult};
use crate::resp::{encode_command, read_response, RespValue};
use crate::slot::Node;

/// Connection that can hold several unflushed commands and read their
/// replies later, in order.
pub trait PipelineConnection {
    /// Buffers a command without touching the network.
    fn send_unflushed(&mut self, args: &[&[u8]]) -> ClientResult<()>;

    /// Reads the next queued reply, flushing buffered commands first if any.
    fn read_reply(&mut self) -> ClientResult<RespValue>;

    /// Flushes buffered commands and reads and drops every outstanding reply.
    fn discard_pending(&mut self) -> ClientResult<()>;

    /// Number of commands whose reply has not been read yet.
    fn pending(&self) -> usize;
}

/// Hands out checked-out connections, one pool per node.
///
/// Dropping a connection returns it to the pool it came from.
pub trait ConnectionProvider {
    type Conn: PipelineConnection;

    /// Checks a connection to `node` out of its pool.
    fn acquire(&self, node: &Node) -> ClientResult<Self::Conn>;
}

/// Per-node pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
}

struct PoolInner {
    node: Node,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

/// Connection pool handle for one node.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a new connection pool for `node`.
    pub fn new(node: Node, config: PoolConfig) -> Self {
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                node,
                config,
                state: Mutex::new(state),
            }),
        }
    }

    /// Acquires a connection from the pool.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        if let Some(conn) = self.pop_idle() {
            return Ok(PooledConnection::new(self.inner.clone(), conn));
        }

        if !self.try_reserve() {
            return Err(ClientError::PoolExhausted);
        }

        match Connection::connect(&self.inner.node, &self.inner.config) {
            Ok(conn) => {
                debug!(node = %self.inner.node, "opened connection");
                Ok(PooledConnection::new(self.inner.clone(), conn))
            }
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Number of idle connections ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Number of open connections, idle or checked out.
    pub fn total(&self) -> usize {
        self.inner.state.lock().total
    }

    fn pop_idle(&self) -> Option<Connection> {
        self.inner.state.lock().idle.pop_front()
    }

    fn try_reserve(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.total >= self.inner.config.max_total {
            return false;
        }
        state.total += 1;
        true
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.total = state.total.saturating_sub(1);
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.inner.state.lock();
        if state.idle.len() < self.inner.config.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Node this connection talks to.
    pub fn node(&self) -> &Node {
        &self.pool.node
    }

    /// Executes a single command and returns its reply.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.send_unflushed(args)?;
        self.read_reply()
    }

    fn with_conn<T>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> ClientResult<T>,
    ) -> ClientResult<T> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(ClientError::Protocol);
        };
        let result = op(conn);
        if result.is_err() {
            // If IO/protocol fails, do not return this connection to the pool.
            self.valid = false;
        }
        result
    }
}

impl PipelineConnection for PooledConnection {
    fn send_unflushed(&mut self, args: &[&[u8]]) -> ClientResult<()> {
        self.with_conn(|conn| {
            conn.send(args);
            Ok(())
        })
    }

    fn read_reply(&mut self) -> ClientResult<RespValue> {
        self.with_conn(Connection::read_reply)
    }

    fn discard_pending(&mut self) -> ClientResult<()> {
        if !self.valid {
            // The stream is out of sync after a failed read; it is closed on
            // drop, so reading further could only block.
            return Ok(());
        }
        self.with_conn(Connection::discard_pending)
    }

    fn pending(&self) -> usize {
        self.conn.as_ref().map_or(0, |conn| conn.pending)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        let pool = ConnectionPool {
            inner: self.pool.clone(),
        };

        if self.valid && conn.is_clean() {
            pool.return_connection(conn);
        } else {
            debug!(
                node = %self.pool.node,
                pending = conn.pending,
                "closing connection instead of pooling it"
            );
            pool.release_slot();
        }
    }
}

/// Single TCP connection with reusable buffers.
///
/// Commands are appended to `write_buf` and only hit the socket on the next
/// reply read, so a whole batch goes out in one write.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: BytesMut,
    pending: usize,
}

impl Connection {
    fn connect(node: &Node, config: &PoolConfig) -> ClientResult<Self> {
        let stream = connect_stream(node, config)?;
        if let Some(timeout) = config.read_timeout {
            stream.set_read_timeout(Some(timeout))?;
        }
        if let Some(timeout) = config.write_timeout {
            stream.set_write_timeout(Some(timeout))?;
        }
        // Disable Nagle to keep request latency low for small payloads.
        stream.set_nodelay(true)?;

        Ok(Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(4 * 1024),
            pending: 0,
        })
    }

    fn send(&mut self, args: &[&[u8]]) {
        encode_command(args, &mut self.write_buf);
        self.pending += 1;
    }

    fn flush(&mut self) -> ClientResult<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;
        self.write_buf.clear();
        Ok(())
    }

    fn read_reply(&mut self) -> ClientResult<RespValue> {
        if self.pending == 0 {
            // Nothing queued: a read would block until the timeout.
            return Err(ClientError::Protocol);
        }
        self.flush()?;
        let value = read_response(&mut self.reader, &mut self.line_buf)?;
        self.pending -= 1;
        Ok(value)
    }

    fn discard_pending(&mut self) -> ClientResult<()> {
        self.flush()?;
        while self.pending > 0 {
            read_response(&mut self.reader, &mut self.line_buf)?;
            self.pending -= 1;
        }
        Ok(())
    }

    fn is_clean(&self) -> bool {
        self.pending == 0 && self.write_buf.is_empty()
    }
}

fn connect_stream(node: &Node, config: &PoolConfig) -> ClientResult<TcpStream> {
    let addr = (node.host(), node.port())
        .to_socket_addrs()
        .map_err(|_| ClientError::InvalidAddress)?
        .next()
        .ok_or(ClientError::InvalidAddress)?;
    let stream = match config.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    Ok(stream)
}

/// Lazily created pools, one per cluster node.
pub struct NodePools {
    config: PoolConfig,
    pools: RwLock<HashMap<Node, ConnectionPool>>,
}

impl NodePools {
    /// Creates an empty pool set; every node gets `config`.
    pub fn new(config: PoolConfig) -> Self {
        NodePools {
            config,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the pool for `node`, creating it on first use.
    pub fn pool_for(&self, node: &Node) -> ConnectionPool {
        if let Some(pool) = self.pools.read().get(node) {
            return pool.clone();
        }
        self.pools
            .write()
            .entry(node.clone())
            .or_insert_with(|| ConnectionPool::new(node.clone(), self.config.clone()))
            .clone()
    }

    /// Checks a connection to `node` out of its pool.
    pub fn acquire(&self, node: &Node) -> ClientResult<PooledConnection> {
        self.pool_for(node).acquire()
    }
}

impl ConnectionProvider for NodePools {
    type Conn = PooledConnection;

    fn acquire(&self, node: &Node) -> ClientResult<PooledConnection> {
        NodePools::acquire(self, node)
    }
}
