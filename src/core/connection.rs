//! Multiplexed connection to a single node
//!
//! Any number of callers may have requests outstanding on one connection.
//! Each request gets a sync id and a waiter slot; a read task per link routes
//! every response to the waiter with the same id, and a write task per link
//! drains an outbound queue so no caller ever holds a lock across I/O.
//!
//! Link failures resolve every outstanding waiter with `ConnectionLost` and
//! flip the state to `Disconnected`; the pool watches that state and drives
//! reconnection through [`Connection::connect`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use fnv::FnvHashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::core::transport::{Link, LinkReader, LinkWriter, Transport};
use crate::error::{ConnectError, PoolError, PoolResult};
use crate::protocol::frame::{HEADER_LEN, MAX_FRAME_LEN};
use crate::protocol::{self, Frame, Greeting, Opcode, Request, Response, GREETING};

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    /// Closed for good; no further sends or reconnects
    Closing,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Disconnected => write!(f, "disconnected"),
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Connected => write!(f, "connected"),
            ConnState::Closing => write!(f, "closing"),
        }
    }
}

/// Handshake settings for a connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Bound on opening the link plus greeting and auth
    pub connect_timeout: Duration,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&ConnectionConfig::default())
    }
}

impl From<&ConnectionConfig> for ConnectOptions {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            user: config.user.clone(),
            password: config.password.clone(),
        }
    }
}

type Waiter = oneshot::Sender<PoolResult<Response>>;

/// An encoded request waiting for the write task
struct Outbound {
    frame: Bytes,
    deadline: Instant,
}

/// Everything tied to the current link, guarded by one mutex
struct LinkState {
    /// Bumped on every connect, failure and close; tasks of older links
    /// carry a stale value and their reports are ignored
    generation: u64,
    accepting: bool,
    waiters: FnvHashMap<u64, Waiter>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    reader: Option<JoinHandle<()>>,
}

struct Shared {
    addr: String,
    state: watch::Sender<ConnState>,
    link: Mutex<LinkState>,
    next_sync: AtomicU64,
}

impl Shared {
    fn link(&self) -> MutexGuard<'_, LinkState> {
        // Nothing panics while holding the lock, but never propagate poison
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// Error for a send attempted while no link is usable
    fn unavailable(&self) -> PoolError {
        match self.state() {
            ConnState::Closing => PoolError::closed(&self.addr),
            _ => PoolError::connection_lost(&self.addr),
        }
    }

    /// Tear down link `generation` after a transport failure
    fn fail(&self, generation: u64, reason: &str) {
        let waiters = {
            let mut link = self.link();
            if link.generation != generation {
                return;
            }
            link.generation += 1;
            link.accepting = false;
            link.outbound = None;
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
            std::mem::take(&mut link.waiters)
        };

        self.state.send_if_modified(|state| {
            if *state == ConnState::Closing {
                return false;
            }
            *state = ConnState::Disconnected;
            true
        });

        warn!(
            "Connection to {} lost ({}), failing {} pending requests",
            self.addr,
            reason,
            waiters.len()
        );
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(PoolError::connection_lost(&self.addr)));
        }
    }

    /// Hand a response to whoever waits for its sync id
    fn deliver(&self, generation: u64, frame: Frame) {
        let waiter = {
            let mut link = self.link();
            if link.generation != generation {
                return;
            }
            link.waiters.remove(&frame.sync)
        };

        match waiter {
            Some(waiter) => {
                let _ = waiter.send(Ok(Response::from_frame(frame)));
            }
            None => trace!(
                "Discarding response for sync {} from {}: nobody waiting",
                frame.sync,
                self.addr
            ),
        }
    }
}

/// Removes a waiter slot when its caller stops waiting, whatever the reason
struct WaiterGuard<'a> {
    shared: &'a Shared,
    sync: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.shared.link().waiters.remove(&self.sync);
    }
}

/// A multiplexed connection to one node
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// A connection that has not been opened yet
    pub fn new<S: Into<String>>(addr: S) -> Self {
        let (state, _) = watch::channel(ConnState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                addr: addr.into(),
                state,
                link: Mutex::new(LinkState {
                    generation: 0,
                    accepting: false,
                    waiters: FnvHashMap::default(),
                    outbound: None,
                    reader: None,
                }),
                // Sync 0 is used by the handshake
                next_sync: AtomicU64::new(1),
            }),
        }
    }

    /// Open a connection and complete the handshake
    pub async fn open<S: Into<String>>(
        addr: S,
        transport: &dyn Transport,
        options: &ConnectOptions,
    ) -> Result<Self, ConnectError> {
        let conn = Self::new(addr);
        conn.connect(transport, options).await?;
        Ok(conn)
    }

    pub fn addr(&self) -> &str {
        &self.shared.addr
    }

    pub fn state(&self) -> ConnState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.shared.state.subscribe()
    }

    /// Number of requests currently waiting for a response
    pub fn pending_count(&self) -> usize {
        self.shared.link().waiters.len()
    }

    /// (Re)establish the link. Used for the first connect and every
    /// reconnect; a failed attempt leaves the connection `Disconnected`.
    pub async fn connect(
        &self,
        transport: &dyn Transport,
        options: &ConnectOptions,
    ) -> Result<(), ConnectError> {
        let addr = self.addr().to_string();
        let began = self.shared.state.send_if_modified(|state| match state {
            ConnState::Disconnected => {
                *state = ConnState::Connecting;
                true
            }
            _ => false,
        });
        if !began {
            return Err(ConnectError::handshake(
                addr,
                format!("connection is {}", self.state()),
            ));
        }

        let link = match timeout(options.connect_timeout, self.handshake(transport, options)).await
        {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                self.abandon_connect();
                return Err(e);
            }
            Err(_) => {
                self.abandon_connect();
                return Err(ConnectError::Timeout { addr });
            }
        };

        let Link { reader, writer } = link;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let generation = {
            let mut state = self.shared.link();
            state.generation += 1;
            state.accepting = true;
            state.outbound = Some(outbound_tx);
            state.generation
        };

        // Close may have raced with the handshake
        let connected = self.shared.state.send_if_modified(|state| match state {
            ConnState::Connecting => {
                *state = ConnState::Connected;
                true
            }
            _ => false,
        });
        if !connected {
            self.shared.fail(generation, "closed during handshake");
            return Err(ConnectError::handshake(addr, "connection closed"));
        }

        tokio::spawn(write_loop(
            Arc::clone(&self.shared),
            generation,
            writer,
            outbound_rx,
        ));
        let reader_task = tokio::spawn(read_loop(Arc::clone(&self.shared), generation, reader));
        {
            let mut state = self.shared.link();
            if state.generation == generation {
                state.reader = Some(reader_task);
            } else {
                reader_task.abort();
            }
        }

        info!("Connected to node {}", addr);
        Ok(())
    }

    fn abandon_connect(&self) {
        self.shared.state.send_if_modified(|state| match state {
            ConnState::Connecting => {
                *state = ConnState::Disconnected;
                true
            }
            _ => false,
        });
    }

    /// Open the link, check the greeting and authenticate
    async fn handshake(
        &self,
        transport: &dyn Transport,
        options: &ConnectOptions,
    ) -> Result<Link, ConnectError> {
        let addr = self.addr();
        let mut link = transport.open(addr).await?;

        let greeting = read_handshake_frame(addr, link.reader.as_mut()).await?;
        if greeting.code != GREETING {
            return Err(ConnectError::handshake(
                addr,
                format!("expected greeting, got code {:#x}", greeting.code),
            ));
        }
        let greeting: Greeting = serde_json::from_slice(&greeting.body)
            .map_err(|e| ConnectError::handshake(addr, format!("malformed greeting: {}", e)))?;
        if !greeting.is_compatible() {
            return Err(ConnectError::handshake(
                addr,
                format!("unsupported server '{}'", greeting.server),
            ));
        }
        debug!("Node {} greeted as '{}'", addr, greeting.server);

        if let Some(user) = &options.user {
            let password = options.password.as_deref().unwrap_or_default();
            let body = protocol::auth_body(&greeting, user, password)
                .map_err(|e| ConnectError::handshake(addr, e.to_string()))?;
            let request = Frame::new(Opcode::Auth.code(), 0, body);
            link.writer
                .write(request.encode())
                .await
                .map_err(|e| ConnectError::handshake(addr, format!("auth write failed: {}", e)))?;

            let reply = read_handshake_frame(addr, link.reader.as_mut()).await?;
            if let Err(e) = Response::from_frame(reply).into_result() {
                let message = match e {
                    PoolError::Server { message, .. } => message,
                    other => other.to_string(),
                };
                return Err(ConnectError::auth_rejected(addr, message));
            }
            debug!("Authenticated to {} as {}", addr, user);
        }

        Ok(link)
    }

    /// Send a request and wait for its response.
    ///
    /// Resolves exactly once: with the matching response, `Timeout` at the
    /// request deadline, `ConnectionLost` if the link fails first or `Closed`
    /// if the connection is closed. Server-side errors come back as a normal
    /// [`Response`]; see [`Response::into_result`].
    pub async fn send(&self, request: Request) -> PoolResult<Response> {
        let shared = &*self.shared;
        // The link would reject it; fail this request only
        if HEADER_LEN + request.body.len() > MAX_FRAME_LEN {
            return Err(PoolError::protocol(format!(
                "{} request of {} bytes exceeds the {} byte frame limit",
                request.opcode,
                request.body.len(),
                MAX_FRAME_LEN - HEADER_LEN
            )));
        }
        let sync = shared.next_sync.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut guard = shared.link();
            let link = &mut *guard;
            let outbound = match (&link.outbound, link.accepting) {
                (Some(outbound), true) => outbound,
                _ => return Err(shared.unavailable()),
            };
            // Registered under the same lock, so the reply cannot beat it
            let queued = outbound.send(Outbound {
                frame: request.to_frame(sync).encode(),
                deadline: request.deadline,
            });
            if queued.is_err() {
                return Err(shared.unavailable());
            }
            link.waiters.insert(sync, tx);
        }

        let _slot = WaiterGuard { shared, sync };
        trace!("Sent {} sync {} to {}", request.opcode, sync, shared.addr);

        let deadline = tokio::time::Instant::from_std(request.deadline);
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            // Waiter dropped unresolved; only happens if the link state vanished
            Ok(Err(_)) => Err(PoolError::connection_lost(&shared.addr)),
            Err(_) => {
                debug!("Request sync {} to {} timed out", sync, shared.addr);
                Err(PoolError::Timeout {
                    addr: shared.addr.clone(),
                    sync,
                })
            }
        }
    }

    /// Close the connection. Pending requests resolve with `Closed`;
    /// calling it again does nothing.
    pub fn close(&self) {
        let previous = self.shared.state.send_replace(ConnState::Closing);
        let waiters = {
            let mut link = self.shared.link();
            link.generation += 1;
            link.accepting = false;
            // Dropping the queue lets the write task shut the link down
            link.outbound = None;
            if let Some(reader) = link.reader.take() {
                reader.abort();
            }
            std::mem::take(&mut link.waiters)
        };

        if previous != ConnState::Closing {
            info!("Closed connection to {}", self.shared.addr);
        }
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(PoolError::closed(&self.shared.addr)));
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.shared.addr)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_handshake_frame(
    addr: &str,
    reader: &mut dyn LinkReader,
) -> Result<Frame, ConnectError> {
    let bytes = reader
        .read()
        .await
        .map_err(|e| ConnectError::handshake(addr, format!("read failed: {}", e)))?;
    Frame::decode(bytes).map_err(|e| ConnectError::handshake(addr, e.to_string()))
}

async fn read_loop(shared: Arc<Shared>, generation: u64, mut reader: Box<dyn LinkReader>) {
    loop {
        let bytes = match reader.read().await {
            Ok(bytes) => bytes,
            Err(e) => {
                shared.fail(generation, &e.to_string());
                return;
            }
        };

        match Frame::decode(bytes) {
            Ok(frame) => shared.deliver(generation, frame),
            Err(e) => {
                // Framing is lost, nothing after this can be trusted
                shared.fail(generation, &e.to_string());
                return;
            }
        }
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut writer: Box<dyn LinkWriter>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(Outbound { frame, deadline }) = outbound.recv().await {
        // Its caller has already timed out
        if Instant::now() >= deadline {
            trace!("Dropping expired request to {}", shared.addr);
            continue;
        }
        if let Err(e) = writer.write(frame).await {
            shared.fail(generation, &e.to_string());
            return;
        }
    }
    let _ = writer.shutdown().await;
}
