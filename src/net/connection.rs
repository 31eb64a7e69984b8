//! Connection lifecycle
//!
//! A [`Connection`] owns one TCP socket. Its read loop runs as a tokio task
//! and frames messages (length header, then body); everything a protocol
//! does with a message runs on the dispatcher. Writes go through a per
//! connection queue drained by at most one write task at a time, so bytes
//! reach the peer in exactly the order they were sent.

use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::message::{NetworkMessage, OutputMessage, CHECKSUM_LENGTH, MAX_BODY_LENGTH};
use super::pool::Pooled;
use super::service::ServicePort;
use crate::crypto::adler32;
use crate::dispatch::{Task, DISPATCHER_TASK_EXPIRATION};
use crate::error::{NetworkError, ProtocolError, RealmError, Result};
use crate::protocol::Protocol;
use crate::state::ServerContext;

/// Unique connection identifier
pub type ConnectionId = u64;

/// Connection state; the only transition is Open to Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Open => "Open",
            ConnectionState::Closed => "Closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How to close a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Let queued writes finish first
    Graceful,
    /// Drop queued writes and close the socket now
    Force,
}

/// Per-connection packet counter
///
/// Counts packets since the window opened and compares the average against
/// the ceiling. The window only restarts once more than two seconds have
/// passed, so short bursts above the ceiling can slip through.
#[derive(Debug, Clone, Copy)]
pub struct PacketRate {
    packets: u32,
    window_start: Instant,
}

impl PacketRate {
    pub fn new(now: Instant) -> Self {
        Self {
            packets: 0,
            window_start: now,
        }
    }

    /// Count one packet; returns false if the ceiling was exceeded
    pub fn record(&mut self, now: Instant, max_per_second: u32) -> bool {
        let time_passed = now.saturating_duration_since(self.window_start).as_secs() + 1;
        self.packets += 1;
        if u64::from(self.packets) / time_passed > u64::from(max_per_second) {
            return false;
        }

        if time_passed > 2 {
            self.window_start = now;
            self.packets = 0;
        }
        true
    }
}

struct ConnectionInner {
    state: ConnectionState,
    queue: VecDeque<Pooled<OutputMessage>>,
    /// A write task is draining the queue
    writing: bool,
    received_first: bool,
    rate: PacketRate,
}

/// One client socket
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    context: Arc<ServerContext>,
    port: Arc<ServicePort>,
    runtime: Handle,
    connected_at: Instant,
    protocol: Mutex<Option<Arc<dyn Protocol>>>,
    /// Read half, parked until the read loop starts
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    inner: Mutex<ConnectionInner>,
    read_task: Mutex<Option<AbortHandle>>,
    write_task: Mutex<Option<AbortHandle>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        peer: SocketAddr,
        context: Arc<ServerContext>,
        port: Arc<ServicePort>,
        runtime: Handle,
    ) -> Self {
        let (reader, writer) = stream.into_split();
        let now = Instant::now();
        Self {
            id,
            peer,
            context,
            port,
            runtime,
            connected_at: now,
            protocol: Mutex::new(None),
            reader: Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            inner: Mutex::new(ConnectionInner {
                state: ConnectionState::Open,
                queue: VecDeque::new(),
                writing: false,
                received_first: false,
                rate: PacketRate::new(now),
            }),
            read_task: Mutex::new(None),
            write_task: Mutex::new(None),
        }
    }

    // ============ Properties ============

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn port(&self) -> &Arc<ServicePort> {
        &self.port
    }

    /// Runtime driving this socket
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// The attached protocol, if negotiation has happened
    pub fn protocol(&self) -> Option<Arc<dyn Protocol>> {
        self.protocol.lock().clone()
    }

    /// Messages waiting to be written
    pub fn queued_messages(&self) -> usize {
        self.inner.lock().queue.len()
    }

    // ============ Lifecycle ============

    /// Start serving the socket
    ///
    /// Server-speaks-first services pass their protocol here; it is told
    /// about the connection on the dispatcher before anything is read.
    pub fn accept(self: &Arc<Self>, protocol: Option<Arc<dyn Protocol>>) {
        if let Some(protocol) = protocol {
            *self.protocol.lock() = Some(Arc::clone(&protocol));
            let task = Task::new(move || {
                protocol.on_connect();
                protocol.core().flush();
            });
            if self.context.dispatcher.add(task, false).is_err() {
                self.close(CloseMode::Force);
                return;
            }
        }

        let Some(reader) = self.reader.lock().take() else {
            return;
        };

        let connection = Arc::clone(self);
        let handle = self.runtime.spawn(async move { connection.read_loop(reader).await });
        *self.read_task.lock() = Some(handle.abort_handle());

        // Closed while the task was being spawned
        if !self.is_open() {
            handle.abort();
        }
    }

    /// Close the connection
    ///
    /// Unregisters from the connection manager first, then queues the
    /// protocol release on the dispatcher. A graceful close keeps the socket
    /// open until queued messages are written.
    pub fn close(self: &Arc<Self>, mode: CloseMode) {
        self.context.connections.release_connection(self.id);

        let close_now = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                // Escalation of a pending graceful close
                if mode == CloseMode::Force {
                    inner.queue.clear();
                    drop(inner);
                    self.close_socket();
                }
                return;
            }

            inner.state = ConnectionState::Closed;
            if mode == CloseMode::Force {
                inner.queue.clear();
            }
            mode == CloseMode::Force || (!inner.writing && inner.queue.is_empty())
        };

        debug!(
            connection_id = self.id,
            address = %self.peer,
            ?mode,
            "Connection closed"
        );

        if let Some(protocol) = self.protocol() {
            let task = Task::new(move || protocol.release());
            if self.context.dispatcher.add(task, false).is_err() {
                debug!(connection_id = self.id, "Dispatcher stopped, skipping protocol release");
            }
        }

        if close_now {
            self.close_socket();
        }
    }

    fn close_socket(self: &Arc<Self>) {
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        if let Some(task) = self.write_task.lock().take() {
            task.abort();
        }

        let connection = Arc::clone(self);
        let write_timeout = self.context.config.network.write_timeout();
        self.runtime.spawn(async move {
            let writer = connection.writer.lock().await.take();
            if let Some(mut writer) = writer {
                let _ = tokio::time::timeout(write_timeout, writer.shutdown()).await;
            }
            trace!(connection_id = connection.id, "Socket closed");
        });
    }

    // ============ Outbound ============

    /// Queue a finished frame; returns false if the connection is closed
    ///
    /// Safe to call from any thread. Frames are written one at a time in
    /// the order they were queued.
    pub fn send(self: &Arc<Self>, msg: Pooled<OutputMessage>) -> bool {
        let start_writer = {
            let mut inner = self.inner.lock();
            if inner.state == ConnectionState::Closed {
                return false;
            }
            inner.queue.push_back(msg);
            !std::mem::replace(&mut inner.writing, true)
        };

        if start_writer {
            let connection = Arc::clone(self);
            let handle = self.runtime.spawn(async move { connection.write_loop().await });
            *self.write_task.lock() = Some(handle.abort_handle());
        }
        true
    }

    async fn write_loop(self: Arc<Self>) {
        let write_timeout = self.context.config.network.write_timeout();

        loop {
            let (next, state) = {
                let mut inner = self.inner.lock();
                let next = inner.queue.pop_front();
                if next.is_none() {
                    inner.writing = false;
                }
                (next, inner.state)
            };

            let Some(msg) = next else {
                // A graceful close waits for the queue to drain
                if state == ConnectionState::Closed {
                    self.close_socket();
                }
                return;
            };

            let result = {
                let mut writer = self.writer.lock().await;
                let Some(writer) = writer.as_mut() else {
                    return;
                };
                tokio::time::timeout(write_timeout, writer.write_all(msg.output_bytes())).await
            };
            // Return the buffer before anything else can block
            drop(msg);

            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(connection_id = self.id, error = %e, "Write failed");
                    self.close(CloseMode::Force);
                    return;
                }
                Err(_) => {
                    warn!(connection_id = self.id, address = %self.peer, "Write timed out");
                    self.close(CloseMode::Force);
                    return;
                }
            }
        }
    }

    // ============ Inbound ============

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let result = self.read_messages(&mut reader).await;

        // A graceful close is finished by the write task once the queue drains
        if !self.is_open() {
            trace!(connection_id = self.id, "Read loop ended after close");
            return;
        }

        if let Err(e) = result {
            match &e {
                RealmError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                    trace!(connection_id = self.id, "Peer closed connection");
                }
                RealmError::Network(NetworkError::Timeout) => {
                    debug!(connection_id = self.id, address = %self.peer, "Read timed out");
                }
                _ => {
                    debug!(connection_id = self.id, address = %self.peer, error = %e, "Read failed");
                }
            }
        }
        self.close(CloseMode::Force);
    }

    async fn read_messages(self: &Arc<Self>, reader: &mut OwnedReadHalf) -> Result<()> {
        let read_timeout = self.context.config.network.read_timeout();

        loop {
            let mut msg = self
                .context
                .input_pool
                .allocate()
                .ok_or(NetworkError::PoolExhausted)?;

            read_exact_timeout(reader, msg.prepare_header(), read_timeout).await?;

            let length = msg.length_header() as usize;
            if length == 0 || length >= MAX_BODY_LENGTH {
                return Err(NetworkError::InvalidFrameLength(length).into());
            }

            read_exact_timeout(reader, msg.prepare_body(length), read_timeout).await?;
            if !self.is_open() {
                // Keep draining so unread input cannot reset the socket early
                continue;
            }

            self.check_packet_rate()?;
            self.on_message(msg).await?;
        }
    }

    fn check_packet_rate(&self) -> std::result::Result<(), NetworkError> {
        let max = self.context.config.network.max_packets_per_second;
        if self.inner.lock().rate.record(Instant::now(), max) {
            Ok(())
        } else {
            warn!(connection_id = self.id, address = %self.peer, max, "Packet rate exceeded");
            Err(NetworkError::RateLimited(max))
        }
    }

    async fn on_message(self: &Arc<Self>, mut msg: Pooled<NetworkMessage>) -> Result<()> {
        let first = !std::mem::replace(&mut self.inner.lock().received_first, true);
        let attached = self.protocol();

        if first {
            let checksummed = verify_first_checksum(&mut msg);
            let protocol = match attached {
                Some(protocol) => {
                    // Identifier byte is meaningless on an exclusive port
                    msg.skip_bytes(1);
                    protocol
                }
                None => {
                    let identifier = msg.peek_byte();
                    match self.port.make_protocol(checksummed, &mut msg, self) {
                        Some(protocol) => {
                            *self.protocol.lock() = Some(Arc::clone(&protocol));
                            protocol
                        }
                        None => return Err(ProtocolError::UnknownIdentifier(identifier).into()),
                    }
                }
            };
            return self.dispatch_first_message(protocol, msg).await;
        }

        let Some(protocol) = attached else {
            return Err(NetworkError::ConnectionClosed.into());
        };
        protocol.core().decode(&mut msg)?;

        let task = Task::with_expiration(DISPATCHER_TASK_EXPIRATION, move || {
            protocol.parse_packet(&mut msg);
            protocol.core().flush();
        });
        self.context.dispatcher.add(task, false)?;
        Ok(())
    }

    async fn dispatch_first_message(
        &self,
        protocol: Arc<dyn Protocol>,
        mut msg: Pooled<NetworkMessage>,
    ) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        let task = Task::new(move || {
            protocol.on_recv_first_message(&mut msg);
            protocol.core().flush();
            let _ = done_tx.send(());
        });
        self.context.dispatcher.add(task, false)?;

        // The next frame may depend on keys negotiated here
        if done_rx.await.is_err() {
            return Err(NetworkError::DispatcherStopped.into());
        }
        Ok(())
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_exact_timeout(
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
    limit: Duration,
) -> Result<()> {
    match tokio::time::timeout(limit, reader.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(NetworkError::Timeout.into()),
    }
}

/// Detect the optional checksum on a connection's first message
///
/// Reads four bytes and compares them with the Adler-32 of the rest. On a
/// mismatch the bytes are assumed to be payload and the cursor is rewound.
pub fn verify_first_checksum(msg: &mut NetworkMessage) -> bool {
    if !msg.can_read(CHECKSUM_LENGTH) {
        return false;
    }

    let computed = if msg.remaining() > CHECKSUM_LENGTH {
        adler32(&msg.unread()[CHECKSUM_LENGTH..])
    } else {
        0
    };
    let received = msg.get_u32();
    if received != computed {
        msg.skip_bytes(-(CHECKSUM_LENGTH as i64));
        return false;
    }
    true
}
