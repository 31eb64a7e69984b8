//! End-to-end tests over localhost sockets
//!
//! These tests verify the end-to-end behavior of:
//! - Protocol selection from the first message (checksummed or not)
//! - Admission control (connection limit and per-IP connection rate)
//! - Strict per-connection write ordering and graceful close
//! - Read, write and packet-rate reaping of misbehaving peers
//! - The status, login and game protocols

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_test::{assert_err, assert_ok};

use realmcore_server::auth::{Account, AccountStore, MemoryAccountStore};
use realmcore_server::config::ServerConfig;
use realmcore_server::crypto::{adler32, XteaKey};
use realmcore_server::dispatch::Task;
use realmcore_server::error::{AuthError, RealmError, ServiceError};
use realmcore_server::net::{AdmissionPredicate, Connection, NetworkMessage, ServiceManager};
use realmcore_server::protocol::packets::{GameLoginRequest, LoginRequest};
use realmcore_server::protocol::status::{
    StatusSections, TAG_BASIC_INFO, TAG_PLAYERS, TAG_VERSION,
};
use realmcore_server::protocol::{
    GameProtocol, LoginProtocol, MessageCodec, Protocol, ProtocolCore, ProtocolFactory,
    ProtocolFlags, StatusProtocol,
};
use realmcore_server::state::ServerContext;
use uuid::Uuid;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const IO_TIMEOUT: Duration = Duration::from_secs(5);

// ============ Test protocols ============

/// Echoes the payload of the first message back and closes
struct EchoProtocol {
    core: ProtocolCore,
}

impl Protocol for EchoProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_recv_first_message(&self, msg: &mut NetworkMessage) {
        let payload = msg.unread().to_vec();
        self.core
            .with_output_buffer(payload.len(), |out| {
                out.add_bytes(&payload);
            })
            .unwrap();
        self.core.disconnect();
    }
}

impl ProtocolFactory for EchoProtocol {
    const PROTOCOL_IDENTIFIER: u8 = 0x01;
    const SERVER_SENDS_FIRST: bool = false;
    const USE_CHECKSUM: bool = true;
    const NAME: &'static str = "echo";

    fn create(connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            core: ProtocolCore::new(connection, ProtocolFlags::empty()),
        })
    }
}

/// Sends one frame per index, `count` read from the first message
struct BurstProtocol {
    core: ProtocolCore,
}

impl Protocol for BurstProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_recv_first_message(&self, msg: &mut NetworkMessage) {
        let count = msg.get_u32();
        for index in 0..count {
            let mut out = self.core.new_message().unwrap();
            out.add_u32(index);
            self.core.send(out).unwrap();
        }
    }
}

impl ProtocolFactory for BurstProtocol {
    const PROTOCOL_IDENTIFIER: u8 = 0x02;
    const SERVER_SENDS_FIRST: bool = false;
    const USE_CHECKSUM: bool = false;
    const NAME: &'static str = "burst";

    fn create(connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            core: ProtocolCore::new(connection, ProtocolFlags::empty()),
        })
    }
}

const WRITER_THREADS: u8 = 4;
const FRAMES_PER_THREAD: u32 = 50;

/// Sends frames from several threads at once
struct ConcurrentProtocol {
    core: ProtocolCore,
}

impl Protocol for ConcurrentProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_recv_first_message(&self, _msg: &mut NetworkMessage) {
        let connection = self.core.connection().unwrap();
        let pool = self.core.context().output_pool.clone();

        for thread in 0..WRITER_THREADS {
            let connection = Arc::clone(&connection);
            let pool = pool.clone();
            std::thread::spawn(move || {
                for seq in 0..FRAMES_PER_THREAD {
                    let mut out = pool.allocate().unwrap();
                    out.add_byte(thread);
                    out.add_u32(seq);
                    out.add_padding(64, 0xAB);
                    assert!(out.write_message_length());
                    assert!(connection.send(out));
                }
            });
        }
    }
}

impl ProtocolFactory for ConcurrentProtocol {
    const PROTOCOL_IDENTIFIER: u8 = 0x03;
    const SERVER_SENDS_FIRST: bool = false;
    const USE_CHECKSUM: bool = false;
    const NAME: &'static str = "concurrent";

    fn create(connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            core: ProtocolCore::new(connection, ProtocolFlags::empty()),
        })
    }
}

const DRAIN_FRAMES: u32 = 300;
const LARGE_PADDING: usize = 16_000;

/// Queues many large frames, then closes gracefully
struct DrainProtocol {
    core: ProtocolCore,
}

impl Protocol for DrainProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_recv_first_message(&self, _msg: &mut NetworkMessage) {
        for index in 0..DRAIN_FRAMES {
            let mut out = self.core.new_message().unwrap();
            out.add_u32(index);
            out.add_padding(LARGE_PADDING, 0x5A);
            self.core.send(out).unwrap();
        }
        self.core.disconnect();
    }
}

impl ProtocolFactory for DrainProtocol {
    const PROTOCOL_IDENTIFIER: u8 = 0x04;
    const SERVER_SENDS_FIRST: bool = false;
    const USE_CHECKSUM: bool = false;
    const NAME: &'static str = "drain";

    fn create(connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            core: ProtocolCore::new(connection, ProtocolFlags::empty()),
        })
    }
}

/// Sends large frames until the pool runs dry or the connection closes
struct FloodProtocol {
    core: ProtocolCore,
}

impl Protocol for FloodProtocol {
    fn core(&self) -> &ProtocolCore {
        &self.core
    }

    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn on_recv_first_message(&self, _msg: &mut NetworkMessage) {
        while let Ok(mut out) = self.core.new_message() {
            out.add_padding(LARGE_PADDING, 0x77);
            if self.core.send(out).is_err() {
                break;
            }
        }
    }
}

impl ProtocolFactory for FloodProtocol {
    const PROTOCOL_IDENTIFIER: u8 = 0x05;
    const SERVER_SENDS_FIRST: bool = false;
    const USE_CHECKSUM: bool = false;
    const NAME: &'static str = "flood";

    fn create(connection: &Arc<Connection>) -> Arc<Self> {
        Arc::new(Self {
            core: ProtocolCore::new(connection, ProtocolFlags::empty()),
        })
    }
}

/// Account store whose credential check waits until released
#[derive(Default)]
struct GatedAccountStore {
    inner: MemoryAccountStore,
    entered: AtomicBool,
    released: AtomicBool,
}

impl AccountStore for GatedAccountStore {
    fn find_by_name(&self, name: &str) -> Option<Account> {
        self.inner.find_by_name(name)
    }

    fn get(&self, id: &Uuid) -> Option<Account> {
        self.inner.get(id)
    }

    fn insert(&self, account: Account) -> Result<(), AuthError> {
        self.inner.insert(account)
    }

    fn count(&self) -> usize {
        self.inner.count()
    }

    fn authenticate(&self, name: &str, password: &str) -> Result<Account, AuthError> {
        self.entered.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + IO_TIMEOUT * 2;
        while !self.released.load(Ordering::SeqCst) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        self.inner.authenticate(name, password)
    }
}

// ============ Helpers ============

fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server_name = "Test Realm".to_string();
    config.network.read_timeout_secs = 5;
    config.network.write_timeout_secs = 5;
    config
}

fn allow_all() -> AdmissionPredicate {
    Arc::new(|_| true)
}

fn start_context(context: ServerContext) -> (Arc<ServerContext>, ServiceManager) {
    let context = Arc::new(context);
    context.start().unwrap();
    let services = ServiceManager::new(Arc::clone(&context));
    (context, services)
}

async fn stop(context: Arc<ServerContext>, services: ServiceManager) {
    services.stop().await;
    context.connections.close_all();
    context.shutdown();
}

fn test_accounts() -> Arc<MemoryAccountStore> {
    let accounts = Arc::new(MemoryAccountStore::new());
    accounts
        .register(
            "alice",
            "wonderland",
            vec!["Alice".to_string(), "Hatter".to_string()],
        )
        .unwrap();
    accounts
}

fn frame(body: &[u8]) -> Vec<u8> {
    let mut frame = (body.len() as u16).to_le_bytes().to_vec();
    frame.extend_from_slice(body);
    frame
}

async fn write_frame(stream: &mut TcpStream, body: &[u8]) {
    stream.write_all(&frame(body)).await.unwrap();
}

/// Read one frame body; `None` once the server has closed the socket
async fn read_frame(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; 2];
    match tokio::time::timeout(IO_TIMEOUT, stream.read_exact(&mut header)).await {
        Ok(Ok(_)) => {}
        Ok(Err(_)) => return None,
        Err(_) => panic!("timed out waiting for a frame"),
    }
    let mut body = vec![0u8; u16::from_le_bytes(header) as usize];
    tokio::time::timeout(IO_TIMEOUT, stream.read_exact(&mut body))
        .await
        .expect("timed out reading frame body")
        .ok()?;
    Some(body)
}

/// Whether the server closes the socket without sending anything
async fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 1];
    matches!(
        tokio::time::timeout(IO_TIMEOUT, stream.read(&mut buf)).await,
        Ok(Ok(0)) | Ok(Err(_))
    )
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + IO_TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn checksummed(payload: &[u8]) -> Vec<u8> {
    let mut body = adler32(payload).to_le_bytes().to_vec();
    body.extend_from_slice(payload);
    body
}

fn encrypted_codec(key: XteaKey) -> MessageCodec {
    let mut codec = MessageCodec::new(ProtocolFlags::CHECKSUM);
    codec.enable_encryption(key);
    codec
}

// ============ Protocol selection ============

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_first_message_selects_checksummed_protocol() {
    let (context, services) = start_context(ServerContext::new(test_config()));
    let addr = assert_ok!(services.add::<EchoProtocol>(LOCALHOST, 0, allow_all()).await);

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut client, &checksummed(b"\x01hello")).await;

    let reply = read_frame(&mut client).await.unwrap();
    assert_eq!(&reply[..], b"hello");
    assert!(closed_by_server(&mut client).await);

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_identifier_closes_connection() {
    let (context, services) = start_context(ServerContext::new(test_config()));
    let addr = assert_ok!(services.add::<EchoProtocol>(LOCALHOST, 0, allow_all()).await);

    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| context.connections.count() == 1).await);

    write_frame(&mut client, &checksummed(b"\x99hello")).await;
    assert!(closed_by_server(&mut client).await);
    assert!(wait_for(|| context.connections.count() == 0).await);

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_checksum_required_protocol_rejects_plain_message() {
    let (context, services) = start_context(ServerContext::new(test_config()));
    let addr = assert_ok!(services.add::<EchoProtocol>(LOCALHOST, 0, allow_all()).await);

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut client, b"\x01hello world").await;
    assert!(closed_by_server(&mut client).await);

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_socket_port_is_exclusive() {
    let (context, services) = start_context(ServerContext::new(test_config()));

    let login = assert_ok!(services.add::<LoginProtocol>(LOCALHOST, 0, allow_all()).await);
    assert_ok!(services.add::<StatusProtocol>(LOCALHOST, login.port(), allow_all()).await);
    let conflict = services
        .add::<GameProtocol>(LOCALHOST, login.port(), allow_all())
        .await;
    assert!(matches!(
        assert_err!(conflict),
        RealmError::Service(ServiceError::SingleSocketConflict { .. })
    ));

    let game = assert_ok!(services.add::<GameProtocol>(LOCALHOST, 0, allow_all()).await);
    let shared = services
        .add::<StatusProtocol>(LOCALHOST, game.port(), allow_all())
        .await;
    assert_err!(shared);

    stop(context, services).await;
}

// ============ Admission ============

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit() {
    let mut config = test_config();
    config.network.max_connections = 2;
    let (context, services) = start_context(ServerContext::new(config));
    let addr = assert_ok!(services.add::<EchoProtocol>(LOCALHOST, 0, allow_all()).await);

    let first = TcpStream::connect(addr).await.unwrap();
    let _second = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| context.connections.count() == 2).await);

    let mut third = TcpStream::connect(addr).await.unwrap();
    assert!(closed_by_server(&mut third).await);
    assert_eq!(context.connections.count(), 2);

    // Releasing one slot lets the next connection in
    drop(first);
    assert!(wait_for(|| context.connections.count() == 1).await);

    let _fourth = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| context.connections.count() == 2).await);

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_rate_blocks_source() {
    let mut config = test_config();
    config.security.max_connections_per_second = 10;
    config.security.connection_block_secs = 1;
    let (context, services) = start_context(ServerContext::new(config));

    let admit: AdmissionPredicate = {
        let context = Arc::clone(&context);
        Arc::new(move |ip| context.bans.admit(ip))
    };
    let addr = assert_ok!(services.add::<EchoProtocol>(LOCALHOST, 0, admit).await);

    let mut clients = Vec::new();
    for _ in 0..20 {
        clients.push(TcpStream::connect(addr).await.unwrap());
    }
    assert!(wait_for(|| context.connections.count() == 10).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(context.connections.count(), 10);

    for client in clients.iter_mut().skip(10) {
        assert!(closed_by_server(client).await);
    }

    // After the cooldown the source is admitted again
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let _late = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| context.connections.count() == 11).await);

    stop(context, services).await;
}

// ============ Write ordering ============

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_frames_arrive_in_send_order() {
    let (context, services) = start_context(ServerContext::new(test_config()));
    let addr = assert_ok!(services.add::<BurstProtocol>(LOCALHOST, 0, allow_all()).await);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut request = vec![0x02];
    request.extend_from_slice(&200u32.to_le_bytes());
    write_frame(&mut client, &request).await;

    for expected in 0..200u32 {
        let body = read_frame(&mut client).await.unwrap();
        assert_eq!(body.len(), 4);
        assert_eq!(u32::from_le_bytes([body[0], body[1], body[2], body[3]]), expected);
    }

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_senders_do_not_interleave() {
    let (context, services) = start_context(ServerContext::new(test_config()));
    let addr = assert_ok!(services.add::<ConcurrentProtocol>(LOCALHOST, 0, allow_all()).await);

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut client, &[0x03, 0x00]).await;

    let mut next_seq = vec![0u32; WRITER_THREADS as usize];
    for _ in 0..(WRITER_THREADS as u32 * FRAMES_PER_THREAD) {
        let body = read_frame(&mut client).await.unwrap();
        assert_eq!(body.len(), 69);
        assert!(body[5..].iter().all(|&b| b == 0xAB));

        let thread = body[0] as usize;
        let seq = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
        assert_eq!(seq, next_seq[thread]);
        next_seq[thread] += 1;
    }
    assert!(next_seq.iter().all(|&n| n == FRAMES_PER_THREAD));

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_close_flushes_queue_despite_more_input() {
    let (context, services) = start_context(ServerContext::new(test_config()));
    let addr = assert_ok!(services.add::<DrainProtocol>(LOCALHOST, 0, allow_all()).await);

    // A second frame arrives while the queued output is still being written
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut frames = frame(&[0x04]);
    frames.extend_from_slice(&frame(&[0x00]));
    client.write_all(&frames).await.unwrap();

    for expected in 0..DRAIN_FRAMES {
        let body = read_frame(&mut client).await.unwrap();
        assert_eq!(body.len(), 4 + LARGE_PADDING);
        assert_eq!(u32::from_le_bytes([body[0], body[1], body[2], body[3]]), expected);
    }
    assert!(read_frame(&mut client).await.is_none());
    assert!(wait_for(|| context.connections.count() == 0).await);

    stop(context, services).await;
}

// ============ Reaping ============

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_connection_read_timeout() {
    let mut config = test_config();
    config.network.read_timeout_secs = 1;
    let (context, services) = start_context(ServerContext::new(config));
    let addr = assert_ok!(services.add::<EchoProtocol>(LOCALHOST, 0, allow_all()).await);

    let started = Instant::now();
    let mut client = TcpStream::connect(addr).await.unwrap();
    assert!(wait_for(|| context.connections.count() == 1).await);

    assert!(closed_by_server(&mut client).await);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(wait_for(|| context.connections.count() == 0).await);

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_reader_write_timeout() {
    let mut config = test_config();
    config.network.read_timeout_secs = 30;
    config.network.write_timeout_secs = 1;
    let (context, services) = start_context(ServerContext::new(config));
    let addr = assert_ok!(services.add::<FloodProtocol>(LOCALHOST, 0, allow_all()).await);

    // The client never reads, so the socket buffers fill up
    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut client, &[0x05]).await;
    assert!(wait_for(|| context.connections.count() == 1).await);

    assert!(wait_for(|| context.connections.count() == 0).await);
    assert!(wait_for(|| context.output_pool.outstanding() == 0).await);

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_packet_rate_limit_closes_connection() {
    let mut config = test_config();
    config.network.max_packets_per_second = 5;
    let (context, services) = start_context(ServerContext::new(config));
    let addr = assert_ok!(services.add::<BurstProtocol>(LOCALHOST, 0, allow_all()).await);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut frames = frame(&[0x02, 0, 0, 0, 0]);
    for _ in 0..3 {
        frames.extend_from_slice(&frame(&[0x00]));
    }
    client.write_all(&frames).await.unwrap();

    // Four packets stay under the ceiling
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(context.connections.count(), 1);

    let burst: Vec<u8> = (0..10).flat_map(|_| frame(&[0x00])).collect();
    client.write_all(&burst).await.unwrap();

    assert!(closed_by_server(&mut client).await);
    assert!(wait_for(|| context.connections.count() == 0).await);

    stop(context, services).await;
}

// ============ Status ============

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_info_request() {
    let (context, services) = start_context(ServerContext::new(test_config()));
    let addr = assert_ok!(services.add::<LoginProtocol>(LOCALHOST, 0, allow_all()).await);
    assert_ok!(services.add::<StatusProtocol>(LOCALHOST, addr.port(), allow_all()).await);

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut client, b"\xFF\xFF\x04\x00info").await;

    let body = read_frame(&mut client).await.unwrap();
    let mut reply = NetworkMessage::from_body(&body);
    let status: serde_json::Value = serde_json::from_str(&reply.get_string()).unwrap();
    assert_eq!(status["name"], "Test Realm");
    assert_eq!(status["version"], realmcore_server::VERSION);
    assert!(status["online"].as_u64().unwrap() >= 1);
    assert!(closed_by_server(&mut client).await);

    // A second request inside the interval gets no reply
    let mut again = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut again, b"\xFF\xFF\x04\x00info").await;
    assert!(closed_by_server(&mut again).await);

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_sections_request() {
    let mut config = test_config();
    config.network.max_connections = 50;
    config.public_ip = "10.1.2.3".to_string();
    let login_port = config.login_port;
    let (context, services) = start_context(ServerContext::new(config));
    let addr = assert_ok!(services.add::<StatusProtocol>(LOCALHOST, 0, allow_all()).await);

    let sections = StatusSections::BASIC_INFO | StatusSections::PLAYERS | StatusSections::VERSION;
    let mut request = vec![0xFF, 0x01];
    request.extend_from_slice(&sections.bits().to_le_bytes());

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut client, &request).await;

    let body = read_frame(&mut client).await.unwrap();
    let mut reply = NetworkMessage::from_body(&body);
    assert_eq!(reply.get_byte(), TAG_BASIC_INFO);
    assert_eq!(reply.get_string(), "Test Realm");
    assert_eq!(reply.get_string(), "10.1.2.3");
    assert_eq!(reply.get_u16(), login_port);
    assert_eq!(reply.get_byte(), TAG_PLAYERS);
    assert_eq!(reply.get_u32(), 1);
    assert_eq!(reply.get_u32(), 50);
    assert_eq!(reply.get_byte(), TAG_VERSION);
    assert_eq!(reply.get_string(), realmcore_server::VERSION);
    assert_eq!(reply.remaining(), 0);

    stop(context, services).await;
}

// ============ Login ============

fn login_frame(key: XteaKey, version: u16, password: &str) -> Vec<u8> {
    let request = LoginRequest {
        os: 2,
        version,
        key,
        account: "Alice".to_string(),
        password: password.to_string(),
    };
    let mut msg = NetworkMessage::new();
    msg.add_byte(LoginProtocol::PROTOCOL_IDENTIFIER);
    request.encode(&mut msg);
    MessageCodec::new(ProtocolFlags::CHECKSUM)
        .encode_frame(msg.body())
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_sends_character_list() {
    let config = test_config();
    let version = config.network.client_version_max;
    let game_port = config.game_port;
    let context = ServerContext::builder(config).accounts(test_accounts()).build();
    let (context, services) = start_context(context);
    let addr = assert_ok!(services.add::<LoginProtocol>(LOCALHOST, 0, allow_all()).await);

    let key = XteaKey::new([11, 22, 33, 44]);
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&login_frame(key, version, "wonderland"))
        .await
        .unwrap();

    let body = read_frame(&mut client).await.unwrap();
    let mut msg = assert_ok!(encrypted_codec(key).decode_frame(&body));

    assert_eq!(msg.get_byte(), 0x14);
    assert_eq!(msg.get_string(), context.config.motd);
    assert_eq!(msg.get_byte(), 0x64);
    assert_eq!(msg.get_byte(), 2);
    assert_eq!(msg.get_string(), "Alice");
    assert_eq!(msg.get_string(), "Test Realm");
    assert_eq!(msg.get_u32().to_le_bytes(), [127, 0, 0, 1]);
    assert_eq!(msg.get_u16(), game_port);
    assert_eq!(msg.get_string(), "Hatter");
    assert!(!msg.is_overrun());

    assert!(read_frame(&mut client).await.is_none());

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_wrong_password() {
    let config = test_config();
    let version = config.network.client_version_min;
    let context = ServerContext::builder(config).accounts(test_accounts()).build();
    let (context, services) = start_context(context);
    let addr = assert_ok!(services.add::<LoginProtocol>(LOCALHOST, 0, allow_all()).await);

    let key = XteaKey::new([5, 6, 7, 8]);
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&login_frame(key, version, "looking-glass"))
        .await
        .unwrap();

    let body = read_frame(&mut client).await.unwrap();
    let mut msg = assert_ok!(encrypted_codec(key).decode_frame(&body));
    assert_eq!(msg.get_byte(), 0x0B);
    assert_eq!(msg.get_string(), "Account name or password is not correct.");
    assert!(read_frame(&mut client).await.is_none());

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_login_unsupported_version() {
    let config = test_config();
    let context = ServerContext::builder(config).accounts(test_accounts()).build();
    let (context, services) = start_context(context);
    let addr = assert_ok!(services.add::<LoginProtocol>(LOCALHOST, 0, allow_all()).await);

    let key = XteaKey::new([1, 1, 2, 3]);
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&login_frame(key, 1, "wonderland")).await.unwrap();

    let body = read_frame(&mut client).await.unwrap();
    let mut msg = assert_ok!(encrypted_codec(key).decode_frame(&body));
    assert_eq!(msg.get_byte(), 0x0B);
    assert_eq!(msg.get_string(), "Your client version is not supported.");

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_credential_check_leaves_dispatcher_free() {
    let config = test_config();
    let version = config.network.client_version_max;
    let accounts = Arc::new(GatedAccountStore::default());
    accounts
        .inner
        .register("alice", "wonderland", vec!["Alice".to_string()])
        .unwrap();
    let context = ServerContext::builder(config)
        .accounts(accounts.clone())
        .build();
    let (context, services) = start_context(context);
    let addr = assert_ok!(services.add::<LoginProtocol>(LOCALHOST, 0, allow_all()).await);

    let key = XteaKey::new([3, 1, 4, 1]);
    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(&login_frame(key, version, "wonderland"))
        .await
        .unwrap();
    assert!(wait_for(|| accounts.entered.load(Ordering::SeqCst)).await);

    // Other work still runs while the password is being checked
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    assert_ok!(context
        .dispatcher
        .add(Task::new(move || flag.store(true, Ordering::SeqCst)), false));
    assert!(wait_for(|| ran.load(Ordering::SeqCst)).await);

    accounts.released.store(true, Ordering::SeqCst);
    let body = read_frame(&mut client).await.unwrap();
    let mut msg = assert_ok!(encrypted_codec(key).decode_frame(&body));
    assert_eq!(msg.get_byte(), 0x14);
    assert!(read_frame(&mut client).await.is_none());

    stop(context, services).await;
}

// ============ Game ============

async fn read_challenge(client: &mut TcpStream) -> (u32, u8) {
    let body = read_frame(client).await.unwrap();
    let mut msg = assert_ok!(MessageCodec::new(ProtocolFlags::CHECKSUM).decode_frame(&body));
    assert_eq!(msg.get_byte(), 0x1F);
    (msg.get_u32(), msg.get_byte())
}

fn game_login_frame(key: XteaKey, version: u16, timestamp: u32, random: u8) -> Vec<u8> {
    let request = GameLoginRequest {
        os: 2,
        version,
        key,
        account: "alice".to_string(),
        character: "hatter".to_string(),
        password: "wonderland".to_string(),
        challenge_timestamp: timestamp,
        challenge_random: random,
    };
    let mut msg = NetworkMessage::new();
    msg.add_byte(GameProtocol::PROTOCOL_IDENTIFIER);
    request.encode(&mut msg);
    MessageCodec::new(ProtocolFlags::CHECKSUM)
        .encode_frame(msg.body())
        .unwrap()
}

async fn game_server() -> (Arc<ServerContext>, ServiceManager, SocketAddr, u16) {
    let config = test_config();
    let version = config.network.client_version_max;
    let context = ServerContext::builder(config).accounts(test_accounts()).build();
    let (context, services) = start_context(context);
    let addr = assert_ok!(services.add::<GameProtocol>(LOCALHOST, 0, allow_all()).await);
    (context, services, addr, version)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_game_login_and_ping() {
    let (context, services, addr, version) = game_server().await;
    let key = XteaKey::new([9, 8, 7, 6]);
    let codec = encrypted_codec(key);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (timestamp, random) = read_challenge(&mut client).await;
    client
        .write_all(&game_login_frame(key, version, timestamp, random))
        .await
        .unwrap();

    let body = read_frame(&mut client).await.unwrap();
    let mut msg = assert_ok!(codec.decode_frame(&body));
    assert_eq!(msg.get_byte(), 0x0A);
    let _player_id = msg.get_u32();
    assert_eq!(msg.get_u16(), 50);

    // Keep-alive is armed once logged in
    assert!(wait_for(|| context.scheduler.pending() == 1).await);

    client.write_all(&codec.encode_frame(&[0x1D]).unwrap()).await.unwrap();
    let body = read_frame(&mut client).await.unwrap();
    let mut msg = assert_ok!(codec.decode_frame(&body));
    assert_eq!(msg.get_byte(), 0x1E);

    // Logout closes the connection and cancels the keep-alive
    client.write_all(&codec.encode_frame(&[0x14]).unwrap()).await.unwrap();
    assert!(read_frame(&mut client).await.is_none());
    assert!(wait_for(|| context.scheduler.pending() == 0).await);
    assert!(wait_for(|| context.connections.count() == 0).await);

    stop(context, services).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_game_challenge_mismatch_closes() {
    let (context, services, addr, version) = game_server().await;
    let key = XteaKey::new([1, 2, 3, 4]);

    let mut client = TcpStream::connect(addr).await.unwrap();
    let (timestamp, random) = read_challenge(&mut client).await;
    client
        .write_all(&game_login_frame(key, version, timestamp, random.wrapping_add(1)))
        .await
        .unwrap();

    assert!(closed_by_server(&mut client).await);
    assert_eq!(context.scheduler.pending(), 0);

    stop(context, services).await;
}
