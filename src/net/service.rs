//! Listening services
//!
//! A [`ServicePort`] owns one listening socket and the list of services
//! sharing it. Clients pick a service with the identifier byte of their
//! first message; a server-speaks-first service gets no such byte and so
//! must have its port to itself. The [`ServiceManager`] maps bind
//! addresses to ports and runs their accept loops.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connection::Connection;
use super::message::NetworkMessage;
use crate::error::{Result, ServiceError};
use crate::protocol::{Protocol, ProtocolFactory};
use crate::state::ServerContext;

/// Decides whether a peer may connect at all
pub type AdmissionPredicate = Arc<dyn Fn(IpAddr) -> bool + Send + Sync>;

/// A protocol variant registered on a port
pub trait Service: Send + Sync {
    fn is_single_socket(&self) -> bool;
    fn is_checksummed(&self) -> bool;
    fn protocol_identifier(&self) -> u8;
    fn protocol_name(&self) -> &'static str;
    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol>;
}

/// [`Service`] for a concrete protocol type
pub struct ServiceDescriptor<P> {
    _protocol: PhantomData<fn() -> P>,
}

impl<P> ServiceDescriptor<P> {
    pub fn new() -> Self {
        Self {
            _protocol: PhantomData,
        }
    }
}

impl<P> Default for ServiceDescriptor<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProtocolFactory> Service for ServiceDescriptor<P> {
    fn is_single_socket(&self) -> bool {
        P::SERVER_SENDS_FIRST
    }

    fn is_checksummed(&self) -> bool {
        P::USE_CHECKSUM
    }

    fn protocol_identifier(&self) -> u8 {
        P::PROTOCOL_IDENTIFIER
    }

    fn protocol_name(&self) -> &'static str {
        P::NAME
    }

    fn make_protocol(&self, connection: &Arc<Connection>) -> Arc<dyn Protocol> {
        P::create(connection)
    }
}

/// One listening address and the services behind it
pub struct ServicePort {
    address: SocketAddr,
    services: RwLock<Vec<Arc<dyn Service>>>,
    admit: AdmissionPredicate,
}

impl ServicePort {
    pub fn new(address: SocketAddr, admit: AdmissionPredicate) -> Self {
        Self {
            address,
            services: RwLock::new(Vec::new()),
            admit,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Register a service; refused if either side needs the port exclusively
    pub fn add_service(&self, service: Arc<dyn Service>) -> std::result::Result<(), ServiceError> {
        let mut services = self.services.write();
        if let Some(existing) = services.first() {
            if existing.is_single_socket() || service.is_single_socket() {
                return Err(ServiceError::SingleSocketConflict {
                    port: self.address.port(),
                });
            }
        }
        services.push(service);
        Ok(())
    }

    /// Whether the port is claimed by a server-speaks-first service
    pub fn is_single_socket(&self) -> bool {
        self.services
            .read()
            .first()
            .is_some_and(|s| s.is_single_socket())
    }

    /// Names of the hosted protocols, for logging
    pub fn protocol_names(&self) -> String {
        self.services
            .read()
            .iter()
            .map(|s| s.protocol_name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Pick a service for a first message and build its protocol
    ///
    /// Consumes the identifier byte. A service matches on identifier, and
    /// only if the message carried a checksum when the service requires one.
    pub fn make_protocol(
        &self,
        checksummed: bool,
        msg: &mut NetworkMessage,
        connection: &Arc<Connection>,
    ) -> Option<Arc<dyn Protocol>> {
        let identifier = msg.get_byte();
        let service = self
            .services
            .read()
            .iter()
            .find(|s| {
                s.protocol_identifier() == identifier && (checksummed || !s.is_checksummed())
            })
            .cloned();

        match service {
            Some(service) => {
                debug!(
                    connection_id = connection.id(),
                    protocol = service.protocol_name(),
                    "Protocol selected"
                );
                Some(service.make_protocol(connection))
            }
            None => {
                warn!(
                    connection_id = connection.id(),
                    address = %connection.peer_addr(),
                    identifier,
                    checksummed,
                    "No service for protocol identifier"
                );
                None
            }
        }
    }

    /// Admission, registration and protocol attachment for a new socket
    fn on_accept(self: &Arc<Self>, context: &Arc<ServerContext>, stream: TcpStream, peer: SocketAddr) {
        if !(self.admit)(peer.ip()) {
            debug!(address = %peer, "Connection rejected by admission control");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(address = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let Some(connection) = context.connections.create_connection(context, stream, peer, self) else {
            return;
        };

        let single = {
            let services = self.services.read();
            services.first().filter(|s| s.is_single_socket()).cloned()
        };
        let protocol = single.map(|service| service.make_protocol(&connection));
        connection.accept(protocol);
    }

    async fn accept_loop(
        self: Arc<Self>,
        context: Arc<ServerContext>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(address = %self.address, protocols = %self.protocol_names(), "Listening");

        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => self.on_accept(&context, stream, peer),
                    Err(e) => {
                        error!(address = %self.address, error = %e, "Accept failed");
                        // Usually descriptor exhaustion; back off briefly
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.recv() => break,
            }
        }

        info!(address = %self.address, "Stopped listening");
    }
}

impl fmt::Debug for ServicePort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServicePort")
            .field("address", &self.address)
            .field("protocols", &self.protocol_names())
            .finish()
    }
}

/// Owner of all listening ports
pub struct ServiceManager {
    context: Arc<ServerContext>,
    ports: Mutex<HashMap<SocketAddr, Arc<ServicePort>>>,
    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl ServiceManager {
    pub fn new(context: Arc<ServerContext>) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            context,
            ports: Mutex::new(HashMap::new()),
            accept_tasks: Mutex::new(Vec::new()),
            shutdown,
            running: AtomicBool::new(true),
        }
    }

    /// Register protocol `P` on `ip:port`, opening the port if needed
    ///
    /// Port 0 binds an ephemeral port. Returns the bound address, which can
    /// be passed back in to add more services to the same port. The
    /// admission predicate of the first registration applies to the port.
    pub async fn add<P: ProtocolFactory>(
        &self,
        ip: IpAddr,
        port: u16,
        admit: AdmissionPredicate,
    ) -> Result<SocketAddr> {
        if !self.is_running() {
            return Err(ServiceError::NotRunning.into());
        }

        let requested = SocketAddr::new(ip, port);
        let service: Arc<dyn Service> = Arc::new(ServiceDescriptor::<P>::new());

        if port != 0 {
            if let Some(existing) = self.ports.lock().get(&requested).cloned() {
                existing.add_service(service)?;
                info!(address = %requested, protocol = P::NAME, "Service added to existing port");
                return Ok(requested);
            }
        }

        let listener = TcpListener::bind(requested)
            .await
            .map_err(|source| ServiceError::Bind {
                address: requested,
                source,
            })?;
        let address = listener.local_addr()?;

        let service_port = Arc::new(ServicePort::new(address, admit));
        service_port.add_service(service)?;
        self.ports.lock().insert(address, Arc::clone(&service_port));

        let task = tokio::spawn(service_port.accept_loop(
            Arc::clone(&self.context),
            listener,
            self.shutdown.subscribe(),
        ));
        self.accept_tasks.lock().push(task);

        info!(address = %address, protocol = P::NAME, "Service bound");
        Ok(address)
    }

    /// Stop accepting on every port
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown.send(());
        let tasks = std::mem::take(&mut *self.accept_tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!(error = %e, "Accept loop terminated abnormally");
                }
            }
        }

        self.ports.lock().clear();
        info!("Service manager stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound addresses, for diagnostics
    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.ports.lock().keys().copied().collect()
    }

    pub fn port(&self, address: &SocketAddr) -> Option<Arc<ServicePort>> {
        self.ports.lock().get(address).cloned()
    }
}
