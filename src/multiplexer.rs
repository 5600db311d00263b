use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::Receiver;
use mio::net::TcpListener;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::config::ProxyConfig;
use crate::connection_table::ConnectionTable;
use crate::delayed_item::DelayedItem;
use crate::delivery_queue::DeliveryQueue;
use crate::endpoint::Endpoint;
use crate::error::ProxyError;
use crate::events::{EventSink, ProxyEvent};
use crate::relay::Relay;

/// Size of the buffer for a single read: every read produces one chunk of at most this size.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

const LISTENER: Token = Token(0);

const EVENTS_CAPACITY: usize = 1024;

/// The proxy's control thread: accepts connections, pairs each of them with a new connection to the remote endpoint,
/// and hands everything it reads to the relay thread.
pub struct Proxy {
    config: ProxyConfig,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    /// Sockets whose read direction is registered with `poll`.
    endpoints: HashMap<Token, Arc<Endpoint>>,
    table: ConnectionTable,
    queue: Arc<DeliveryQueue<DelayedItem>>,
    events: EventSink,
    next_token: usize,
}

impl Proxy {
    /// Binds the listening socket. All failures that prevent the proxy from running at all are reported here.
    pub fn bind(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let listen_addr = config.listen_addr();
        let addr = listen_addr.to_socket_addrs()?
            .next()
            .ok_or(ProxyError::Resolve(listen_addr))?;
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        info!("Accepting requests on {}", local_addr);
        Ok(Self {
            config: config.clone(),
            poll,
            listener,
            local_addr,
            endpoints: HashMap::new(),
            table: ConnectionTable::new(),
            queue: Arc::new(DeliveryQueue::new()),
            events: EventSink::default(),
            next_token: LISTENER.0 + 1,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscribe(&mut self) -> Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    /// Starts the relay thread and processes events until the process terminates. Only returns if the relay thread
    /// cannot be started.
    pub fn run(mut self) -> Result<(), ProxyError> {
        Relay::new(Arc::clone(&self.queue), self.events.clone()).spawn()?;
        if self.config.delay.as_nanos() > 0 {
            info!("Applying a delay of {} to all communication", humantime::format_duration(self.config.delay));
        }
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() != ErrorKind::Interrupted {
                    warn!("Exception during selection: {}", e);
                }
                continue;
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    token => self.read_all(token),
                }
            }
        }
    }

    // Readiness is edge-triggered: keep accepting until the listener has no more pending connections.
    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    // SAFETY: the descriptor was just released by the mio stream and is owned by nothing else.
                    let stream = unsafe { TcpStream::from_raw_fd(stream.into_raw_fd()) };
                    self.handle_connection(stream, addr);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("Unable to accept connection: {}", e);
                    self.rearm_listener();
                    break;
                }
            }
        }
    }

    // Connections still pending after a failed accept would otherwise not be reported again until a new one arrives.
    fn rearm_listener(&mut self) {
        if let Err(e) = self.poll.registry().reregister(&mut self.listener, LISTENER, Interest::READABLE) {
            warn!("Unable to re-register listener: {}", e);
        }
    }

    /// Connects to the remote host on behalf of the new client. If that is not successful, the client's socket is
    /// closed and nothing is registered.
    fn handle_connection(&mut self, inbound: TcpStream, addr: SocketAddr) {
        info!("Got a request from {}", addr);
        self.events.emit(ProxyEvent::Accepted(Some(addr)));
        let client_token = self.next_token();
        let client = match Endpoint::new(inbound, client_token) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                warn!("Unable to set up connection from {}: {}", addr, e);
                return;
            }
        };
        debug!("Connecting to remote host {}", self.config.remote_addr());
        let remote = match self.connect_remote() {
            Ok(outbound) => {
                let remote_token = self.next_token();
                Endpoint::new(outbound, remote_token).map(Arc::new)
            }
            Err(e) => Err(e),
        };
        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Error connecting to remote host {}: {}", self.config.remote_addr(), e);
                warn!("Closing {}", client);
                self.events.emit(ProxyEvent::ConnectFailed(Some(addr)));
                return;
            }
        };
        info!("Connected to remote host {}", self.config.remote_addr());

        if let Err(e) = self.register(&client).and_then(|_| self.register(&remote)) {
            warn!("Unable to register connection {} <-> {}: {}", client, remote, e);
            self.deregister(&client);
            self.deregister(&remote);
            return;
        }
        self.table.insert_pair(&client, &remote);
        self.events.emit(ProxyEvent::Paired { client: client.token(), remote: remote.token() });
        self.endpoints.insert(client.token(), client);
        self.endpoints.insert(remote.token(), remote);
    }

    fn connect_remote(&self) -> io::Result<TcpStream> {
        let mut last_error = None;
        for addr in self.config.remote_addr().to_socket_addrs()? {
            let result = match self.config.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match result {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("Unable to connect to {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            io::Error::new(ErrorKind::NotFound, "remote host did not resolve to any address")
        }))
    }

    /// Reads everything that is currently available on the socket, one chunk per read. Each chunk is queued for
    /// the paired socket. End of stream, a read error, or a missing pair all end this socket's read direction.
    fn read_all(&mut self, token: Token) {
        let endpoint = match self.endpoints.get(&token) {
            Some(endpoint) => Arc::clone(endpoint),
            // already closed while handling an earlier event of the same wake-up.
            None => return,
        };
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        loop {
            match endpoint.read(&mut buffer) {
                Ok(0) => {
                    debug!("Read end of stream from {}", endpoint);
                    self.close_read_side(&endpoint);
                    return;
                }
                Ok(len) => match self.table.peer_of(token) {
                    Some(peer) => {
                        debug!("Read {} bytes from {}", len, endpoint);
                        let eligible_at = self.eligible_from_now();
                        let item = DelayedItem::data(buffer[..len].to_vec(), Arc::clone(peer), eligible_at);
                        self.queue.push(item);
                        self.events.emit(ProxyEvent::Enqueued { from: token, bytes: len });
                    }
                    None => {
                        debug!("Read {} bytes from {}, but no pair is known. Closing", len, endpoint);
                        self.close_read_side(&endpoint);
                        return;
                    }
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("Exception reading from {}: {}. Closing", endpoint, e);
                    self.close_read_side(&endpoint);
                    return;
                }
            }
        }
    }

    // The close sentinel is queued behind all chunks already read from this socket, so the peer's output is only
    // shut down once those have been written.
    fn close_read_side(&mut self, endpoint: &Arc<Endpoint>) {
        let token = endpoint.token();
        self.deregister(endpoint);
        endpoint.close_input();
        self.endpoints.remove(&token);
        let peer = self.table.remove(token);
        self.queue.push(DelayedItem::close(peer, self.eligible_from_now()));
        self.events.emit(ProxyEvent::ReadClosed(token));
    }

    // Stamped right after the read that produced the item, so every chunk spends at least the full delay queued.
    fn eligible_from_now(&self) -> Instant {
        Instant::now() + self.config.delay
    }

    fn register(&self, endpoint: &Endpoint) -> io::Result<()> {
        let fd = endpoint.raw_fd();
        self.poll.registry().register(&mut SourceFd(&fd), endpoint.token(), Interest::READABLE)
    }

    fn deregister(&self, endpoint: &Endpoint) {
        let fd = endpoint.raw_fd();
        if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!("Unable to deregister {}: {}", endpoint, e);
        }
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }
}
