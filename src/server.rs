//! The server: accept loop, handshake driving and the connection registry.

use std::{
    collections::HashMap,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    connection::Connection,
    error::{Error, Result},
    handshake,
    sync,
};

/// Callback invoked after a connection completes its opening handshake.
pub type ConnectHandler = dyn Fn(&Arc<Connection>) + Send + Sync;

/// Callback invoked after a clean disconnect.
pub type DisconnectHandler = dyn Fn(&Arc<Connection>) + Send + Sync;

/// Callback invoked when a connection or the accept path fails. The
/// connection is absent for failures before a connection existed.
pub type ErrorHandler = dyn Fn(Option<&Arc<Connection>>, &Error) + Send + Sync;

/// Engine limits and deadlines.
///
/// ```
/// use std::time::Duration;
/// # use weft::ServerConfig;
/// let config = ServerConfig::default()
///     .max_message_size(64 * 1024)
///     .read_timeout(Duration::from_secs(60));
/// ```
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub struct ServerConfig {
    /// The maximum size of a reassembled message. A peer exceeding it is
    /// closed with status 1009.
    ///
    /// The default value is 32 KiB.
    pub max_message_size: usize,
    /// The maximum total wire size of a single frame, header included. A
    /// peer declaring a bigger frame is closed with status 1009 before
    /// the payload is buffered.
    ///
    /// The default value is 16 KiB.
    pub max_frame_size: usize,
    /// TCP deadline for each read of the read loop. A connection whose
    /// peer stays silent longer is torn down through the error path.
    ///
    /// The default value is 120 seconds.
    pub read_timeout: Duration,
    /// TCP deadline for each outbound write.
    ///
    /// The default value is 10 seconds.
    pub write_timeout: Duration,
    /// Deadline for the whole opening handshake.
    ///
    /// The default value is 30 seconds.
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 32 * 1024,
            max_frame_size: 16 * 1024,
            read_timeout: Duration::from_secs(120),
            write_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerConfig {
    /// Sets [`Self::max_message_size`].
    pub fn max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    /// Sets [`Self::max_frame_size`].
    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Sets [`Self::read_timeout`].
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    /// Sets [`Self::write_timeout`].
    pub fn write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Sets [`Self::handshake_timeout`].
    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }
}

/// A WebSocket server.
///
/// Owns the set of live connections and the lifecycle callbacks. Cloning
/// is cheap and yields another handle to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

pub(crate) struct ServerInner {
    config: ServerConfig,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    on_connect: RwLock<Option<Arc<ConnectHandler>>>,
    on_disconnect: RwLock<Option<Arc<DisconnectHandler>>>,
    on_error: RwLock<Option<Arc<ErrorHandler>>>,
}

impl Server {
    /// Creates a server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a server with the given configuration.
    pub fn with_config(config: ServerConfig) -> Self {
        Server {
            inner: Arc::new(ServerInner {
                config,
                connections: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                on_connect: RwLock::new(None),
                on_disconnect: RwLock::new(None),
                on_error: RwLock::new(None),
            }),
        }
    }

    /// Installs the callback invoked for every new connection.
    ///
    /// This is the place to install per-connection callbacks with
    /// [`Connection::on_message`] and [`Connection::on_close`].
    pub fn on_connect<F>(&self, handler: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        *sync::write(&self.inner.on_connect) = Some(Arc::new(handler));
    }

    /// Installs the callback invoked after every clean disconnect.
    pub fn on_disconnect<F>(&self, handler: F)
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        *sync::write(&self.inner.on_disconnect) = Some(Arc::new(handler));
    }

    /// Installs the callback invoked when a connection fails uncleanly,
    /// or when accepting or upgrading a new connection fails.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(Option<&Arc<Connection>>, &Error) + Send + Sync + 'static,
    {
        *sync::write(&self.inner.on_error) = Some(Arc::new(handler));
    }

    /// The number of live connections.
    pub fn connection_count(&self) -> usize {
        sync::read(&self.inner.connections).len()
    }

    /// Binds `addr` and serves WebSocket connections until the listener
    /// fails. Blocks the calling thread.
    pub fn listen<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let listener = TcpListener::bind(addr)?;
        self.serve(listener)
    }

    /// Serves WebSocket connections from an already bound listener.
    /// Blocks the calling thread.
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("listening on {addr}");
        }

        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => {
                    debug!("accepted TCP connection from {peer_addr}");
                    let inner = Arc::clone(&self.inner);
                    thread::spawn(move || inner.handle_connection(stream, peer_addr));
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                    self.inner.notify_error(None, &Error::Io(err));
                }
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerInner {
    /// Upgrades one accepted stream and runs its read loop. Runs on the
    /// connection's own thread.
    fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer_addr: SocketAddr) {
        // The whole opening handshake runs under its own deadline.
        let handshake_deadline = Some(self.config.handshake_timeout);
        if let Err(err) = stream
            .set_read_timeout(handshake_deadline)
            .and_then(|()| stream.set_write_timeout(handshake_deadline))
        {
            self.notify_error(None, &Error::Io(err));
            return;
        }

        let leftover = match handshake::server::upgrade(&mut stream) {
            Ok(leftover) => leftover,
            Err(err) => {
                // Dropping the stream closes it; no connection is created.
                debug!("handshake with {peer_addr} failed: {err}");
                self.notify_error(None, &err);
                return;
            }
        };

        // Handshake done; switch to the configured per-operation deadlines.
        if let Err(err) = stream
            .set_read_timeout(Some(self.config.read_timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.config.write_timeout)))
        {
            self.notify_error(None, &Error::Io(err));
            return;
        }

        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(err) => {
                self.notify_error(None, &Error::Io(err));
                return;
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::new(id, peer_addr, writer, Arc::downgrade(&self), self.config);

        sync::write(&self.connections).insert(id, Arc::clone(&conn));
        info!("connection {id} established from {peer_addr}");

        // The slot lock is released before the callback runs.
        let handler = sync::read(&self.on_connect).clone();
        if let Some(handler) = handler {
            handler(&conn);
        }

        conn.run_read_loop(stream, leftover);
        debug!("connection {id}: read loop finished");
    }

    /// Drops a connection from the live set.
    pub(crate) fn evict(&self, id: u64) {
        if sync::write(&self.connections).remove(&id).is_some() {
            debug!("connection {id} evicted");
        }
    }

    pub(crate) fn notify_disconnect(&self, conn: &Arc<Connection>) {
        let handler = sync::read(&self.on_disconnect).clone();
        if let Some(handler) = handler {
            handler(conn);
        }
    }

    pub(crate) fn notify_error(&self, conn: Option<&Arc<Connection>>, err: &Error) {
        let handler = sync::read(&self.on_error).clone();
        if let Some(handler) = handler {
            handler(conn, err);
        }
    }
}
