//! The per-connection protocol engine.
//!
//! Each connection owns one read thread that de-frames the TCP stream and
//! drives callbacks; writers may run on any thread and serialize on the
//! connection's write lock.

use std::{
    fmt,
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    slice,
    sync::{Arc, Mutex, RwLock, Weak},
    thread,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use crate::{
    error::{Error, ProtocolError, Result},
    protocol::{
        fragment::fragment,
        frame::{
            CloseFrame, Frame, FrameHeader,
            codec::{FrameDecoder, FrameEncoder},
            coding::{CloseCode, Control, Data, OpCode},
        },
        message::{IncompleteMessage, IncompleteMessageType},
    },
    server::{ServerConfig, ServerInner},
    sync,
};

/// How long a started close handshake may stay unanswered before the
/// endpoint is released forcibly.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of the scratch buffer for TCP reads.
const READ_CHUNK: usize = 1024;

/// Initial capacity of the read loop's accumulation buffer.
const ACCUMULATOR_CAPACITY: usize = 4096;

/// Callback invoked with every fully reassembled message.
pub type MessageHandler = dyn Fn(&Arc<Connection>, &[u8]) + Send + Sync;

/// Callback invoked with the peer's close frame body on a clean close.
pub type CloseHandler = dyn Fn(&Arc<Connection>, &[u8]) + Send + Sync;

/// Close handshake progress. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    /// The connection is fully usable.
    Open,
    /// We sent a close frame and are waiting for the peer to echo it.
    Closing,
    /// The close handshake finished or the connection was torn down.
    Closed,
}

/// How a frame sequence goes out on the wire.
#[derive(Debug, Clone, Copy)]
enum WriteStrategy {
    /// One TCP write for the whole encoded sequence.
    Buffered,
    /// One TCP write per frame.
    Streamed,
}

/// A single server-side WebSocket connection.
///
/// Handles are shared: the read thread, user callbacks and any number of
/// sender threads may hold one. The bytes of a single `send_*` call always
/// appear contiguously on the wire because every write path holds the
/// write lock for its whole frame sequence.
pub struct Connection {
    id: u64,
    peer_addr: SocketAddr,
    /// Write half of the endpoint. Guards every outbound byte.
    writer: Mutex<TcpStream>,
    /// Close handshake state. Lock order: state before writer.
    state: Mutex<CloseState>,
    on_message: RwLock<Option<Arc<MessageHandler>>>,
    on_close: RwLock<Option<Arc<CloseHandler>>>,
    me: Weak<Connection>,
    server: Weak<ServerInner>,
    config: ServerConfig,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        peer_addr: SocketAddr,
        writer: TcpStream,
        server: Weak<ServerInner>,
        config: ServerConfig,
    ) -> Arc<Connection> {
        Arc::new_cyclic(|me| Connection {
            id,
            peer_addr,
            writer: Mutex::new(writer),
            state: Mutex::new(CloseState::Open),
            on_message: RwLock::new(None),
            on_close: RwLock::new(None),
            me: me.clone(),
            server,
            config,
        })
    }

    /// The server-assigned connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the close handshake has not started yet.
    pub fn is_open(&self) -> bool {
        *sync::lock(&self.state) == CloseState::Open
    }

    /// Installs the message callback, replacing any previous one.
    ///
    /// The callback runs on the connection's read thread with no engine
    /// lock held, so it may send messages, but it must return promptly.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&Arc<Connection>, &[u8]) + Send + Sync + 'static,
    {
        *sync::write(&self.on_message) = Some(Arc::new(handler));
    }

    /// Installs the close callback, replacing any previous one.
    ///
    /// It receives the peer's close frame body (status code and reason)
    /// when the close handshake completes cleanly.
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(&Arc<Connection>, &[u8]) + Send + Sync + 'static,
    {
        *sync::write(&self.on_close) = Some(Arc::new(handler));
    }

    /// Sends a binary message split into frames of at most `frame_size`
    /// payload bytes, encoded into one buffer and written with a single
    /// TCP write.
    pub fn send_binary_message_buffered(&self, msg: &[u8], frame_size: usize) -> Result<()> {
        let frames = fragment(Data::Binary, msg, frame_size)?;
        self.write_frames(&frames, WriteStrategy::Buffered)
    }

    /// Sends a binary message split into frames of at most `frame_size`
    /// payload bytes, one TCP write per frame.
    ///
    /// Useful for large messages where buffering the whole encoding first
    /// is undesirable. The write lock is held across the whole sequence.
    pub fn send_binary_message_streamed(&self, msg: &[u8], frame_size: usize) -> Result<()> {
        let frames = fragment(Data::Binary, msg, frame_size)?;
        self.write_frames(&frames, WriteStrategy::Streamed)
    }

    /// Sends a text message split into frames of at most `frame_size`
    /// payload bytes, encoded into one buffer and written with a single
    /// TCP write.
    pub fn send_text_message_buffered(&self, msg: &str, frame_size: usize) -> Result<()> {
        let frames = fragment(Data::Text, msg.as_bytes(), frame_size)?;
        self.write_frames(&frames, WriteStrategy::Buffered)
    }

    /// Sends a text message split into frames of at most `frame_size`
    /// payload bytes, one TCP write per frame.
    pub fn send_text_message_streamed(&self, msg: &str, frame_size: usize) -> Result<()> {
        let frames = fragment(Data::Text, msg.as_bytes(), frame_size)?;
        self.write_frames(&frames, WriteStrategy::Streamed)
    }

    /// Sends a ping frame. The body must be at most 125 bytes.
    pub fn send_ping(&self, body: &[u8]) -> Result<()> {
        let frame = Frame::ping(Bytes::copy_from_slice(body))?;
        self.write_frames(slice::from_ref(&frame), WriteStrategy::Buffered)
    }

    /// Sends an unsolicited pong frame. The body must be at most 125 bytes.
    pub fn send_pong(&self, body: &[u8]) -> Result<()> {
        let frame = Frame::pong(Bytes::copy_from_slice(body))?;
        self.write_frames(slice::from_ref(&frame), WriteStrategy::Buffered)
    }

    /// Starts the close handshake.
    ///
    /// Writes a close frame carrying `code` and `reason` and transitions
    /// the connection to the closing state. If the peer does not echo the
    /// close frame within five seconds the endpoint is released forcibly.
    ///
    /// Returns [`Error::AlreadyClosing`] when a close handshake has
    /// already started or finished.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<()> {
        let frame = Frame::close(Some(CloseFrame {
            code,
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        }))?;

        let mut state = sync::lock(&self.state);
        if *state != CloseState::Open {
            return Err(Error::AlreadyClosing);
        }
        *state = CloseState::Closing;
        let mut writer = sync::lock(&self.writer);
        drop(state);

        let result = write_encoded(&mut writer, slice::from_ref(&frame), WriteStrategy::Buffered);
        drop(writer);

        if let Err(err) = result {
            let err = Error::Io(err);
            self.abort(&err);
            return Err(err);
        }

        debug!("connection {}: close handshake started with status {code}", self.id);
        self.arm_close_timer();
        Ok(())
    }

    /// Writes a frame sequence under the write lock.
    ///
    /// The close state is checked first and the write lock is acquired
    /// before the state lock is released, so no close frame can slip in
    /// between the check and the write.
    fn write_frames(&self, frames: &[Frame], strategy: WriteStrategy) -> Result<()> {
        let state = sync::lock(&self.state);
        if *state != CloseState::Open {
            return Err(Error::AlreadyClosing);
        }
        let mut writer = sync::lock(&self.writer);
        drop(state);

        let result = write_encoded(&mut writer, frames, strategy);
        drop(writer);

        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                let err = Error::Io(err);
                self.abort(&err);
                Err(err)
            }
        }
    }

    /// Runs the read loop until the connection is done.
    ///
    /// `leftover` holds frame bytes the client pipelined behind its
    /// upgrade request.
    pub(crate) fn run_read_loop(&self, mut reader: TcpStream, leftover: BytesMut) {
        let decoder = FrameDecoder::new(Some(self.config.max_frame_size), true);
        let mut acc = leftover;
        acc.reserve(ACCUMULATOR_CAPACITY.saturating_sub(acc.len()));
        let mut scratch = [0u8; READ_CHUNK];
        let mut incomplete: Option<IncompleteMessage> = None;

        loop {
            // A single TCP read may complete several frames; drain them
            // all before blocking again.
            loop {
                let frame = match decoder.decode(&mut acc) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => {
                        self.fail(&err);
                        return;
                    }
                };

                trace!(
                    "connection {}: received {} frame with {} payload bytes",
                    self.id,
                    frame.header().opcode,
                    frame.payload().len()
                );

                match self.dispatch(frame, &mut incomplete) {
                    Ok(true) => (),
                    Ok(false) => return,
                    Err(err) => {
                        self.fail(&err);
                        return;
                    }
                }
            }

            match reader.read(&mut scratch) {
                Ok(0) => {
                    self.abort(&Error::Protocol(
                        ProtocolError::ResetWithoutClosingHandshake,
                    ));
                    return;
                }
                Ok(n) => acc.extend_from_slice(&scratch[..n]),
                Err(err) => {
                    self.abort(&Error::Io(err));
                    return;
                }
            }
        }
    }

    /// Routes one inbound frame. Returns whether the read loop should
    /// keep going.
    fn dispatch(&self, frame: Frame, incomplete: &mut Option<IncompleteMessage>) -> Result<bool> {
        match frame.header().opcode {
            OpCode::Control(ctl) => match ctl {
                Control::Close => {
                    let payload = frame.into_payload();
                    // A one-byte body cannot carry a status code.
                    if payload.len() == 1 {
                        return Err(Error::Protocol(ProtocolError::InvalidCloseSequence));
                    }
                    self.handle_close_frame(payload);
                    Ok(false)
                }
                Control::Ping => {
                    let pong = Frame::pong(frame.into_payload())?;
                    match self.write_frames(slice::from_ref(&pong), WriteStrategy::Buffered) {
                        // No pong once our own close frame is on the wire.
                        Ok(()) | Err(Error::AlreadyClosing) => Ok(true),
                        // A failed write already tore the connection down.
                        Err(_) => Ok(false),
                    }
                }
                Control::Pong => {
                    trace!("connection {}: pong received", self.id);
                    Ok(true)
                }
                Control::Reserved(code) => Err(Error::Protocol(
                    ProtocolError::UnknownControlFrameType(code),
                )),
            },

            OpCode::Data(data) => {
                let fin = frame.header().is_final;
                let size_limit = Some(self.config.max_message_size);

                match data {
                    Data::Continue => {
                        let Some(msg) = incomplete.as_mut() else {
                            return Err(Error::Protocol(ProtocolError::UnexpectedContinueFrame));
                        };
                        msg.extend(frame.payload(), size_limit)?;
                        if fin {
                            if let Some(msg) = incomplete.take() {
                                let payload = msg.complete()?;
                                self.deliver_message(&payload);
                            }
                        }
                        Ok(true)
                    }

                    Data::Text | Data::Binary if incomplete.is_some() => {
                        Err(Error::Protocol(ProtocolError::ExpectedFragment(data)))
                    }

                    Data::Text | Data::Binary => {
                        let kind = if data == Data::Text {
                            IncompleteMessageType::Text
                        } else {
                            IncompleteMessageType::Binary
                        };
                        let mut msg = IncompleteMessage::new(kind);
                        msg.extend(frame.payload(), size_limit)?;
                        if fin {
                            let payload = msg.complete()?;
                            self.deliver_message(&payload);
                        } else {
                            *incomplete = Some(msg);
                        }
                        Ok(true)
                    }

                    Data::Reserved(code) => {
                        Err(Error::Protocol(ProtocolError::UnknownDataFrameType(code)))
                    }
                }
            }
        }
    }

    /// Hands a reassembled message to the user callback.
    fn deliver_message(&self, payload: &[u8]) {
        let Some(conn) = self.me.upgrade() else {
            return;
        };
        let handler = sync::read(&self.on_message).clone();
        if let Some(handler) = handler {
            handler(&conn, payload);
        } else {
            debug!(
                "connection {}: no message handler installed, dropping {} bytes",
                self.id,
                payload.len()
            );
        }
    }

    /// Runs our half of the close handshake for an inbound close frame.
    fn handle_close_frame(&self, payload: Bytes) {
        let mut state = sync::lock(&self.state);
        match *state {
            CloseState::Open => {
                *state = CloseState::Closed;
                let mut writer = sync::lock(&self.writer);
                drop(state);

                // Mirror the peer's status code; empty body if it sent none.
                let status = if payload.len() >= 2 {
                    payload.slice(..2)
                } else {
                    Bytes::new()
                };
                let echo =
                    Frame::from_parts(FrameHeader::new(OpCode::Control(Control::Close)), status);
                if let Err(err) = write_encoded(
                    &mut writer,
                    slice::from_ref(&echo),
                    WriteStrategy::Buffered,
                ) {
                    debug!("connection {}: failed to echo close frame: {err}", self.id);
                }
                drop(writer);

                debug!("connection {}: peer started the close handshake", self.id);
                self.finish_close(&payload);
            }

            CloseState::Closing => {
                *state = CloseState::Closed;
                drop(state);
                debug!("connection {}: peer answered our close frame", self.id);
                self.finish_close(&payload);
            }

            CloseState::Closed => {}
        }
    }

    /// Completes a clean close: callbacks, then endpoint release.
    fn finish_close(&self, payload: &[u8]) {
        if let Some(conn) = self.me.upgrade() {
            let handler = sync::read(&self.on_close).clone();
            if let Some(handler) = handler {
                handler(&conn, payload);
            }
            if let Some(server) = self.server.upgrade() {
                server.notify_disconnect(&conn);
            }
        }
        self.release();
        self.evict();
    }

    /// Fails the connection after an ingress violation: sends a
    /// status-only close frame and releases the endpoint. Per the
    /// propagation policy these errors do not reach `on_error`.
    fn fail(&self, err: &Error) {
        let code = match err {
            Error::Capacity(_) => CloseCode::Size,
            Error::Utf8 => CloseCode::Invalid,
            _ => CloseCode::Protocol,
        };
        warn!("connection {}: {err}; closing with status {code}", self.id);

        let mut state = sync::lock(&self.state);
        let was_open = *state == CloseState::Open;
        *state = CloseState::Closed;
        let mut writer = sync::lock(&self.writer);
        drop(state);

        if was_open {
            let close = Frame::from_parts(
                FrameHeader::new(OpCode::Control(Control::Close)),
                Bytes::copy_from_slice(&u16::from(code).to_be_bytes()),
            );
            if let Err(err) = write_encoded(
                &mut writer,
                slice::from_ref(&close),
                WriteStrategy::Buffered,
            ) {
                debug!("connection {}: failed to send close frame: {err}", self.id);
            }
        }
        drop(writer);

        self.release();
        self.evict();
    }

    /// Tears the connection down after an I/O failure. `on_error` fires
    /// only when the failure interrupted an open connection.
    fn abort(&self, err: &Error) {
        let mut state = sync::lock(&self.state);
        let was_open = *state == CloseState::Open;
        *state = CloseState::Closed;
        drop(state);

        if was_open {
            debug!("connection {}: aborted: {err}", self.id);
            if let (Some(conn), Some(server)) = (self.me.upgrade(), self.server.upgrade()) {
                server.notify_error(Some(&conn), err);
            }
        }

        self.release();
        self.evict();
    }

    /// Spawns the timer bounding the close handshake.
    fn arm_close_timer(&self) {
        let Some(conn) = self.me.upgrade() else {
            return;
        };
        thread::spawn(move || {
            thread::sleep(CLOSE_HANDSHAKE_TIMEOUT);
            let mut state = sync::lock(&conn.state);
            if *state == CloseState::Closing {
                *state = CloseState::Closed;
                drop(state);
                warn!(
                    "connection {}: peer did not answer the close frame, releasing the endpoint",
                    conn.id
                );
                conn.release();
                conn.evict();
            }
        });
    }

    /// Shuts both directions of the endpoint down, which also unblocks
    /// the read thread.
    fn release(&self) {
        let _ = sync::lock(&self.writer).shutdown(Shutdown::Both);
    }

    /// Removes this connection from the server's live set.
    fn evict(&self) {
        if let Some(server) = self.server.upgrade() {
            server.evict(self.id);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Encodes and writes a frame sequence to the locked endpoint.
fn write_encoded(
    writer: &mut TcpStream,
    frames: &[Frame],
    strategy: WriteStrategy,
) -> io::Result<()> {
    let encoder = FrameEncoder;
    match strategy {
        WriteStrategy::Buffered => {
            let mut buf = BytesMut::with_capacity(frames.iter().map(Frame::len).sum());
            for frame in frames {
                encoder.encode(frame, &mut buf);
            }
            writer.write_all(&buf)
        }
        WriteStrategy::Streamed => {
            let mut buf = BytesMut::new();
            for frame in frames {
                buf.clear();
                encoder.encode(frame, &mut buf);
                writer.write_all(&buf)?;
            }
            Ok(())
        }
    }
}
