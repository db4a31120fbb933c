//! Shared plumbing for integration tests: just enough of a WebSocket
//! client to drive the server over a raw TCP stream.

#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use weft::Server;

/// Starts `server` on an ephemeral port and returns the bound address.
pub fn spawn_server(server: Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        let _ = server.serve(listener);
    });
    addr
}

/// Connects and upgrades, returning the stream positioned right after the
/// server's `101 Switching Protocols` response.
pub fn connect(addr: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("set read timeout");

    stream
        .write_all(upgrade_request().as_bytes())
        .expect("send upgrade request");

    let response = read_http_response(&mut stream);
    assert!(
        response.starts_with("HTTP/1.1 101"),
        "unexpected response: {response}"
    );
    assert!(response.contains("s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
    stream
}

/// A valid upgrade request using the RFC 6455 example key.
pub fn upgrade_request() -> String {
    "GET /chat HTTP/1.1\r\n\
     Host: localhost\r\n\
     Connection: Upgrade\r\n\
     Upgrade: websocket\r\n\
     Sec-WebSocket-Version: 13\r\n\
     Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
        .to_string()
}

/// Reads an HTTP response up to and including the blank line.
pub fn read_http_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("read response byte");
        assert!(n > 0, "connection closed during handshake");
        buf.push(byte[0]);
    }
    String::from_utf8(buf).expect("response is not UTF-8")
}

/// Reads exactly `n` bytes.
pub fn read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).expect("read_exact");
    buf
}

/// Reads one server frame, returning its first header byte and unmasked
/// payload. Server frames must never be masked.
pub fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let header = read_exact(stream, 2);
    assert_eq!(header[1] & 0x80, 0, "server frames must be unmasked");
    let len = match header[1] & 0x7F {
        126 => {
            let ext = read_exact(stream, 2);
            u16::from_be_bytes([ext[0], ext[1]]) as usize
        }
        127 => {
            let ext = read_exact(stream, 8);
            let mut be_bytes = [0u8; 8];
            be_bytes.copy_from_slice(&ext);
            u64::from_be_bytes(be_bytes) as usize
        }
        n => n as usize,
    };
    (header[0], read_exact(stream, len))
}

/// Builds a masked client frame.
pub fn client_frame(first_byte: u8, mask: [u8; 4], payload: &[u8]) -> Vec<u8> {
    assert!(payload.len() < 126, "helper only builds short frames");
    let mut frame = vec![first_byte, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
    frame
}

/// Polls `condition` until it holds or `timeout` elapses.
pub fn wait_until(condition: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
