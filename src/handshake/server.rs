//! Server-side opening handshake.

use std::io::{Read, Write};

use bytes::BytesMut;
use log::debug;

use crate::{
    error::{Error, ProtocolError, Result},
    handshake::derive_accept_key,
};

/// Maximum number of headers parsed from an upgrade request.
const MAX_HEADERS: usize = 124;

/// Upper bound on the size of an upgrade request.
const MAX_REQUEST_BYTES: usize = 16 * 1024;

/// Performs the server half of the opening handshake on `stream`.
///
/// Reads the HTTP/1.1 upgrade request, validates it and writes the
/// `101 Switching Protocols` response. Returns any bytes the client sent
/// after the request; those belong to the frame layer and must seed the
/// connection's accumulation buffer.
///
/// On failure a `400 Bad Request` is written where possible and the error
/// is returned; the caller drops the stream without creating a connection.
pub fn upgrade<S: Read + Write>(stream: &mut S) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(1024);
    let mut scratch = [0u8; 1024];

    loop {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut header_storage);

        match request.parse(&buf)? {
            httparse::Status::Complete(size) => {
                let accept_key = match validate(&request) {
                    Ok(accept_key) => accept_key,
                    Err(err) => {
                        debug!("rejecting upgrade request: {err}");
                        let _ = stream.write_all(
                            b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n",
                        );
                        return Err(err);
                    }
                };

                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Connection: Upgrade\r\n\
                     Upgrade: websocket\r\n\
                     Sec-WebSocket-Accept: {accept_key}\r\n\r\n"
                );
                stream.write_all(response.as_bytes())?;
                stream.flush()?;

                // Anything past the request is frame data the client
                // pipelined without waiting for our response.
                return Ok(buf.split_off(size));
            }

            httparse::Status::Partial => {
                if buf.len() > MAX_REQUEST_BYTES {
                    return Err(Error::Protocol(ProtocolError::OversizedHandshake));
                }

                let n = stream.read(&mut scratch)?;
                if n == 0 {
                    return Err(Error::Protocol(ProtocolError::HandshakeIncomplete));
                }
                buf.extend_from_slice(&scratch[..n]);
            }
        }
    }
}

/// Checks the upgrade request and derives the accept key from it.
fn validate(request: &httparse::Request<'_, '_>) -> Result<String> {
    if request.method != Some("GET") {
        return Err(Error::Protocol(ProtocolError::WrongHttpMethod));
    }

    // httparse reports the minor version; 1 means HTTP/1.1.
    if request.version != Some(1) {
        return Err(Error::Protocol(ProtocolError::WrongHttpVersion));
    }

    let header = |name: &str| {
        request
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value)
    };

    if !header("Connection")
        .and_then(|value| std::str::from_utf8(value).ok())
        .map(|value| {
            value
                .split([' ', ','])
                .any(|part| part.eq_ignore_ascii_case("Upgrade"))
        })
        .unwrap_or(false)
    {
        return Err(Error::Protocol(
            ProtocolError::MissingConnectionUpgradeHeader,
        ));
    }

    if !header("Upgrade")
        .and_then(|value| std::str::from_utf8(value).ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return Err(Error::Protocol(
            ProtocolError::MissingUpgradeWebSocketHeader,
        ));
    }

    if !header("Sec-WebSocket-Version")
        .map(|value| value == b"13")
        .unwrap_or(false)
    {
        return Err(Error::Protocol(
            ProtocolError::MissingSecWebSocketVersionHeader,
        ));
    }

    let key = header("Sec-WebSocket-Key")
        .ok_or(Error::Protocol(ProtocolError::MissingSecWebSocketKey))?;

    Ok(derive_accept_key(key))
}
