//! Thread-based server-side WebSocket library.
//!
//! A [`Server`] accepts TCP connections, performs the RFC 6455 opening
//! handshake and runs one read thread per connection. Inbound frames are
//! reassembled into messages and handed to user callbacks; outbound
//! messages are fragmented into frame sequences and written atomically
//! under a per-connection write lock.
//!
//! ```no_run
//! use weft::Server;
//!
//! let server = Server::new();
//!
//! server.on_connect(|conn| {
//!     println!("client {} connected", conn.id());
//!     conn.on_message(|conn, data| {
//!         // Echo everything back, four payload bytes per frame.
//!         conn.send_binary_message_buffered(data, 4).ok();
//!     });
//! });
//!
//! server.listen("127.0.0.1:8080").unwrap();
//! ```
//!
//! Client-side framing (masked writes to a peer), extensions and TLS are
//! out of scope.

#![warn(
    missing_docs,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub mod error;
pub use error::{Error, Result};

pub mod handshake;
pub mod protocol;

mod connection;
mod server;
mod sync;

// re-export bytes since used in `Frame` and `CloseFrame` APIs.
pub use bytes::Bytes;

pub use crate::{
    connection::Connection,
    protocol::frame::coding::CloseCode,
    server::{Server, ServerConfig},
};
