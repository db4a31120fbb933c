//! Minimal echo server: every message a client sends comes straight back.

use weft::Server;

fn main() {
    let server = Server::new();

    server.on_connect(|conn| {
        println!("client {} connected from {}", conn.id(), conn.peer_addr());

        conn.on_message(|conn, data| {
            match std::str::from_utf8(data) {
                Ok(text) => println!("received message: {text}"),
                Err(_) => println!("received {} binary bytes", data.len()),
            }
            if let Err(err) = conn.send_binary_message_buffered(data, 1024) {
                eprintln!("echo failed: {err}");
            }
        });

        conn.on_close(|conn, reason| {
            println!("client {} closed ({} byte reason)", conn.id(), reason.len());
        });
    });

    server.on_disconnect(|conn| println!("client {} disconnected cleanly", conn.id()));

    server.on_error(|conn, err| match conn {
        Some(conn) => eprintln!("connection {} error: {err}", conn.id()),
        None => eprintln!("server error: {err}"),
    });

    println!("starting WebSocket server on 127.0.0.1:8080");
    if let Err(err) = server.listen("127.0.0.1:8080") {
        eprintln!("server failed: {err}");
        std::process::exit(1);
    }
}
