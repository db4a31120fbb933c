//! Write atomicity under concurrent senders.

mod common;

use std::{
    collections::HashMap,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use weft::{Connection, Server};

const MESSAGES_PER_SENDER: usize = 20;
const MESSAGE_LEN: usize = 10;
const FRAME_SIZE: usize = 3;

#[test]
fn concurrent_sends_never_interleave_on_the_wire() {
    let server = Server::new();
    let (conn_tx, conn_rx) = mpsc::channel::<Arc<Connection>>();
    server.on_connect(move |conn| {
        conn_tx.send(Arc::clone(conn)).ok();
    });
    let addr = common::spawn_server(server);
    let mut client = common::connect(addr);

    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    // One sender streams text full of 'a', the other binary full of 'b'.
    // Streamed writes issue one TCP write per frame, so only the write
    // lock keeps the fragment sequences contiguous.
    let text_conn = Arc::clone(&conn);
    let text_sender = thread::spawn(move || {
        let msg = "a".repeat(MESSAGE_LEN);
        for _ in 0..MESSAGES_PER_SENDER {
            text_conn.send_text_message_streamed(&msg, FRAME_SIZE).unwrap();
        }
    });
    let binary_conn = Arc::clone(&conn);
    let binary_sender = thread::spawn(move || {
        let msg = [b'b'; MESSAGE_LEN];
        for _ in 0..MESSAGES_PER_SENDER {
            binary_conn
                .send_binary_message_streamed(&msg, FRAME_SIZE)
                .unwrap();
        }
    });

    // Parse every frame off the wire and re-assemble messages; any
    // interleaving shows up as a continuation mismatch or a mixed payload.
    let frames_per_message = MESSAGE_LEN.div_ceil(FRAME_SIZE);
    let total_frames = 2 * MESSAGES_PER_SENDER * frames_per_message;

    let mut complete: HashMap<u8, usize> = HashMap::new();
    let mut current: Option<(u8, Vec<u8>)> = None;

    for _ in 0..total_frames {
        let (first_byte, payload) = common::read_frame(&mut client);
        let fin = first_byte & 0x80 != 0;
        let opcode = first_byte & 0x0F;

        match current.take() {
            None => {
                assert!(opcode == 0x1 || opcode == 0x2, "unexpected opcode {opcode}");
                assert!(!fin, "messages of this size are always fragmented");
                current = Some((opcode, payload));
            }
            Some((msg_opcode, mut collected)) => {
                assert_eq!(opcode, 0x0, "interleaved frame inside a message");
                collected.extend_from_slice(&payload);
                if fin {
                    let expected = if msg_opcode == 0x1 { b'a' } else { b'b' };
                    assert_eq!(collected.len(), MESSAGE_LEN);
                    assert!(
                        collected.iter().all(|b| *b == expected),
                        "payload of one send call was interleaved with another"
                    );
                    *complete.entry(msg_opcode).or_default() += 1;
                } else {
                    current = Some((msg_opcode, collected));
                }
            }
        }
    }

    assert_eq!(current, None, "a message was left unfinished");
    assert_eq!(complete.get(&0x1), Some(&MESSAGES_PER_SENDER));
    assert_eq!(complete.get(&0x2), Some(&MESSAGES_PER_SENDER));

    text_sender.join().unwrap();
    binary_sender.join().unwrap();
}
