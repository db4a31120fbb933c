//! Outbound message fragmentation.

use bytes::Bytes;

use crate::{
    error::{Error, Result},
    protocol::frame::{
        Frame,
        coding::{Data, OpCode},
    },
};

/// Splits a message into a well-formed frame sequence.
///
/// The first frame carries `opcode`, every later frame is a continuation,
/// and only the last frame has its FIN bit set. Each frame holds at most
/// `frame_size` payload bytes. An empty message yields a single empty
/// final frame. All produced frames are unmasked (server to client).
pub fn fragment(opcode: Data, payload: &[u8], frame_size: usize) -> Result<Vec<Frame>> {
    debug_assert!(
        matches!(opcode, Data::Text | Data::Binary),
        "Invalid opcode for a message."
    );
    if frame_size == 0 {
        return Err(Error::BadFrameSize);
    }

    if payload.is_empty() {
        return Ok(vec![Frame::message(Bytes::new(), OpCode::Data(opcode), true)]);
    }

    let count = payload.len().div_ceil(frame_size);
    let mut frames = Vec::with_capacity(count);
    for (i, chunk) in payload.chunks(frame_size).enumerate() {
        let chunk_opcode = if i == 0 { opcode } else { Data::Continue };
        frames.push(Frame::message(
            Bytes::copy_from_slice(chunk),
            OpCode::Data(chunk_opcode),
            i == count - 1,
        ));
    }

    Ok(frames)
}
