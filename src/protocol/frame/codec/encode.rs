use bytes::BytesMut;

use crate::protocol::frame::{
    frame::{Frame, LengthFormat},
    mask::apply_mask,
};

/// Encoder for WebSocket frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameEncoder;

impl FrameEncoder {
    /// Serializes one frame to the back of `dst`.
    ///
    /// When the frame carries a mask key the payload bytes are masked as
    /// they are written; the in-memory frame keeps its unmasked form.
    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) {
        dst.reserve(frame.len());

        Self::write_header(frame, dst);

        let start = dst.len();
        dst.extend_from_slice(frame.payload());
        if let Some(mask) = frame.header().mask {
            apply_mask(&mut dst[start..], mask);
        }
    }

    #[inline]
    fn write_header(frame: &Frame, dst: &mut BytesMut) {
        let header = frame.header();
        let length = frame.payload().len() as u64;

        let code: u8 = header.opcode.into();
        let one = {
            code | if header.is_final { 0x80 } else { 0 }
                | if header.rsv1 { 0x40 } else { 0 }
                | if header.rsv2 { 0x20 } else { 0 }
                | if header.rsv3 { 0x10 } else { 0 }
        };

        let lenfmt = LengthFormat::for_length(length);
        let two = { lenfmt.length_byte() | if header.mask.is_some() { 0x80 } else { 0 } };

        dst.extend_from_slice(&[one, two]);
        match lenfmt {
            LengthFormat::U8(_) => (),
            LengthFormat::U16 => {
                dst.extend_from_slice(&(length as u16).to_be_bytes());
            }
            LengthFormat::U64 => {
                dst.extend_from_slice(&length.to_be_bytes());
            }
        }

        if let Some(ref mask) = header.mask {
            dst.extend_from_slice(mask);
        }
    }
}
