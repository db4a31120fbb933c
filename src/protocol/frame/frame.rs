use bytes::{Bytes, BytesMut};

use crate::{
    error::CapacityError,
    protocol::frame::coding::{CloseCode, Control, OpCode},
};

/// Maximum body length of a control frame (RFC 6455 section 5.5).
pub(crate) const MAX_CONTROL_PAYLOAD: usize = 125;

/// Payload length classes and their wire encodings.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LengthFormat {
    U8(u8),
    U16,
    U64,
}

impl LengthFormat {
    /// Picks the length class for a payload length.
    pub(crate) fn for_length(length: u64) -> Self {
        match length {
            0..=125 => LengthFormat::U8(length as u8),
            126..=65535 => LengthFormat::U16,
            _ => LengthFormat::U64,
        }
    }

    /// The value of the 7-bit length classifier.
    pub(crate) fn length_byte(self) -> u8 {
        match self {
            LengthFormat::U8(b) => b,
            LengthFormat::U16 => 126,
            LengthFormat::U64 => 127,
        }
    }

    /// Number of extended length bytes following the base header.
    pub(crate) fn extra_bytes(self) -> usize {
        match self {
            LengthFormat::U8(_) => 0,
            LengthFormat::U16 => 2,
            LengthFormat::U64 => 8,
        }
    }
}

/// A frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Indicates that the frame is the last one of a possibly fragmented
    /// message.
    pub is_final: bool,
    /// Reserved for protocol extensions, must be zero.
    pub rsv1: bool,
    /// Reserved for protocol extensions, must be zero.
    pub rsv2: bool,
    /// Reserved for protocol extensions, must be zero.
    pub rsv3: bool,
    /// WebSocket protocol opcode.
    pub opcode: OpCode,
    /// A frame mask, if any.
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Creates a final, unmasked header with all reserved bits clear.
    pub fn new(opcode: OpCode) -> Self {
        FrameHeader {
            is_final: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            mask: None,
        }
    }

    /// Wire length of this header for the given payload length.
    pub fn len(&self, length: u64) -> usize {
        2 + LengthFormat::for_length(length).extra_bytes() + if self.mask.is_some() { 4 } else { 0 }
    }
}

/// A struct representing a WebSocket frame.
///
/// The payload is kept unmasked in memory regardless of the mask field;
/// masking is applied and removed at the wire boundary by the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub(crate) header: FrameHeader,
    pub(crate) payload: Bytes,
}

impl Frame {
    /// Gets the total length of the frame on the wire.
    pub fn len(&self) -> usize {
        let length = self.payload.len();
        self.header.len(length as u64) + length
    }

    /// Gets a reference to the frame's header.
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// Gets a reference to the unmasked payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consumes the frame into its unmasked payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Tells whether the frame is masked.
    pub fn is_masked(&self) -> bool {
        self.header.mask.is_some()
    }

    /// Assembles a frame from an already validated header and payload.
    pub(crate) fn from_parts(header: FrameHeader, payload: Bytes) -> Frame {
        Frame { header, payload }
    }

    /// Creates a new control frame, enforcing the control payload size cap.
    fn control(control: Control, payload: Bytes) -> Result<Frame, CapacityError> {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(CapacityError::ControlPayloadTooLong(payload.len()));
        }
        Ok(Frame {
            header: FrameHeader::new(OpCode::Control(control)),
            payload,
        })
    }

    /// Creates a new data frame.
    pub fn message(data: impl Into<Bytes>, opcode: OpCode, is_final: bool) -> Frame {
        debug_assert!(
            matches!(opcode, OpCode::Data(_)),
            "Invalid opcode for data frame."
        );
        Frame {
            header: FrameHeader {
                is_final,
                ..FrameHeader::new(opcode)
            },
            payload: data.into(),
        }
    }

    /// Creates a new ping frame. The body must fit in a control frame.
    pub fn ping(data: impl Into<Bytes>) -> Result<Frame, CapacityError> {
        Self::control(Control::Ping, data.into())
    }

    /// Creates a new pong frame. The body must fit in a control frame.
    pub fn pong(data: impl Into<Bytes>) -> Result<Frame, CapacityError> {
        Self::control(Control::Pong, data.into())
    }

    /// Creates a new close frame.
    ///
    /// The body is the big-endian status code followed by the reason; both
    /// together must fit in a control frame.
    pub fn close(msg: Option<CloseFrame>) -> Result<Frame, CapacityError> {
        let payload = match msg {
            Some(CloseFrame { code, reason }) => {
                let body_len = 2 + reason.len();
                if body_len > MAX_CONTROL_PAYLOAD {
                    return Err(CapacityError::ControlPayloadTooLong(body_len));
                }
                let mut buf = BytesMut::with_capacity(body_len);
                buf.extend_from_slice(&u16::from(code).to_be_bytes());
                buf.extend_from_slice(&reason);
                buf.freeze()
            }
            None => Bytes::new(),
        };

        Ok(Frame {
            header: FrameHeader::new(OpCode::Control(Control::Close)),
            payload,
        })
    }
}

/// A struct representing the close command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// The reason as a code.
    pub code: CloseCode,
    /// The reason as raw bytes, usually a UTF-8 string.
    pub reason: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::coding::Data;

    #[test]
    fn header_length_tracks_the_length_class() {
        let unmasked = FrameHeader::new(OpCode::Data(Data::Binary));
        assert_eq!(unmasked.len(0), 2);
        assert_eq!(unmasked.len(125), 2);
        assert_eq!(unmasked.len(126), 4);
        assert_eq!(unmasked.len(65535), 4);
        assert_eq!(unmasked.len(65536), 10);

        let masked = FrameHeader {
            mask: Some([1, 2, 3, 4]),
            ..unmasked
        };
        assert_eq!(masked.len(5), 6);
    }

    #[test]
    fn control_constructors_cap_the_body() {
        assert!(Frame::ping(vec![0u8; 125]).is_ok());
        assert_eq!(
            Frame::ping(vec![0u8; 126]),
            Err(CapacityError::ControlPayloadTooLong(126))
        );
        assert_eq!(
            Frame::pong(vec![0u8; 200]),
            Err(CapacityError::ControlPayloadTooLong(200))
        );
    }

    #[test]
    fn close_body_is_code_then_reason() {
        let frame = Frame::close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Bytes::from_static(b"bye"),
        }))
        .unwrap();
        assert_eq!(frame.payload().as_ref(), [0x03, 0xe8, b'b', b'y', b'e']);

        assert_eq!(
            Frame::close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Bytes::from(vec![b'x'; 124]),
            })),
            Err(CapacityError::ControlPayloadTooLong(126))
        );
    }

    #[test]
    fn empty_close_has_no_body() {
        let frame = Frame::close(None).unwrap();
        assert!(frame.payload().is_empty());
        assert_eq!(frame.len(), 2);
    }
}
