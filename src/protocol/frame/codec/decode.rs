use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::{
    error::{CapacityError, Error, ProtocolError, Result},
    protocol::frame::{
        coding::{Control, Data, OpCode},
        frame::{Frame, FrameHeader, MAX_CONTROL_PAYLOAD},
        mask::apply_mask,
    },
};

/// Why [`decode_frame`] could not produce a frame.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum DecodeError {
    /// The base or extended header is not fully present.
    #[error("truncated frame header")]
    ShortHeader,
    /// The mask key is not fully present.
    #[error("truncated mask key")]
    ShortMask,
    /// The payload is not fully present.
    #[error("truncated payload")]
    ShortPayload,
    /// The header is semantically invalid.
    #[error(transparent)]
    Protocol(ProtocolError),
}

/// Everything derivable from the length prefix alone, before the mask key
/// or payload are available.
#[derive(Debug, Clone, Copy)]
struct HeaderPrefix {
    is_final: bool,
    opcode: OpCode,
    masked: bool,
    payload_len: u64,
    /// Offset just past the extended length bytes.
    mask_offset: usize,
}

impl HeaderPrefix {
    /// Total size of the frame on the wire.
    fn frame_len(&self) -> u64 {
        self.header_len() as u64 + self.payload_len
    }

    /// Size of the header including any mask key.
    fn header_len(&self) -> usize {
        self.mask_offset + if self.masked { 4 } else { 0 }
    }
}

/// Parses and validates the frame prefix without consuming `input`.
///
/// At most 10 bytes are examined, so the declared payload length is known
/// before mask key or payload bytes arrive.
fn scan_prefix(input: &[u8]) -> Result<HeaderPrefix, DecodeError> {
    if input.len() < 2 {
        return Err(DecodeError::ShortHeader);
    }

    let (first, second) = (input[0], input[1]);

    if first & 0x70 != 0 {
        return Err(DecodeError::Protocol(ProtocolError::NonZeroReservedBits));
    }

    let is_final = first & 0x80 != 0;
    let opcode = OpCode::from(first & 0x0F);
    match opcode {
        OpCode::Data(Data::Reserved(code)) => {
            return Err(DecodeError::Protocol(ProtocolError::UnknownDataFrameType(
                code,
            )));
        }
        OpCode::Control(Control::Reserved(code)) => {
            return Err(DecodeError::Protocol(
                ProtocolError::UnknownControlFrameType(code),
            ));
        }
        _ => (),
    }

    let masked = second & 0x80 != 0;

    let mut mask_offset = 2;
    let payload_len = match second & 0x7F {
        126 => {
            if input.len() < 4 {
                return Err(DecodeError::ShortHeader);
            }
            mask_offset = 4;
            u64::from(u16::from_be_bytes([input[2], input[3]]))
        }
        127 => {
            if input.len() < 10 {
                return Err(DecodeError::ShortHeader);
            }
            let mut be_bytes = [0u8; 8];
            be_bytes.copy_from_slice(&input[2..10]);
            let len = u64::from_be_bytes(be_bytes);
            // The most significant bit MUST be 0 (RFC 6455 section 5.2).
            if len & 0x8000_0000_0000_0000 != 0 {
                return Err(DecodeError::Protocol(ProtocolError::InvalidPayloadLength));
            }
            mask_offset = 10;
            len
        }
        len => u64::from(len),
    };

    // Control frames MUST NOT be fragmented and MUST have a payload length
    // of 125 bytes or less (RFC 6455 section 5.5).
    if let OpCode::Control(_) = opcode {
        if !is_final {
            return Err(DecodeError::Protocol(ProtocolError::FragmentedControlFrame));
        }
        if payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(DecodeError::Protocol(ProtocolError::ControlFrameTooBig));
        }
    }

    Ok(HeaderPrefix {
        is_final,
        opcode,
        masked,
        payload_len,
        mask_offset,
    })
}

/// Decodes one complete frame from the front of `input`.
///
/// Returns the frame and the number of bytes it occupied on the wire. The
/// payload is unmasked during decoding. Fails with one of the `Short*`
/// variants when `input` is truncated at any stage; the incremental reader
/// treats those as "read more", everything else as fatal.
pub fn decode_frame(input: &[u8]) -> Result<(Frame, usize), DecodeError> {
    let prefix = scan_prefix(input)?;

    let mask = if prefix.masked {
        if input.len() < prefix.mask_offset + 4 {
            return Err(DecodeError::ShortMask);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&input[prefix.mask_offset..prefix.mask_offset + 4]);
        Some(key)
    } else {
        None
    };

    let header_len = prefix.header_len();
    if (input.len() as u64) < prefix.frame_len() {
        return Err(DecodeError::ShortPayload);
    }
    let total = header_len + prefix.payload_len as usize;

    let mut payload = input[header_len..total].to_vec();
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }

    let header = FrameHeader {
        is_final: prefix.is_final,
        rsv1: false,
        rsv2: false,
        rsv3: false,
        opcode: prefix.opcode,
        mask,
    };

    Ok((Frame::from_parts(header, Bytes::from(payload)), total))
}

/// Incremental frame reader over an accumulation buffer.
///
/// The read loop appends raw TCP bytes to one growable buffer and calls
/// [`decode`](FrameDecoder::decode) until it reports that no complete frame
/// is left. Frames come out in wire order; partial input stays in the
/// buffer for the next call.
#[derive(Debug, Clone, Copy)]
pub struct FrameDecoder {
    max_frame_size: Option<usize>,
    require_masked: bool,
}

impl FrameDecoder {
    /// Creates a decoder enforcing a total per-frame wire size cap and,
    /// for server use, that every inbound frame is masked.
    pub fn new(max_frame_size: Option<usize>, require_masked: bool) -> Self {
        FrameDecoder {
            max_frame_size,
            require_masked,
        }
    }

    /// Tries to take one frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when `src` does not yet hold a complete frame.
    /// The total frame size is computed from the length prefix before any
    /// payload byte is touched, so a peer declaring an enormous length is
    /// rejected without the payload ever being buffered.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let prefix = match scan_prefix(src) {
            Ok(prefix) => prefix,
            Err(DecodeError::Protocol(err)) => return Err(err.into()),
            Err(_) => return Ok(None),
        };

        if self.require_masked && !prefix.masked {
            return Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient));
        }

        let total = prefix.frame_len();
        if let Some(max_size) = self.max_frame_size {
            if total > max_size as u64 {
                return Err(Error::Capacity(CapacityError::FrameTooLong {
                    size: total,
                    max_size,
                }));
            }
        }

        if (src.len() as u64) < total {
            return Ok(None);
        }

        let mut raw = src.split_to(total as usize);
        let mut payload = raw.split_off(prefix.header_len());

        let mask = prefix.masked.then(|| {
            let mut key = [0u8; 4];
            key.copy_from_slice(&raw[prefix.mask_offset..prefix.mask_offset + 4]);
            key
        });
        if let Some(mask) = mask {
            apply_mask(&mut payload, mask);
        }

        let header = FrameHeader {
            is_final: prefix.is_final,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: prefix.opcode,
            mask,
        };

        Ok(Some(Frame::from_parts(header, payload.freeze())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::codec::FrameEncoder;

    fn masked_text(payload: &[u8], mask: [u8; 4], is_final: bool) -> Frame {
        Frame::from_parts(
            FrameHeader {
                is_final,
                mask: Some(mask),
                ..FrameHeader::new(OpCode::Data(Data::Text))
            },
            Bytes::copy_from_slice(payload),
        )
    }

    fn encode_all(frames: &[Frame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            FrameEncoder.encode(frame, &mut buf);
        }
        buf.to_vec()
    }

    #[test]
    fn unmasked_round_trip() {
        for len in [0usize, 1, 125, 126, 65535, 65536] {
            let frame = Frame::message(vec![0xAB; len], OpCode::Data(Data::Binary), true);
            let mut buf = BytesMut::new();
            FrameEncoder.encode(&frame, &mut buf);

            let (decoded, consumed) = decode_frame(&buf).unwrap();
            assert_eq!(consumed, buf.len());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn masked_round_trip_restores_the_payload() {
        let frame = masked_text(b"Hello", [0x37, 0xfa, 0x21, 0x3d], true);
        let mut buf = BytesMut::new();
        FrameEncoder.encode(&frame, &mut buf);

        let (decoded, _) = decode_frame(&buf).unwrap();
        assert_eq!(decoded.payload().as_ref(), b"Hello");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn truncation_is_reported_stage_by_stage() {
        let frame = masked_text(&[0xCC; 300], [9, 8, 7, 6], true);
        let bytes = encode_all(std::slice::from_ref(&frame));

        assert_eq!(decode_frame(&bytes[..1]), Err(DecodeError::ShortHeader));
        // 16-bit extended length cut short.
        assert_eq!(decode_frame(&bytes[..3]), Err(DecodeError::ShortHeader));
        // Mask key cut short.
        assert_eq!(decode_frame(&bytes[..6]), Err(DecodeError::ShortMask));
        // Payload cut short.
        assert_eq!(
            decode_frame(&bytes[..bytes.len() - 1]),
            Err(DecodeError::ShortPayload)
        );
    }

    #[test]
    fn reserved_bits_are_rejected() {
        assert_eq!(
            decode_frame(&[0xC1, 0x00]),
            Err(DecodeError::Protocol(ProtocolError::NonZeroReservedBits))
        );
    }

    #[test]
    fn reserved_opcodes_are_rejected() {
        assert_eq!(
            decode_frame(&[0x83, 0x00]),
            Err(DecodeError::Protocol(ProtocolError::UnknownDataFrameType(3)))
        );
        assert_eq!(
            decode_frame(&[0x8B, 0x00]),
            Err(DecodeError::Protocol(
                ProtocolError::UnknownControlFrameType(11)
            ))
        );
    }

    #[test]
    fn fragmented_or_oversized_control_frames_are_rejected() {
        // Ping with FIN cleared.
        assert_eq!(
            decode_frame(&[0x09, 0x00]),
            Err(DecodeError::Protocol(ProtocolError::FragmentedControlFrame))
        );
        // Ping declaring a 126-byte body.
        assert_eq!(
            decode_frame(&[0x89, 126, 0x00, 0x7e]),
            Err(DecodeError::Protocol(ProtocolError::ControlFrameTooBig))
        );
    }

    #[test]
    fn high_bit_of_64_bit_length_is_rejected() {
        let header = [0x82, 127, 0x80, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode_frame(&header),
            Err(DecodeError::Protocol(ProtocolError::InvalidPayloadLength))
        );
    }

    #[test]
    fn oversize_is_detected_from_the_prefix_alone() {
        let decoder = FrameDecoder::new(Some(16 * 1024), true);
        // Masked binary frame declaring 2 GiB; neither mask key nor payload
        // bytes are present yet.
        let mut src = BytesMut::from(&[0x82u8, 0xFF, 0, 0, 0, 0, 0x80, 0, 0, 0][..]);

        match decoder.decode(&mut src) {
            Err(Error::Capacity(CapacityError::FrameTooLong { size, max_size })) => {
                assert_eq!(size, 14 + (2u64 << 30));
                assert_eq!(max_size, 16 * 1024);
            }
            other => panic!("expected FrameTooLong, got {other:?}"),
        }
    }

    #[test]
    fn unmasked_client_frames_are_rejected_when_required() {
        let decoder = FrameDecoder::new(None, true);
        let mut src = BytesMut::from(&[0x81u8, 0x01, b'x'][..]);
        assert!(matches!(
            decoder.decode(&mut src),
            Err(Error::Protocol(ProtocolError::UnmaskedFrameFromClient))
        ));
    }

    #[test]
    fn frames_survive_arbitrary_chunking() {
        let originals = vec![
            masked_text(b"Hello", [0x37, 0xfa, 0x21, 0x3d], false),
            Frame::from_parts(
                FrameHeader {
                    is_final: true,
                    mask: Some([1, 2, 3, 4]),
                    ..FrameHeader::new(OpCode::Data(Data::Continue))
                },
                Bytes::from(vec![0x55; 200]),
            ),
            Frame::from_parts(
                FrameHeader {
                    mask: Some([0, 0, 0, 1]),
                    ..FrameHeader::new(OpCode::Control(Control::Ping))
                },
                Bytes::from_static(b"hi"),
            ),
        ];
        let wire = encode_all(&originals);

        let decoder = FrameDecoder::new(None, true);
        for chunk_size in [1usize, 2, 3, 5, 7, 16, 64, wire.len()] {
            let mut src = BytesMut::new();
            let mut decoded = Vec::new();

            for chunk in wire.chunks(chunk_size) {
                src.extend_from_slice(chunk);
                while let Some(frame) = decoder.decode(&mut src).unwrap() {
                    decoded.push(frame);
                }
            }

            assert!(src.is_empty());
            assert_eq!(decoded, originals, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn one_buffer_can_yield_several_frames() {
        let frames = vec![
            masked_text(b"a", [5, 5, 5, 5], true),
            masked_text(b"b", [6, 6, 6, 6], true),
        ];
        let mut src = BytesMut::from(&encode_all(&frames)[..]);

        let decoder = FrameDecoder::new(None, true);
        assert_eq!(decoder.decode(&mut src).unwrap(), Some(frames[0].clone()));
        assert_eq!(decoder.decode(&mut src).unwrap(), Some(frames[1].clone()));
        assert_eq!(decoder.decode(&mut src).unwrap(), None);
    }
}
