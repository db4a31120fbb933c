//! Reassembly of fragmented messages.

use bytes::{Bytes, BytesMut};

use crate::error::{CapacityError, Error, Result};

/// The kind of message being reassembled.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum IncompleteMessageType {
    /// A UTF-8 text message.
    Text,
    /// A binary message.
    Binary,
}

/// A partially reassembled message.
///
/// The read loop keeps at most one of these per connection; its absence is
/// what marks "no message in progress".
#[derive(Debug)]
pub struct IncompleteMessage {
    kind: IncompleteMessageType,
    buffer: BytesMut,
}

impl IncompleteMessage {
    /// Creates a new empty message of the given kind.
    pub fn new(kind: IncompleteMessageType) -> Self {
        IncompleteMessage {
            kind,
            buffer: BytesMut::new(),
        }
    }

    /// The kind of the message in progress.
    pub fn kind(&self) -> IncompleteMessageType {
        self.kind
    }

    /// The number of payload bytes collected so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether any payload bytes have been collected.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Adds more data to the message, enforcing the per-message cap.
    pub fn extend(&mut self, tail: &[u8], size_limit: Option<usize>) -> Result<()> {
        // Always have a max size. This ensures an error in case of
        // concatenating two buffers of more than `usize::MAX` bytes in total.
        let max_size = size_limit.unwrap_or(usize::MAX);
        let my_size = self.buffer.len();
        let portion_size = tail.len();
        // Be careful about integer overflows here.
        if my_size > max_size || portion_size > max_size - my_size {
            return Err(Error::Capacity(CapacityError::MessageTooLong {
                size: my_size.saturating_add(portion_size),
                max_size,
            }));
        }

        self.buffer.extend_from_slice(tail);
        Ok(())
    }

    /// Completes the message, validating text payloads as UTF-8.
    pub fn complete(self) -> Result<Bytes> {
        let IncompleteMessage { kind, buffer } = self;
        let payload = buffer.freeze();
        if kind == IncompleteMessageType::Text {
            simdutf8::basic::from_utf8(&payload).map_err(|_| Error::Utf8)?;
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_are_joined_in_order() {
        let mut msg = IncompleteMessage::new(IncompleteMessageType::Binary);
        msg.extend(b"Hello, ", None).unwrap();
        msg.extend(b"World!", None).unwrap();
        assert_eq!(msg.complete().unwrap().as_ref(), b"Hello, World!");
    }

    #[test]
    fn the_cap_is_enforced_before_fin() {
        let mut msg = IncompleteMessage::new(IncompleteMessageType::Binary);
        msg.extend(&[0u8; 6], Some(10)).unwrap();
        assert!(matches!(
            msg.extend(&[0u8; 5], Some(10)),
            Err(Error::Capacity(CapacityError::MessageTooLong {
                size: 11,
                max_size: 10,
            }))
        ));
    }

    #[test]
    fn a_message_of_exactly_the_cap_is_accepted() {
        let mut msg = IncompleteMessage::new(IncompleteMessageType::Binary);
        msg.extend(&[0u8; 10], Some(10)).unwrap();
        assert_eq!(msg.complete().unwrap().len(), 10);
    }

    #[test]
    fn text_must_be_utf8() {
        let mut msg = IncompleteMessage::new(IncompleteMessageType::Text);
        msg.extend(&[0xf0, 0x28, 0x8c, 0x28], None).unwrap();
        assert!(matches!(msg.complete(), Err(Error::Utf8)));
    }

    #[test]
    fn utf8_split_across_fragments_is_fine() {
        // "é" is 0xc3 0xa9; cut between the two bytes.
        let mut msg = IncompleteMessage::new(IncompleteMessageType::Text);
        msg.extend(&[b'h', 0xc3], None).unwrap();
        msg.extend(&[0xa9], None).unwrap();
        assert_eq!(msg.complete().unwrap().as_ref(), "hé".as_bytes());
    }
}
