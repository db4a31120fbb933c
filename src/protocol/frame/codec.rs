//! WebSocket frame codec: serialization and incremental deserialization.

mod decode;
pub use decode::{DecodeError, FrameDecoder, decode_frame};

mod encode;
pub use encode::FrameEncoder;
