//! Utilities to work with raw WebSocket frames.

pub mod coding;

pub mod codec;
#[allow(clippy::module_inception)]
mod frame;
mod mask;

pub use frame::{CloseFrame, Frame, FrameHeader};
