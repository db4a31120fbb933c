//! WebSocket protocol implementation.

pub mod frame;

pub mod fragment;
pub mod message;

pub use frame::CloseFrame;
