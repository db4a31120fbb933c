//! Opcodes and close codes.

use std::fmt;

/// WebSocket message opcode as in RFC 6455.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum OpCode {
    /// Data (text or binary).
    Data(Data),
    /// Control message (close, ping, pong).
    Control(Control),
}

/// Data opcodes as in RFC 6455.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Data {
    /// 0x0 denotes a continuation frame.
    Continue,
    /// 0x1 denotes a text frame.
    Text,
    /// 0x2 denotes a binary frame.
    Binary,
    /// 0x3-7 are reserved for further non-control frames.
    Reserved(u8),
}

/// Control opcodes as in RFC 6455.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Control {
    /// 0x8 denotes a connection close.
    Close,
    /// 0x9 denotes a ping.
    Ping,
    /// 0xa denotes a pong.
    Pong,
    /// 0xb-f are reserved for further control frames.
    Reserved(u8),
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Data::Continue => write!(f, "CONTINUE"),
            Data::Text => write!(f, "TEXT"),
            Data::Binary => write!(f, "BINARY"),
            Data::Reserved(x) => write!(f, "RESERVED_{x}"),
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Control::Close => write!(f, "CLOSE"),
            Control::Ping => write!(f, "PING"),
            Control::Pong => write!(f, "PONG"),
            Control::Reserved(x) => write!(f, "RESERVED_{x}"),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            OpCode::Data(d) => d.fmt(f),
            OpCode::Control(c) => c.fmt(f),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(code: OpCode) -> Self {
        match code {
            OpCode::Data(Data::Continue) => 0,
            OpCode::Data(Data::Text) => 1,
            OpCode::Data(Data::Binary) => 2,
            OpCode::Data(Data::Reserved(i)) => i,
            OpCode::Control(Control::Close) => 8,
            OpCode::Control(Control::Ping) => 9,
            OpCode::Control(Control::Pong) => 10,
            OpCode::Control(Control::Reserved(i)) => i,
        }
    }
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        match byte {
            0 => OpCode::Data(Data::Continue),
            1 => OpCode::Data(Data::Text),
            2 => OpCode::Data(Data::Binary),
            i @ 3..=7 => OpCode::Data(Data::Reserved(i)),
            8 => OpCode::Control(Control::Close),
            9 => OpCode::Control(Control::Ping),
            10 => OpCode::Control(Control::Pong),
            i @ 11..=15 => OpCode::Control(Control::Reserved(i)),
            _ => panic!("Bug: OpCode out of range"),
        }
    }
}

/// Status code used to indicate why an endpoint is closing the connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CloseCode {
    /// Indicates a normal closure, meaning that the purpose for which the
    /// connection was established has been fulfilled.
    Normal,
    /// Indicates that an endpoint is "going away", such as a server going
    /// down or a browser having navigated away from a page.
    Away,
    /// Indicates that an endpoint is terminating the connection due to a
    /// protocol error.
    Protocol,
    /// Indicates that an endpoint is terminating the connection because it
    /// has received a type of data it cannot accept.
    Unsupported,
    /// Indicates that an endpoint is terminating the connection because it
    /// has received data within a message that was not consistent with the
    /// type of the message (e.g., non-UTF-8 data within a text message).
    Invalid,
    /// Indicates that an endpoint is terminating the connection because it
    /// has received a message that violates its policy.
    Policy,
    /// Indicates that an endpoint is terminating the connection because it
    /// has received a message that is too big for it to process.
    Size,
    /// Indicates that a server is terminating the connection because it
    /// encountered an unexpected condition.
    Error,
    /// Any other status code. The engine passes peer-supplied codes through
    /// without checking them against the IANA registry.
    Other(u16),
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Error => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseCode::Normal,
            1001 => CloseCode::Away,
            1002 => CloseCode::Protocol,
            1003 => CloseCode::Unsupported,
            1007 => CloseCode::Invalid,
            1008 => CloseCode::Policy,
            1009 => CloseCode::Size,
            1011 => CloseCode::Error,
            code => CloseCode::Other(code),
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code: u16 = (*self).into();
        write!(f, "{code}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_byte_round_trip() {
        for byte in 0..16u8 {
            assert_eq!(u8::from(OpCode::from(byte)), byte);
        }
    }

    #[test]
    fn close_code_round_trip() {
        for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1011, 4000] {
            assert_eq!(u16::from(CloseCode::from(code)), code);
        }
    }
}
