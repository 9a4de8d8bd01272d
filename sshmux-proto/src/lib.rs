//! Wire format of the OpenSSH ControlMaster multiplexing protocol.
//!
//! Messages are sequences of big-endian `u32` and length-prefixed string
//! fields, framed with a 4-byte big-endian length prefix and carried over
//! the master's Unix control socket.

mod codec;
mod field;
mod message;

pub use codec::{frame, read_packet, write_packet};
pub use field::{DecodeError, Decoder, Encoder};
pub use message::{AliveCheck, ESCAPE_DISABLED, Hello, MUX_VERSION, NewSession, Reply, kind};
