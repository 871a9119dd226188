//! Wire protocol support for the MAS controller.
//!
//! The controller speaks a line-oriented protocol over TCP in which every
//! byte is shifted into the high half of the byte range. [`codec`] implements
//! that framing; [`table`] holds the command vocabulary used to validate
//! outgoing commands before they reach the wire.

pub mod codec;
pub mod table;

pub use codec::{decode_reply, encode_message};
pub use table::{CommandEntry, CommandTable};
