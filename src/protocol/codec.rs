//! Byte-level encoding of the controller's scrambled ASCII framing.
//!
//! Messages travel as 7-bit ASCII with the high bit set on every byte.
//! An outgoing message ends with a single shifted carriage return; a reply
//! ends with a shifted carriage return + line feed pair. The shift is a plain
//! +128 on every code point, with no escaping: the protocol assumes message
//! text never needs the high bit itself.
//!
//! `encode_message` and `decode_reply` are pure and are exact inverses on the
//! payload (the terminators are added/stripped, not round-tripped).

/// Shift applied to every byte on the wire.
const SHIFT: u8 = 128;

/// Terminator appended to an outgoing message (`\r` + 128).
pub const MESSAGE_TERMINATOR: u8 = 0x8D;

/// Terminator pair ending a controller reply (`\r\n` + 128 on each byte).
pub const REPLY_TERMINATOR: [u8; 2] = [0x8D, 0x8A];

/// Encode a command line for the wire.
///
/// Every byte is shifted up by 128 and the shifted carriage return is
/// appended. `message` must be 7-bit ASCII.
pub fn encode_message(message: &str) -> Vec<u8> {
    debug_assert!(message.is_ascii(), "wire messages must be 7-bit ASCII");
    let mut encoded: Vec<u8> = message.bytes().map(|b| b.wrapping_add(SHIFT)).collect();
    encoded.push(MESSAGE_TERMINATOR);
    encoded
}

/// Decode a complete controller reply into whitespace-separated tokens.
///
/// Every byte is shifted back down by 128, the trailing two-byte reply
/// terminator is dropped, and the remaining text is split on whitespace.
/// The caller must only pass buffers that end with [`REPLY_TERMINATOR`];
/// anything shorter than the terminator decodes to no tokens.
pub fn decode_reply(reply: &[u8]) -> Vec<String> {
    let Some(payload) = reply.len().checked_sub(REPLY_TERMINATOR.len()) else {
        return Vec::new();
    };
    let decoded: String = reply[..payload]
        .iter()
        .map(|b| char::from(b.wrapping_sub(SHIFT)))
        .collect();
    decoded.split_whitespace().map(str::to_owned).collect()
}

/// Whether `buffer` ends with the two-byte reply terminator.
pub fn reply_complete(buffer: &[u8]) -> bool {
    buffer.ends_with(&REPLY_TERMINATOR)
}
