use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use super::messages::{WireMessage, WireMessageHeader};
use super::varint::{encode_length, encoded_len};

/// Encode `messages` into one wire message, the inverse of
/// [`decode`](super::decode).
///
/// Produces `[varint header_len][WireMessageHeader][payload]` with the
/// offsets table pointing at each sub-message inside the payload.
pub fn encode(messages: &[WireMessage]) -> Bytes {
    let mut header = WireMessageHeader {
        types: Vec::with_capacity(messages.len()),
        offsets: Vec::with_capacity(messages.len()),
    };
    let mut payload = BytesMut::new();

    for message in messages {
        header.types.push(message.message_type() as i32);
        header.offsets.push(payload.len() as u32);
        payload.put_slice(&message.encode_payload());
    }

    let header_bytes = header.encode_to_vec();
    let header_len = header_bytes.len() as u64;

    let mut prefix = Vec::with_capacity(encoded_len(header_len));
    encode_length(header_len, &mut prefix);

    let mut out = BytesMut::with_capacity(prefix.len() + header_bytes.len() + payload.len());
    out.put_slice(&prefix);
    out.put_slice(&header_bytes);
    out.put_slice(&payload);
    out.freeze()
}
