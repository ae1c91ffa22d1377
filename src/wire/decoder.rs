use prost::Message;
use tracing::trace;

use super::messages::{
    BeginTransaction, CommitTransaction, DeleteDescription, InsertDescription, MessageType,
    UpdateDescription, WireMessage, WireMessageHeader,
};
use super::varint::decode_header_length;
use crate::error::DecodeError;

/// Smallest buffer that can hold a length prefix, a header entry and a type.
const MIN_WIRE_MESSAGE_LEN: usize = 3;

/// Decode one wire message into its sub-messages, in header order.
///
/// Layout: `[varint header_len][header_len bytes: WireMessageHeader][payload]`.
/// Sub-message `i` spans `payload[offsets[i]..offsets[i + 1]]`, the last one
/// runs to the end of the payload.
pub fn decode(raw: &[u8]) -> Result<Vec<WireMessage>, DecodeError> {
    if raw.len() < MIN_WIRE_MESSAGE_LEN {
        return Err(DecodeError::TruncatedMessage { len: raw.len() });
    }

    let (header_len, prefix_len) = decode_header_length(raw)?;
    let header = decode_header(&raw[prefix_len..], prefix_len, header_len)?;
    // decode_header guarantees header_len fits in the remaining buffer
    let payload = &raw[prefix_len + header_len as usize..];

    trace!(
        header_len,
        messages = header.types.len(),
        payload_len = payload.len(),
        "Decoding wire message"
    );

    let mut messages = Vec::with_capacity(header.types.len());
    for (index, &raw_type) in header.types.iter().enumerate() {
        let slice = sub_message(payload, &header.offsets, index)?;
        let message_type = MessageType::try_from(raw_type).map_err(|_| {
            DecodeError::UnknownMessageType {
                index,
                value: raw_type,
            }
        })?;
        messages.push(decode_sub_message(message_type, slice, index)?);
    }

    Ok(messages)
}

fn decode_header(
    rest: &[u8],
    offset: usize,
    header_len: u64,
) -> Result<WireMessageHeader, DecodeError> {
    let header_error = |reason: String| DecodeError::HeaderDecodeError {
        offset,
        header_len,
        reason,
    };

    if header_len > rest.len() as u64 {
        return Err(header_error(format!(
            "header extends past the end of the buffer ({} bytes remain)",
            rest.len()
        )));
    }

    let header = WireMessageHeader::decode(&rest[..header_len as usize])
        .map_err(|e| header_error(e.to_string()))?;

    if header.types.len() != header.offsets.len() {
        return Err(header_error(format!(
            "len(types) {} != len(offsets) {}",
            header.types.len(),
            header.offsets.len()
        )));
    }

    Ok(header)
}

fn sub_message<'a>(
    payload: &'a [u8],
    offsets: &[u32],
    index: usize,
) -> Result<&'a [u8], DecodeError> {
    let out_of_bounds = |offset: u32| DecodeError::OffsetOutOfBounds {
        index,
        offset,
        payload_len: payload.len(),
    };

    let start = offsets[index];
    if start as usize > payload.len() {
        return Err(out_of_bounds(start));
    }

    let end = match offsets.get(index + 1) {
        Some(&next) if (next as usize) > payload.len() => {
            return Err(DecodeError::OffsetOutOfBounds {
                index: index + 1,
                offset: next,
                payload_len: payload.len(),
            })
        }
        Some(&next) if next < start => {
            return Err(DecodeError::OffsetOutOfBounds {
                index: index + 1,
                offset: next,
                payload_len: payload.len(),
            })
        }
        Some(&next) => next as usize,
        None => payload.len(),
    };

    Ok(&payload[start as usize..end])
}

fn decode_sub_message(
    message_type: MessageType,
    data: &[u8],
    index: usize,
) -> Result<WireMessage, DecodeError> {
    let payload_error = |e: prost::DecodeError| DecodeError::PayloadDecodeError {
        index,
        message_type: message_type.as_str(),
        len: data.len(),
        reason: e.to_string(),
    };

    let message = match message_type {
        MessageType::Begin => {
            WireMessage::Begin(BeginTransaction::decode(data).map_err(payload_error)?)
        }
        MessageType::Commit => {
            WireMessage::Commit(CommitTransaction::decode(data).map_err(payload_error)?)
        }
        MessageType::Insert => {
            WireMessage::Insert(InsertDescription::decode(data).map_err(payload_error)?)
        }
        MessageType::Update => {
            WireMessage::Update(UpdateDescription::decode(data).map_err(payload_error)?)
        }
        MessageType::Delete => {
            WireMessage::Delete(DeleteDescription::decode(data).map_err(payload_error)?)
        }
    };

    Ok(message)
}
