//! pg_pb3_ld wire format: a varint header length, a protobuf header with a
//! parallel type/offset table, then the concatenated sub-messages.

pub mod decoder;
pub mod encoder;
pub mod messages;
pub mod varint;

#[cfg(test)]
mod decoder_tests;

pub use decoder::decode;
pub use encoder::encode;
pub use messages::{
    BeginTransaction, CommitTransaction, DeleteDescription, FieldSetDescription,
    InsertDescription, MessageType, TableDescription, UpdateDescription, WireMessage,
    WireMessageHeader,
};
