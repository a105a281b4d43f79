//! The binary wire protocol: codecs, framing, message ids, and the inbound
//! and outbound engines.

mod buffered_input;
mod buffered_output;
mod client_messages;
mod decimal;
mod describe_protocol;
mod field_type;
mod message_type;
mod server_messages;
mod symbol_codec;

pub(crate) use buffered_input::BufferedInput;
pub(crate) use buffered_output::{BufferedOutput, FrameBuilder};
pub(crate) use client_messages::{
    send_heartbeat, send_protocol_description, send_record_description, subscribe_symbols,
    SubscribeRequest,
};
pub(crate) use describe_protocol::ProtocolState;
pub(crate) use field_type::FieldType;
pub(crate) use server_messages::{process_server_data, InboundBuffer};
pub(crate) use symbol_codec::{encode_symbol, read_symbol, write_symbol};

pub use describe_protocol::MessageSupport;
pub use message_type::MessageType;
