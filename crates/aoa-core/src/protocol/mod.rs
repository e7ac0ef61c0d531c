//! Protocol module containing the command table and the binary frame codec.

pub mod codec;
pub mod command;

pub use codec::{
    decode_header, decode_payload, encode, encode_message, encode_u16, split_frame,
    write_data_header, FrameHeader, Message, ProtocolError, SessionId, DATA_PREFIX_SIZE,
    HEADER_SIZE, MAX_FRAME_SIZE,
};
pub use command::Command;
