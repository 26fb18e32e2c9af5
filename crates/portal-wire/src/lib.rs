//! Binary protocol spoken between keyboard devices and the portal server.
//!
//! [`wire`] encodes single messages; [`framing`] carries them over a byte
//! stream with a length prefix.

pub mod framing;
pub mod wire;

pub use framing::{read_frame, write_frame, FrameError, MAX_FRAME_LEN};
pub use wire::{
    decode_device_message, decode_server_message, encode_device_message, encode_server_message,
    DeviceMessage, EndpointEntry, ServerMessage, WireError, MAX_STRING_LEN, PROTOCOL_VERSION,
};
