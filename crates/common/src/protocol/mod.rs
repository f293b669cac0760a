// Binary framing for the relay's sync/awareness protocol.

pub mod frame;

pub use frame::{
    decode_frame, decode_var_buf, encode_frame, encode_var_buf, FrameError, MessageType, RawFrame,
};
