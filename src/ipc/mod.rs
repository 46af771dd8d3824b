//! Host side of the tool IPC channel.
//!
//! The protocol is shared with `toolsmith-sdk`: fixed 8-byte little-endian
//! integers and length-prefixed frames, with [`Opcode`] tags selecting the
//! operation a tool requests.

pub mod codec;

pub use codec::{read_frame, read_u64, write_frame, write_u64};
pub use toolsmith_sdk::{DENIED, Opcode};
