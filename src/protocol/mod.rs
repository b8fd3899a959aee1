//! Wire-level framing: splitting messages into MTU-sized fragments and putting them back together.

pub mod chunker;
pub mod fragment;
pub mod reassembler;
pub mod stream_frame;

pub use chunker::{Chunker, Fragments};
pub use fragment::{Fragment, FragmentHeader, FragmentPosition, MessageKind};
pub use reassembler::{LogicalMessage, Reassembler};
pub use stream_frame::StreamFrame;

/// Raw single-byte control signals. They bypass the fragment framing and are interpreted by the
///  device's script engine directly.
pub mod signal {
    /// interrupts the currently running script
    pub const BREAK: u8 = 0x03;
    /// restarts the script engine
    pub const RESET: u8 = 0x04;
}
