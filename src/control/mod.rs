//! Control plane: typed envelopes over a length-framed local socket.

pub mod codec;
pub mod handlers;
pub mod message;
pub mod router;

pub use codec::{ControlCodec, MAX_FRAME_BYTES};
pub use handlers::{CommandTerminalLauncher, SystemHandler, TerminalHandler, TerminalLauncher};
pub use message::{
    Category, ControlCommand, ControlMessage, EnvelopeHeader, MessageType, SpawnRequest,
    SpawnResult, SystemCommand, TerminalCommand,
};
pub use router::{ConnectionState, ControlHandler, ControlSocketRouter, RouterConfig};
