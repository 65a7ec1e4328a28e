//! Large-object reliable transfer between peers.
//! Transport-agnostic: the host supplies message and stream transports, a payload source and
//! an install sink; the core picks a strategy, paces, recovers losses and verifies.

pub mod compressor;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fragment;
pub mod fragmented;
pub mod id;
pub mod integrity;
pub mod pacing;
pub mod progress;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod stream;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod testing;

pub use compressor::{Compressor, Deflate, Payload, PayloadCompressor};
pub use config::TransferConfig;
pub use coordinator::{TransferCoordinator, TransferOutcome};
pub use error::{FailureKind, TransferError, TransportError};
pub use id::{PeerId, TransferId};
pub use progress::{ChannelSink, NoopSink, ProgressEvent, ProgressSink};
pub use protocol::{Envelope, EnvelopeKind, Message, StreamPreamble, PROTOCOL_VERSION};
pub use registry::{SessionInfo, SessionKey};
pub use session::{Direction, Status, Strategy};
pub use transport::{
    DiscardSink, DrainCallback, InstallSink, MessageTransport, PayloadSource, StreamTransport,
};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
