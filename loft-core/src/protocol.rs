//! Loft wire protocol: message types and version.

use serde::{Deserialize, Serialize};

use crate::id::{PeerId, TransferId};

/// Current protocol version. Sent in `Hello`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Bytes a `Fragment` message adds around its payload once enveloped and framed
/// (length prefix, envelope header, variant tag, transfer id, index, vec length).
pub const FRAGMENT_OVERHEAD: usize = 64;

/// All control-channel messages. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First message on every control connection, both directions.
    Hello {
        protocol_version: u8,
        node_id: PeerId,
        /// Port of the dedicated stream listener, if the node accepts streams.
        stream_port: Option<u16>,
    },
    /// Receiver asks the sender to start delivering `logical_name` under `transfer_id`.
    FetchRequest {
        transfer_id: TransferId,
        logical_name: String,
        accepts_stream: bool,
    },
    /// Round-trip probe used to measure average ping before pacing.
    Probe { nonce: u64 },
    ProbeReply { nonce: u64 },
    /// Fragmented path: total length, name and fragment layout of the payload.
    Announce {
        transfer_id: TransferId,
        logical_name: String,
        total_length: u64,
        compressed: bool,
        fragment_size: u32,
        fragment_count: u32,
        digest: [u8; 32],
    },
    /// One slice of the payload. Oneway on the first pass, request (acked) during recovery.
    Fragment {
        transfer_id: TransferId,
        index: u32,
        bytes: Vec<u8>,
    },
    /// How many fragments in `[range_start, range_end)` are still missing?
    Checkup {
        transfer_id: TransferId,
        range_start: u32,
        range_end: u32,
    },
    /// Reply to `Checkup`. Negative means the receiver aborted the whole transfer.
    CheckupReply { transfer_id: TransferId, missing: i64 },
    /// Which fragment indices are still missing (full list)?
    CompletenessRequest { transfer_id: TransferId },
    CompletenessReply {
        transfer_id: TransferId,
        missing: Vec<u32>,
    },
    /// Stream path header, sent on the control channel before the bytes go over the stream.
    StreamOffer {
        transfer_id: TransferId,
        logical_name: String,
        total_length: u64,
        compressed: bool,
        digest: [u8; 32],
        keepalive_token: u64,
    },
    /// Heartbeat while a stream write is outstanding.
    KeepAlive { token: u64 },
    KeepAliveAck { token: u64 },
    /// Sender finished writing; how much has the receiver taken in?
    StreamFinish { transfer_id: TransferId },
    StreamReport {
        transfer_id: TransferId,
        received: u64,
        complete: bool,
    },
    Cancel { transfer_id: TransferId },
    Ack { transfer_id: TransferId },
    Reject {
        transfer_id: TransferId,
        reason: String,
    },
}

impl Message {
    /// Short variant name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::FetchRequest { .. } => "fetch-request",
            Message::Probe { .. } => "probe",
            Message::ProbeReply { .. } => "probe-reply",
            Message::Announce { .. } => "announce",
            Message::Fragment { .. } => "fragment",
            Message::Checkup { .. } => "checkup",
            Message::CheckupReply { .. } => "checkup-reply",
            Message::CompletenessRequest { .. } => "completeness-request",
            Message::CompletenessReply { .. } => "completeness-reply",
            Message::StreamOffer { .. } => "stream-offer",
            Message::KeepAlive { .. } => "keepalive",
            Message::KeepAliveAck { .. } => "keepalive-ack",
            Message::StreamFinish { .. } => "stream-finish",
            Message::StreamReport { .. } => "stream-report",
            Message::Cancel { .. } => "cancel",
            Message::Ack { .. } => "ack",
            Message::Reject { .. } => "reject",
        }
    }
}

/// Delivery class of a framed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// Fire-and-forget; any reply the handler produces is discarded.
    Oneway,
    /// Sender awaits a `Reply` carrying the same `seq`.
    Request,
    Reply { to: u64 },
}

/// What actually travels in a control frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    pub kind: EnvelopeKind,
    pub message: Message,
}

/// First frame on a dedicated stream connection; raw payload bytes follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPreamble {
    pub node_id: PeerId,
    pub transfer_id: TransferId,
    pub total_length: u64,
}
