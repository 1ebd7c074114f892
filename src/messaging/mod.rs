//! Bus messaging: envelope codec, subject naming and the broker client.

pub mod client;
pub mod envelope;
pub mod subjects;

pub use client::{BusClient, BusRequestError, EnvelopeStream, InboundEnvelope};
pub use envelope::{
    ConnectAck, ConnectReject, ConnectRequest, Envelope, MAX_CALL_HOPS, RuntimeReconnect,
    ToolCallReply, ToolCallRequest, ToolsConfigUpdate,
};
