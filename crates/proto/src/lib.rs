//! # cosi-proto
//!
//! The wire contract between nodes of a signing tree: typed message
//! envelopes for the four protocol phases plus view-change traffic, and a
//! deterministic binary codec.
//!
//! ## Modules
//!
//! - [`message`]: `SigningMessage` envelope and per-phase payload structs
//! - [`encoding`]: bincode-based encode/decode with typed errors
//!
//! Group elements and scalars cross the wire as canonical 32-byte arrays;
//! interpreting them is the signing layer's job. The transport below this
//! crate moves opaque frames and never decodes payloads.

pub mod encoding;
pub mod message;

pub use encoding::{decode, encode, CodecError};
pub use message::{
    AnnouncementPayload, ChallengePayload, CommitmentPayload, ErrorPayload, ExceptionSet,
    MessageBody, ResponsePayload, SigningMessage, ViewAcceptedPayload, ViewChangePayload,
};
