//! Wire message types for the client channel.
//!
//! Every message is a JSON envelope `{ "type": string, "payload": object,
//! "timestamp"?: integer ms }`. Inbound envelopes are parsed once at the
//! channel boundary into discriminated [`messages::Inbound`] variants;
//! outbound variants are serialised back into envelopes by the writer.

pub mod messages;
