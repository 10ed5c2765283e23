//! Inbound webhook handling.
//!
//! - [`signature`]: HMAC-SHA256 verification of the raw body
//! - [`parser`]: envelope parsing into a [`NewEvent`](crate::types::NewEvent)

pub mod parser;
pub mod signature;

pub use parser::{
    DELIVERY_HEADER, EVENT_HEADER, EnvelopeHeaders, IngestError, parse_delivery,
};
pub use signature::{SIGNATURE_HEADER, decode_signature, sign, verify};
