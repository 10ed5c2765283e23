//! Outbound access to the WMS API.

pub mod client;

pub use client::WmsClient;
