//! WMS Sync - an ordered, durable, retrying queue for inbound warehouse events.
//!
//! Webhooks from the Warehouse Management System arrive out of order,
//! duplicated, or not at all. This crate admits each delivery once, holds
//! events until their causal prerequisites have been applied, dispatches them
//! to handlers with bounded retries, and polls the WMS for changes whose
//! notification never arrived.

pub mod config;
pub mod persistence;
pub mod projection;
pub mod queue;
pub mod server;
pub mod store;
pub mod types;
pub mod webhooks;
pub mod wms;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_utils;
