// gridsync-relay library entry point: rooms, connections and the HTTP surface.

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod replica;
pub mod room;
pub mod server;
pub mod ws;
