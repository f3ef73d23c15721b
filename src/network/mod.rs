pub mod client;
pub mod connection_manager;
pub mod dedup_filter;
pub mod events;
pub mod message;
pub mod roster;
pub mod server;
pub mod wire;
