pub mod events;
pub mod handler;
pub mod hub;
pub mod metrics;
pub mod mirror;
pub mod rate_limit;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
