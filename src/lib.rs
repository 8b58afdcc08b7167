pub mod address;
pub mod clock;
pub mod config;
pub mod ingress;
pub mod logging;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
