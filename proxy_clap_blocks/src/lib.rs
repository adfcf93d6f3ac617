//! Building blocks for the command line of the proxy
pub mod health;
pub mod proxy;
pub mod socket_addr;
pub mod store;
pub mod tokio;
