//! Reverse tunnels: control sessions, public forwarders, the tunnel client and the
//! front-door balancer, all speaking the packet protocol in [`codec`].

pub mod balancer;
pub mod client;
pub mod codec;
pub mod edge;
pub mod error;
pub mod forwarder;
pub mod handler;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod transport;
