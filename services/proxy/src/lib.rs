//! relayd
//!
//! Protocol-agnostic connection-pooling proxy. Inbound connections are bound
//! to pre-established backend connections and every request/response
//! exchange passes through ingress and egress traffic hooks.

pub mod config;
pub mod error;
pub mod proxy;

pub use error::ProxyError;
pub use proxy::{
    Client, ClientConfig, Inbound, InboundId, Proxy, ProxyOptions, ProxyStats, Server,
    ServerConfig, ServerStats, Session, TcpInbound, TrafficEvent, TrafficField, WriteCallback,
};
