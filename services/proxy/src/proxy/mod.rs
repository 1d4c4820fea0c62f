//! Connection-pooling proxy.
//!
//! ## Architecture
//!
//! ```text
//! Client -> Server -> Proxy::connect   -> available pool -> busy pool
//!                  -> Proxy::pass_through
//!                       onIngressTraffic -> Client::send -> Client::receive
//!                       onEgressTraffic  -> Inbound::async_write
//!                  -> Proxy::disconnect -> busy pool -> available pool
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let proxy = Arc::new(Proxy::new(pool, hooks.clone(), options, client_config));
//! let server = Arc::new(Server::bind(ServerConfig::new(addr), proxy, hooks).await?);
//! server.run(shutdown_rx).await?;
//! ```

mod client;
mod engine;
mod inbound;
mod server;
mod traffic;

pub use client::{
    client_id, resolve, Client, ClientConfig, DEFAULT_RECEIVE_BUFFER_SIZE,
    DEFAULT_RECEIVE_CHUNK_SIZE,
};
pub use engine::{AvailablePool, BusyPool, Proxy, ProxyOptions, ProxyStats, Session};
pub use inbound::{Inbound, InboundId, TcpInbound, WriteCallback};
pub use server::{Server, ServerConfig, ServerStats, DEFAULT_MAX_CONNECTIONS};
pub use traffic::{
    connection_payload, extract_field, HookOutcome, PeerAddrs, TrafficEvent, TrafficField,
};
