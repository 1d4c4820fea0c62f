//! Proxy engine.
//!
//! Maintains two pools:
//!
//! - `available`: idle backend clients keyed by client id.
//! - `busy`: inbound connections bound to the client serving them.
//!
//! A backend client is in at most one of the two at any time. Outside the
//! short windows inside [`Proxy::connect`] and [`Proxy::disconnect`], in
//! non-elastic mode `available.size() + busy.size()` equals the number of
//! clients the pool was populated with.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use relayd_hooks::{HookName, HookRunner};
use relayd_pool::Pool;
use serde::Serialize;
use tracing::{debug, error, warn};

use super::client::{Client, ClientConfig};
use super::inbound::{Inbound, InboundId};
use super::traffic::{extract_field, TrafficEvent, TrafficField};
use crate::error::ProxyError;

/// Pool of idle backend clients keyed by client id.
pub type AvailablePool = Pool<String, Arc<Client>>;

/// Pool of active sessions keyed by inbound connection.
pub type BusyPool = Pool<InboundId, Session>;

/// Pool behavior switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyOptions {
    /// Create a new client when the available pool is empty.
    pub elastic: bool,
    /// Return elastic clients to the available pool on disconnect.
    pub reuse_elastic_clients: bool,
}

/// An inbound connection bound to its backend client.
#[derive(Clone)]
pub struct Session {
    pub inbound: Arc<dyn Inbound>,
    pub client: Arc<Client>,
}

/// Proxy counters.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub clients_assigned: AtomicU64,
    pub clients_released: AtomicU64,
    pub elastic_clients_created: AtomicU64,
    pub reconnects: AtomicU64,
    pub bytes_to_backend: AtomicU64,
    pub bytes_from_backend: AtomicU64,
}

/// Binds inbound connections to backend clients and relays their traffic.
pub struct Proxy {
    available: AvailablePool,
    busy: BusyPool,
    hooks: Arc<dyn HookRunner>,
    options: ProxyOptions,
    client_config: ClientConfig,
    stats: ProxyStats,
}

impl Proxy {
    /// Create a proxy over an already populated pool.
    ///
    /// `client_config` is the template for elastic and replacement clients.
    pub fn new(
        available: AvailablePool,
        hooks: Arc<dyn HookRunner>,
        options: ProxyOptions,
        client_config: ClientConfig,
    ) -> Self {
        Self {
            available,
            busy: Pool::unbounded(),
            hooks,
            options,
            client_config,
            stats: ProxyStats::default(),
        }
    }

    pub fn available(&self) -> &AvailablePool {
        &self.available
    }

    pub fn busy(&self) -> &BusyPool {
        &self.busy
    }

    pub fn options(&self) -> ProxyOptions {
        self.options
    }

    pub fn stats(&self) -> &ProxyStats {
        &self.stats
    }

    /// Backend client currently bound to `id`.
    pub fn bound_client(&self, id: InboundId) -> Option<Arc<Client>> {
        self.busy.get(&id).map(|session| session.client)
    }

    // =========================================================================
    // Connection Lifecycle
    // =========================================================================

    /// Bind `inbound` to an idle backend client.
    pub async fn connect(&self, inbound: Arc<dyn Inbound>) -> Result<(), ProxyError> {
        let client = match self.available.pop_any() {
            Some((_, client)) => client,
            None if self.options.elastic => {
                let client = Arc::new(Client::connect(&self.client_config).await?);
                self.stats.elastic_clients_created.fetch_add(1, Ordering::Relaxed);
                debug!(client = %client.short_id(), "Created a new elastic client");
                client
            }
            None => {
                error!("No more available connections");
                return Err(ProxyError::PoolExhausted);
            }
        };

        if let Err(e) = self.is_healthy(&client) {
            warn!(client = %client.short_id(), error = %e, "Client health check failed");
        }

        let id = inbound.id();
        let remote = inbound.remote_addr();
        let session = Session {
            inbound,
            client: Arc::clone(&client),
        };
        if let Err(e) = self.busy.put(id, session) {
            error!(inbound = %id, error = %e, "Failed to bind the connection");
            self.recycle(client);
            return Err(e.into());
        }
        self.stats.clients_assigned.fetch_add(1, Ordering::Relaxed);

        debug!(
            function = "proxy.connect",
            client = %client.short_id(),
            server = %remote,
            "Client has been assigned"
        );
        debug!(
            function = "proxy.connect",
            available = self.available.size(),
            busy = self.busy.size(),
            "Pool sizes"
        );
        Ok(())
    }

    /// Release the backend client bound to `inbound`.
    ///
    /// In elastic mode without reuse the client is closed instead and the
    /// call reports [`ProxyError::ClientNotConnected`].
    pub fn disconnect(&self, inbound: &dyn Inbound) -> Result<(), ProxyError> {
        let id = inbound.id();
        let Some(Session { client, .. }) = self.busy.pop(&id) else {
            error!(inbound = %id, "No client found for the connection");
            return Err(ProxyError::ClientNotFound);
        };
        self.stats.clients_released.fetch_add(1, Ordering::Relaxed);

        if self.options.elastic && !self.options.reuse_elastic_clients {
            client.close();
            debug!(client = %client.short_id(), "Closed the elastic client");
            return Err(ProxyError::ClientNotConnected);
        }

        if let Err(e) = self.is_healthy(&client) {
            warn!(client = %client.short_id(), error = %e, "Client health check failed");
        }
        self.recycle(client);

        debug!(
            function = "proxy.disconnect",
            available = self.available.size(),
            busy = self.busy.size(),
            "Pool sizes"
        );
        Ok(())
    }

    fn recycle(&self, client: Arc<Client>) {
        let id = client.id().to_string();
        if let Err(e) = self.available.put(id, Arc::clone(&client)) {
            error!(client = %client.short_id(), error = %e, "Failed to return the client to the pool");
            client.close();
        }
    }

    // =========================================================================
    // Traffic
    // =========================================================================

    /// Relay one request/response exchange for `inbound`.
    pub async fn pass_through(&self, inbound: &Arc<dyn Inbound>) -> Result<(), ProxyError> {
        let id = inbound.id();
        let Some(mut client) = self.bound_client(id) else {
            error!(inbound = %id, "No client found for the connection");
            return Err(ProxyError::ClientNotFound);
        };

        let (request, read_error) = match inbound.next(None) {
            Ok(data) => (data, None),
            Err(e) => {
                error!(inbound = %id, error = %e, "Error reading from client");
                (Vec::new(), Some(e.to_string()))
            }
        };
        debug!(
            function = "proxy.passthrough",
            length = request.len(),
            local = %inbound.local_addr(),
            remote = %inbound.remote_addr(),
            "Received data from client"
        );

        let event = TrafficEvent::new(
            inbound.as_ref(),
            &client,
            TrafficField::Request,
            request,
            read_error,
        );
        let request = self.run_traffic_hook(HookName::OnIngressTraffic, event).await;

        match client.send(&request).await {
            Ok(sent) => {
                self.stats
                    .bytes_to_backend
                    .fetch_add(sent as u64, Ordering::Relaxed);
                debug!(
                    function = "proxy.passthrough",
                    length = sent,
                    local = %client.local_addr(),
                    remote = %client.remote_addr(),
                    "Sent data to database"
                );
            }
            Err(e) => {
                error!(client = %client.short_id(), error = %e, "Error sending request to database")
            }
        }

        let (response, receive_error) = match client.receive().await {
            Ok(data) => {
                self.stats
                    .bytes_from_backend
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                debug!(
                    function = "proxy.passthrough",
                    length = data.len(),
                    local = %client.local_addr(),
                    remote = %client.remote_addr(),
                    "Received data from database"
                );
                (data, None)
            }
            Err(e) if e.is_eof() || matches!(e, ProxyError::ClientNotConnected) => {
                debug!(client = %client.short_id(), error = %e, "Backend connection is gone, reconnecting");
                client = self.reconnect(inbound, client).await?;
                (Vec::new(), Some(e.to_string()))
            }
            Err(e) => {
                error!(client = %client.short_id(), error = %e, "Error receiving data from database");
                (Vec::new(), Some(e.to_string()))
            }
        };

        let event = TrafficEvent::new(
            inbound.as_ref(),
            &client,
            TrafficField::Response,
            response,
            receive_error,
        );
        let response = self.run_traffic_hook(HookName::OnEgressTraffic, event).await;

        let local = inbound.local_addr();
        let remote = inbound.remote_addr();
        inbound
            .async_write(
                response,
                Box::new(move |result| match result {
                    Ok(written) => debug!(
                        function = "proxy.passthrough",
                        length = written,
                        local = %local,
                        remote = %remote,
                        "Sent data to client"
                    ),
                    Err(e) => warn!(remote = %remote, error = %e, "Failed to write to client"),
                }),
            )
            .map_err(|e| {
                error!(inbound = %id, error = %e, "Error writing to client");
                ProxyError::ServerSendFailed(e)
            })
    }

    // Ingress hooks may replace the request with anything, including nothing.
    // Egress hooks only replace the response with non-empty data.
    async fn run_traffic_hook(&self, hook: HookName, event: TrafficEvent) -> Vec<u8> {
        let result = match self
            .hooks
            .run(hook, event.to_payload(), self.hooks.verification())
            .await
        {
            Ok(result) => result,
            Err(e) => {
                error!(hook = %hook, error = %e, "Error running hook");
                None
            }
        };

        let outcome = extract_field(result.as_ref(), event.field);
        if let Some(e) = &outcome.error {
            error!(hook = %hook, error = %e, "Hook reported an error");
        }

        match outcome.data {
            Some(data) if event.field == TrafficField::Request || !data.is_empty() => data,
            _ => event.data,
        }
    }

    // Replaces a closed backend client and rebinds the inbound connection to
    // it. If no replacement can be made the stale binding stays, and the next
    // exchange tries again.
    async fn reconnect(
        &self,
        inbound: &Arc<dyn Inbound>,
        stale: Arc<Client>,
    ) -> Result<Arc<Client>, ProxyError> {
        stale.close();

        let id = inbound.id();
        if !self.busy.contains(&id) {
            // Disconnected or shut down; nothing to rebind.
            return Ok(stale);
        }

        let client = match Client::connect(&self.client_config).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!(client = %stale.short_id(), error = %e, "Failed to reconnect to the database");
                return Ok(stale);
            }
        };

        if !self.busy.remove(&id) {
            // Disconnected or shut down while we were reconnecting.
            client.close();
            return Ok(stale);
        }
        let session = Session {
            inbound: Arc::clone(inbound),
            client: Arc::clone(&client),
        };
        if let Err(e) = self.busy.put(id, session) {
            client.close();
            return Err(e.into());
        }
        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);

        debug!(
            inbound = %id,
            old = %stale.short_id(),
            new = %client.short_id(),
            "Client reconnected"
        );
        Ok(client)
    }

    // =========================================================================
    // Health
    // =========================================================================

    /// Check whether `client` can serve traffic.
    ///
    /// Fails with [`ProxyError::PoolExhausted`] whenever [`Proxy::is_exhausted`]
    /// holds, whatever the client's state. A disconnected client is only
    /// logged; it gets replaced on its next exchange.
    pub fn is_healthy(&self, client: &Client) -> Result<(), ProxyError> {
        if self.is_exhausted() {
            return Err(ProxyError::PoolExhausted);
        }
        if !client.is_connected() {
            warn!(client = %client.short_id(), "Client is disconnected");
        }
        Ok(())
    }

    /// True when the available pool is bounded, empty and not elastic.
    pub fn is_exhausted(&self) -> bool {
        if self.options.elastic {
            return false;
        }
        self.available.is_empty() && self.available.cap() > 0
    }

    /// Close every client and inbound connection and empty both pools.
    pub fn shutdown(&self) {
        self.available.for_each(|_, client| {
            client.close();
            ControlFlow::Continue(())
        });
        self.available.clear();
        debug!("All available connections have been closed");

        // Unbind before closing, so an interrupted exchange finds nothing to
        // reconnect.
        self.busy.for_each(|id, session| {
            self.busy.remove(id);
            session.inbound.close();
            session.client.close();
            ControlFlow::Continue(())
        });
        self.busy.clear();
        debug!("All busy connections have been closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relayd_hooks::{HookRegistry, Verification};
    use relayd_pool::UNBOUNDED;

    fn proxy(capacity: usize, options: ProxyOptions) -> Proxy {
        Proxy::new(
            Pool::new(capacity),
            Arc::new(HookRegistry::new(Verification::PassDown)),
            options,
            ClientConfig::new("tcp", "127.0.0.1:1"),
        )
    }

    #[test]
    fn test_is_exhausted() {
        assert!(proxy(4, ProxyOptions::default()).is_exhausted());
        assert!(!proxy(UNBOUNDED, ProxyOptions::default()).is_exhausted());

        let elastic = ProxyOptions {
            elastic: true,
            ..Default::default()
        };
        assert!(!proxy(4, elastic).is_exhausted());
    }

    #[test]
    fn test_shutdown_on_empty_pools() {
        let proxy = proxy(4, ProxyOptions::default());
        proxy.shutdown();
        proxy.shutdown();
        assert_eq!(proxy.available().size(), 0);
        assert_eq!(proxy.busy().size(), 0);
    }

    #[test]
    fn test_options_serialize_camel_case() {
        let options = ProxyOptions {
            elastic: true,
            reuse_elastic_clients: false,
        };
        assert_eq!(
            serde_json::to_value(options).unwrap(),
            serde_json::json!({"elastic": true, "reuseElasticClients": false})
        );
    }
}
