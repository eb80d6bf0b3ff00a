// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The process-wide pool of outbound connections to other deployments.
//!
//! One entry per downstream address. Each entry holds a lazily-dialed,
//! multiplexed channel, a health bit, and the per-address dial lock that
//! keeps reconnects from thundering-herd dialing. Sends are deadlined and
//! transient transport failures are retried with exponential backoff and
//! jitter; handler-level failures are never retried here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

use flow_ore::retry::{Retry, RetryResult};
use flow_repr::schema::SchemaMap;
use flow_repr::{DataRequest, Error};

use crate::grpc::{decode_envelope, encode_envelope, status_to_error};
use crate::proto;
use crate::proto::data_client::DataClient;

/// Tuning knobs for the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Default per-send deadline when the caller supplies none.
    pub timeout: Duration,
    /// Bound on transport-level retries per send.
    pub retries: usize,
    /// Initial retry backoff; grows exponentially with full jitter.
    pub backoff: Duration,
    /// How long an address stays skipped after a failure before round-robin
    /// probes it again.
    pub unhealthy_cooldown: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            timeout: Duration::from_secs(60),
            retries: 3,
            backoff: Duration::from_millis(100),
            unhealthy_cooldown: Duration::from_secs(5),
        }
    }
}

/// A process-wide pool of outbound connections, keyed by address.
#[derive(Debug)]
pub struct ConnectionPool {
    entries: Mutex<HashMap<String, Arc<PoolEntry>>>,
    opts: PoolOptions,
}

impl ConnectionPool {
    pub fn new(opts: PoolOptions) -> ConnectionPool {
        ConnectionPool {
            entries: Mutex::new(HashMap::new()),
            opts,
        }
    }

    /// Sends `req` to `address`, dialing if needed, deadlining the call, and
    /// retrying transient transport errors up to the configured bound.
    pub async fn send(
        &self,
        address: &str,
        req: &DataRequest,
        deadline: Option<Duration>,
    ) -> Result<DataRequest, Error> {
        let entry = self.entry(address);
        let timeout = deadline.unwrap_or(self.opts.timeout);
        Retry::default()
            .initial_backoff(self.opts.backoff)
            .max_tries(self.opts.retries.max(1))
            .retry_async(|state| {
                let entry = Arc::clone(&entry);
                let req = req.clone();
                async move {
                    if state.i > 0 {
                        debug!(address = %entry.address, attempt = state.i, "pool: retrying send");
                    }
                    match entry.process_once(req, timeout).await {
                        Ok(resp) => {
                            entry.mark_healthy();
                            RetryResult::Ok(resp)
                        }
                        Err(err) if err.kind.is_retryable() => {
                            entry.mark_unhealthy();
                            RetryResult::RetryableErr(err)
                        }
                        Err(err) => RetryResult::FatalErr(err),
                    }
                }
            })
            .await
    }

    /// Fetches the schema map of the node at `address`, retrying until the
    /// node answers or the bound is hit. Used by the gateway at start-up.
    pub async fn discover(
        &self,
        address: &str,
        max_wait: Duration,
    ) -> Result<SchemaMap, Error> {
        let entry = self.entry(address);
        Retry::default()
            .initial_backoff(self.opts.backoff)
            .max_duration(max_wait)
            .retry_async(|_state| {
                let entry = Arc::clone(&entry);
                async move {
                    match entry.discover_once().await {
                        Ok(map) => {
                            entry.mark_healthy();
                            RetryResult::Ok(map)
                        }
                        Err(err) if err.kind.is_retryable() => {
                            entry.mark_unhealthy();
                            RetryResult::RetryableErr(err)
                        }
                        Err(err) => RetryResult::FatalErr(err),
                    }
                }
            })
            .await
    }

    /// Probes the node's health RPC once, returning `(serving, detail)`.
    /// Heads use the detail string to locate a consensus leader.
    pub async fn health(&self, address: &str) -> Result<(bool, String), Error> {
        let entry = self.entry(address);
        let mut client = entry.client().await?;
        match client.health(proto::Empty {}).await {
            Ok(resp) => {
                entry.mark_healthy();
                let status = resp.into_inner();
                Ok((status.serving, status.detail))
            }
            Err(status) => {
                let err = status_to_error(&status, address);
                if err.kind.is_retryable() {
                    entry.mark_unhealthy();
                }
                Err(err)
            }
        }
    }

    /// Whether the address is currently considered usable. Unhealthy
    /// addresses become probe-able again after the cool-down.
    pub fn is_healthy(&self, address: &str) -> bool {
        let entries = self.entries.lock();
        match entries.get(address) {
            Some(entry) => entry.is_usable(self.opts.unhealthy_cooldown),
            None => true,
        }
    }

    /// Drops every pooled connection.
    pub fn close_all(&self) {
        let mut entries = self.entries.lock();
        let n = entries.len();
        entries.clear();
        debug!("pool: closed {n} connections");
    }

    fn entry(&self, address: &str) -> Arc<PoolEntry> {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(address.to_string()).or_insert_with(|| {
            Arc::new(PoolEntry {
                address: address.to_string(),
                client: tokio::sync::OnceCell::new(),
                healthy: AtomicBool::new(true),
                unhealthy_since: Mutex::new(None),
            })
        }))
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool::new(PoolOptions::default())
    }
}

/// One pooled downstream address.
#[derive(Debug)]
struct PoolEntry {
    address: String,
    /// The connected client. `OnceCell` serializes the dial per address;
    /// once established, the channel multiplexes any number of concurrent
    /// sends and reconnects internally.
    client: tokio::sync::OnceCell<DataClient<Channel>>,
    healthy: AtomicBool,
    unhealthy_since: Mutex<Option<Instant>>,
}

impl PoolEntry {
    async fn client(&self) -> Result<DataClient<Channel>, Error> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let endpoint = Endpoint::from_shared(format!("http://{}", self.address))
                    .map_err(|e| {
                        Error::invalid_input("pool", format!("bad address {}: {e}", self.address))
                    })?
                    .connect_timeout(Duration::from_secs(5));
                Ok::<_, Error>(DataClient::new(endpoint.connect_lazy()))
            })
            .await?;
        Ok(client.clone())
    }

    async fn process_once(
        &self,
        req: DataRequest,
        timeout: Duration,
    ) -> Result<DataRequest, Error> {
        let mut client = self.client().await?;
        let mut request = tonic::Request::new(encode_envelope(&req).map_err(|s| {
            Error::invalid_input("pool", s.message().to_string())
        })?);
        // The grpc-timeout header lets the server shed the call; the local
        // timeout bounds it even when the peer never answers.
        request.set_timeout(timeout);
        match tokio::time::timeout(timeout, client.process(request)).await {
            Err(_) => Err(Error::cancelled(&self.address)),
            Ok(Ok(resp)) => decode_envelope(&resp.into_inner())
                .map_err(|s| Error::invalid_input(&self.address, s.message().to_string())),
            Ok(Err(status)) => Err(status_to_error(&status, &self.address)),
        }
    }

    async fn discover_once(&self) -> Result<SchemaMap, Error> {
        let mut client = self.client().await?;
        match client.endpoint_discovery(proto::Empty {}).await {
            Ok(resp) => serde_json::from_str(&resp.into_inner().schema_json).map_err(|e| {
                Error::invalid_input(&self.address, format!("bad schema map: {e}"))
            }),
            Err(status) => Err(status_to_error(&status, &self.address)),
        }
    }

    fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Relaxed);
        *self.unhealthy_since.lock() = None;
    }

    fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            warn!(address = %self.address, "pool: marking address unhealthy");
        }
        let mut since = self.unhealthy_since.lock();
        if since.is_none() {
            *since = Some(Instant::now());
        }
    }

    fn is_usable(&self, cooldown: Duration) -> bool {
        if self.healthy.load(Ordering::Relaxed) {
            return true;
        }
        // After the cool-down, let round-robin probe the address again.
        self.unhealthy_since
            .lock()
            .is_some_and(|since| since.elapsed() >= cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_address_is_unavailable() {
        let pool = ConnectionPool::new(PoolOptions {
            retries: 2,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_millis(200),
            ..Default::default()
        });
        let req = DataRequest::new("/foo", flow_repr::DocBatch::empty());
        // Port 1 on loopback refuses immediately.
        let err = pool
            .send("127.0.0.1:1", &req, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind,
            flow_repr::ErrorKind::Unavailable | flow_repr::ErrorKind::Cancelled
        ));
        assert!(!pool.is_healthy("127.0.0.1:1"));
    }

    #[tokio::test]
    async fn health_recovers_after_cooldown() {
        let pool = ConnectionPool::new(PoolOptions {
            retries: 1,
            backoff: Duration::from_millis(1),
            timeout: Duration::from_millis(50),
            unhealthy_cooldown: Duration::from_millis(0),
        });
        let req = DataRequest::new("/foo", flow_repr::DocBatch::empty());
        let _ = pool
            .send("127.0.0.1:1", &req, Some(Duration::from_millis(100)))
            .await;
        // Zero cool-down: immediately probe-able again.
        assert!(pool.is_healthy("127.0.0.1:1"));
    }

    #[test]
    fn close_all_empties_the_pool() {
        let pool = ConnectionPool::default();
        let _ = pool.entry("10.0.0.1:80");
        pool.close_all();
        assert!(pool.entries.lock().is_empty());
    }
}
