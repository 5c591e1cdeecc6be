//! Pool of mutual-TLS upstream connections keyed by target and credential.
//!
//! Every checkout re-checks the credential window under the same shard lock
//! that hands the connection out, so no request is dispatched on a connection
//! whose certificate is inside the safety margin.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};

use super::connector::{Established, UpstreamConnector, UpstreamSender};
use crate::credential::{self, CredentialIdentity, ExchangedCredential};
use crate::error::ConnectError;
use crate::proxy::relay::ProxyBody;
use crate::state::Metrics;
use crate::target::Target;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub target: String,
    pub identity: CredentialIdentity,
}

impl PoolKey {
    pub fn new(target: &Target, credential: &ExchangedCredential) -> Self {
        Self {
            target: target.name.clone(),
            identity: credential.identity(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub safety_margin: Duration,
    pub idle_timeout: Duration,
    pub max_idle_per_key: usize,
}

struct PoolEntry {
    id: u64,
    sender: UpstreamSender,
    task: AbortHandle,
    not_before: Option<DateTime<Utc>>,
    not_after: DateTime<Utc>,
    /// Requests currently using a shared (HTTP/2) entry.
    in_flight: usize,
    idle_since: Instant,
}

impl PoolEntry {
    fn usable(&self, now: DateTime<Utc>, settings: &PoolSettings) -> bool {
        credential::covers(self.not_before, self.not_after, now, settings.safety_margin)
            && !self.sender.is_closed()
            && (self.in_flight > 0 || self.idle_since.elapsed() < settings.idle_timeout)
    }

    fn shutdown(&self) {
        if self.in_flight == 0 {
            self.task.abort();
        }
    }
}

enum Checkout {
    Exclusive(PoolEntry),
    Shared { id: u64, sender: UpstreamSender },
}

pub struct ConnectionPool {
    entries: DashMap<PoolKey, Vec<PoolEntry>>,
    connector: UpstreamConnector,
    settings: PoolSettings,
    metrics: Arc<Metrics>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(connector: UpstreamConnector, settings: PoolSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            entries: DashMap::new(),
            connector,
            settings,
            metrics,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Hand out a connection to `target` authenticated with `credential`.
    ///
    /// The credential is consumed: on a pool hit it is dropped immediately,
    /// otherwise it lives until the new TLS session has taken its key.
    pub async fn acquire(
        self: &Arc<Self>,
        target: &Target,
        credential: ExchangedCredential,
    ) -> Result<PooledConnection, ConnectError> {
        let key = PoolKey::new(target, &credential);
        let now = Utc::now();

        if let Some(checkout) = self.checkout(&key, now) {
            self.metrics.record_pool_hit();
            tracing::debug!(target = %key.target, identity = %key.identity, "Reusing pooled upstream connection");
            return Ok(PooledConnection::new(self.clone(), key, checkout, true));
        }

        if !credential.covers(now, self.settings.safety_margin) {
            return Err(ConnectError::CredentialExpired);
        }

        let established = match self.connector.connect(target, &credential).await {
            Ok(established) => established,
            Err(e) => {
                self.metrics.record_connect_error();
                return Err(e);
            }
        };
        drop(credential);

        let checkout = self.admit(&key, established);
        Ok(PooledConnection::new(self.clone(), key, checkout, false))
    }

    fn checkout(&self, key: &PoolKey, now: DateTime<Utc>) -> Option<Checkout> {
        let mut entries = self.entries.get_mut(key)?;

        let before = entries.len();
        entries.retain(|entry| {
            let keep = entry.usable(now, &self.settings);
            if !keep {
                entry.shutdown();
            }
            keep
        });
        let evicted = before - entries.len();

        let checkout = match entries.iter_mut().find(|e| e.sender.is_shared()) {
            Some(entry) => entry.sender.share().map(|sender| {
                entry.in_flight += 1;
                Checkout::Shared {
                    id: entry.id,
                    sender,
                }
            }),
            None => entries.pop().map(Checkout::Exclusive),
        };
        let empty = entries.is_empty();
        drop(entries);

        for _ in 0..evicted {
            self.metrics.record_eviction();
        }
        if empty {
            self.entries.remove_if(key, |_, entries| entries.is_empty());
        }

        checkout
    }

    fn admit(&self, key: &PoolKey, established: Established) -> Checkout {
        let mut entry = PoolEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            sender: established.sender,
            task: established.task,
            not_before: established.not_before,
            not_after: established.not_after,
            in_flight: 0,
            idle_since: Instant::now(),
        };

        match entry.sender.share() {
            Some(sender) => {
                entry.in_flight = 1;
                let id = entry.id;
                self.entries.entry(key.clone()).or_default().push(entry);
                Checkout::Shared { id, sender }
            }
            None => Checkout::Exclusive(entry),
        }
    }

    fn put_back(&self, key: &PoolKey, checkout: Checkout) {
        match checkout {
            Checkout::Exclusive(mut entry) => {
                entry.idle_since = Instant::now();
                let now = Utc::now();
                let mut entries = self.entries.entry(key.clone()).or_default();
                if entry.usable(now, &self.settings) && entries.len() < self.settings.max_idle_per_key
                {
                    entries.push(entry);
                    tracing::debug!(
                        target = %key.target,
                        identity = %key.identity,
                        idle = entries.len(),
                        idle_timeout_secs = self.settings.idle_timeout.as_secs(),
                        "Returned upstream connection to pool; it closes unless reused within the idle timeout"
                    );
                } else {
                    drop(entries);
                    entry.shutdown();
                    self.metrics.record_eviction();
                    self.entries.remove_if(key, |_, entries| entries.is_empty());
                }
            }
            Checkout::Shared { id, .. } => self.finish_shared(key, id),
        }
    }

    fn discard(&self, key: &PoolKey, checkout: Checkout) {
        match checkout {
            Checkout::Exclusive(entry) => {
                // Mid-exchange HTTP/1 connections cannot be reused.
                entry.task.abort();
                self.metrics.record_eviction();
            }
            // An abandoned HTTP/2 stream is reset by dropping it; the connection stays healthy.
            Checkout::Shared { id, .. } => self.finish_shared(key, id),
        }
    }

    fn finish_shared(&self, key: &PoolKey, id: u64) {
        if let Some(mut entries) = self.entries.get_mut(key) {
            if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
                entry.in_flight = entry.in_flight.saturating_sub(1);
                entry.idle_since = Instant::now();
            }
        }
    }

    /// Evict entries that idled out or whose credential no longer covers the
    /// safety margin at `now`. Returns how many were removed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        self.entries.retain(|_, entries| {
            entries.retain(|entry| {
                let keep = entry.usable(now, &self.settings);
                if !keep {
                    entry.shutdown();
                    evicted += 1;
                }
                keep
            });
            !entries.is_empty()
        });

        for _ in 0..evicted {
            self.metrics.record_eviction();
        }
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted upstream connections");
        }
        evicted
    }

    /// Number of pooled connections, idle or shared.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_all(&self) {
        self.entries.retain(|_, entries| {
            for entry in entries.iter() {
                entry.task.abort();
            }
            false
        });
    }

    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.evict_expired(Utc::now());
                    }
                    _ = shutdown.recv() => break,
                }
            }
            pool.close_all();
            tracing::debug!("Connection pool reaper stopped");
        })
    }
}

/// A connection checked out of the pool for one request/response exchange.
///
/// Call [`PooledConnection::release`] once the response has been fully read;
/// dropping the guard without releasing discards the connection.
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    key: PoolKey,
    checkout: Option<Checkout>,
    reused: bool,
}

impl PooledConnection {
    fn new(pool: Arc<ConnectionPool>, key: PoolKey, checkout: Checkout, reused: bool) -> Self {
        Self {
            pool,
            key,
            checkout: Some(checkout),
            reused,
        }
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_http2(&self) -> bool {
        matches!(self.checkout, Some(Checkout::Shared { .. }))
    }

    pub async fn send_request(
        &mut self,
        request: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, hyper::Error> {
        let sender = match self.checkout.as_mut() {
            Some(Checkout::Exclusive(entry)) => &mut entry.sender,
            Some(Checkout::Shared { sender, .. }) => sender,
            None => unreachable!("checkout is only taken on release or drop"),
        };
        sender.send(request).await
    }

    /// Return the connection to the pool for reuse.
    pub fn release(mut self) {
        if let Some(checkout) = self.checkout.take() {
            self.pool.put_back(&self.key, checkout);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(checkout) = self.checkout.take() {
            self.pool.discard(&self.key, checkout);
        }
    }
}
