// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Next-hop route table
//!
//! Holds one live multiplexed [`Connection`] per configured next hop, keyed by
//! `scheme://addr`. Streams are opened on the least-used alive entry; a
//! background health check evicts dead entries and reconnects them.

use std::{
  sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock, Weak,
  },
  time::Duration,
};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::transport::{
  registry::{Endpoint, TransportRegistry},
  Connection, Stream, TransportError,
};

#[derive(thiserror::Error, Debug)]
pub enum RouteError {
  #[error("No route available")]
  NoRoute,
  #[error("Transport failure: {0}")]
  Transport(#[from] TransportError),
  #[error("Gave up dialing {key} after {attempts} attempts")]
  RetriesExhausted { key: String, attempts: u32 },
  #[error("Route table is shutting down")]
  ShutDown,
}

/// A configured next hop; identity is `scheme://addr`
#[derive(Clone, PartialEq, Eq)]
pub struct NextHop {
  pub scheme: String,
  pub addr: String,
  pub key: String,
  pub raw_config: String,
  pub access_token: Option<String>,
}

impl std::fmt::Debug for NextHop {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NextHop")
      .field("scheme", &self.scheme)
      .field("addr", &self.addr)
      .field("raw_config", &self.raw_config)
      .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
      .finish_non_exhaustive()
  }
}

impl NextHop {
  pub fn new(scheme: impl Into<String>, addr: impl Into<String>, raw_config: impl Into<String>) -> Self {
    Self {
      scheme: scheme.into(),
      addr: addr.into(),
      key: String::new(),
      raw_config: raw_config.into(),
      access_token: None,
    }
  }

  pub fn with_key(mut self, key: impl Into<String>) -> Self {
    self.key = key.into();
    self
  }

  pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
    self.access_token = Some(token.into());
    self
  }

  pub fn route_key(&self) -> String {
    route_key(&self.scheme, &self.addr)
  }
}

pub fn route_key(scheme: &str, addr: &str) -> String {
  format!("{}://{}", scheme, addr)
}

#[derive(Debug, Clone)]
pub struct RouteTableConfig {
  pub health_check_interval: Duration,
  pub redial_delay: Duration,
  /// Caps the dial attempts of `add`; reconnects always retry until cancelled
  pub max_add_attempts: Option<u32>,
}

impl Default for RouteTableConfig {
  fn default() -> Self {
    Self {
      health_check_interval: Duration::from_secs(5),
      redial_delay: Duration::from_secs(1),
      max_add_attempts: None,
    }
  }
}

struct RouteEntry {
  key: String,
  hop: NextHop,
  connection: Arc<dyn Connection>,
  hits: AtomicU64,
}

impl RouteEntry {
  fn hits(&self) -> u64 {
    self.hits.load(Ordering::Relaxed)
  }
}

/// Point-in-time view of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSnapshot {
  pub key: String,
  pub hits: u64,
  pub alive: bool,
}

struct RouteTableInner {
  entries: RwLock<Vec<Arc<RouteEntry>>>,
  reconnecting: DashMap<String, CancellationToken>,
  transports: Arc<TransportRegistry>,
  config: RouteTableConfig,
  shutdown: CancellationToken,
}

pub struct RouteTable {
  inner: Arc<RouteTableInner>,
}

impl std::fmt::Debug for RouteTable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RouteTable")
      .field("routes", &self.snapshot())
      .finish_non_exhaustive()
  }
}

impl RouteTable {
  /// Creates an empty table and starts its health check; requires a running Tokio runtime
  pub fn new(transports: Arc<TransportRegistry>, config: RouteTableConfig) -> Self {
    let inner = Arc::new(RouteTableInner {
      entries: RwLock::new(Vec::new()),
      reconnecting: DashMap::new(),
      transports,
      config,
      shutdown: CancellationToken::new(),
    });
    tokio::task::spawn(
      health_check_loop(Arc::downgrade(&inner), inner.shutdown.clone())
        .instrument(tracing::debug_span!("route_health_check")),
    );
    Self { inner }
  }

  /// Dials `hop` until connected and inserts it, replacing any entry with the same key
  ///
  /// Unsupported schemes and invalid configurations fail immediately; dial failures
  /// are retried every `redial_delay` up to `max_add_attempts`.
  #[tracing::instrument(skip(self, hop), fields(key = %hop.route_key()), err)]
  pub async fn add(&self, hop: NextHop) -> Result<(), RouteError> {
    let key = hop.route_key();
    if let Some((_, reconnect)) = self.inner.reconnecting.remove(&key) {
      reconnect.cancel();
    }
    let connection = self
      .inner
      .dial_until_connected(&hop, self.inner.config.max_add_attempts, &self.inner.shutdown)
      .await?;
    self.inner.insert(hop, connection, None);
    tracing::info!(%key, "route_added");
    Ok(())
  }

  /// Removes the entry for `scheme://addr`, closing its connection and cancelling any reconnect
  ///
  /// Returns whether anything was removed or cancelled.
  pub fn del(&self, scheme: &str, addr: &str) -> bool {
    let key = route_key(scheme, addr);
    // Entries move to `reconnecting` only under the entries lock, so one of the two holds the key
    let (removed, cancelled) = {
      let mut entries = self.inner.entries.write().expect("Lock poisoned");
      let position = entries.iter().position(|entry| entry.key == key);
      let removed = position.map(|index| entries.remove(index));
      let cancelled = match self.inner.reconnecting.remove(&key) {
        Some((_, reconnect)) => {
          reconnect.cancel();
          true
        }
        None => false,
      };
      (removed, cancelled)
    };
    if let Some(entry) = removed.as_ref() {
      entry.connection.close();
      tracing::info!(%key, "route_deleted");
    }
    removed.is_some() || cancelled
  }

  /// Opens a stream on the least-used alive entry, falling back through the others
  pub async fn route(&self) -> Result<Stream, RouteError> {
    let mut candidates: Vec<Arc<RouteEntry>> = {
      let entries = self.inner.entries.read().expect("Lock poisoned");
      if entries.is_empty() {
        return Err(RouteError::NoRoute);
      }
      entries
        .iter()
        .filter(|entry| !entry.connection.is_closed())
        .cloned()
        .collect()
    };
    candidates.sort_by_key(|entry| entry.hits());
    for entry in candidates {
      // The connection may have died since the snapshot was taken
      if entry.connection.is_closed() {
        continue;
      }
      match entry.connection.open_stream().await {
        Ok(stream) => {
          entry.hits.fetch_add(1, Ordering::Relaxed);
          return Ok(stream);
        }
        Err(error) => {
          tracing::warn!(key = %entry.key, %error, "route_open_failed");
        }
      }
    }
    Err(RouteError::NoRoute)
  }

  pub fn len(&self) -> usize {
    self.inner.entries.read().expect("Lock poisoned").len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn snapshot(&self) -> Vec<RouteSnapshot> {
    self
      .inner
      .entries
      .read()
      .expect("Lock poisoned")
      .iter()
      .map(|entry| RouteSnapshot {
        key: entry.key.clone(),
        hits: entry.hits(),
        alive: !entry.connection.is_closed(),
      })
      .collect()
  }

  /// Runs one health check pass immediately
  pub fn check_health(&self) {
    self.inner.check_health();
  }

  /// Stops the health check and reconnects, and closes every connection
  pub fn shutdown(&self) {
    self.inner.shutdown.cancel();
    self.inner.reconnecting.clear();
    let drained: Vec<Arc<RouteEntry>> = self
      .inner
      .entries
      .write()
      .expect("Lock poisoned")
      .drain(..)
      .collect();
    for entry in drained {
      entry.connection.close();
    }
  }
}

impl Drop for RouteTable {
  fn drop(&mut self) {
    self.shutdown();
  }
}

impl RouteTableInner {
  async fn dial_once(&self, hop: &NextHop) -> Result<Arc<dyn Connection>, TransportError> {
    let mut dialer = self.transports.new_dialer(
      &hop.scheme,
      Endpoint::new(&hop.addr, &hop.key, &hop.raw_config),
    )?;
    if let Some(token) = hop.access_token.as_ref() {
      dialer.set_access_token(token.clone());
    }
    Ok(Arc::from(dialer.dial().await?))
  }

  async fn dial_until_connected(
    &self,
    hop: &NextHop,
    max_attempts: Option<u32>,
    cancel: &CancellationToken,
  ) -> Result<Arc<dyn Connection>, RouteError> {
    let mut attempts = 0u32;
    loop {
      attempts += 1;
      match self.dial_once(hop).await {
        Ok(connection) => return Ok(connection),
        Err(error @ (TransportError::UnsupportedScheme(_) | TransportError::InvalidConfig(_))) => {
          return Err(error.into())
        }
        Err(error) => {
          tracing::error!(key = %hop.route_key(), attempt = attempts, %error, "next_hop_dial_failed");
        }
      }
      if max_attempts.map_or(false, |max| attempts >= max) {
        return Err(RouteError::RetriesExhausted {
          key: hop.route_key(),
          attempts,
        });
      }
      tokio::select! {
        _ = cancel.cancelled() => return Err(RouteError::ShutDown),
        _ = tokio::time::sleep(self.config.redial_delay) => {}
      }
    }
  }

  /// Inserts or replaces by key; a replaced connection is closed
  fn insert(&self, hop: NextHop, connection: Arc<dyn Connection>, hits: Option<u64>) {
    let replaced = {
      let mut entries = self.entries.write().expect("Lock poisoned");
      insert_entry(&mut entries, hop, connection, hits)
    };
    if let Some(replaced) = replaced {
      replaced.connection.close();
    }
  }

  fn check_health(self: &Arc<Self>) {
    let reconnects: Vec<(Arc<RouteEntry>, CancellationToken)> = {
      let mut entries = self.entries.write().expect("Lock poisoned");
      let (alive, dead): (Vec<_>, Vec<_>) = entries
        .drain(..)
        .partition(|entry| !entry.connection.is_closed());
      *entries = alive;
      entries.sort_by_key(|entry| entry.hits());
      // Registered before the lock is released so a concurrent `del` always sees the key
      dead
        .into_iter()
        .filter_map(|entry| {
          tracing::warn!(key = %entry.key, "next_hop_disconnected");
          self.register_reconnect(&entry.key).map(|cancel| (entry, cancel))
        })
        .collect()
    };
    for (entry, cancel) in reconnects {
      let table = Arc::downgrade(self);
      let span = tracing::info_span!("reconnect", key = %entry.key);
      tokio::task::spawn(reconnect(table, entry, cancel).instrument(span));
    }
  }

  /// `None` when a reconnect for `key` is already running
  fn register_reconnect(&self, key: &str) -> Option<CancellationToken> {
    match self.reconnecting.entry(key.to_string()) {
      dashmap::mapref::entry::Entry::Occupied(_) => None,
      dashmap::mapref::entry::Entry::Vacant(vacant) => {
        let cancel = self.shutdown.child_token();
        vacant.insert(cancel.clone());
        Some(cancel)
      }
    }
  }
}

/// New entries start level with the least-used route rather than absorbing all traffic
fn insert_entry(
  entries: &mut Vec<Arc<RouteEntry>>,
  hop: NextHop,
  connection: Arc<dyn Connection>,
  hits: Option<u64>,
) -> Option<Arc<RouteEntry>> {
  let key = hop.route_key();
  let hits = hits.unwrap_or_else(|| entries.iter().map(|e| e.hits()).min().unwrap_or(0));
  let entry = Arc::new(RouteEntry {
    key: key.clone(),
    hop,
    connection,
    hits: AtomicU64::new(hits),
  });
  match entries.iter().position(|existing| existing.key == key) {
    Some(index) => Some(std::mem::replace(&mut entries[index], entry)),
    None => {
      entries.push(entry);
      None
    }
  }
}

async fn reconnect(table: Weak<RouteTableInner>, entry: Arc<RouteEntry>, cancel: CancellationToken) {
  let connection = loop {
    let inner = match table.upgrade() {
      Some(inner) => inner,
      None => return,
    };
    let attempt = tokio::select! {
      _ = cancel.cancelled() => return,
      attempt = inner.dial_until_connected(&entry.hop, None, &cancel) => attempt,
    };
    match attempt {
      Ok(connection) => break connection,
      // The canceller already released this registration
      Err(RouteError::ShutDown) => return,
      Err(error) => {
        // Unsupported scheme or invalid config cannot recover; the entry stays removed
        tracing::error!(%error, "reconnect_abandoned");
        let _entries = inner.entries.write().expect("Lock poisoned");
        if !cancel.is_cancelled() {
          inner.reconnecting.remove(&entry.key);
        }
        return;
      }
    }
  };
  let inner = match table.upgrade() {
    Some(inner) => inner,
    None => {
      connection.close();
      return;
    }
  };
  // A `del` or `add` for this key cancels the registration that spawned this task
  let replaced = {
    let mut entries = inner.entries.write().expect("Lock poisoned");
    let registered = !cancel.is_cancelled()
      && inner
        .reconnecting
        .remove_if(&entry.key, |_, token| !token.is_cancelled())
        .is_some();
    if !registered {
      drop(entries);
      connection.close();
      return;
    }
    insert_entry(&mut entries, entry.hop.clone(), connection, Some(entry.hits()))
  };
  if let Some(replaced) = replaced {
    replaced.connection.close();
  }
  tracing::info!(key = %entry.key, "next_hop_reconnected");
}

async fn health_check_loop(table: Weak<RouteTableInner>, shutdown: CancellationToken) {
  let period = match table.upgrade() {
    Some(inner) => inner.config.health_check_interval,
    None => return,
  };
  let mut interval = tokio::time::interval(period);
  interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  // The first tick completes immediately
  interval.tick().await;
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => return,
      _ = interval.tick() => {}
    }
    match table.upgrade() {
      Some(inner) => inner.check_health(),
      None => return,
    }
  }
}
