// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Access, hop and target node runners
//!
//! Each role binds its listener, prepares its outbound side and serves until
//! the shutdown token is cancelled.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context as AnyhowContext;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  config::{AccessConfig, HopConfig, ListenerConfig, NextHopConfig, TargetConfig, TCP_SCHEME},
  forward::{BufferPool, Forwarder, Outbound, TcpTarget, OVERLAY_BUFFER_SIZE, TARGET_BUFFER_SIZE},
  route::{RouteError, RouteTable},
  transport::{
    allow_list_validator, registry::Endpoint, registry::TransportRegistry, BoxedListener,
    TransportError,
  },
  util::resolve_socket_addr,
};

/// A node whose listener is bound and whose accept loop runs in the background
pub struct RunningNode {
  local_addr: SocketAddr,
  shutdown: CancellationToken,
  task: JoinHandle<anyhow::Result<()>>,
}

impl RunningNode {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }

  /// Waits for the accept loop to end
  pub async fn wait(self) -> anyhow::Result<()> {
    self.task.await.context("Node task panicked")?
  }
}

enum BoundListener {
  Tcp(TcpListener),
  Overlay(BoxedListener),
}

impl BoundListener {
  async fn bind(
    registry: &TransportRegistry,
    config: &ListenerConfig,
  ) -> anyhow::Result<BoundListener> {
    if config.scheme == TCP_SCHEME {
      let addr = resolve_socket_addr(&config.listen_addr)
        .await
        .with_context(|| format!("Resolving listen address {}", config.listen_addr))?;
      let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Binding tcp listener on {}", addr))?;
      return Ok(BoundListener::Tcp(listener));
    }
    let mut listener = registry
      .new_listener(
        &config.scheme,
        Endpoint::new(&config.listen_addr, &config.key, &config.raw_config),
      )
      .await
      .with_context(|| {
        format!(
          "Starting {} listener on {}",
          config.scheme, config.listen_addr
        )
      })?;
    if !config.auth_tokens.is_empty() {
      listener.set_auth_func(allow_list_validator(config.auth_tokens.iter().cloned()));
    }
    Ok(BoundListener::Overlay(listener))
  }

  fn local_addr(&self) -> anyhow::Result<SocketAddr> {
    match self {
      BoundListener::Tcp(listener) => Ok(listener.local_addr()?),
      BoundListener::Overlay(listener) => Ok(listener.local_addr()?),
    }
  }
}

/// Adds every configured next hop in order
///
/// Hops that are misconfigured abort startup; hops that stay unreachable past
/// the attempt cap are skipped so the remaining routes can still serve.
async fn populate_route_table(
  table: &RouteTable,
  hops: &[NextHopConfig],
  shutdown: &CancellationToken,
) -> anyhow::Result<()> {
  for hop in hops {
    let hop = hop.to_next_hop();
    let key = hop.route_key();
    let added = tokio::select! {
      _ = shutdown.cancelled() => anyhow::bail!("Shutdown requested while adding next hops"),
      added = table.add(hop) => added,
    };
    match added {
      Ok(()) => {}
      Err(RouteError::Transport(
        error @ (TransportError::UnsupportedScheme(_) | TransportError::InvalidConfig(_)),
      )) => {
        return Err(error).with_context(|| format!("Configuring next hop {}", key));
      }
      Err(error) => {
        tracing::error!(%key, %error, "next_hop_add_failed");
      }
    }
  }
  if !hops.is_empty() && table.is_empty() {
    tracing::warn!("no_next_hop_reachable");
  }
  Ok(())
}

async fn build_route_table(
  registry: Arc<TransportRegistry>,
  hops: &[NextHopConfig],
  config: crate::route::RouteTableConfig,
  shutdown: &CancellationToken,
) -> anyhow::Result<Arc<RouteTable>> {
  let table = Arc::new(RouteTable::new(registry, config));
  populate_route_table(&table, hops, shutdown).await?;
  Ok(table)
}

fn spawn_forwarder<O: Outbound>(
  role: &'static str,
  forwarder: Forwarder<O>,
  listener: BoundListener,
  route_table: Option<Arc<RouteTable>>,
  shutdown: CancellationToken,
) -> anyhow::Result<RunningNode> {
  let local_addr = listener.local_addr()?;
  tracing::info!(role, addr = %local_addr, "node_started");
  let task = tokio::task::spawn(
    {
      let shutdown = shutdown.clone();
      async move {
        let served = match listener {
          BoundListener::Tcp(listener) => {
            forwarder.serve_tcp(listener, shutdown).await;
            Ok(())
          }
          BoundListener::Overlay(listener) => forwarder
            .serve_mux(listener, shutdown)
            .await
            .context("Overlay listener failed"),
        };
        if let Some(table) = route_table {
          table.shutdown();
        }
        tracing::info!("node_stopped");
        served
      }
    }
    .instrument(tracing::info_span!("node", role, addr = %local_addr)),
  );
  Ok(RunningNode {
    local_addr,
    shutdown,
    task,
  })
}

/// Edge node: plain TCP or overlay ingress, forwarded along the route table
pub async fn start_access(
  config: AccessConfig,
  shutdown: CancellationToken,
) -> anyhow::Result<RunningNode> {
  let route = config.route_config;
  let registry = Arc::new(TransportRegistry::with_default_backends());
  let listener = BoundListener::bind(&registry, &route.listener).await?;
  let table = build_route_table(
    Arc::clone(&registry),
    &route.dialer,
    route.route_table.to_route_table_config(),
    &shutdown,
  )
  .await?;
  let forwarder = Forwarder::new(Arc::clone(&table), BufferPool::new(OVERLAY_BUFFER_SIZE));
  spawn_forwarder("access", forwarder, listener, Some(table), shutdown)
}

/// Relay node: overlay ingress forwarded along the route table
pub async fn start_hop(config: HopConfig, shutdown: CancellationToken) -> anyhow::Result<RunningNode> {
  let route = config.route_config;
  let registry = Arc::new(TransportRegistry::with_default_backends());
  let listener = BoundListener::bind(&registry, &route.listener).await?;
  let table = build_route_table(
    Arc::clone(&registry),
    &route.hops,
    route.route_table.to_route_table_config(),
    &shutdown,
  )
  .await?;
  let forwarder = Forwarder::new(Arc::clone(&table), BufferPool::new(OVERLAY_BUFFER_SIZE));
  spawn_forwarder("hop", forwarder, listener, Some(table), shutdown)
}

/// Exit node: overlay ingress forwarded to the destination, one TCP connection per stream
pub async fn start_target(
  config: TargetConfig,
  shutdown: CancellationToken,
) -> anyhow::Result<RunningNode> {
  let registry = TransportRegistry::with_default_backends();
  let listener = BoundListener::bind(&registry, &config.listener).await?;
  let forwarder = Forwarder::new(
    Arc::new(TcpTarget::new(config.target.address)),
    BufferPool::new(TARGET_BUFFER_SIZE),
  );
  spawn_forwarder("target", forwarder, listener, None, shutdown)
}

pub async fn run_access(config: AccessConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
  start_access(config, shutdown).await?.wait().await
}

pub async fn run_hop(config: HopConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
  start_hop(config, shutdown).await?.wait().await
}

pub async fn run_target(config: TargetConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
  start_target(config, shutdown).await?.wait().await
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio_util::sync::CancellationToken;

  use super::{start_access, start_hop, start_target};
  use crate::config::{AccessConfig, HopConfig, TargetConfig};

  #[tokio::test]
  async fn misconfigured_next_hop_aborts_startup() {
    let config = AccessConfig::from_yaml(
      r#"
route_config:
  listener: { scheme: tcp, listen_addr: "127.0.0.1:0" }
  dialer:
    - { nexthop_addr: "127.0.0.1:9", scheme: mux, raw_config: "{ not json" }
"#,
    )
    .unwrap();
    let started = start_access(config, CancellationToken::new()).await;
    assert!(started.is_err());
  }

  #[tokio::test]
  async fn unreachable_next_hop_is_skipped_after_attempt_cap() {
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_addr = unused.local_addr().unwrap();
    drop(unused);
    let config = HopConfig::from_yaml(&format!(
      r#"
route_config:
  listener: {{ scheme: mux, listen_addr: "127.0.0.1:0" }}
  hops:
    - {{ hop_addr: "{}", scheme: mux }}
  route_table: {{ redial_delay_secs: 0, max_add_attempts: 1 }}
"#,
      dead_addr
    ))
    .unwrap();
    let shutdown = CancellationToken::new();
    let node = tokio::time::timeout(Duration::from_secs(10), start_hop(config, shutdown.clone()))
      .await
      .expect("Capped add must not block startup")
      .unwrap();
    assert_ne!(node.local_addr().port(), 0);
    node.shutdown();
    node.wait().await.unwrap();
  }

  #[tokio::test]
  async fn target_stops_on_shutdown() {
    let config = TargetConfig::from_yaml(
      r#"
listener: { scheme: mux, listen_addr: "127.0.0.1:0", auth_tokens: ["t"] }
target: { address: "127.0.0.1:9" }
"#,
    )
    .unwrap();
    let shutdown = CancellationToken::new();
    let node = start_target(config, shutdown.clone()).await.unwrap();
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), node.wait())
      .await
      .expect("Node must stop on shutdown")
      .unwrap();
  }
}
