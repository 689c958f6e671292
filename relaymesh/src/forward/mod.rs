// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Accept loops that hand every inbound session to an [`Outbound`] and relay it

use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::{
  route::{RouteError, RouteTable},
  transport::{BoxedConnection, BoxedListener, Stream, TransportError},
  util::resolve_socket_addr,
};

pub mod pool;
pub mod relay;

pub use pool::{BufferPool, OVERLAY_BUFFER_SIZE, TARGET_BUFFER_SIZE};
pub use relay::{relay, RelayStats};

#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
  #[error(transparent)]
  Route(#[from] RouteError),
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error("Destination unreachable: {0}")]
  Destination(#[from] std::io::Error),
}

/// Where forwarded sessions go; one call per inbound session
pub trait Outbound: Send + Sync + 'static {
  fn open(&self) -> BoxFuture<'_, Result<Stream, ForwardError>>;
}

impl Outbound for RouteTable {
  fn open(&self) -> BoxFuture<'_, Result<Stream, ForwardError>> {
    async move { Ok(self.route().await?) }.boxed()
  }
}

/// Dials a fresh TCP connection to a fixed destination for every session
#[derive(Debug, Clone)]
pub struct TcpTarget {
  address: String,
}

impl TcpTarget {
  pub fn new(address: impl Into<String>) -> Self {
    Self {
      address: address.into(),
    }
  }

  pub fn address(&self) -> &str {
    &self.address
  }
}

impl Outbound for TcpTarget {
  fn open(&self) -> BoxFuture<'_, Result<Stream, ForwardError>> {
    async move {
      let addr = resolve_socket_addr(&self.address).await?;
      let socket = TcpStream::connect(addr).await?;
      socket.set_nodelay(true)?;
      Ok(Stream::from(socket))
    }
    .boxed()
  }
}

pub struct Forwarder<O: ?Sized> {
  outbound: Arc<O>,
  pool: BufferPool,
}

impl<O: ?Sized> Clone for Forwarder<O> {
  fn clone(&self) -> Self {
    Self {
      outbound: Arc::clone(&self.outbound),
      pool: self.pool.clone(),
    }
  }
}

impl<O: Outbound + ?Sized> Forwarder<O> {
  pub fn new(outbound: Arc<O>, pool: BufferPool) -> Self {
    Self { outbound, pool }
  }

  pub fn pool(&self) -> &BufferPool {
    &self.pool
  }

  /// Relays every accepted TCP socket until `shutdown` is cancelled
  pub async fn serve_tcp(&self, listener: TcpListener, shutdown: CancellationToken) {
    let local_addr = listener.local_addr().ok();
    tracing::info!(addr = ?local_addr, "tcp_forwarder_started");
    let incoming = TcpListenerStream::new(listener).take_until({
      let shutdown = shutdown.clone();
      async move { shutdown.cancelled().await }
    });
    tokio::pin!(incoming);
    while let Some(accepted) = incoming.next().await {
      let socket = match accepted {
        Ok(socket) => socket,
        Err(error) => {
          tracing::warn!(%error, "tcp_accept_failed");
          continue;
        }
      };
      if let Err(error) = socket.set_nodelay(true) {
        tracing::debug!(%error, "tcp_nodelay_failed");
      }
      let session = self.session(Stream::from(socket), shutdown.child_token());
      tokio::task::spawn(session);
    }
    tracing::info!(addr = ?local_addr, "tcp_forwarder_stopped");
  }

  /// Accepts overlay connections and relays every stream opened on them
  ///
  /// A failed accept affects only that peer; the loop ends when the listener
  /// closes or `shutdown` is cancelled, and the listener is closed either way.
  pub async fn serve_mux(
    &self,
    listener: BoxedListener,
    shutdown: CancellationToken,
  ) -> Result<(), TransportError> {
    let local_addr = listener.local_addr().ok();
    tracing::info!(addr = ?local_addr, "mux_forwarder_started");
    let result = loop {
      let accepted = tokio::select! {
        _ = shutdown.cancelled() => break Ok(()),
        accepted = listener.accept() => accepted,
      };
      match accepted {
        Ok(connection) => {
          let span = tracing::info_span!("connection", peer = ?connection.remote_addr());
          tokio::task::spawn(
            self
              .clone()
              .serve_connection(connection, shutdown.child_token())
              .instrument(span),
          );
        }
        Err(error) if error.is_terminal_for_listener() => break Err(error),
        Err(error) => {
          tracing::debug!(%error, "mux_accept_failed");
        }
      }
    };
    listener.close();
    tracing::info!(addr = ?local_addr, "mux_forwarder_stopped");
    match result {
      Err(TransportError::ListenerClosed) => Ok(()),
      other => other,
    }
  }

  async fn serve_connection(self, connection: BoxedConnection, shutdown: CancellationToken) {
    loop {
      let accepted = tokio::select! {
        _ = shutdown.cancelled() => break,
        accepted = connection.accept_stream() => accepted,
      };
      match accepted {
        Ok(stream) => {
          tokio::task::spawn(self.session(stream, shutdown.child_token()));
        }
        Err(error) => {
          tracing::debug!(%error, "connection_ended");
          break;
        }
      }
    }
    connection.close();
  }

  /// One inbound session: open the outbound leg, then relay until either side ends
  fn session(
    &self,
    inbound: Stream,
    session: CancellationToken,
  ) -> impl std::future::Future<Output = ()> + Send + 'static {
    let outbound = Arc::clone(&self.outbound);
    let pool = self.pool.clone();
    let span = tracing::debug_span!(
      "session",
      id = %uuid::Uuid::new_v4(),
      peer = ?inbound.remote_addr(),
    );
    async move {
      let outbound = tokio::select! {
        _ = session.cancelled() => return,
        opened = outbound.open() => opened,
      };
      let outbound = match outbound {
        Ok(outbound) => outbound,
        Err(error) => {
          tracing::warn!(%error, "session_open_failed");
          return;
        }
      };
      let stats = relay(&pool, inbound, outbound, session).await;
      tracing::debug!(
        sent = stats.inbound_to_outbound,
        received = stats.outbound_to_inbound,
        "session_closed"
      );
    }
    .instrument(span)
  }
}
