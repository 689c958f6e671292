// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Capability contract shared by every overlay transport backend
//!
//! A [`Dialer`] produces client-side [`Connection`]s, a [`Listener`] produces
//! server-side ones; either side may open or accept [`Stream`]s on a
//! connection once the authentication handshake has completed.

use std::{
  fmt::Debug,
  net::SocketAddr,
  sync::{Arc, Mutex},
  time::Duration,
};

use futures::future::BoxFuture;
use tokio::time::Instant;

pub mod auth;
pub mod kcp;
pub mod mux;
mod pending;
pub mod quic;
pub mod registry;
pub mod session;
pub mod stream;

pub use stream::Stream;

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
  #[error("Access token of {length} bytes exceeds the 2-byte length prefix")]
  TokenTooLong { length: usize },
  #[error("Handshake ended unexpectedly: {0}")]
  UnexpectedEnd(#[from] crate::util::framed::ReadError),
  #[error("Failure writing handshake frame: {0}")]
  Write(#[source] std::io::Error),
  #[error("Access token rejected")]
  Rejected,
  #[error("Handshake reply did not echo the access token")]
  ReplyMismatch,
  #[error("Handshake did not complete within {0:?}")]
  TimedOut(Duration),
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("Unsupported protocol scheme {0:?}")]
  UnsupportedScheme(String),
  #[error("Invalid transport configuration: {0}")]
  InvalidConfig(String),
  #[error("Authentication failed: {0}")]
  Authentication(#[from] AuthError),
  #[error("I/O failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("Listener is not bound")]
  NotListening,
  #[error("Listener closed")]
  ListenerClosed,
  #[error("Connection closed")]
  ConnectionClosed,
  #[error("Deadline exceeded")]
  TimedOut,
  #[error("Stream multiplexer failure: {0}")]
  Multiplexer(#[from] yamux::ConnectionError),
  #[error("KCP session failure: {0}")]
  Kcp(String),
  #[error("QUIC connection failure: {0}")]
  Quic(#[from] quinn::ConnectionError),
  #[error("QUIC connect failure: {0}")]
  QuicConnect(#[from] quinn::ConnectError),
  #[error("TLS configuration failure: {0}")]
  Tls(#[from] rustls::Error),
  #[error("Certificate generation failure: {0}")]
  Certificate(#[from] rcgen::RcgenError),
}

impl TransportError {
  /// Whether the error describes a listener that will never yield another connection
  pub fn is_terminal_for_listener(&self) -> bool {
    matches!(self, Self::ListenerClosed | Self::NotListening)
  }
}

/// Decides whether an access token presented during the handshake is acceptable
pub type AuthValidator = Arc<dyn Fn(&str) -> bool + Send + Sync + 'static>;

/// Builds a validator accepting exactly the listed tokens
pub fn allow_list_validator<I, S>(tokens: I) -> AuthValidator
where
  I: IntoIterator<Item = S>,
  S: Into<String>,
{
  let tokens: std::collections::HashSet<String> = tokens.into_iter().map(Into::into).collect();
  Arc::new(move |token: &str| tokens.contains(token))
}

pub type BoxedConnection = Box<dyn Connection + 'static>;
pub type BoxedDialer = Box<dyn Dialer + 'static>;
pub type BoxedListener = Box<dyn Listener + 'static>;

pub trait Dialer: Send + Sync {
  /// Establishes and authenticates a new multiplexed connection
  fn dial(&self) -> BoxFuture<'_, Result<BoxedConnection, TransportError>>;

  /// Credential presented during subsequent dials
  fn set_access_token(&mut self, token: String);
}

pub trait Listener: Send + Sync {
  /// Binds the listening socket; must be called once before `accept`
  fn listen(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;

  /// Yields the next authenticated connection
  ///
  /// Fails with [`TransportError::ListenerClosed`] once `close` has been called;
  /// other failures concern only the peer being accepted.
  fn accept(&self) -> BoxFuture<'_, Result<BoxedConnection, TransportError>>;

  fn close(&self);

  fn local_addr(&self) -> Result<SocketAddr, TransportError>;

  fn set_auth_func(&mut self, validator: AuthValidator);
}

pub trait Connection: Send + Sync + Debug {
  fn open_stream(&self) -> BoxFuture<'_, Result<Stream, TransportError>>;

  /// Waits for a peer-initiated stream, bounded by any deadline set on the connection
  fn accept_stream(&self) -> BoxFuture<'_, Result<Stream, TransportError>>;

  /// Idempotent
  fn close(&self);

  fn is_closed(&self) -> bool;

  fn remote_addr(&self) -> Option<SocketAddr>;

  fn local_addr(&self) -> Option<SocketAddr>;

  fn set_deadline(&self, deadline: Option<Instant>);
}

/// Parses a backend's JSON options blob, where an empty blob selects defaults
pub(crate) fn parse_raw_config<T>(raw_config: &str) -> Result<T, TransportError>
where
  T: serde::de::DeserializeOwned + Default,
{
  if raw_config.trim().is_empty() {
    return Ok(T::default());
  }
  serde_json::from_str(raw_config).map_err(|e| TransportError::InvalidConfig(e.to_string()))
}

/// Optional deadline applied to connection-level waits
#[derive(Debug, Default)]
pub(crate) struct DeadlineCell(Mutex<Option<Instant>>);

impl DeadlineCell {
  pub fn set(&self, deadline: Option<Instant>) {
    *self.0.lock().expect("Mutex poisoned") = deadline;
  }

  pub fn get(&self) -> Option<Instant> {
    *self.0.lock().expect("Mutex poisoned")
  }

  pub async fn run<F, T>(&self, fut: F) -> Result<T, TransportError>
  where
    F: std::future::Future<Output = Result<T, TransportError>>,
  {
    match self.get() {
      Some(deadline) => tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_elapsed| TransportError::TimedOut)?,
      None => fut.await,
    }
  }
}
