// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Scheme-to-backend table used to construct listeners and dialers

use std::{collections::HashMap, sync::Arc};

use super::{
  kcp::{KcpDialer, KcpListener},
  mux::{MuxDialer, MuxListener},
  quic::{QuicDialer, QuicListener},
  BoxedDialer, BoxedListener, TransportError,
};

pub const KCP_SCHEME: &str = "kcp";
pub const MUX_SCHEME: &str = "mux";
pub const QUIC_SCHEME: &str = "quic";

/// Where and how a backend should connect or listen
#[derive(Debug, Clone, Copy)]
pub struct Endpoint<'a> {
  pub addr: &'a str,
  /// Passphrase for backends that encrypt their own framing
  pub key: &'a str,
  /// Backend-specific JSON options; empty selects defaults
  pub raw_config: &'a str,
}

impl<'a> Endpoint<'a> {
  pub fn new(addr: &'a str, key: &'a str, raw_config: &'a str) -> Self {
    Self {
      addr,
      key,
      raw_config,
    }
  }
}

pub type DialerConstructor =
  Arc<dyn Fn(Endpoint<'_>) -> Result<BoxedDialer, TransportError> + Send + Sync>;
pub type ListenerConstructor =
  Arc<dyn Fn(Endpoint<'_>) -> Result<BoxedListener, TransportError> + Send + Sync>;

#[derive(Clone)]
struct Backend {
  dialer: DialerConstructor,
  listener: ListenerConstructor,
}

#[derive(Clone, Default)]
pub struct TransportRegistry {
  backends: HashMap<String, Backend>,
}

impl std::fmt::Debug for TransportRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TransportRegistry")
      .field("schemes", &self.schemes())
      .finish()
  }
}

impl TransportRegistry {
  pub fn empty() -> Self {
    Self::default()
  }

  /// Registry holding the KCP, TCP-mux and QUIC backends
  pub fn with_default_backends() -> Self {
    let mut registry = Self::empty();
    registry.register(
      KCP_SCHEME,
      Arc::new(|e: Endpoint<'_>| {
        Ok(Box::new(KcpDialer::new(e.addr, e.key, e.raw_config)?) as BoxedDialer)
      }),
      Arc::new(|e: Endpoint<'_>| {
        Ok(Box::new(KcpListener::new(e.addr, e.key, e.raw_config)?) as BoxedListener)
      }),
    );
    registry.register(
      MUX_SCHEME,
      Arc::new(|e: Endpoint<'_>| Ok(Box::new(MuxDialer::new(e.addr, e.raw_config)?) as BoxedDialer)),
      Arc::new(|e: Endpoint<'_>| {
        Ok(Box::new(MuxListener::new(e.addr, e.raw_config)?) as BoxedListener)
      }),
    );
    registry.register(
      QUIC_SCHEME,
      Arc::new(|e: Endpoint<'_>| Ok(Box::new(QuicDialer::new(e.addr, e.raw_config)?) as BoxedDialer)),
      Arc::new(|e: Endpoint<'_>| {
        Ok(Box::new(QuicListener::new(e.addr, e.raw_config)?) as BoxedListener)
      }),
    );
    registry
  }

  /// Adds or replaces the backend for `scheme`
  pub fn register(
    &mut self,
    scheme: impl Into<String>,
    dialer: DialerConstructor,
    listener: ListenerConstructor,
  ) {
    self
      .backends
      .insert(scheme.into(), Backend { dialer, listener });
  }

  pub fn supports(&self, scheme: &str) -> bool {
    self.backends.contains_key(scheme)
  }

  pub fn schemes(&self) -> Vec<&str> {
    let mut schemes: Vec<&str> = self.backends.keys().map(String::as_str).collect();
    schemes.sort_unstable();
    schemes
  }

  fn backend(&self, scheme: &str) -> Result<&Backend, TransportError> {
    self
      .backends
      .get(scheme)
      .ok_or_else(|| TransportError::UnsupportedScheme(scheme.to_string()))
  }

  /// Builds an unconnected dialer
  pub fn new_dialer(
    &self,
    scheme: &str,
    endpoint: Endpoint<'_>,
  ) -> Result<BoxedDialer, TransportError> {
    (self.backend(scheme)?.dialer)(endpoint)
  }

  /// Builds a listener and binds it
  #[tracing::instrument(skip(self, endpoint), fields(addr = endpoint.addr), err)]
  pub async fn new_listener(
    &self,
    scheme: &str,
    endpoint: Endpoint<'_>,
  ) -> Result<BoxedListener, TransportError> {
    let mut listener = (self.backend(scheme)?.listener)(endpoint)?;
    listener.listen().await?;
    Ok(listener)
  }
}
