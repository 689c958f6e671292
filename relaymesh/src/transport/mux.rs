// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! TCP backend: one TCP socket per connection, authenticated in the clear and
//! then multiplexed with yamux

use std::{net::SocketAddr, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use serde::Deserialize;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use super::{
  auth::{request_auth, verify_auth, with_handshake_deadline},
  parse_raw_config,
  pending::PendingHandshakes,
  session::{MuxSession, SessionConfig, SessionSide},
  AuthValidator, BoxedConnection, Dialer, Listener, TransportError,
};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MuxSettings {
  pub keepalive_interval_secs: u64,
  pub keepalive_timeout_secs: u64,
  pub max_streams: usize,
}

impl Default for MuxSettings {
  fn default() -> Self {
    Self {
      keepalive_interval_secs: 3,
      keepalive_timeout_secs: 10,
      max_streams: SessionConfig::default().max_streams,
    }
  }
}

impl MuxSettings {
  pub fn from_raw_config(raw_config: &str) -> Result<Self, TransportError> {
    let settings: Self = parse_raw_config(raw_config)?;
    if settings.keepalive_interval_secs == 0 {
      return Err(TransportError::InvalidConfig(
        "keepalive_interval_secs must be positive".into(),
      ));
    }
    if settings.keepalive_timeout_secs < settings.keepalive_interval_secs {
      return Err(TransportError::InvalidConfig(
        "keepalive_timeout_secs must not be shorter than keepalive_interval_secs".into(),
      ));
    }
    settings.session_config().validate()?;
    Ok(settings)
  }

  fn session_config(&self) -> SessionConfig {
    SessionConfig {
      max_streams: self.max_streams,
      ..Default::default()
    }
  }

  /// Probes every interval; the peer is declared dead once the timeout elapses unanswered
  fn apply_keepalive(&self, socket: &TcpStream) -> std::io::Result<()> {
    let interval = Duration::from_secs(self.keepalive_interval_secs);
    let keepalive = socket2::TcpKeepalive::new().with_time(interval);
    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let keepalive = keepalive.with_interval(interval);
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    let keepalive = keepalive.with_retries(
      (self.keepalive_timeout_secs / self.keepalive_interval_secs).max(1) as u32,
    );
    socket2::SockRef::from(socket).set_tcp_keepalive(&keepalive)
  }

  /// Layers the multiplexer over an authenticated socket
  fn promote(
    &self,
    socket: TcpStream,
    side: SessionSide,
  ) -> Result<BoxedConnection, TransportError> {
    socket.set_nodelay(true)?;
    self.apply_keepalive(&socket)?;
    let (local_addr, remote_addr) = (socket.local_addr().ok(), socket.peer_addr().ok());
    Ok(Box::new(MuxSession::spawn(
      socket,
      side,
      &self.session_config(),
      local_addr,
      remote_addr,
    )))
  }
}

pub struct MuxDialer {
  addr: String,
  settings: MuxSettings,
  access_token: Option<String>,
}

impl MuxDialer {
  pub fn new(addr: impl Into<String>, raw_config: &str) -> Result<Self, TransportError> {
    Ok(Self {
      addr: addr.into(),
      settings: MuxSettings::from_raw_config(raw_config)?,
      access_token: None,
    })
  }
}

impl Dialer for MuxDialer {
  fn dial(&self) -> BoxFuture<'_, Result<BoxedConnection, TransportError>> {
    async move {
      let mut socket = TcpStream::connect(&self.addr).await?;
      with_handshake_deadline(request_auth(&mut socket, self.access_token.as_deref())).await?;
      tracing::debug!(addr = %self.addr, "mux_dialed");
      self.settings.promote(socket, SessionSide::Client)
    }
    .boxed()
  }

  fn set_access_token(&mut self, token: String) {
    self.access_token = Some(token);
  }
}

async fn handshake(
  mut socket: TcpStream,
  peer: SocketAddr,
  settings: MuxSettings,
  validator: Option<AuthValidator>,
) -> Result<BoxedConnection, TransportError> {
  if let Err(error) = with_handshake_deadline(verify_auth(&mut socket, validator.as_ref())).await {
    tracing::warn!(%peer, %error, "mux_authentication_failed");
    return Err(error.into());
  }
  settings.promote(socket, SessionSide::Server)
}

pub struct MuxListener {
  addr: String,
  settings: MuxSettings,
  listener: Option<TcpListener>,
  validator: Option<AuthValidator>,
  handshakes: PendingHandshakes,
  closed: CancellationToken,
}

impl MuxListener {
  pub fn new(addr: impl Into<String>, raw_config: &str) -> Result<Self, TransportError> {
    Ok(Self {
      addr: addr.into(),
      settings: MuxSettings::from_raw_config(raw_config)?,
      listener: None,
      validator: None,
      handshakes: PendingHandshakes::new(),
      closed: CancellationToken::new(),
    })
  }
}

impl Listener for MuxListener {
  fn listen(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let listener = TcpListener::bind(&self.addr).await?;
      tracing::info!(addr = ?listener.local_addr().ok(), "mux_listening");
      self.listener = Some(listener);
      Ok(())
    }
    .boxed()
  }

  fn accept(&self) -> BoxFuture<'_, Result<BoxedConnection, TransportError>> {
    async move {
      let listener = self.listener.as_ref().ok_or(TransportError::NotListening)?;
      loop {
        let (socket, peer): (TcpStream, SocketAddr) = tokio::select! {
          _ = self.closed.cancelled() => return Err(TransportError::ListenerClosed),
          authenticated = self.handshakes.next() => return authenticated,
          accepted = listener.accept() => accepted?,
        };
        self
          .handshakes
          .spawn(peer, handshake(socket, peer, self.settings.clone(), self.validator.clone()));
      }
    }
    .boxed()
  }

  fn close(&self) {
    self.closed.cancel();
  }

  fn local_addr(&self) -> Result<SocketAddr, TransportError> {
    let listener = self.listener.as_ref().ok_or(TransportError::NotListening)?;
    Ok(listener.local_addr()?)
  }

  fn set_auth_func(&mut self, validator: AuthValidator) {
    self.validator = Some(validator);
  }
}

#[cfg(test)]
mod tests {
  use super::MuxSettings;

  #[test]
  fn settings_default_from_empty_config() {
    let settings = MuxSettings::from_raw_config("").unwrap();
    assert_eq!(settings.keepalive_interval_secs, 3);
    assert_eq!(settings.keepalive_timeout_secs, 10);
  }

  #[test]
  fn settings_partial_override() {
    let settings = MuxSettings::from_raw_config(r#"{"max_streams": 16}"#).unwrap();
    assert_eq!(settings.max_streams, 16);
    assert_eq!(settings.keepalive_interval_secs, 3);
  }

  #[test]
  fn settings_reject_inverted_keepalive() {
    let result = MuxSettings::from_raw_config(
      r#"{"keepalive_interval_secs": 10, "keepalive_timeout_secs": 3}"#,
    );
    assert!(result.is_err());
    assert!(MuxSettings::from_raw_config("not json").is_err());
  }

  #[test]
  fn settings_reject_stream_counts_beyond_the_window() {
    assert!(MuxSettings::from_raw_config(r#"{"max_streams": 8192}"#).is_err());
    assert!(MuxSettings::from_raw_config(r#"{"max_streams": 0}"#).is_err());
    assert!(MuxSettings::from_raw_config(r#"{"max_streams": 4096}"#).is_ok());
  }
}
