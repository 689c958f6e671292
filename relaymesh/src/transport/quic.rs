// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! QUIC backend: natively multiplexed, self-signed on the listener side
//!
//! The access-token handshake always runs over the first bidirectional stream
//! of each connection, which is never surfaced to callers. A dialer without a
//! token presents an empty one, and a listener without a validator accepts any,
//! so the first stream is consumed whatever either side is configured with.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use serde::Deserialize;
use tokio::time::Instant;

use super::{
  auth::{request_auth, verify_auth, with_handshake_deadline, HANDSHAKE_TIMEOUT},
  parse_raw_config,
  pending::PendingHandshakes,
  stream::StreamIo,
  AuthError, AuthValidator, BoxedConnection, Connection, DeadlineCell, Dialer, Listener, Stream,
  TransportError,
};
use crate::util::resolve_socket_addr;

pub const ALPN_RELAYMESH_1: &[u8] = b"relaymesh-1";
const SERVER_NAME: &str = "localhost";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuicSettings {
  pub keepalive_interval_secs: u64,
  pub idle_timeout_secs: u64,
}

impl Default for QuicSettings {
  fn default() -> Self {
    Self {
      keepalive_interval_secs: 10,
      idle_timeout_secs: 30,
    }
  }
}

impl QuicSettings {
  pub fn from_raw_config(raw_config: &str) -> Result<Self, TransportError> {
    let settings: Self = parse_raw_config(raw_config)?;
    if settings.keepalive_interval_secs >= settings.idle_timeout_secs {
      return Err(TransportError::InvalidConfig(
        "keepalive_interval_secs must be shorter than idle_timeout_secs".into(),
      ));
    }
    Ok(settings)
  }

  fn transport_config(&self) -> Result<Arc<quinn::TransportConfig>, TransportError> {
    let idle_timeout = quinn::IdleTimeout::try_from(Duration::from_secs(self.idle_timeout_secs))
      .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
    let mut transport = quinn::TransportConfig::default();
    transport
      .keep_alive_interval(Some(Duration::from_secs(self.keepalive_interval_secs)))
      .max_idle_timeout(Some(idle_timeout));
    Ok(Arc::new(transport))
  }
}

/// Accepts any server certificate; peers are authenticated by access token instead
struct SkipServerVerification;

impl rustls::client::ServerCertVerifier for SkipServerVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::Certificate,
    _intermediates: &[rustls::Certificate],
    _server_name: &rustls::ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: std::time::SystemTime,
  ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::ServerCertVerified::assertion())
  }
}

fn client_config(settings: &QuicSettings) -> Result<quinn::ClientConfig, TransportError> {
  let mut crypto = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
    .with_no_client_auth();
  crypto.alpn_protocols = vec![ALPN_RELAYMESH_1.to_vec()];
  let mut config = quinn::ClientConfig::new(Arc::new(crypto));
  config.transport_config(settings.transport_config()?);
  Ok(config)
}

fn server_config(settings: &QuicSettings) -> Result<quinn::ServerConfig, TransportError> {
  let certificate = rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()])?;
  let cert_chain = vec![rustls::Certificate(certificate.serialize_der()?)];
  let private_key = rustls::PrivateKey(certificate.serialize_private_key_der());
  let mut crypto = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_single_cert(cert_chain, private_key)?;
  crypto.alpn_protocols = vec![ALPN_RELAYMESH_1.to_vec()];
  let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
  config.transport_config(settings.transport_config()?);
  Ok(config)
}

pub struct QuicConnection {
  connection: quinn::Connection,
  // Keeps the local endpoint driver alive for dialed connections
  endpoint: quinn::Endpoint,
  deadline: DeadlineCell,
}

impl std::fmt::Debug for QuicConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QuicConnection")
      .field("remote_addr", &self.connection.remote_address())
      .field("stable_id", &self.connection.stable_id())
      .finish_non_exhaustive()
  }
}

impl QuicConnection {
  fn wrap(&self, (send, recv): (quinn::SendStream, quinn::RecvStream)) -> Stream {
    Stream::new(
      StreamIo::Quic(send, recv),
      Connection::local_addr(self),
      Some(self.connection.remote_address()),
    )
  }
}

impl Connection for QuicConnection {
  fn open_stream(&self) -> BoxFuture<'_, Result<Stream, TransportError>> {
    async move {
      let streams = self.connection.open_bi().await?;
      Ok(self.wrap(streams))
    }
    .boxed()
  }

  fn accept_stream(&self) -> BoxFuture<'_, Result<Stream, TransportError>> {
    async move {
      let streams = self
        .deadline
        .run(async { Ok(self.connection.accept_bi().await?) })
        .await?;
      Ok(self.wrap(streams))
    }
    .boxed()
  }

  fn close(&self) {
    self.connection.close(0u32.into(), b"closed");
  }

  fn is_closed(&self) -> bool {
    self.connection.close_reason().is_some()
  }

  fn remote_addr(&self) -> Option<SocketAddr> {
    Some(self.connection.remote_address())
  }

  fn local_addr(&self) -> Option<SocketAddr> {
    self.endpoint.local_addr().ok()
  }

  fn set_deadline(&self, deadline: Option<Instant>) {
    self.deadline.set(deadline);
  }
}

pub struct QuicDialer {
  addr: String,
  settings: QuicSettings,
  access_token: Option<String>,
}

impl QuicDialer {
  pub fn new(addr: impl Into<String>, raw_config: &str) -> Result<Self, TransportError> {
    Ok(Self {
      addr: addr.into(),
      settings: QuicSettings::from_raw_config(raw_config)?,
      access_token: None,
    })
  }

  async fn authenticate(&self, connection: &quinn::Connection) -> Result<(), TransportError> {
    let token = self.access_token.as_deref().unwrap_or("");
    let (send, recv) = connection.open_bi().await?;
    let mut channel = Stream::new(StreamIo::Quic(send, recv), None, None);
    with_handshake_deadline(request_auth(&mut channel, Some(token))).await?;
    // Dropping the channel finishes its send half without waiting for acknowledgement
    Ok(())
  }
}

impl Dialer for QuicDialer {
  fn dial(&self) -> BoxFuture<'_, Result<BoxedConnection, TransportError>> {
    async move {
      let remote_addr = resolve_socket_addr(&self.addr).await?;
      let bind_addr: SocketAddr = if remote_addr.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
      } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
      };
      let endpoint = quinn::Endpoint::client(bind_addr)?;
      let connection = endpoint
        .connect_with(client_config(&self.settings)?, remote_addr, SERVER_NAME)?
        .await?;
      if let Err(error) = self.authenticate(&connection).await {
        connection.close(0u32.into(), b"authentication failed");
        return Err(error);
      }
      tracing::debug!(addr = %remote_addr, "quic_dialed");
      Ok(Box::new(QuicConnection {
        connection,
        endpoint,
        deadline: DeadlineCell::default(),
      }) as BoxedConnection)
    }
    .boxed()
  }

  fn set_access_token(&mut self, token: String) {
    self.access_token = Some(token);
  }
}

pub struct QuicListener {
  addr: String,
  settings: QuicSettings,
  endpoint: Option<quinn::Endpoint>,
  validator: Option<AuthValidator>,
  handshakes: PendingHandshakes,
}

impl QuicListener {
  pub fn new(addr: impl Into<String>, raw_config: &str) -> Result<Self, TransportError> {
    Ok(Self {
      addr: addr.into(),
      settings: QuicSettings::from_raw_config(raw_config)?,
      endpoint: None,
      validator: None,
      handshakes: PendingHandshakes::new(),
    })
  }
}

async fn verify_peer(
  connection: &quinn::Connection,
  validator: Option<AuthValidator>,
) -> Result<(), TransportError> {
  let validator = match validator {
    Some(validator) => validator,
    None => Arc::new(|_: &str| true) as AuthValidator,
  };
  let handshake = async {
    let (send, recv) = connection.accept_bi().await?;
    let mut channel = Stream::new(StreamIo::Quic(send, recv), None, None);
    verify_auth(&mut channel, Some(&validator)).await?;
    Ok::<_, TransportError>(())
  };
  tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
    .await
    .map_err(|_elapsed| AuthError::TimedOut(HANDSHAKE_TIMEOUT))?
}

/// Completes the TLS handshake and then the token exchange, each bounded by the handshake deadline
async fn accept_connection(
  connecting: quinn::Connecting,
  peer: SocketAddr,
  endpoint: quinn::Endpoint,
  validator: Option<AuthValidator>,
) -> Result<BoxedConnection, TransportError> {
  let connection = tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting)
    .await
    .map_err(|_elapsed| AuthError::TimedOut(HANDSHAKE_TIMEOUT))??;
  if let Err(error) = verify_peer(&connection, validator).await {
    tracing::warn!(%peer, %error, "quic_authentication_failed");
    connection.close(0u32.into(), b"authentication failed");
    return Err(error);
  }
  Ok(Box::new(QuicConnection {
    connection,
    endpoint,
    deadline: DeadlineCell::default(),
  }) as BoxedConnection)
}

impl Listener for QuicListener {
  fn listen(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let addr = resolve_socket_addr(&self.addr).await?;
      let endpoint = quinn::Endpoint::server(server_config(&self.settings)?, addr)?;
      tracing::info!(addr = ?endpoint.local_addr().ok(), "quic_listening");
      self.endpoint = Some(endpoint);
      Ok(())
    }
    .boxed()
  }

  fn accept(&self) -> BoxFuture<'_, Result<BoxedConnection, TransportError>> {
    async move {
      let endpoint = self.endpoint.as_ref().ok_or(TransportError::NotListening)?;
      loop {
        let connecting = tokio::select! {
          authenticated = self.handshakes.next() => return authenticated,
          connecting = endpoint.accept() => connecting.ok_or(TransportError::ListenerClosed)?,
        };
        let peer = connecting.remote_address();
        self.handshakes.spawn(
          peer,
          accept_connection(connecting, peer, endpoint.clone(), self.validator.clone()),
        );
      }
    }
    .boxed()
  }

  fn close(&self) {
    if let Some(endpoint) = self.endpoint.as_ref() {
      endpoint.close(0u32.into(), b"listener closed");
    }
  }

  fn local_addr(&self) -> Result<SocketAddr, TransportError> {
    let endpoint = self.endpoint.as_ref().ok_or(TransportError::NotListening)?;
    Ok(endpoint.local_addr()?)
  }

  fn set_auth_func(&mut self, validator: AuthValidator) {
    self.validator = Some(validator);
  }
}

#[cfg(test)]
mod tests {
  use super::QuicSettings;

  #[test]
  fn settings_defaults_and_validation() {
    let settings = QuicSettings::from_raw_config("").unwrap();
    assert_eq!(settings.keepalive_interval_secs, 10);
    assert_eq!(settings.idle_timeout_secs, 30);
    assert!(QuicSettings::from_raw_config(r#"{"keepalive_interval_secs": 30}"#).is_err());
  }

  #[test]
  fn self_signed_server_config_builds() {
    let settings = QuicSettings::default();
    super::server_config(&settings).expect("Self-signed server configuration must build");
    super::client_config(&settings).expect("Client configuration must build");
  }
}
