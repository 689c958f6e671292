// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Reliable-UDP backend: a KCP session, optionally AEAD-sealed, authenticated
//! and then multiplexed with yamux

use std::{net::SocketAddr, sync::Arc};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  sync::Mutex,
};
use tokio_kcp::{KcpListener as RawKcpListener, KcpStream};
use tokio_util::sync::CancellationToken;

use super::{
  auth::{request_auth, verify_auth, with_handshake_deadline, HANDSHAKE_TIMEOUT},
  pending::PendingHandshakes,
  session::{MuxSession, SessionSide},
  AuthError, AuthValidator, BoxedConnection, Dialer, Listener, TransportError,
};
use crate::util::resolve_socket_addr;

pub mod config;
pub mod crypt;

pub use config::KcpSettings;
use crypt::{derive_key, SealedStream, DERIVED_KEY_LEN};

fn kcp_error(error: impl std::fmt::Display) -> TransportError {
  TransportError::Kcp(error.to_string())
}

enum Handshake<'a> {
  Dial(Option<&'a str>),
  Accept(Option<&'a AuthValidator>),
}

impl Handshake<'_> {
  fn side(&self) -> SessionSide {
    match self {
      Handshake::Dial(_) => SessionSide::Client,
      Handshake::Accept(_) => SessionSide::Server,
    }
  }
}

/// Shared configuration of both KCP roles
struct KcpProfile {
  settings: KcpSettings,
  key: [u8; DERIVED_KEY_LEN],
}

impl KcpProfile {
  fn new(key: &str, raw_config: &str) -> Result<Self, TransportError> {
    Ok(Self {
      settings: KcpSettings::from_raw_config(raw_config)?,
      key: derive_key(key),
    })
  }

  /// Seals the session if a cipher is configured, authenticates, then multiplexes
  async fn promote(
    &self,
    stream: KcpStream,
    handshake: Handshake<'_>,
    local_addr: Option<SocketAddr>,
    remote_addr: SocketAddr,
  ) -> Result<BoxedConnection, TransportError> {
    match self.settings.cipher().algorithm() {
      Some(algorithm) => {
        let salted = SealedStream::establish(stream, algorithm, &self.key, handshake.side());
        let sealed = tokio::time::timeout(HANDSHAKE_TIMEOUT, salted)
          .await
          .map_err(|_elapsed| AuthError::TimedOut(HANDSHAKE_TIMEOUT))??;
        self
          .authenticate_and_spawn(sealed, handshake, local_addr, remote_addr)
          .await
      }
      None => {
        self
          .authenticate_and_spawn(stream, handshake, local_addr, remote_addr)
          .await
      }
    }
  }

  async fn authenticate_and_spawn<T>(
    &self,
    mut io: T,
    handshake: Handshake<'_>,
    local_addr: Option<SocketAddr>,
    remote_addr: SocketAddr,
  ) -> Result<BoxedConnection, TransportError>
  where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let side = handshake.side();
    match handshake {
      Handshake::Dial(token) => with_handshake_deadline(request_auth(&mut io, token)).await?,
      Handshake::Accept(validator) => {
        with_handshake_deadline(verify_auth(&mut io, validator)).await?;
      }
    }
    Ok(Box::new(MuxSession::spawn(
      io,
      side,
      &self.settings.session_config(),
      local_addr,
      Some(remote_addr),
    )))
  }
}

pub struct KcpDialer {
  addr: String,
  profile: KcpProfile,
  access_token: Option<String>,
}

impl KcpDialer {
  pub fn new(addr: impl Into<String>, key: &str, raw_config: &str) -> Result<Self, TransportError> {
    Ok(Self {
      addr: addr.into(),
      profile: KcpProfile::new(key, raw_config)?,
      access_token: None,
    })
  }
}

impl Dialer for KcpDialer {
  fn dial(&self) -> BoxFuture<'_, Result<BoxedConnection, TransportError>> {
    async move {
      let remote_addr = resolve_socket_addr(&self.addr).await?;
      let stream = KcpStream::connect(&self.profile.settings.kcp_config(), remote_addr)
        .await
        .map_err(kcp_error)?;
      let connection = self
        .profile
        .promote(
          stream,
          Handshake::Dial(self.access_token.as_deref()),
          None,
          remote_addr,
        )
        .await?;
      tracing::debug!(addr = %remote_addr, "kcp_dialed");
      Ok(connection)
    }
    .boxed()
  }

  fn set_access_token(&mut self, token: String) {
    self.access_token = Some(token);
  }
}

pub struct KcpListener {
  addr: String,
  profile: Arc<KcpProfile>,
  listener: Mutex<Option<RawKcpListener>>,
  local_addr: Option<SocketAddr>,
  validator: Option<AuthValidator>,
  handshakes: PendingHandshakes,
  closed: CancellationToken,
}

impl KcpListener {
  pub fn new(addr: impl Into<String>, key: &str, raw_config: &str) -> Result<Self, TransportError> {
    Ok(Self {
      addr: addr.into(),
      profile: Arc::new(KcpProfile::new(key, raw_config)?),
      listener: Mutex::new(None),
      local_addr: None,
      validator: None,
      handshakes: PendingHandshakes::new(),
      closed: CancellationToken::new(),
    })
  }
}

impl Listener for KcpListener {
  fn listen(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let addr = resolve_socket_addr(&self.addr).await?;
      let listener = RawKcpListener::bind(self.profile.settings.kcp_config(), addr)
        .await
        .map_err(kcp_error)?;
      let local_addr = listener.local_addr()?;
      tracing::info!(addr = %local_addr, "kcp_listening");
      self.local_addr = Some(local_addr);
      *self.listener.get_mut() = Some(listener);
      Ok(())
    }
    .boxed()
  }

  fn accept(&self) -> BoxFuture<'_, Result<BoxedConnection, TransportError>> {
    async move {
      loop {
        let (stream, peer) = {
          let mut guard = self.listener.lock().await;
          if self.closed.is_cancelled() {
            // Releases the UDP socket once no accept is in flight
            guard.take();
            return Err(TransportError::ListenerClosed);
          }
          let listener = guard.as_mut().ok_or(TransportError::NotListening)?;
          let accepted = tokio::select! {
            _ = self.closed.cancelled() => None,
            authenticated = self.handshakes.next() => return authenticated,
            accepted = listener.accept() => Some(accepted),
          };
          match accepted {
            Some(accepted) => accepted.map_err(kcp_error)?,
            None => {
              guard.take();
              return Err(TransportError::ListenerClosed);
            }
          }
        };
        let profile = Arc::clone(&self.profile);
        let validator = self.validator.clone();
        let local_addr = self.local_addr;
        self.handshakes.spawn(peer, async move {
          profile
            .promote(stream, Handshake::Accept(validator.as_ref()), local_addr, peer)
            .await
            .map_err(|error| {
              tracing::warn!(%peer, %error, "kcp_handshake_failed");
              error
            })
        });
      }
    }
    .boxed()
  }

  fn close(&self) {
    self.closed.cancel();
    if let Ok(mut guard) = self.listener.try_lock() {
      guard.take();
    }
  }

  fn local_addr(&self) -> Result<SocketAddr, TransportError> {
    self.local_addr.ok_or(TransportError::NotListening)
  }

  fn set_auth_func(&mut self, validator: AuthValidator) {
    self.validator = Some(validator);
  }
}
