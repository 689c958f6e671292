// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Stream multiplexing session shared by the byte-stream backends
//!
//! A yamux connection is driven by a single background task which services
//! outbound open requests, queues inbound streams, and closes the session on
//! request. [`MuxSession`] is the [`Connection`] handle to that task.

use std::{
  collections::VecDeque,
  future::Future,
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
  task::Poll,
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  sync::{mpsc, oneshot, Mutex},
  time::Instant,
};
use tokio_util::{
  compat::{FuturesAsyncReadCompatExt, TokioAsyncReadCompatExt},
  sync::CancellationToken,
};
use tracing_futures::Instrument;

use super::{stream::StreamIo, Connection, DeadlineCell, Stream, TransportError};

type OpenRequest = oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>;

/// Every stream reserves a 256 KiB receive window out of yamux's 1 GiB connection window
pub const MAX_STREAMS_LIMIT: usize = 4096;

/// Multiplexer settings applied once the raw transport has authenticated
#[derive(Debug, Clone)]
pub struct SessionConfig {
  pub max_streams: usize,
  /// Inbound streams waiting for `accept_stream` beyond this are refused
  pub accept_backlog: usize,
}

impl Default for SessionConfig {
  fn default() -> Self {
    Self {
      max_streams: 512,
      accept_backlog: 256,
    }
  }
}

impl SessionConfig {
  pub fn validate(&self) -> Result<(), TransportError> {
    if self.max_streams == 0 || self.max_streams > MAX_STREAMS_LIMIT {
      return Err(TransportError::InvalidConfig(format!(
        "max_streams must be within 1..={}, got {}",
        MAX_STREAMS_LIMIT, self.max_streams
      )));
    }
    Ok(())
  }

  fn yamux_config(&self) -> yamux::Config {
    let mut config = yamux::Config::default();
    config.set_max_num_streams(self.max_streams);
    config
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSide {
  Client,
  Server,
}

impl From<SessionSide> for yamux::Mode {
  fn from(side: SessionSide) -> Self {
    match side {
      SessionSide::Client => yamux::Mode::Client,
      SessionSide::Server => yamux::Mode::Server,
    }
  }
}

pub struct MuxSession {
  open_requests: mpsc::Sender<OpenRequest>,
  incoming: Mutex<mpsc::Receiver<yamux::Stream>>,
  shutdown: CancellationToken,
  closed: Arc<AtomicBool>,
  deadline: DeadlineCell,
  local_addr: Option<SocketAddr>,
  remote_addr: Option<SocketAddr>,
}

impl std::fmt::Debug for MuxSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MuxSession")
      .field("local_addr", &self.local_addr)
      .field("remote_addr", &self.remote_addr)
      .field("closed", &self.closed.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

impl MuxSession {
  /// Layers a multiplexer over an authenticated byte stream and spawns its driver
  pub fn spawn<T>(
    io: T,
    side: SessionSide,
    config: &SessionConfig,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
  ) -> Self
  where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
  {
    let connection = yamux::Connection::new(
      TokioAsyncReadCompatExt::compat(io),
      config.yamux_config(),
      side.into(),
    );
    let (open_requests, open_receiver) = mpsc::channel(64);
    let (incoming_sender, incoming) = mpsc::channel(config.accept_backlog.max(1));
    let shutdown = CancellationToken::new();
    let closed = Arc::new(AtomicBool::new(false));

    let span = tracing::debug_span!("mux_session", ?side, remote = ?remote_addr);
    tokio::task::spawn(
      drive(
        connection,
        open_receiver,
        incoming_sender,
        shutdown.clone(),
        closed.clone(),
      )
      .instrument(span),
    );

    Self {
      open_requests,
      incoming: Mutex::new(incoming),
      shutdown,
      closed,
      deadline: DeadlineCell::default(),
      local_addr,
      remote_addr,
    }
  }

  fn wrap(&self, stream: yamux::Stream) -> Stream {
    Stream::new(
      StreamIo::Multiplexed(FuturesAsyncReadCompatExt::compat(stream)),
      self.local_addr,
      self.remote_addr,
    )
  }
}

async fn drive<T>(
  mut connection: yamux::Connection<T>,
  mut open_receiver: mpsc::Receiver<OpenRequest>,
  incoming: mpsc::Sender<yamux::Stream>,
  shutdown: CancellationToken,
  closed: Arc<AtomicBool>,
) where
  T: futures::AsyncRead + futures::AsyncWrite + Unpin + Send + 'static,
{
  let mut pending_opens: VecDeque<OpenRequest> = VecDeque::new();
  let shutdown_requested = shutdown.cancelled();
  tokio::pin!(shutdown_requested);

  let outcome: Result<bool, yamux::ConnectionError> = futures::future::poll_fn(|cx| loop {
    if shutdown_requested.as_mut().poll(cx).is_ready() {
      return Poll::Ready(Ok(true));
    }
    let mut progress = false;

    while let Poll::Ready(Some(request)) = open_receiver.poll_recv(cx) {
      pending_opens.push_back(request);
      progress = true;
    }

    while !pending_opens.is_empty() {
      match connection.poll_new_outbound(cx) {
        Poll::Ready(result) => {
          if let Some(request) = pending_opens.pop_front() {
            // The requester may have given up; the stream is dropped and closed
            let _ = request.send(result);
          }
          progress = true;
        }
        Poll::Pending => break,
      }
    }

    match connection.poll_next_inbound(cx) {
      Poll::Ready(Some(Ok(stream))) => {
        if let Err(error) = incoming.try_send(stream) {
          tracing::warn!(reason = %error, "inbound_stream_refused");
        }
        progress = true;
      }
      Poll::Ready(Some(Err(error))) => return Poll::Ready(Err(error)),
      Poll::Ready(None) => return Poll::Ready(Ok(false)),
      Poll::Pending => {}
    }

    if !progress {
      return Poll::Pending;
    }
  })
  .await;

  closed.store(true, Ordering::SeqCst);
  match outcome {
    Ok(true) => {
      if let Err(error) = futures::future::poll_fn(|cx| connection.poll_close(cx)).await {
        tracing::debug!(?error, "session_close_failed");
      }
      tracing::debug!("session_closed_locally");
    }
    Ok(false) => tracing::debug!("session_closed_by_peer"),
    Err(error) => tracing::debug!(?error, "session_failed"),
  }
  // Requests still queued observe a dropped sender and report the closure
  drop(pending_opens);
}

impl Connection for MuxSession {
  fn open_stream(&self) -> BoxFuture<'_, Result<Stream, TransportError>> {
    async move {
      if self.is_closed() {
        return Err(TransportError::ConnectionClosed);
      }
      let (sender, receiver) = oneshot::channel();
      self
        .open_requests
        .send(sender)
        .await
        .map_err(|_| TransportError::ConnectionClosed)?;
      let stream = receiver
        .await
        .map_err(|_| TransportError::ConnectionClosed)??;
      Ok(self.wrap(stream))
    }
    .boxed()
  }

  fn accept_stream(&self) -> BoxFuture<'_, Result<Stream, TransportError>> {
    async move {
      let next = async {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or(TransportError::ConnectionClosed)
      };
      let stream = self.deadline.run(next).await?;
      Ok(self.wrap(stream))
    }
    .boxed()
  }

  fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
    self.shutdown.cancel();
  }

  fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  fn remote_addr(&self) -> Option<SocketAddr> {
    self.remote_addr
  }

  fn local_addr(&self) -> Option<SocketAddr> {
    self.local_addr
  }

  fn set_deadline(&self, deadline: Option<Instant>) {
    self.deadline.set(deadline);
  }
}

impl Drop for MuxSession {
  fn drop(&mut self) {
    self.shutdown.cancel();
  }
}
