// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  future::Future,
  io::Error as IOError,
  net::SocketAddr,
  pin::Pin,
  task::{Context, Poll},
};

use tokio::{
  io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf},
  net::TcpStream,
  time::{Instant, Sleep},
};
use tokio_util::compat::Compat;

/// Backing byte channel of a [`Stream`]
pub(crate) enum StreamIo {
  Tcp(TcpStream),
  Multiplexed(Compat<yamux::Stream>),
  Quic(quinn::SendStream, quinn::RecvStream),
  Duplex(DuplexStream),
}

impl std::fmt::Debug for StreamIo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Tcp(_) => f.write_str("Tcp"),
      Self::Multiplexed(_) => f.write_str("Multiplexed"),
      Self::Quic(..) => f.write_str("Quic"),
      Self::Duplex(_) => f.write_str("Duplex"),
    }
  }
}

/// A full-duplex byte stream, either a raw TCP socket or a channel within a
/// multiplexed connection
///
/// Addresses are snapshotted from the owning connection at creation, so a
/// stream never keeps its connection alive.
pub struct Stream {
  io: StreamIo,
  local_addr: Option<SocketAddr>,
  remote_addr: Option<SocketAddr>,
  read_deadline: Option<Pin<Box<Sleep>>>,
  write_deadline: Option<Pin<Box<Sleep>>>,
}

impl std::fmt::Debug for Stream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Stream")
      .field("io", &self.io)
      .field("local_addr", &self.local_addr)
      .field("remote_addr", &self.remote_addr)
      .finish_non_exhaustive()
  }
}

impl Stream {
  pub(crate) fn new(
    io: StreamIo,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
  ) -> Self {
    Self {
      io,
      local_addr,
      remote_addr,
      read_deadline: None,
      write_deadline: None,
    }
  }

  /// Wraps an in-memory pipe; used for tests and in-process plumbing
  pub fn from_duplex(duplex: DuplexStream) -> Self {
    Self::new(StreamIo::Duplex(duplex), None, None)
  }

  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.local_addr
  }

  pub fn remote_addr(&self) -> Option<SocketAddr> {
    self.remote_addr
  }

  /// Reads pending past the deadline fail with [`std::io::ErrorKind::TimedOut`]
  pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
    self.read_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
  }

  /// Writes pending past the deadline fail with [`std::io::ErrorKind::TimedOut`]
  pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
    self.write_deadline = deadline.map(|d| Box::pin(tokio::time::sleep_until(d)));
  }

  pub fn set_deadline(&mut self, deadline: Option<Instant>) {
    self.set_read_deadline(deadline);
    self.set_write_deadline(deadline);
  }

  /// Shuts down the write half, signalling end-of-stream to the peer
  pub async fn close(&mut self) -> Result<(), IOError> {
    self.shutdown().await
  }

  fn deadline_expired(deadline: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> bool {
    match deadline {
      Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
      None => false,
    }
  }
}

impl From<TcpStream> for Stream {
  fn from(stream: TcpStream) -> Self {
    let (local_addr, remote_addr) = (stream.local_addr().ok(), stream.peer_addr().ok());
    Self::new(StreamIo::Tcp(stream), local_addr, remote_addr)
  }
}

fn deadline_error() -> IOError {
  IOError::new(std::io::ErrorKind::TimedOut, "Stream deadline exceeded")
}

impl AsyncRead for Stream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    let this = Pin::into_inner(self);
    if Self::deadline_expired(&mut this.read_deadline, cx) {
      return Poll::Ready(Err(deadline_error()));
    }
    match &mut this.io {
      StreamIo::Tcp(s) => Pin::new(s).poll_read(cx, buf),
      StreamIo::Multiplexed(s) => Pin::new(s).poll_read(cx, buf),
      StreamIo::Quic(_, recv) => AsyncRead::poll_read(Pin::new(recv), cx, buf),
      StreamIo::Duplex(s) => Pin::new(s).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Stream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    let this = Pin::into_inner(self);
    if Self::deadline_expired(&mut this.write_deadline, cx) {
      return Poll::Ready(Err(deadline_error()));
    }
    match &mut this.io {
      StreamIo::Tcp(s) => Pin::new(s).poll_write(cx, buf),
      StreamIo::Multiplexed(s) => Pin::new(s).poll_write(cx, buf),
      StreamIo::Quic(send, _) => AsyncWrite::poll_write(Pin::new(send), cx, buf),
      StreamIo::Duplex(s) => Pin::new(s).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    let this = Pin::into_inner(self);
    if Self::deadline_expired(&mut this.write_deadline, cx) {
      return Poll::Ready(Err(deadline_error()));
    }
    match &mut this.io {
      StreamIo::Tcp(s) => Pin::new(s).poll_flush(cx),
      StreamIo::Multiplexed(s) => Pin::new(s).poll_flush(cx),
      StreamIo::Quic(send, _) => AsyncWrite::poll_flush(Pin::new(send), cx),
      StreamIo::Duplex(s) => Pin::new(s).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    let this = Pin::into_inner(self);
    match &mut this.io {
      StreamIo::Tcp(s) => Pin::new(s).poll_shutdown(cx),
      StreamIo::Multiplexed(s) => Pin::new(s).poll_shutdown(cx),
      StreamIo::Quic(send, _) => AsyncWrite::poll_shutdown(Pin::new(send), cx),
      StreamIo::Duplex(s) => Pin::new(s).poll_shutdown(cx),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::Stream;
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::time::Instant;

  #[tokio::test]
  async fn duplex_stream_carries_bytes() {
    let (a, b) = tokio::io::duplex(64);
    let (mut a, mut b) = (Stream::from_duplex(a), Stream::from_duplex(b));
    a.write_all(b"test buffer").await.unwrap();
    let mut received = [0u8; 11];
    b.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"test buffer");
    a.close().await.unwrap();
    assert_eq!(b.read(&mut received).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn read_deadline_expires() {
    let (a, _b) = tokio::io::duplex(64);
    let mut a = Stream::from_duplex(a);
    a.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)));
    let mut buf = [0u8; 4];
    let err = a.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    // Clearing the deadline allows reads to proceed again
    a.set_read_deadline(None);
    let pending = tokio::time::timeout(Duration::from_millis(20), a.read(&mut buf)).await;
    assert!(pending.is_err(), "Read must block without a deadline");
  }

  #[tokio::test]
  async fn write_deadline_is_independent_of_read_deadline() {
    let (a, mut b) = tokio::io::duplex(64);
    let mut a = Stream::from_duplex(a);
    a.set_read_deadline(Some(Instant::now()));
    a.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
  }
}
