// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use relaymesh::transport::{BoxedConnection, BoxedListener, Stream, TransportError};
use tokio::{
  io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
  net::TcpListener,
  task::JoinHandle,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Routes library logs to the test harness when `RUST_LOG` is set
pub fn init_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

async fn echo_stream(stream: Stream) {
  let (mut reader, mut writer) = tokio::io::split(stream);
  let _ = tokio::io::copy(&mut reader, &mut writer).await;
  let _ = writer.shutdown().await;
}

/// Echoes every stream the peer opens on `connection`
pub async fn echo_connection(connection: BoxedConnection) {
  while let Ok(stream) = connection.accept_stream().await {
    tokio::task::spawn(echo_stream(stream));
  }
}

/// Accepts a single connection and echoes its streams until the peer goes away
pub fn spawn_overlay_echo(listener: BoxedListener) -> JoinHandle<Result<(), TransportError>> {
  tokio::task::spawn(async move {
    let connection = listener.accept().await?;
    echo_connection(connection).await;
    Ok(())
  })
}

/// Plain TCP echo service standing in for a real destination
pub async fn spawn_tcp_echo() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::task::spawn(async move {
    while let Ok((socket, _)) = listener.accept().await {
      tokio::task::spawn(async move {
        let (mut reader, mut writer) = socket.into_split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
      });
    }
  });
  addr
}

pub async fn assert_echo<S>(stream: &mut S, payload: &[u8])
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  stream.write_all(payload).await.unwrap();
  let mut reply = vec![0u8; payload.len()];
  tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut reply))
    .await
    .expect("Echo must arrive before the test timeout")
    .unwrap();
  assert_eq!(reply, payload);
}
