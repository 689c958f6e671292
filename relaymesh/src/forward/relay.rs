// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::pool::BufferPool;

/// Bound on flushing and shutting down a write half once the session ends
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
  pub inbound_to_outbound: u64,
  pub outbound_to_inbound: u64,
}

/// Copies bytes both ways between two streams until either direction ends
///
/// Each direction runs as its own task with a buffer from `pool`. When one
/// direction finishes, `session` is cancelled so the other stops too, and both
/// write halves are shut down. Cancelling `session` externally tears the relay
/// down the same way. Returns once both tasks have exited.
pub async fn relay<A, B>(
  pool: &BufferPool,
  inbound: A,
  outbound: B,
  session: CancellationToken,
) -> RelayStats
where
  A: AsyncRead + AsyncWrite + Send + 'static,
  B: AsyncRead + AsyncWrite + Send + 'static,
{
  let (inbound_reader, inbound_writer) = tokio::io::split(inbound);
  let (outbound_reader, outbound_writer) = tokio::io::split(outbound);
  let forward = tokio::task::spawn(pump(
    inbound_reader,
    outbound_writer,
    pool.clone(),
    session.clone(),
  ));
  let backward = tokio::task::spawn(pump(
    outbound_reader,
    inbound_writer,
    pool.clone(),
    session.clone(),
  ));
  let (forward, backward) = tokio::join!(forward, backward);
  RelayStats {
    inbound_to_outbound: settle("inbound_to_outbound", forward),
    outbound_to_inbound: settle("outbound_to_inbound", backward),
  }
}

fn settle(
  direction: &'static str,
  joined: Result<std::io::Result<u64>, tokio::task::JoinError>,
) -> u64 {
  match joined {
    Ok(Ok(transferred)) => transferred,
    Ok(Err(error)) => {
      tracing::debug!(direction, %error, "relay_direction_failed");
      0
    }
    Err(error) => {
      tracing::error!(direction, %error, "relay_task_panicked");
      0
    }
  }
}

async fn pump<R, W>(
  mut reader: R,
  mut writer: W,
  pool: BufferPool,
  session: CancellationToken,
) -> std::io::Result<u64>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  let mut transferred = 0u64;
  let result = {
    let mut buffer = pool.take();
    tokio::select! {
      result = copy_through(&mut reader, &mut writer, &mut buffer, &mut transferred) => result,
      _ = session.cancelled() => Ok(()),
    }
  };
  session.cancel();
  if tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown())
    .await
    .is_err()
  {
    tracing::debug!("relay_shutdown_timed_out");
  }
  result.map(|()| transferred)
}

async fn copy_through<R, W>(
  reader: &mut R,
  writer: &mut W,
  buffer: &mut [u8],
  transferred: &mut u64,
) -> std::io::Result<()>
where
  R: AsyncRead + Unpin,
  W: AsyncWrite + Unpin,
{
  loop {
    let read = reader.read(buffer).await?;
    if read == 0 {
      return Ok(());
    }
    writer.write_all(&buffer[..read]).await?;
    writer.flush().await?;
    *transferred += read as u64;
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
  use tokio_util::sync::CancellationToken;

  use super::relay;
  use crate::forward::pool::BufferPool;

  #[tokio::test]
  async fn bytes_arrive_in_order_both_ways() {
    let pool = BufferPool::new(8);
    let (mut client, inbound) = duplex(64);
    let (outbound, mut server) = duplex(64);
    let relay_task = tokio::task::spawn({
      let pool = pool.clone();
      async move { relay(&pool, inbound, outbound, CancellationToken::new()).await }
    });

    let request = b"request bytes that span several buffers".to_vec();
    client.write_all(&request).await.unwrap();
    let mut received = vec![0u8; request.len()];
    server.read_exact(&mut received).await.unwrap();
    assert_eq!(received, request);

    server.write_all(b"response").await.unwrap();
    let mut response = [0u8; 8];
    client.read_exact(&mut response).await.unwrap();
    assert_eq!(&response, b"response");

    drop(client);
    let stats = tokio::time::timeout(Duration::from_secs(5), relay_task)
      .await
      .expect("Relay must end once a side closes")
      .unwrap();
    assert_eq!(stats.inbound_to_outbound, request.len() as u64);
    assert_eq!(stats.outbound_to_inbound, 8);
    assert_eq!(pool.idle(), 2, "Both buffers must return to the pool");
  }

  #[tokio::test]
  async fn closing_one_end_unblocks_the_other_direction() {
    let pool = BufferPool::new(16);
    let (client, inbound) = duplex(64);
    let (outbound, mut server) = duplex(64);
    let relay_task = tokio::task::spawn({
      let pool = pool.clone();
      async move { relay(&pool, inbound, outbound, CancellationToken::new()).await }
    });

    // The server never writes, so only the client's close can end the backward copy
    drop(client);
    tokio::time::timeout(Duration::from_secs(5), relay_task)
      .await
      .expect("Relay must end once a side closes")
      .unwrap();
    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), server.read_to_end(&mut rest))
      .await
      .expect("Server side must observe end of stream")
      .unwrap();
    assert_eq!(read, 0);
  }

  #[tokio::test]
  async fn cancelling_the_session_ends_the_relay() {
    let pool = BufferPool::new(16);
    let (_client, inbound) = duplex(64);
    let (outbound, _server) = duplex(64);
    let session = CancellationToken::new();
    let relay_task = tokio::task::spawn({
      let pool = pool.clone();
      let session = session.clone();
      async move { relay(&pool, inbound, outbound, session).await }
    });
    session.cancel();
    let stats = tokio::time::timeout(Duration::from_secs(5), relay_task)
      .await
      .expect("Relay must end on cancellation")
      .unwrap();
    assert_eq!(stats, Default::default());
  }
}
