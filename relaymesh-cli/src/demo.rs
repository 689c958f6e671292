// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{net::SocketAddr, time::Duration};

use anyhow::{Context as AnyhowContext, Result};
use relaymesh::transport::{
  allow_list_validator,
  registry::{Endpoint, TransportRegistry},
  BoxedConnection, BoxedListener, Stream,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

const DEMO_KEY: &str = "relaymesh-demo";
const DEMO_ACCESS_TOKEN: &str = "demo";
const PING_INTERVAL: Duration = Duration::from_secs(1);

async fn print_stream(mut stream: Stream) {
  let peer = stream.remote_addr();
  let mut buffer = vec![0u8; 1024];
  loop {
    match stream.read(&mut buffer).await {
      Ok(0) => break,
      Ok(read) => println!(
        "received from {:?}: {}",
        peer,
        String::from_utf8_lossy(&buffer[..read])
      ),
      Err(error) => {
        tracing::debug!(%error, "demo_stream_failed");
        break;
      }
    }
  }
}

async fn print_connection(connection: BoxedConnection) {
  while let Ok(stream) = connection.accept_stream().await {
    tokio::task::spawn(print_stream(stream));
  }
  connection.close();
}

async fn serve(listener: BoxedListener, shutdown: CancellationToken) {
  loop {
    let accepted = tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => accepted,
    };
    match accepted {
      Ok(connection) => {
        let span = tracing::info_span!("demo_connection", peer = ?connection.remote_addr());
        tokio::task::spawn(print_connection(connection).instrument(span));
      }
      Err(error) if error.is_terminal_for_listener() => break,
      Err(error) => tracing::warn!(%error, "demo_accept_failed"),
    }
  }
  listener.close();
}

pub async fn demo_main(scheme: &str, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
  let registry = TransportRegistry::with_default_backends();
  let mut listener = registry
    .new_listener(scheme, Endpoint::new(&addr.to_string(), DEMO_KEY, ""))
    .await
    .with_context(|| format!("Starting {} listener on {}", scheme, addr))?;
  listener.set_auth_func(allow_list_validator([DEMO_ACCESS_TOKEN]));
  let bound = listener.local_addr()?;
  let server = tokio::task::spawn(serve(listener, shutdown.clone()));

  let mut dialer = registry.new_dialer(scheme, Endpoint::new(&bound.to_string(), DEMO_KEY, ""))?;
  dialer.set_access_token(DEMO_ACCESS_TOKEN.into());
  let connection = dialer
    .dial()
    .await
    .with_context(|| format!("Dialing {}://{}", scheme, bound))?;
  let mut stream = connection.open_stream().await?;
  tracing::info!(%scheme, addr = %bound, "demo_started");

  let mut ticker = tokio::time::interval(PING_INTERVAL);
  let mut sequence = 0u64;
  let pinged: Result<()> = loop {
    tokio::select! {
      _ = shutdown.cancelled() => break Ok(()),
      _ = ticker.tick() => {
        sequence += 1;
        if let Err(error) = stream.write_all(format!("ping {}", sequence).as_bytes()).await {
          break Err(error).context("Writing ping");
        }
      }
    }
  };
  let _ = stream.close().await;
  connection.close();
  shutdown.cancel();
  server.await.context("Demo listener task panicked")?;
  pinged
}
