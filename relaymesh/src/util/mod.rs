// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

pub mod framed;
pub mod validators;

/// Resolves a `host:port` string to the first socket address it names
pub async fn resolve_socket_addr(addr: &str) -> std::io::Result<std::net::SocketAddr> {
  tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
    std::io::Error::new(
      std::io::ErrorKind::AddrNotAvailable,
      format!("No addresses found for {:?}", addr),
    )
  })
}
