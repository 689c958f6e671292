// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::net::SocketAddr;
use std::path::Path;

use crate::transport::registry::{MUX_SCHEME, KCP_SCHEME, QUIC_SCHEME};

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).is_file() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_socketaddr(v: &str) -> Result<SocketAddr> {
  use std::net::ToSocketAddrs;
  ToSocketAddrs::to_socket_addrs(v)
    .map_err(AnyErr::from)
    .and_then(|mut items| {
      items
        .next()
        .ok_or_else(|| AnyErr::msg("No addresses were resolved from the given host"))
    })
}

/// Accepts only schemes that name an overlay transport backend
pub fn parse_overlay_scheme(v: &str) -> Result<&'static str> {
  [MUX_SCHEME, KCP_SCHEME, QUIC_SCHEME]
    .into_iter()
    .find(|scheme| *scheme == v)
    .ok_or_else(|| {
      AnyErr::msg(format!(
        "Unsupported protocol {:?}; expected one of {}, {}, {}",
        v, MUX_SCHEME, KCP_SCHEME, QUIC_SCHEME
      ))
    })
}

pub fn validate_socketaddr(v: &str) -> Result<(), String> {
  parse_socketaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_overlay_scheme(v: &str) -> Result<(), String> {
  parse_overlay_scheme(v).map(|_| ()).map_err(|e| e.to_string())
}
