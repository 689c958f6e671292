// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! YAML node configuration
//!
//! Access and hop nodes describe a listener plus their next hops under
//! `route_config`; target nodes describe a listener and a destination.

use std::{net::SocketAddr, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
  route::{NextHop, RouteTableConfig},
  transport::registry::{KCP_SCHEME, MUX_SCHEME, QUIC_SCHEME},
};

/// Scheme selecting a plain TCP accept loop instead of an overlay listener
pub const TCP_SCHEME: &str = "tcp";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Failed to read configuration: {0}")]
  Io(#[from] std::io::Error),
  #[error("Malformed configuration: {0}")]
  Yaml(#[from] serde_yaml::Error),
  #[error("Invalid address {addr:?} for {field}")]
  InvalidAddress { field: &'static str, addr: String },
  #[error("Unsupported scheme {scheme:?} for {field}")]
  UnsupportedScheme { field: &'static str, scheme: String },
  #[error("{0}")]
  Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
  pub scheme: String,
  pub listen_addr: String,
  #[serde(default)]
  pub key: String,
  #[serde(default)]
  pub raw_config: String,
  /// Access tokens accepted from dialing peers; empty disables authentication
  #[serde(default)]
  pub auth_tokens: Vec<String>,
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextHopConfig {
  #[serde(alias = "nexthop_addr", alias = "hop_addr")]
  pub addr: String,
  pub scheme: String,
  #[serde(default)]
  pub raw_config: String,
  #[serde(default)]
  pub key: String,
  #[serde(default)]
  pub access_token: Option<String>,
  /// Accepted for compatibility; latency probing is not performed
  #[serde(default)]
  pub probe_addr: String,
}

impl std::fmt::Debug for NextHopConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("NextHopConfig")
      .field("addr", &self.addr)
      .field("scheme", &self.scheme)
      .field("raw_config", &self.raw_config)
      .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
      .finish_non_exhaustive()
  }
}

impl NextHopConfig {
  pub fn to_next_hop(&self) -> NextHop {
    let hop = NextHop::new(&self.scheme, &self.addr, &self.raw_config).with_key(&self.key);
    match self.access_token.as_deref() {
      Some(token) if !token.is_empty() => hop.with_access_token(token),
      _ => hop,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteTableSettings {
  pub health_check_interval_secs: u64,
  pub redial_delay_secs: u64,
  pub max_add_attempts: Option<u32>,
}

impl Default for RouteTableSettings {
  fn default() -> Self {
    Self {
      health_check_interval_secs: 5,
      redial_delay_secs: 1,
      max_add_attempts: None,
    }
  }
}

impl RouteTableSettings {
  pub fn to_route_table_config(&self) -> RouteTableConfig {
    RouteTableConfig {
      health_check_interval: Duration::from_secs(self.health_check_interval_secs),
      redial_delay: Duration::from_secs(self.redial_delay_secs),
      max_add_attempts: self.max_add_attempts,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRouteConfig {
  pub listener: ListenerConfig,
  #[serde(default)]
  pub dialer: Vec<NextHopConfig>,
  #[serde(default)]
  pub route_table: RouteTableSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessConfig {
  pub route_config: AccessRouteConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopRouteConfig {
  pub listener: ListenerConfig,
  #[serde(default)]
  pub hops: Vec<NextHopConfig>,
  #[serde(default)]
  pub route_table: RouteTableSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopConfig {
  pub route_config: HopRouteConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetAddressConfig {
  pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetConfig {
  pub listener: ListenerConfig,
  pub target: TargetAddressConfig,
}

fn is_overlay_scheme(scheme: &str) -> bool {
  matches!(scheme, KCP_SCHEME | MUX_SCHEME | QUIC_SCHEME)
}

/// Requires a `host:port` shape; hostnames are resolved later, at bind or dial time
fn check_address(field: &'static str, addr: &str) -> Result<(), ConfigError> {
  if addr.parse::<SocketAddr>().is_ok() {
    return Ok(());
  }
  let invalid = || ConfigError::InvalidAddress {
    field,
    addr: addr.to_string(),
  };
  let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
  if host.is_empty() || port.parse::<u16>().is_err() {
    return Err(invalid());
  }
  Ok(())
}

fn check_scheme(
  field: &'static str,
  scheme: &str,
  allow_plain_tcp: bool,
) -> Result<(), ConfigError> {
  if is_overlay_scheme(scheme) || (allow_plain_tcp && scheme == TCP_SCHEME) {
    Ok(())
  } else {
    Err(ConfigError::UnsupportedScheme {
      field,
      scheme: scheme.to_string(),
    })
  }
}

fn check_listener(listener: &ListenerConfig, allow_plain_tcp: bool) -> Result<(), ConfigError> {
  check_scheme("listener.scheme", &listener.scheme, allow_plain_tcp)?;
  check_address("listener.listen_addr", &listener.listen_addr)?;
  if listener.scheme == TCP_SCHEME && !listener.auth_tokens.is_empty() {
    return Err(ConfigError::Invalid(
      "listener.auth_tokens cannot be used with a plain tcp listener".into(),
    ));
  }
  Ok(())
}

fn check_next_hops(field: &'static str, hops: &[NextHopConfig]) -> Result<(), ConfigError> {
  for hop in hops {
    check_scheme(field, &hop.scheme, false)?;
    check_address(field, &hop.addr)?;
  }
  Ok(())
}

fn check_route_table(settings: &RouteTableSettings) -> Result<(), ConfigError> {
  if settings.health_check_interval_secs == 0 {
    return Err(ConfigError::Invalid(
      "route_table.health_check_interval_secs must be positive".into(),
    ));
  }
  if settings.max_add_attempts == Some(0) {
    return Err(ConfigError::Invalid(
      "route_table.max_add_attempts must be positive when set".into(),
    ));
  }
  Ok(())
}

impl AccessConfig {
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    Self::from_yaml(&std::fs::read_to_string(path)?)
  }

  pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let route = &self.route_config;
    check_listener(&route.listener, true)?;
    check_next_hops("route_config.dialer", &route.dialer)?;
    check_route_table(&route.route_table)
  }
}

impl HopConfig {
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    Self::from_yaml(&std::fs::read_to_string(path)?)
  }

  pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let route = &self.route_config;
    check_listener(&route.listener, false)?;
    check_next_hops("route_config.hops", &route.hops)?;
    check_route_table(&route.route_table)
  }
}

impl TargetConfig {
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    Self::from_yaml(&std::fs::read_to_string(path)?)
  }

  pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    check_listener(&self.listener, false)?;
    check_address("target.address", &self.target.address)
  }
}
