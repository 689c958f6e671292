// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::Deserialize;
use tokio_kcp::{KcpConfig, KcpNoDelayConfig};

use super::crypt::CipherKind;
use crate::transport::{parse_raw_config, session::SessionConfig, TransportError};

const MIN_MTU: usize = 50;
const MAX_MTU: usize = 1500;
const MAX_SHARDS: usize = 255;

/// Options carried in a KCP hop's raw JSON configuration
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KcpSettings {
  pub crypt: String,
  pub datashard: usize,
  pub parityshard: usize,
  pub nodelay: i32,
  pub interval: i32,
  pub resend: i32,
  pub nc: i32,
  pub sndwnd: u16,
  pub rcvwnd: u16,
  pub mtu: usize,
  pub acknodelay: bool,
  pub max_streams: usize,
}

impl Default for KcpSettings {
  fn default() -> Self {
    Self {
      crypt: "aes".into(),
      datashard: 10,
      parityshard: 3,
      nodelay: 1,
      interval: 10,
      resend: 2,
      nc: 1,
      sndwnd: 1024,
      rcvwnd: 1024,
      mtu: 1350,
      acknodelay: true,
      max_streams: SessionConfig::default().max_streams,
    }
  }
}

impl KcpSettings {
  pub fn from_raw_config(raw_config: &str) -> Result<Self, TransportError> {
    let settings: Self = parse_raw_config(raw_config)?;
    settings.validate()?;
    if settings.datashard != 0 || settings.parityshard != 0 {
      tracing::debug!(
        datashard = settings.datashard,
        parityshard = settings.parityshard,
        "kcp_fec_unavailable"
      );
    }
    Ok(settings)
  }

  fn validate(&self) -> Result<(), TransportError> {
    match self.datashard.checked_add(self.parityshard) {
      Some(shards) if shards <= MAX_SHARDS => {}
      _ => {
        return Err(TransportError::InvalidConfig(format!(
          "datashard + parityshard must not exceed {}, got {} + {}",
          MAX_SHARDS, self.datashard, self.parityshard
        )))
      }
    }
    if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
      return Err(TransportError::InvalidConfig(format!(
        "mtu must be within {}..={}, got {}",
        MIN_MTU, MAX_MTU, self.mtu
      )));
    }
    if self.sndwnd == 0 || self.rcvwnd == 0 {
      return Err(TransportError::InvalidConfig(
        "sndwnd and rcvwnd must be positive".into(),
      ));
    }
    if self.interval <= 0 {
      return Err(TransportError::InvalidConfig(
        "interval must be positive".into(),
      ));
    }
    self.session_config().validate()
  }

  pub fn cipher(&self) -> CipherKind {
    CipherKind::from_name(&self.crypt)
  }

  pub fn kcp_config(&self) -> KcpConfig {
    KcpConfig {
      mtu: self.mtu,
      nodelay: KcpNoDelayConfig {
        nodelay: self.nodelay != 0,
        interval: self.interval,
        resend: self.resend,
        nc: self.nc != 0,
      },
      wnd_size: (self.sndwnd, self.rcvwnd),
      flush_write: true,
      flush_acks_input: self.acknodelay,
      stream: true,
      ..Default::default()
    }
  }

  pub fn session_config(&self) -> SessionConfig {
    SessionConfig {
      max_streams: self.max_streams,
      ..Default::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::KcpSettings;
  use crate::transport::kcp::crypt::CipherKind;

  #[test]
  fn empty_config_selects_defaults() {
    let settings = KcpSettings::from_raw_config("").unwrap();
    assert_eq!(settings, KcpSettings::default());
    assert_eq!(settings.cipher(), CipherKind::Aes256Gcm);
    let config = settings.kcp_config();
    assert_eq!(config.mtu, 1350);
    assert_eq!(config.wnd_size, (1024, 1024));
    assert!(config.nodelay.nodelay);
    assert_eq!(config.nodelay.interval, 10);
    assert_eq!(config.nodelay.resend, 2);
    assert!(config.nodelay.nc);
    assert!(config.stream);
  }

  #[test]
  fn partial_config_overrides_selected_fields() {
    let settings =
      KcpSettings::from_raw_config(r#"{"crypt": "none", "mtu": 1200, "sndwnd": 128}"#).unwrap();
    assert_eq!(settings.cipher(), CipherKind::None);
    assert_eq!(settings.mtu, 1200);
    assert_eq!(settings.sndwnd, 128);
    assert_eq!(settings.rcvwnd, 1024);
  }

  #[test]
  fn invalid_values_are_rejected() {
    assert!(KcpSettings::from_raw_config(r#"{"datashard": 200, "parityshard": 100}"#).is_err());
    assert!(KcpSettings::from_raw_config(r#"{"mtu": 9000}"#).is_err());
    assert!(KcpSettings::from_raw_config(r#"{"rcvwnd": 0}"#).is_err());
    assert!(KcpSettings::from_raw_config(r#"{"mtu": "big"}"#).is_err());
    assert!(KcpSettings::from_raw_config(r#"{"max_streams": 8192}"#).is_err());
  }

  #[test]
  fn huge_shard_counts_are_rejected_without_overflow() {
    let raw = format!(r#"{{"datashard": {}, "parityshard": 2}}"#, usize::MAX);
    assert!(KcpSettings::from_raw_config(&raw).is_err());
  }
}
