// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;

use relaymesh::{
  config::{AccessConfig, HopConfig, TargetConfig},
  node::{start_access, start_hop, start_target, RunningNode},
};
use tokio::{io::AsyncReadExt, net::TcpStream};
use tokio_util::sync::CancellationToken;

mod common;
use common::{assert_echo, init_logging, spawn_tcp_echo, TEST_TIMEOUT};

async fn target_node(
  scheme: &str,
  token: &str,
  destination: SocketAddr,
  shutdown: &CancellationToken,
) -> RunningNode {
  let config = TargetConfig::from_yaml(&format!(
    r#"
listener: {{ scheme: {scheme}, listen_addr: "127.0.0.1:0", auth_tokens: ["{token}"] }}
target: {{ address: "{destination}" }}
"#,
    scheme = scheme,
    token = token,
    destination = destination,
  ))
  .unwrap();
  start_target(config, shutdown.child_token()).await.unwrap()
}

async fn stop(nodes: Vec<RunningNode>, shutdown: CancellationToken) {
  shutdown.cancel();
  for node in nodes {
    tokio::time::timeout(TEST_TIMEOUT, node.wait())
      .await
      .expect("Nodes must stop on shutdown")
      .unwrap();
  }
}

#[tokio::test]
async fn access_to_target_over_mux() {
  init_logging();
  let shutdown = CancellationToken::new();
  let destination = spawn_tcp_echo().await;
  let target = target_node("mux", "exit-token", destination, &shutdown).await;

  let access = start_access(
    AccessConfig::from_yaml(&format!(
      r#"
route_config:
  listener: {{ scheme: tcp, listen_addr: "127.0.0.1:0" }}
  dialer:
    - {{ nexthop_addr: "{}", scheme: mux, access_token: "exit-token" }}
"#,
      target.local_addr()
    ))
    .unwrap(),
    shutdown.child_token(),
  )
  .await
  .unwrap();

  let mut client = TcpStream::connect(access.local_addr()).await.unwrap();
  assert_echo(&mut client, b"test buffer").await;
  drop(client);
  stop(vec![access, target], shutdown).await;
}

#[tokio::test]
async fn access_through_hop_to_target_across_backends() {
  init_logging();
  let shutdown = CancellationToken::new();
  let destination = spawn_tcp_echo().await;
  let target = target_node("quic", "exit-token", destination, &shutdown).await;

  let hop = start_hop(
    HopConfig::from_yaml(&format!(
      r#"
route_config:
  listener: {{ scheme: kcp, listen_addr: "127.0.0.1:0", key: "hop-key", auth_tokens: ["hop-token"] }}
  hops:
    - {{ hop_addr: "{}", scheme: quic, access_token: "exit-token" }}
"#,
      target.local_addr()
    ))
    .unwrap(),
    shutdown.child_token(),
  )
  .await
  .unwrap();

  let access = start_access(
    AccessConfig::from_yaml(&format!(
      r#"
route_config:
  listener: {{ scheme: tcp, listen_addr: "127.0.0.1:0" }}
  dialer:
    - {{ nexthop_addr: "{}", scheme: kcp, key: "hop-key", access_token: "hop-token" }}
"#,
      hop.local_addr()
    ))
    .unwrap(),
    shutdown.child_token(),
  )
  .await
  .unwrap();

  // Concurrent sessions share the overlay connections but never each other's bytes
  let sessions: Vec<_> = (0..4)
    .map(|index| {
      let access_addr = access.local_addr();
      tokio::task::spawn(async move {
        let mut client = TcpStream::connect(access_addr).await.unwrap();
        let payload = format!("session {} payload", index).repeat(64);
        assert_echo(&mut client, payload.as_bytes()).await;
      })
    })
    .collect();
  for session in sessions {
    tokio::time::timeout(TEST_TIMEOUT, session)
      .await
      .expect("Every session must complete")
      .unwrap();
  }
  stop(vec![access, hop, target], shutdown).await;
}

#[tokio::test]
async fn wrong_access_token_never_reaches_the_target() {
  init_logging();
  let shutdown = CancellationToken::new();
  let destination = spawn_tcp_echo().await;
  let target = target_node("mux", "exit-token", destination, &shutdown).await;

  let started = start_access(
    AccessConfig::from_yaml(&format!(
      r#"
route_config:
  listener: {{ scheme: tcp, listen_addr: "127.0.0.1:0" }}
  dialer:
    - {{ nexthop_addr: "{}", scheme: mux, access_token: "stolen-token" }}
  route_table: {{ redial_delay_secs: 0, max_add_attempts: 2 }}
"#,
      target.local_addr()
    ))
    .unwrap(),
    shutdown.child_token(),
  )
  .await
  .unwrap();

  // The rejected hop is skipped, so sessions find no route and are closed
  let mut client = TcpStream::connect(started.local_addr()).await.unwrap();
  let mut rest = Vec::new();
  let read = tokio::time::timeout(TEST_TIMEOUT, client.read_to_end(&mut rest))
    .await
    .expect("Unroutable session must be closed")
    .unwrap_or(0);
  assert_eq!(read, 0);
  stop(vec![started, target], shutdown).await;
}
