// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use relaymesh::{
  config::{AccessConfig, HopConfig, TargetConfig},
  node,
  util::validators::{
    parse_overlay_scheme, parse_socketaddr, validate_existing_file, validate_overlay_scheme,
    validate_socketaddr,
  },
};
use tokio_util::sync::CancellationToken;

mod certgen;
mod demo;

fn config_arg() -> Arg<'static> {
  Arg::new("config")
    .long("config")
    .short('c')
    .help("Path to the node's YAML configuration")
    .validator(validate_existing_file)
    .takes_value(true)
    .required(true)
}

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,yamux=warn,info")
  });
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("access")
        .about("Run an edge node, carrying local client traffic into the overlay")
        .arg(config_arg()),
    )
    .subcommand(
      Command::new("hop")
        .about("Run a relay node, forwarding overlay streams to the next hop")
        .arg(config_arg()),
    )
    .subcommand(
      Command::new("target")
        .about("Run an exit node, forwarding overlay streams to the destination service")
        .arg(config_arg()),
    )
    .subcommand(
      Command::new("demo")
        .about("Run a listener and a dialer in-process, sending a ping every second")
        .arg(
          Arg::new("protocol")
            .long("protocol")
            .short('p')
            .validator(validate_overlay_scheme)
            .default_value("mux")
            .takes_value(true),
        )
        .arg(
          Arg::new("addr")
            .long("addr")
            .short('a')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:3445")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

/// Cancelled on the first SIGINT
fn shutdown_on_ctrl_c() -> CancellationToken {
  let shutdown = CancellationToken::new();
  let shutdown_trigger = shutdown.clone();
  tokio::task::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("SIGINT detected, initiating graceful shutdown");
    shutdown_trigger.cancel();
  });
  shutdown
}

fn config_path(opts: &ArgMatches) -> &str {
  opts
    .value_of("config")
    .expect("Config argument is required")
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("access", opts) => {
      let path = config_path(opts);
      let config = AccessConfig::from_path(path)
        .with_context(|| format!("Loading access configuration from {}", path))?;
      tracing::info!("Running as access node with config {:#?}", config);
      node::run_access(config, shutdown_on_ctrl_c()).await
    }
    ("hop", opts) => {
      let path = config_path(opts);
      let config = HopConfig::from_path(path)
        .with_context(|| format!("Loading hop configuration from {}", path))?;
      tracing::info!("Running as hop node with config {:#?}", config);
      node::run_hop(config, shutdown_on_ctrl_c()).await
    }
    ("target", opts) => {
      let path = config_path(opts);
      let config = TargetConfig::from_path(path)
        .with_context(|| format!("Loading target configuration from {}", path))?;
      tracing::info!("Running as target node with config {:#?}", config);
      node::run_target(config, shutdown_on_ctrl_c()).await
    }
    ("demo", opts) => {
      let scheme = parse_overlay_scheme(opts.value_of("protocol").expect("Protocol has a default"))?;
      let addr = parse_socketaddr(opts.value_of("addr").expect("Address has a default"))?;
      demo::demo_main(scheme, addr, shutdown_on_ctrl_c()).await
    }
    ("cert", opts) => {
      tracing::info!("Generating certs...");
      let path_raw = opts.value_of("path").expect("Path argument is required");
      let san = opts.value_of("san").expect("SAN argument must exist");
      certgen::certgen_main(path_raw.into(), san.into()).await
    }
    (_, _) => unreachable!(),
  }
}
