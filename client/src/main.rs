use crate::{
	cli::CliOpts,
	config::{load_runtime_config, RuntimeConfig},
};
use clap::Parser;
use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use std::{net::SocketAddr, str::FromStr, sync::Arc};
use thor_driver_core::{
	bridge::host::{self, SharedDriver},
	driver::{ChainDriver, Driver},
	net::HttpNet,
	shutdown::Controller,
	utils::{default_subscriber, install_panic_hooks, json_subscriber, spawn_in_span},
	vendor::WatchOnly,
};
use tracing::{error, info, warn};

mod cli;
mod config;

const USER_SIGNAL: &str = "User signaled shutdown";

/// Thor driver client: follows the chain head and optionally hosts the driver bridge.
async fn run(cfg: RuntimeConfig, shutdown: Controller) -> Result<Arc<Driver>> {
	let version = clap::crate_version!();
	info!("Running Thor driver client version: {version}.");
	info!("Using config: {cfg:?}");

	let net = HttpNet::new(&cfg.net).wrap_err("Unable to initialize node client")?;
	let wallet = WatchOnly::new(cfg.watch_addresses.clone());

	info!("Connecting to {}...", cfg.net.base_url);
	let driver = shutdown
		.with_cancel(Driver::connect(
			Arc::new(net),
			Arc::new(wallet),
			cfg.driver.clone(),
		))
		.await?
		.wrap_err("Unable to connect to node")?;
	let driver = Arc::new(driver);

	if let Some(port) = cfg.bridge_port {
		let addr = SocketAddr::from_str(&format!("{}:{port}", cfg.bridge_host))
			.wrap_err("Unable to parse bridge address from config")?;
		let acceptor = Arc::new(SharedDriver(driver.clone()));
		let (_, server) = host::bind(addr, acceptor, shutdown.clone())?;
		spawn_in_span(server);
	}

	spawn_in_span(shutdown.with_cancel(follow_heads(driver.clone())));

	Ok(driver)
}

async fn follow_heads(driver: Arc<Driver>) {
	let head = driver.head();
	info!(number = head.number, id = %head.id, timestamp = head.timestamp, "Starting head");

	loop {
		match driver.poll_head().await {
			Ok(head) => {
				info!(number = head.number, id = %head.id, timestamp = head.timestamp, "New head")
			},
			Err(error) => {
				warn!(%error, "Head tracking stopped");
				return;
			},
		}
	}
}

#[tokio::main]
pub async fn main() -> Result<()> {
	let shutdown = Controller::new();
	let opts = CliOpts::parse();
	let cfg = load_runtime_config(&opts)?;

	if cfg.log_format_json {
		tracing::subscriber::set_global_default(json_subscriber(cfg.log_level))?;
	} else {
		tracing::subscriber::set_global_default(default_subscriber(cfg.log_level))?;
	};

	// install custom panic hooks
	install_panic_hooks(shutdown.clone())?;

	// spawn a task to watch for ctrl-c signals from user to trigger the shutdown
	spawn_in_span(shutdown.clone().on_user_signal(USER_SIGNAL.to_string()));

	let driver = match run(cfg, shutdown.clone()).await {
		Ok(driver) => driver,
		Err(error) => {
			error!("{error:#}");
			return Err(error.wrap_err("Starting Thor driver client failed"));
		},
	};

	let reason = shutdown.interrupted().await;
	driver.close();
	info!("Shutting down: {reason}");

	if reason != USER_SIGNAL {
		return Err(eyre!(reason).wrap_err("Running Thor driver client encountered an error"));
	}
	Ok(())
}
