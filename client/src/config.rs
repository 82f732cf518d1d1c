use color_eyre::{
	eyre::{eyre, WrapErr},
	Result,
};
use serde::{Deserialize, Serialize};
use std::fs;
use thor_driver_core::{
	configuration::{DriverConfig, NetConfig},
	types::tracing_level_format,
};
use tracing::Level;

use crate::cli::CliOpts;

/// Representation of a configuration used by this project.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct RuntimeConfig {
	#[serde(flatten)]
	pub net: NetConfig,
	#[serde(flatten)]
	pub driver: DriverConfig,
	/// Log level, default is `INFO`. See `<https://docs.rs/log/0.4.14/log/enum.LevelFilter.html>` for possible log level values. (default: `INFO`).
	#[serde(with = "tracing_level_format")]
	pub log_level: Level,
	/// If set to true, logs are displayed in JSON format, which is used for structured logging. Otherwise, plain text format is used (default: false).
	pub log_format_json: bool,
	/// Host the driver bridge binds to (default: 127.0.0.1).
	pub bridge_host: String,
	/// If set, the driver is exposed to other processes over a websocket on this port (default: None).
	pub bridge_port: Option<u16>,
	/// Addresses reported as owned to bridge clients. No keys are held, signing requests fail.
	pub watch_addresses: Vec<String>,
}

impl Default for RuntimeConfig {
	fn default() -> Self {
		RuntimeConfig {
			net: Default::default(),
			driver: Default::default(),
			log_level: Level::INFO,
			log_format_json: false,
			bridge_host: "127.0.0.1".to_string(),
			bridge_port: None,
			watch_addresses: vec![],
		}
	}
}

pub fn load_runtime_config(opts: &CliOpts) -> Result<RuntimeConfig> {
	let mut cfg = if let Some(config_path) = &opts.config {
		fs::metadata(config_path).map_err(|_| eyre!("Provided config file doesn't exist."))?;
		confy::load_path(config_path)
			.wrap_err(format!("Failed to load configuration from {}", config_path))?
	} else {
		RuntimeConfig::default()
	};

	cfg.log_format_json = opts.logs_json || cfg.log_format_json;
	cfg.log_level = opts.verbosity.unwrap_or(cfg.log_level);

	// Flags override the config parameters
	if let Some(url) = &opts.url {
		cfg.net.base_url = url.to_string();
	}
	if let Some(port) = opts.bridge_port {
		cfg.bridge_port = Some(port);
	}

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::{load_runtime_config, RuntimeConfig};
	use crate::cli::CliOpts;
	use clap::Parser;
	use serde_json::json;
	use std::time::Duration;
	use test_case::test_case;
	use tracing::Level;

	fn load(args: &[&str]) -> RuntimeConfig {
		let opts = CliOpts::parse_from(["thor-driver-client"].iter().chain(args));
		load_runtime_config(&opts).unwrap()
	}

	#[test]
	fn defaults_without_flags() {
		let cfg = load(&[]);
		assert_eq!(cfg.net.base_url, "http://127.0.0.1:8669/");
		assert_eq!(cfg.driver.poll_interval, Duration::from_secs(10));
		assert_eq!(cfg.log_level, Level::INFO);
		assert!(!cfg.log_format_json);
		assert_eq!(cfg.bridge_port, None);
	}

	#[test_case(&["--url", "https://node.example/"] => "https://node.example/" ; "long")]
	#[test_case(&["-u", "http://10.0.0.1:8669/"] => "http://10.0.0.1:8669/" ; "short")]
	fn url_flag_overrides_base_url(args: &[&str]) -> String {
		load(args).net.base_url
	}

	#[test]
	fn flags_override_logging_and_bridge() {
		let cfg = load(&["--verbosity", "debug", "--logs-json", "--bridge-port", "8670"]);
		assert_eq!(cfg.log_level, Level::DEBUG);
		assert!(cfg.log_format_json);
		assert_eq!(cfg.bridge_port, Some(8670));
	}

	#[test]
	fn missing_config_file_is_an_error() {
		let opts = CliOpts::parse_from(["thor-driver-client", "--config", "/nonexistent/thor.toml"]);
		assert!(load_runtime_config(&opts).is_err());
	}

	#[test]
	fn flattened_sections_read_from_one_table() {
		let cfg: RuntimeConfig = serde_json::from_value(json!({
			"base_url": "http://node:8669/",
			"poll_interval": 2000,
			"stream_debounce": 5,
			"log_level": "WARN",
			"bridge_port": 9000,
		}))
		.unwrap();
		assert_eq!(cfg.net.base_url, "http://node:8669/");
		assert_eq!(cfg.driver.poll_interval, Duration::from_secs(2));
		assert_eq!(cfg.driver.stream_debounce, 5);
		assert_eq!(cfg.log_level, Level::WARN);
		assert_eq!(cfg.bridge_port, Some(9000));
		assert_eq!(cfg.bridge_host, "127.0.0.1");
	}
}
