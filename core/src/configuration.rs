use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::duration_millis_format;

/// Head tracking and caching parameters of one driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
	/// Pause between best block lookups while polling (default: 10s).
	#[serde(with = "duration_millis_format")]
	pub poll_interval: Duration,
	/// A head younger than this counts as nearly synced (default: 60s).
	#[serde(with = "duration_millis_format")]
	pub freshness_window: Duration,
	/// Nearly synced polls needed before subscribing to beats (default: 3).
	pub stream_debounce: u32,
	/// Bound on content-addressed cache entries (default: 1024).
	pub content_capacity: usize,
	/// Bound on revision-tied cache entries (default: 2048).
	pub revision_capacity: usize,
	pub tx: TxConfig,
}

impl Default for DriverConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(10),
			freshness_window: Duration::from_secs(60),
			stream_debounce: 3,
			content_capacity: 1024,
			revision_capacity: 2048,
			tx: TxConfig::default(),
		}
	}
}

/// Defaults applied to transactions built by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxConfig {
	/// Blocks after the reference block the transaction stays valid (default: 18).
	pub expiration: u32,
	pub gas_price_coef: u8,
}

impl Default for TxConfig {
	fn default() -> Self {
		Self {
			expiration: 18,
			gas_price_coef: 0,
		}
	}
}

/// Connection to the node's HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
	/// Node API root, e.g. `http://127.0.0.1:8669/`.
	pub base_url: String,
	#[serde(with = "duration_millis_format")]
	pub request_timeout: Duration,
	/// Lowest accepted `x-thorest-ver` of the node (default: none).
	pub min_node_version: Option<String>,
}

impl Default for NetConfig {
	fn default() -> Self {
		Self {
			base_url: "http://127.0.0.1:8669/".to_string(),
			request_timeout: Duration::from_secs(15),
			min_node_version: None,
		}
	}
}
