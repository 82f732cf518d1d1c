//! Exposes a [`ChainDriver`](crate::driver::ChainDriver) to another process over a websocket.
//!
//! # Methods
//!
//! * `connect` - returns genesis block and current head of the exposed driver
//! * `pollHead`, `getBlock`, `getTransaction`, `getReceipt`, `getAccount`, `getCode`,
//!   `getStorage`, `explain`, `filterEventLogs`, `filterTransferLogs`, `signTx`, `signCert`,
//!   `isAddressOwned` - forwarded to the driver, parameters are positional

use serde::{Deserialize, Serialize};

use crate::types::{Block, Head};

pub mod host;
pub mod remote;
pub mod rpc;

/// Host path the bridge is served on.
pub const PATH: &str = "connex-driver-host";

/// Result of the `connect` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
	pub genesis: Block,
	pub head: Head,
}
