//! Shared data structures and serde helpers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, time::Duration};

use crate::bloom::Bloom;

pub const GENESIS_HEADER: &str = "x-genesis-id";

/// Locally known chain tip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
	pub id: String,
	pub number: u32,
	pub timestamp: u64,
	#[serde(rename = "parentID")]
	pub parent_id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub txs_features: Option<u32>,
}

impl Head {
	/// An advance is accepted only if it names another block that is not behind this one.
	pub fn accepts(&self, next: &Head) -> bool {
		next.id != self.id && next.number >= self.number
	}
}

impl fmt::Display for Head {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "#{} {}", self.number, self.id)
	}
}

/// Block announcement received over the beat subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beat {
	pub number: u32,
	pub id: String,
	#[serde(rename = "parentID")]
	pub parent_id: String,
	pub timestamp: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub txs_features: Option<u32>,
	#[serde(with = "hex_bytes_format")]
	pub bloom: Vec<u8>,
	pub k: u32,
	#[serde(default)]
	pub obsolete: bool,
}

impl Beat {
	pub fn head(&self) -> Head {
		Head {
			id: self.id.clone(),
			number: self.number,
			timestamp: self.timestamp,
			parent_id: self.parent_id.clone(),
			txs_features: self.txs_features,
		}
	}

	pub fn bloom(&self) -> Bloom {
		Bloom::new(self.k, self.bloom.clone())
	}
}

/// Selects the chain state a query is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Revision {
	Number(u32),
	Id(String),
}

impl Revision {
	pub fn best() -> Self {
		Revision::Id("best".to_string())
	}

	/// Numbers and 32 byte block ids name one immutable block.
	pub fn is_exact(&self) -> bool {
		match self {
			Revision::Number(_) => true,
			Revision::Id(id) => {
				id.len() == 66
					&& id.starts_with("0x")
					&& id[2..].chars().all(|c| c.is_ascii_hexdigit())
			},
		}
	}
}

impl fmt::Display for Revision {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Revision::Number(number) => write!(f, "{number}"),
			Revision::Id(id) => write!(f, "{id}"),
		}
	}
}

impl From<u32> for Revision {
	fn from(number: u32) -> Self {
		Revision::Number(number)
	}
}

impl From<&str> for Revision {
	fn from(id: &str) -> Self {
		Revision::Id(id.to_string())
	}
}

impl From<String> for Revision {
	fn from(id: String) -> Self {
		Revision::Id(id)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
	pub id: String,
	pub number: u32,
	#[serde(default)]
	pub size: u32,
	#[serde(rename = "parentID")]
	pub parent_id: String,
	pub timestamp: u64,
	#[serde(default)]
	pub gas_limit: u64,
	#[serde(default)]
	pub beneficiary: String,
	#[serde(default)]
	pub gas_used: u64,
	#[serde(default)]
	pub total_score: u64,
	#[serde(default)]
	pub txs_root: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub txs_features: Option<u32>,
	#[serde(default)]
	pub state_root: String,
	#[serde(default)]
	pub receipts_root: String,
	#[serde(default)]
	pub signer: String,
	#[serde(default)]
	pub is_trunk: bool,
	#[serde(default)]
	pub transactions: Vec<String>,
}

impl Block {
	pub fn head(&self) -> Head {
		Head {
			id: self.id.clone(),
			number: self.number,
			timestamp: self.timestamp,
			parent_id: self.parent_id.clone(),
			txs_features: self.txs_features,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
	pub balance: String,
	pub energy: String,
	pub has_code: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Code {
	pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storage {
	pub value: String,
}

/// One action of a transaction; `to` is absent for contract creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clause {
	pub to: Option<String>,
	#[serde(default = "zero")]
	pub value: Value,
	#[serde(default = "empty_data")]
	pub data: String,
}

fn zero() -> Value {
	Value::from(0)
}

fn empty_data() -> String {
	"0x".to_string()
}

/// Arguments of a speculative multi-clause execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainArg {
	pub clauses: Vec<Clause>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub caller: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gas: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gas_price: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gas_payer: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmOutput {
	#[serde(default)]
	pub contract_address: Option<String>,
	#[serde(default)]
	pub data: String,
	#[serde(default)]
	pub events: Vec<Value>,
	#[serde(default)]
	pub transfers: Vec<Value>,
	#[serde(default)]
	pub gas_used: u64,
	#[serde(default)]
	pub reverted: bool,
	#[serde(default)]
	pub vm_error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxMeta {
	#[serde(rename = "blockID")]
	pub block_id: String,
	pub block_number: u32,
	pub block_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
	pub id: String,
	#[serde(default)]
	pub chain_tag: u8,
	#[serde(default)]
	pub block_ref: String,
	#[serde(default)]
	pub expiration: u32,
	#[serde(default)]
	pub clauses: Vec<Clause>,
	#[serde(default)]
	pub gas_price_coef: u8,
	#[serde(default)]
	pub gas: u64,
	#[serde(default)]
	pub origin: String,
	#[serde(default)]
	pub delegator: Option<String>,
	#[serde(default)]
	pub nonce: String,
	#[serde(default)]
	pub depends_on: Option<String>,
	#[serde(default)]
	pub size: u32,
	#[serde(default)]
	pub meta: Option<TxMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
	#[serde(default)]
	pub gas_used: u64,
	#[serde(default)]
	pub gas_payer: String,
	#[serde(default)]
	pub paid: String,
	#[serde(default)]
	pub reward: String,
	pub reverted: bool,
	#[serde(default)]
	pub outputs: Vec<Value>,
	#[serde(default)]
	pub meta: Option<Value>,
}

/// Arguments of an event or transfer log filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterArg {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub range: Option<FilterRange>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub options: Option<FilterOptions>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub criteria_set: Vec<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub order: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRange {
	pub unit: String,
	pub from: u64,
	pub to: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
	pub offset: u64,
	pub limit: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
	pub address: String,
	#[serde(default)]
	pub topics: Vec<String>,
	#[serde(default)]
	pub data: String,
	#[serde(default)]
	pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
	pub sender: String,
	pub recipient: String,
	pub amount: String,
	#[serde(default)]
	pub meta: Option<Value>,
}

pub mod hex_bytes_format {
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		let value = value.strip_prefix("0x").unwrap_or(&value);
		hex::decode(value).map_err(serde::de::Error::custom)
	}
}

pub mod tracing_level_format {
	use serde::{self, Deserialize, Deserializer, Serializer};
	use std::str::FromStr;
	use tracing::Level;

	pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&level.to_string())
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		Level::from_str(&value).map_err(serde::de::Error::custom)
	}
}

pub mod duration_millis_format {
	use super::Duration;
	use serde::{self, Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_u64(duration.as_millis() as u64)
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = u64::deserialize(deserializer)?;
		Ok(Duration::from_millis(value))
	}
}
