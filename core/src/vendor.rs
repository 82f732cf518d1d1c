//! Transaction building and certificate signing.
//!
//! Key custody and transaction encoding are left to [`Wallet`] and [`TxEncoder`]
//! implementations; this module only assembles what they sign.

use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::{
	error::{Error, Result},
	net::{Method, Net, Params},
	types::{Clause, GENESIS_HEADER},
	utils::blake2b_256,
};

const TX_GAS: u64 = 5_000;
const CLAUSE_GAS: u64 = 16_000;
const CONTRACT_CREATION_GAS: u64 = 48_000;
const ZERO_BYTE_GAS: u64 = 4;
const NON_ZERO_BYTE_GAS: u64 = 68;
/// Added on top of the execution gas of an estimate.
pub const EXECUTION_GAS_MARGIN: u64 = 15_000;

pub const CERT_DOMAIN: &str = "localhost";

/// Holder of signing keys.
#[automock]
pub trait Wallet: Send + Sync {
	/// Addresses of the held keys, first one is the default signer.
	fn addresses(&self) -> Vec<String>;

	/// Signs a 32 byte message hash with the key of `address`.
	fn sign(&self, address: &str, hash: &[u8; 32]) -> Result<Vec<u8>>;
}

/// Wallet that knows addresses but holds no keys.
///
/// Ownership checks work, every signing attempt fails.
#[derive(Debug, Clone, Default)]
pub struct WatchOnly {
	addresses: Vec<String>,
}

impl WatchOnly {
	pub fn new(addresses: Vec<String>) -> Self {
		Self { addresses }
	}
}

impl Wallet for WatchOnly {
	fn addresses(&self) -> Vec<String> {
		self.addresses.clone()
	}

	fn sign(&self, address: &str, _: &[u8; 32]) -> Result<Vec<u8>> {
		Err(Error::InvalidInput(format!("{address}: no key to sign with")))
	}
}

/// Picks the requested signer, or the first key when none is requested.
pub fn find_signer(wallet: &dyn Wallet, signer: Option<&str>) -> Result<String> {
	let addresses = wallet.addresses();
	match signer {
		None => addresses
			.into_iter()
			.next()
			.ok_or_else(|| Error::InvalidInput("empty wallet".to_string())),
		Some(signer) => addresses
			.into_iter()
			.find(|address| address.eq_ignore_ascii_case(signer))
			.ok_or_else(|| Error::InvalidInput(format!("{signer}: not in wallet"))),
	}
}

/// Validates a hex encoded private key, with optional `0x` prefix.
pub fn parse_private_key(key: &str) -> Result<[u8; 32]> {
	let digits = key.strip_prefix("0x").unwrap_or(key);
	let mut bytes = [0u8; 32];
	if digits.len() != 64 {
		return Err(Error::InvalidInput("invalid private key".to_string()));
	}
	hex::decode_to_slice(digits, &mut bytes)
		.map_err(|_| Error::InvalidInput("invalid private key".to_string()))?;
	Ok(bytes)
}

/// Fields of a transaction before signing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxBody {
	pub chain_tag: u8,
	pub block_ref: String,
	pub expiration: u32,
	pub clauses: Vec<Clause>,
	pub gas_price_coef: u8,
	pub gas: u64,
	pub depends_on: Option<String>,
	pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTx {
	pub id: String,
	/// `0x` prefixed encoded transaction.
	pub raw: String,
}

/// Transaction codec.
#[automock]
pub trait TxEncoder: Send + Sync {
	fn signing_hash(&self, body: &TxBody) -> [u8; 32];

	fn encode(&self, body: &TxBody, signature: &[u8]) -> Result<SignedTx>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignTxOptions {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub signer: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub gas: Option<u64>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub depends_on: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub link: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
	pub txid: String,
	pub signer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPayload {
	#[serde(rename = "type")]
	pub kind: String,
	pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertMessage {
	pub purpose: String,
	pub payload: CertPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignCertOptions {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub signer: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertAnnex {
	pub domain: String,
	pub timestamp: u64,
	pub signer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertResponse {
	pub annex: CertAnnex,
	pub signature: String,
}

/// Gas charged before any clause executes.
///
/// A transaction without clauses is charged as one with a single clause.
/// Fails when clause data is not hex.
pub fn intrinsic_gas(clauses: &[Clause]) -> Result<u64> {
	if clauses.is_empty() {
		return Ok(TX_GAS + CLAUSE_GAS);
	}
	clauses.iter().try_fold(TX_GAS, |gas, clause| {
		let clause_gas = match clause.to {
			Some(_) => CLAUSE_GAS,
			None => CONTRACT_CREATION_GAS,
		};
		Ok(gas + clause_gas + data_gas(&clause.data)?)
	})
}

fn data_gas(data: &str) -> Result<u64> {
	let bytes = hex::decode(data.strip_prefix("0x").unwrap_or(data))
		.map_err(|error| Error::InvalidInput(format!("{data}: invalid clause data: {error}")))?;
	Ok(bytes
		.iter()
		.map(|byte| match byte {
			0 => ZERO_BYTE_GAS,
			_ => NON_ZERO_BYTE_GAS,
		})
		.sum())
}

/// Gas limit for `clauses` given the gas their execution used.
pub fn estimate_gas(clauses: &[Clause], execution_gas: u64) -> Result<u64> {
	let margin = match execution_gas {
		0 => 0,
		gas => gas + EXECUTION_GAS_MARGIN,
	};
	Ok(intrinsic_gas(clauses)? + margin)
}

/// Chain tag is the last byte of the genesis block id.
pub fn chain_tag(genesis_id: &str) -> Result<u8> {
	genesis_id
		.len()
		.checked_sub(2)
		.and_then(|start| genesis_id.get(start..))
		.and_then(|byte| u8::from_str_radix(byte, 16).ok())
		.ok_or_else(|| Error::InvalidInput(format!("{genesis_id}: invalid genesis id")))
}

/// Block reference is the first 8 bytes of the head id.
pub fn block_ref(head_id: &str) -> Result<String> {
	head_id
		.get(..18)
		.map(str::to_string)
		.ok_or_else(|| Error::InvalidInput(format!("{head_id}: invalid block id")))
}

/// Bytes a certificate signer signs: sorted-key JSON with the signer lower-cased.
pub fn encode_certificate(message: &CertMessage, annex: &CertAnnex) -> Vec<u8> {
	// serde_json maps keep keys sorted
	let certificate = json!({
		"purpose": message.purpose,
		"payload": {
			"type": message.payload.kind,
			"content": message.payload.content,
		},
		"domain": annex.domain,
		"timestamp": annex.timestamp,
		"signer": annex.signer.to_lowercase(),
	});
	certificate.to_string().into_bytes()
}

/// Signs a certificate at `timestamp`.
pub fn sign_certificate(
	wallet: &dyn Wallet,
	message: &CertMessage,
	options: &SignCertOptions,
	timestamp: u64,
) -> Result<CertResponse> {
	let signer = find_signer(wallet, options.signer.as_deref())?;
	let annex = CertAnnex {
		domain: CERT_DOMAIN.to_string(),
		timestamp,
		signer,
	};
	let hash = blake2b_256(&encode_certificate(message, &annex));
	let signature = wallet.sign(&annex.signer, &hash)?;
	Ok(CertResponse {
		annex,
		signature: format!("0x{}", hex::encode(signature)),
	})
}

/// Signed transaction handed to the commit watcher.
#[derive(Clone)]
pub struct TxObject {
	pub id: String,
	pub raw: String,
	net: Arc<dyn Net>,
	genesis_id: String,
}

impl TxObject {
	pub(crate) fn new(signed: SignedTx, net: Arc<dyn Net>, genesis_id: String) -> Self {
		Self {
			id: signed.id,
			raw: signed.raw,
			net,
			genesis_id,
		}
	}

	/// Posts the transaction to the node.
	pub async fn resend(&self) -> Result<()> {
		debug!(id = %self.id, "Sending transaction");
		let params = Params::default()
			.header(GENESIS_HEADER, &self.genesis_id)
			.body(json!({ "raw": self.raw }));
		let _: Value = self.net.http(Method::Post, "transactions", params).await?;
		Ok(())
	}
}

impl std::fmt::Debug for TxObject {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TxObject")
			.field("id", &self.id)
			.field("raw", &self.raw)
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	const ALICE: &str = "0x7567d83b7b8d80addcb281a71d54fc7b3364ffed";
	const BOB: &str = "0xd3ae78222beadb038203be21ed5ce7c9b1bff602";

	fn clause(to: Option<&str>, data: &str) -> Clause {
		Clause {
			to: to.map(str::to_string),
			value: Value::from(0),
			data: data.to_string(),
		}
	}

	fn wallet(addresses: &[&str]) -> MockWallet {
		let addresses = addresses.iter().map(|a| a.to_string()).collect::<Vec<_>>();
		let mut wallet = MockWallet::new();
		wallet.expect_addresses().return_const(addresses);
		wallet
	}

	#[test]
	fn watch_only_wallet_cannot_sign() {
		let wallet = WatchOnly::new(vec![ALICE.to_string()]);
		assert_eq!(find_signer(&wallet, None).unwrap(), ALICE);
		assert!(matches!(
			wallet.sign(ALICE, &[0u8; 32]),
			Err(Error::InvalidInput(_))
		));
	}

	#[test_case(vec![] => 21_000 ; "no clauses")]
	#[test_case(vec![clause(Some(ALICE), "0x")] => 21_000 ; "transfer")]
	#[test_case(vec![clause(None, "0x")] => 53_000 ; "contract creation")]
	#[test_case(vec![clause(Some(ALICE), "0x0001ff")] => 21_000 + 4 + 68 * 2 ; "data bytes")]
	#[test_case(vec![clause(Some(ALICE), "0x"), clause(Some(BOB), "0x00")] => 5_000 + 16_000 * 2 + 4 ; "two clauses")]
	fn intrinsic(clauses: Vec<Clause>) -> u64 {
		intrinsic_gas(&clauses).unwrap()
	}

	#[test_case("0xzz" ; "not hex")]
	#[test_case("0x123" ; "odd length")]
	fn malformed_clause_data_is_rejected(data: &str) {
		let clauses = [clause(Some(ALICE), "0x"), clause(Some(BOB), data)];
		assert!(matches!(
			intrinsic_gas(&clauses),
			Err(Error::InvalidInput(_))
		));
		assert!(matches!(
			estimate_gas(&clauses, 100),
			Err(Error::InvalidInput(_))
		));
	}

	#[test_case(0 => 21_000 ; "nothing executed")]
	#[test_case(100 => 21_000 + 100 + 15_000 ; "execution margin")]
	fn estimates(execution_gas: u64) -> u64 {
		estimate_gas(&[clause(Some(ALICE), "0x")], execution_gas).unwrap()
	}

	#[test_case(&format!("0x{}", "11".repeat(32)) => true ; "prefixed")]
	#[test_case(&"AB".repeat(32) => true ; "bare upper case")]
	#[test_case(&"11".repeat(31) => false ; "short")]
	#[test_case(&format!("0x{}", "zz".repeat(32)) => false ; "not hex")]
	fn private_keys(key: &str) -> bool {
		parse_private_key(key).is_ok()
	}

	#[test]
	fn chain_tag_and_block_ref() {
		let genesis = "0x00000000851caf3cfdb6e899cf5958bfb1ac3413d346d43539627e6be7ec1b4a";
		assert_eq!(chain_tag(genesis).unwrap(), 0x4a);
		assert_eq!(block_ref(genesis).unwrap(), "0x00000000851caf3c");
		assert!(chain_tag("").is_err());
		assert!(block_ref("0x01").is_err());
	}

	#[test]
	fn signer_selection() {
		let keys = wallet(&[ALICE, BOB]);
		assert_eq!(find_signer(&keys, None).unwrap(), ALICE);
		assert_eq!(find_signer(&keys, Some(BOB.to_uppercase().replace("0X", "0x").as_str())).unwrap(), BOB);
		assert!(matches!(
			find_signer(&keys, Some("0x01")),
			Err(Error::InvalidInput(_))
		));
		assert_eq!(
			find_signer(&wallet(&[]), None),
			Err(Error::InvalidInput("empty wallet".to_string()))
		);
	}

	#[test]
	fn certificate_is_sorted_json() {
		let message = CertMessage {
			purpose: "identification".to_string(),
			payload: CertPayload {
				kind: "text".to_string(),
				content: "fyi".to_string(),
			},
		};
		let annex = CertAnnex {
			domain: CERT_DOMAIN.to_string(),
			timestamp: 1545035330,
			signer: "0x7567D83B7B8D80ADDCB281A71D54FC7B3364FFED".to_string(),
		};
		assert_eq!(
			String::from_utf8(encode_certificate(&message, &annex)).unwrap(),
			r#"{"domain":"localhost","payload":{"content":"fyi","type":"text"},"purpose":"identification","signer":"0x7567d83b7b8d80addcb281a71d54fc7b3364ffed","timestamp":1545035330}"#
		);
	}

	#[test]
	fn certificate_signature() {
		let message = CertMessage {
			purpose: "agreement".to_string(),
			payload: CertPayload {
				kind: "text".to_string(),
				content: "terms".to_string(),
			},
		};
		let mut keys = wallet(&[ALICE]);
		keys.expect_sign()
			.withf(|address, _| address.eq_ignore_ascii_case(ALICE))
			.returning(|_, hash| Ok(hash[..4].to_vec()));

		let response = sign_certificate(&keys, &message, &SignCertOptions::default(), 42).unwrap();
		assert_eq!(response.annex.signer, ALICE);
		assert_eq!(response.annex.timestamp, 42);
		let hash = blake2b_256(&encode_certificate(&message, &response.annex));
		assert_eq!(response.signature, format!("0x{}", hex::encode(&hash[..4])));
	}
}
