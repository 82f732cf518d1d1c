//! Chain driver: the query surface over the node, backed by the head tracker and the response cache.

use async_trait::async_trait;
use mockall::automock;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{future::Future, sync::Arc};
use tracing::{info, warn};

use crate::{
	cache::{CacheClass, ResponseCache},
	configuration::DriverConfig,
	error::{Error, Result},
	net::{Method, Net, Params},
	shutdown::Controller,
	state,
	tracker::HeadTracker,
	types::{
		Account, Block, Clause, Code, Event, ExplainArg, FilterArg, Head, Receipt, Revision,
		Storage, Transaction, Transfer, VmOutput, GENESIS_HEADER,
	},
	utils::{content_key, random_bytes, spawn_in_span},
	vendor::{
		block_ref, chain_tag, estimate_gas, find_signer, intrinsic_gas, sign_certificate,
		CertMessage, CertResponse, SignCertOptions, SignTxOptions, TxBody, TxEncoder, TxObject,
		TxResponse, Wallet,
	},
};

/// Operations a chain driver offers, locally or across the bridge.
#[async_trait]
#[automock]
pub trait ChainDriver: Send + Sync {
	fn genesis(&self) -> Block;

	fn head(&self) -> Head;

	/// Resolves with the next accepted head.
	async fn poll_head(&self) -> Result<Head>;

	async fn get_block(&self, revision: Revision) -> Result<Option<Block>>;

	async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>>;

	async fn get_receipt(&self, id: &str) -> Result<Option<Receipt>>;

	async fn get_account(&self, address: &str, revision: &str) -> Result<Account>;

	async fn get_code(&self, address: &str, revision: &str) -> Result<Code>;

	async fn get_storage(&self, address: &str, key: &str, revision: &str) -> Result<Storage>;

	/// Executes clauses without committing them.
	///
	/// The result stays cached until a block touches one of `ties`. Dependencies missing
	/// from `ties` are not tracked, so results may go stale.
	async fn explain(
		&self,
		arg: ExplainArg,
		revision: &str,
		ties: Vec<String>,
	) -> Result<Vec<VmOutput>>;

	async fn filter_event_logs(&self, arg: FilterArg) -> Result<Vec<Event>>;

	async fn filter_transfer_logs(&self, arg: FilterArg) -> Result<Vec<Transfer>>;

	async fn sign_tx(&self, clauses: Vec<Clause>, options: SignTxOptions) -> Result<TxResponse>;

	async fn sign_cert(&self, message: CertMessage, options: SignCertOptions)
		-> Result<CertResponse>;

	async fn is_address_owned(&self, address: &str) -> Result<bool>;
}

type TxCommitHandler = Box<dyn Fn(TxObject) + Send + Sync>;

/// [`ChainDriver`] over a node's HTTP API.
///
/// Closing or dropping the driver stops its head tracker and fails pending operations.
pub struct Driver {
	net: Arc<dyn Net>,
	genesis: Block,
	tracker: HeadTracker,
	cache: ResponseCache,
	shutdown: Controller,
	wallet: Arc<dyn Wallet>,
	encoder: Option<Arc<dyn TxEncoder>>,
	config: DriverConfig,
	on_tx_commit: Option<TxCommitHandler>,
}

impl Driver {
	/// Fetches genesis and best block, then starts a driver at the best block.
	pub async fn connect(
		net: Arc<dyn Net>,
		wallet: Arc<dyn Wallet>,
		config: DriverConfig,
	) -> Result<Self> {
		let genesis = net.http(Method::Get, "blocks/0", Params::default()).await?;
		let genesis: Block = decode("GET blocks/0", genesis)?;

		let params = Params::default().header(GENESIS_HEADER, &genesis.id);
		let best = net.http(Method::Get, "blocks/best", params).await?;
		let best: Block = decode("GET blocks/best", best)?;
		info!(genesis = %genesis.id, head = %best.head(), "Connected to node");

		let head = best.head();
		Ok(Self::new(net, genesis, Some(head), wallet, config))
	}

	/// Starts a driver at `initial_head`, or at genesis when absent.
	///
	/// Must be called within a tokio runtime, the head tracker is spawned right away.
	pub fn new(
		net: Arc<dyn Net>,
		genesis: Block,
		initial_head: Option<Head>,
		wallet: Arc<dyn Wallet>,
		config: DriverConfig,
	) -> Self {
		let head = initial_head.unwrap_or_else(|| genesis.head());
		let state = state::shared(head, config.content_capacity, config.revision_capacity);
		let shutdown = Controller::new();
		let tracker = HeadTracker::new(
			state.clone(),
			net.clone(),
			shutdown.clone(),
			config.clone(),
			genesis.id.clone(),
		);
		let cache = ResponseCache::new(state, shutdown.clone());
		spawn_in_span(tracker.clone().run());

		Self {
			net,
			genesis,
			tracker,
			cache,
			shutdown,
			wallet,
			encoder: None,
			config,
			on_tx_commit: None,
		}
	}

	/// Sets the codec `sign_tx` encodes transactions with.
	pub fn with_encoder(mut self, encoder: Arc<dyn TxEncoder>) -> Self {
		self.encoder = Some(encoder);
		self
	}

	/// Registers a watcher called with every signed transaction before it is sent.
	pub fn on_tx_commit(mut self, handler: impl Fn(TxObject) + Send + Sync + 'static) -> Self {
		self.on_tx_commit = Some(Box::new(handler));
		self
	}

	pub fn shutdown(&self) -> Controller {
		self.shutdown.clone()
	}

	pub fn close(&self) {
		if self.shutdown.interrupt("driver closed") {
			info!(genesis = %self.genesis.id, "Driver closed");
		}
	}

	/// Request future with the genesis header set, independent of `self`.
	fn request(
		&self,
		method: Method,
		path: String,
		params: Params,
	) -> impl Future<Output = Result<Value>> + Send + 'static {
		let net = self.net.clone();
		let params = params.header(GENESIS_HEADER, &self.genesis.id);
		async move { net.http(method, &path, params).await }
	}

	async fn cached<T: DeserializeOwned>(
		&self,
		key: String,
		class: CacheClass,
		revision: String,
		method: Method,
		path: String,
		params: Params,
	) -> Result<T> {
		let context = format!("{method} {path}");
		let value = self
			.cache
			.get(key, class, revision, self.request(method, path, params))
			.await?;
		decode(&context, value)
	}

	async fn uncached<T: DeserializeOwned>(
		&self,
		method: Method,
		path: String,
		params: Params,
	) -> Result<T> {
		let context = format!("{method} {path}");
		let value = self
			.shutdown
			.with_cancel(self.request(method, path, params))
			.await??;
		decode(&context, value)
	}

	async fn estimate_gas(&self, clauses: &[Clause], caller: &str) -> Result<u64> {
		let arg = ExplainArg {
			clauses: clauses.to_vec(),
			caller: Some(caller.to_string()),
			..Default::default()
		};
		let head = self.head();
		let outputs = self.explain(arg, &head.id, vec![]).await?;
		let execution_gas = outputs.iter().map(|output| output.gas_used).sum();
		estimate_gas(clauses, execution_gas)
	}
}

fn decode<T: DeserializeOwned>(context: &str, value: Value) -> Result<T> {
	serde_json::from_value(value).map_err(|error| Error::malformed(context, error))
}

impl Drop for Driver {
	fn drop(&mut self) {
		self.close();
	}
}

#[async_trait]
impl ChainDriver for Driver {
	fn genesis(&self) -> Block {
		self.genesis.clone()
	}

	fn head(&self) -> Head {
		self.tracker.head()
	}

	async fn poll_head(&self) -> Result<Head> {
		self.tracker.wait_for_head().await
	}

	async fn get_block(&self, revision: Revision) -> Result<Option<Block>> {
		let path = format!("blocks/{revision}");
		if !revision.is_exact() {
			return self.uncached(Method::Get, path, Params::default()).await;
		}
		let key = format!("block-{revision}");
		self.cached(
			key,
			CacheClass::ContentAddressed,
			revision.to_string(),
			Method::Get,
			path,
			Params::default(),
		)
		.await
	}

	async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
		let head = self.head();
		self.cached(
			format!("tx-{id}"),
			CacheClass::ContentAddressed,
			head.id.clone(),
			Method::Get,
			format!("transactions/{id}"),
			Params::default().query("head", &head.id),
		)
		.await
	}

	async fn get_receipt(&self, id: &str) -> Result<Option<Receipt>> {
		let head = self.head();
		self.cached(
			format!("receipt-{id}"),
			CacheClass::ContentAddressed,
			head.id.clone(),
			Method::Get,
			format!("transactions/{id}/receipt"),
			Params::default().query("head", &head.id),
		)
		.await
	}

	async fn get_account(&self, address: &str, revision: &str) -> Result<Account> {
		let key = address.to_lowercase();
		self.cached(
			key.clone(),
			CacheClass::tied(&key, Vec::<String>::new()),
			revision.to_string(),
			Method::Get,
			format!("accounts/{address}"),
			Params::default().query("revision", revision),
		)
		.await
	}

	async fn get_code(&self, address: &str, revision: &str) -> Result<Code> {
		let address = address.to_lowercase();
		let key = format!("code-{address}");
		self.cached(
			key.clone(),
			CacheClass::tied(&key, [address.clone()]),
			revision.to_string(),
			Method::Get,
			format!("accounts/{address}/code"),
			Params::default().query("revision", revision),
		)
		.await
	}

	async fn get_storage(&self, address: &str, key: &str, revision: &str) -> Result<Storage> {
		let address = address.to_lowercase();
		let cache_key = format!("storage-{address}-{key}");
		self.cached(
			cache_key.clone(),
			CacheClass::tied(&cache_key, [address.clone()]),
			revision.to_string(),
			Method::Get,
			format!("accounts/{address}/storage/{key}"),
			Params::default().query("revision", revision),
		)
		.await
	}

	async fn explain(
		&self,
		arg: ExplainArg,
		revision: &str,
		ties: Vec<String>,
	) -> Result<Vec<VmOutput>> {
		let key = content_key("explain", &arg);
		let body = serde_json::to_value(&arg).map_err(|error| Error::InvalidInput(error.to_string()))?;
		self.cached(
			key.clone(),
			CacheClass::tied(&key, ties),
			revision.to_string(),
			Method::Post,
			"accounts/*".to_string(),
			Params::default().query("revision", revision).body(body),
		)
		.await
	}

	async fn filter_event_logs(&self, arg: FilterArg) -> Result<Vec<Event>> {
		let key = content_key("event", &arg);
		let body = serde_json::to_value(&arg).map_err(|error| Error::InvalidInput(error.to_string()))?;
		self.cached(
			key.clone(),
			CacheClass::tied(&key, Vec::<String>::new()),
			self.head().id,
			Method::Post,
			"logs/event".to_string(),
			Params::default().body(body),
		)
		.await
	}

	async fn filter_transfer_logs(&self, arg: FilterArg) -> Result<Vec<Transfer>> {
		let key = content_key("transfer", &arg);
		let body = serde_json::to_value(&arg).map_err(|error| Error::InvalidInput(error.to_string()))?;
		self.cached(
			key.clone(),
			CacheClass::tied(&key, Vec::<String>::new()),
			self.head().id,
			Method::Post,
			"logs/transfer".to_string(),
			Params::default().body(body),
		)
		.await
	}

	async fn sign_tx(&self, clauses: Vec<Clause>, options: SignTxOptions) -> Result<TxResponse> {
		let signer = find_signer(self.wallet.as_ref(), options.signer.as_deref())?;
		let encoder = self
			.encoder
			.clone()
			.ok_or_else(|| Error::InvalidInput("no transaction encoder".to_string()))?;
		let chain_tag = chain_tag(&self.genesis.id)?;
		intrinsic_gas(&clauses)?;

		let gas = match options.gas {
			Some(gas) => gas,
			None => self.estimate_gas(&clauses, &signer).await?,
		};
		let head = self.head();
		let body = TxBody {
			chain_tag,
			block_ref: block_ref(&head.id)?,
			expiration: self.config.tx.expiration,
			clauses,
			gas_price_coef: self.config.tx.gas_price_coef,
			gas,
			depends_on: options.depends_on,
			nonce: format!("0x{}", hex::encode(random_bytes::<8>())),
		};

		let signature = self.wallet.sign(&signer, &encoder.signing_hash(&body))?;
		let signed = encoder.encode(&body, &signature)?;
		let tx = TxObject::new(signed, self.net.clone(), self.genesis.id.clone());
		if let Some(on_tx_commit) = &self.on_tx_commit {
			on_tx_commit(tx.clone());
		}

		self.shutdown.with_cancel(tx.resend()).await?.map_err(|error| {
			warn!(id = %tx.id, %error, "Cannot send transaction");
			error
		})?;
		Ok(TxResponse {
			txid: tx.id,
			signer,
		})
	}

	async fn sign_cert(
		&self,
		message: CertMessage,
		options: SignCertOptions,
	) -> Result<CertResponse> {
		sign_certificate(
			self.wallet.as_ref(),
			&message,
			&options,
			self.head().timestamp,
		)
	}

	async fn is_address_owned(&self, address: &str) -> Result<bool> {
		Ok(self
			.wallet
			.addresses()
			.iter()
			.any(|owned| owned.eq_ignore_ascii_case(address)))
	}
}
