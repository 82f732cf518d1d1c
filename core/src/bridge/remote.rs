use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpStream, sync::mpsc, time::sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use super::{
	rpc::{Endpoint, Frame, Response, RpcError},
	Handshake,
};
use crate::{
	driver::ChainDriver,
	error::{Error, Result},
	shutdown::Controller,
	types::{
		Account, Block, Clause, Code, Event, ExplainArg, FilterArg, Head, Receipt, Revision,
		Storage, Transaction, Transfer, VmOutput,
	},
	utils::spawn_in_span,
	vendor::{CertMessage, CertResponse, SignCertOptions, SignTxOptions, TxResponse},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// [`ChainDriver`] whose operations run on a bridge host.
///
/// A lost connection fails pending calls and refuses new ones until the
/// connection is reestablished. Reconnects are attempted until the driver is closed.
pub struct RemoteDriver {
	endpoint: Arc<Endpoint>,
	genesis: Block,
	head: Mutex<Head>,
	shutdown: Controller,
}

impl RemoteDriver {
	/// Connects to the bridge host at `url` and performs the handshake.
	pub async fn connect(url: &str) -> Result<Self> {
		Self::open(url, RECONNECT_INTERVAL).await
	}

	async fn open(url: &str, reconnect_interval: Duration) -> Result<Self> {
		let socket = open_socket(url).await?;
		let (endpoint, outbound) = Endpoint::new();
		let endpoint = Arc::new(endpoint);
		let shutdown = Controller::new();
		spawn_in_span(run(
			url.to_string(),
			socket,
			outbound,
			endpoint.clone(),
			shutdown.clone(),
			reconnect_interval,
		));

		let handshake = endpoint
			.call("connect", vec![])
			.await
			.and_then(|value| decode::<Handshake>("connect", value));
		let Handshake { genesis, head } = match handshake {
			Ok(handshake) => handshake,
			Err(error) => {
				// no reconnects for a host that never completed a handshake
				shutdown.interrupt("handshake failed");
				return Err(error);
			},
		};
		info!(%url, genesis = %genesis.id, %head, "Connected to bridge host");

		Ok(Self {
			endpoint,
			genesis,
			head: Mutex::new(head),
			shutdown,
		})
	}

	pub fn close(&self) {
		self.shutdown.interrupt("driver closed");
	}

	async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T> {
		let value = self.endpoint.call(method, params).await?;
		decode(method, value)
	}
}

impl Drop for RemoteDriver {
	fn drop(&mut self) {
		self.close();
	}
}

fn decode<T: DeserializeOwned>(method: &str, value: Value) -> Result<T> {
	serde_json::from_value(value).map_err(|error| Error::malformed(method, error))
}

fn param(value: impl Serialize) -> Result<Value> {
	serde_json::to_value(value).map_err(|error| Error::InvalidInput(error.to_string()))
}

fn closed() -> Error {
	Error::Transport("closed".to_string())
}

async fn open_socket(url: &str) -> Result<Socket> {
	let (socket, _) = connect_async(url)
		.await
		.map_err(|error| Error::Transport(format!("websocket {url}: {error}")))?;
	Ok(socket)
}

async fn run(
	url: String,
	mut socket: Socket,
	mut outbound: mpsc::UnboundedReceiver<String>,
	endpoint: Arc<Endpoint>,
	shutdown: Controller,
	reconnect_interval: Duration,
) {
	loop {
		let error = session(&mut socket, &mut outbound, &endpoint, &shutdown).await;
		if let Err(error) = socket.close(None).await {
			trace!(%error, "Bridge socket already closed");
		}
		endpoint.set_error(Some(error));
		if shutdown.is_interrupted() {
			return;
		}
		warn!(%url, "Bridge connection lost, reconnecting");

		socket = loop {
			if shutdown.with_cancel(sleep(reconnect_interval)).await.is_err() {
				return;
			}
			match open_socket(&url).await {
				Ok(socket) => break socket,
				Err(error) => warn!(%error, "Cannot reconnect to bridge host"),
			}
		};

		// requests of calls that already failed
		while outbound.try_recv().is_ok() {}
		endpoint.set_error(None);
		info!(%url, "Reconnected to bridge host");
	}
}

/// Pumps frames over one connection, returning the error pending calls fail with.
async fn session(
	socket: &mut Socket,
	outbound: &mut mpsc::UnboundedReceiver<String>,
	endpoint: &Endpoint,
	shutdown: &Controller,
) -> Error {
	let interrupted = shutdown.interrupted();
	tokio::pin!(interrupted);

	loop {
		tokio::select! {
			reason = &mut interrupted => return Error::Cancelled(reason),
			frame = outbound.recv() => {
				let Some(frame) = frame else {
					return closed();
				};
				if let Err(error) = socket.send(Message::Text(frame)).await {
					debug!(%error, "Cannot send bridge request");
					return closed();
				}
			},
			message = socket.next() => match message {
				Some(Ok(Message::Text(text))) => match Frame::parse(&text) {
					Ok(Frame::Response(response)) => endpoint.resolve(response),
					Ok(Frame::Request(request)) => {
						let response = Response::new(request.id, Err(RpcError::method_not_found(&request.method)));
						let Ok(frame) = Frame::Response(response).encode() else {
							continue;
						};
						if let Err(error) = socket.send(Message::Text(frame)).await {
							debug!(%error, "Cannot send bridge response");
							return closed();
						}
					},
					Err(error) => warn!(%error, "Receive bridge payload"),
				},
				Some(Ok(Message::Close(_))) | None => return closed(),
				Some(Ok(_)) => trace!("Ignoring non-text frame"),
				Some(Err(error)) => {
					debug!(%error, "Bridge connection failed");
					return closed();
				},
			},
		}
	}
}

#[async_trait]
impl ChainDriver for RemoteDriver {
	fn genesis(&self) -> Block {
		self.genesis.clone()
	}

	fn head(&self) -> Head {
		self.head.lock().clone()
	}

	async fn poll_head(&self) -> Result<Head> {
		let head: Head = self.call("pollHead", vec![]).await?;
		*self.head.lock() = head.clone();
		Ok(head)
	}

	async fn get_block(&self, revision: Revision) -> Result<Option<Block>> {
		self.call("getBlock", vec![param(revision)?]).await
	}

	async fn get_transaction(&self, id: &str) -> Result<Option<Transaction>> {
		self.call("getTransaction", vec![param(id)?]).await
	}

	async fn get_receipt(&self, id: &str) -> Result<Option<Receipt>> {
		self.call("getReceipt", vec![param(id)?]).await
	}

	async fn get_account(&self, address: &str, revision: &str) -> Result<Account> {
		self.call("getAccount", vec![param(address)?, param(revision)?])
			.await
	}

	async fn get_code(&self, address: &str, revision: &str) -> Result<Code> {
		self.call("getCode", vec![param(address)?, param(revision)?])
			.await
	}

	async fn get_storage(&self, address: &str, key: &str, revision: &str) -> Result<Storage> {
		let params = vec![param(address)?, param(key)?, param(revision)?];
		self.call("getStorage", params).await
	}

	async fn explain(
		&self,
		arg: ExplainArg,
		revision: &str,
		ties: Vec<String>,
	) -> Result<Vec<VmOutput>> {
		let params = vec![param(arg)?, param(revision)?, param(ties)?];
		self.call("explain", params).await
	}

	async fn filter_event_logs(&self, arg: FilterArg) -> Result<Vec<Event>> {
		self.call("filterEventLogs", vec![param(arg)?]).await
	}

	async fn filter_transfer_logs(&self, arg: FilterArg) -> Result<Vec<Transfer>> {
		self.call("filterTransferLogs", vec![param(arg)?]).await
	}

	async fn sign_tx(&self, clauses: Vec<Clause>, options: SignTxOptions) -> Result<TxResponse> {
		self.call("signTx", vec![param(clauses)?, param(options)?])
			.await
	}

	async fn sign_cert(
		&self,
		message: CertMessage,
		options: SignCertOptions,
	) -> Result<CertResponse> {
		self.call("signCert", vec![param(message)?, param(options)?])
			.await
	}

	async fn is_address_owned(&self, address: &str) -> Result<bool> {
		self.call("isAddressOwned", vec![param(address)?]).await
	}
}
