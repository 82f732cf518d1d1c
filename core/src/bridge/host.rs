use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use mockall::automock;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{future::Future, net::SocketAddr, sync::Arc};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use warp::{
	ws::{Message, WebSocket, Ws},
	Filter, Rejection, Reply,
};

use super::{
	rpc::{Frame, Response, RpcError, SERVER_ERROR},
	Handshake, PATH,
};
use crate::{
	driver::ChainDriver,
	error::{Error, Result},
	shutdown::Controller,
	types::{Clause, ExplainArg, FilterArg, Revision},
	utils::spawn_in_span,
	vendor::{CertMessage, SignCertOptions, SignTxOptions},
};

/// Decides which driver a new bridge connection talks to.
#[async_trait]
#[automock]
pub trait Acceptor: Send + Sync {
	/// Rejecting closes the connection.
	async fn accept(&self) -> Result<Arc<dyn ChainDriver>>;
}

/// Accepts every connection with the same driver.
pub struct SharedDriver(pub Arc<dyn ChainDriver>);

#[async_trait]
impl Acceptor for SharedDriver {
	async fn accept(&self) -> Result<Arc<dyn ChainDriver>> {
		Ok(self.0.clone())
	}
}

pub fn routes(
	acceptor: Arc<dyn Acceptor>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	warp::path(PATH)
		.and(warp::path::end())
		.and(warp::ws())
		.and(warp::any().map(move || acceptor.clone()))
		.map(|ws: Ws, acceptor: Arc<dyn Acceptor>| {
			ws.on_upgrade(move |web_socket| connect(web_socket, acceptor))
		})
}

/// Binds the bridge host to `addr`, serving until `shutdown` is interrupted.
pub fn bind(
	addr: SocketAddr,
	acceptor: Arc<dyn Acceptor>,
	shutdown: Controller,
) -> Result<(SocketAddr, impl Future<Output = ()>)> {
	// warp graceful shutdown expects a signal that is [`Future<Output = ()>`]
	let shutdown_signal = shutdown.interrupted().map(|_| ());
	let (addr, server) = warp::serve(routes(acceptor))
		.try_bind_with_graceful_shutdown(addr, shutdown_signal)
		.map_err(|error| Error::Transport(format!("Cannot bind bridge host: {error}")))?;
	info!("Bridge host running on ws://{addr}/{PATH}");
	Ok((addr, server))
}

async fn connect(web_socket: WebSocket, acceptor: Arc<dyn Acceptor>) {
	let driver = match acceptor.accept().await {
		Ok(driver) => driver,
		Err(error) => {
			warn!(%error, "Bridge connection rejected");
			if let Err(error) = web_socket.close().await {
				debug!(%error, "Cannot close rejected connection");
			}
			return;
		},
	};

	let (web_socket_sender, mut web_socket_receiver) = web_socket.split();
	let (sender, receiver) = mpsc::unbounded_channel();
	let receiver_stream = UnboundedReceiverStream::new(receiver);

	spawn_in_span(receiver_stream.forward(web_socket_sender).map(|result| {
		if let Err(error) = result {
			error!(%error, "Error sending bridge message");
		}
	}));

	// requests still running when the connection closes are abandoned
	let connection = Controller::new();

	while let Some(result) = web_socket_receiver.next().await {
		let message = match result {
			Err(error) => {
				error!(%error, "Error receiving bridge message");
				break;
			},
			Ok(message) if message.is_close() => break,
			Ok(message) => message,
		};
		let Ok(text) = message.to_str() else {
			continue;
		};

		let request = match Frame::parse(text) {
			Ok(Frame::Request(request)) => request,
			Ok(Frame::Response(response)) => {
				debug!(id = response.id, "Ignoring response, host issues no calls");
				continue;
			},
			Err(error) => {
				warn!(%error, "Receive bridge payload");
				continue;
			},
		};

		let driver = driver.clone();
		let sender = sender.clone();
		let handle = connection.with_cancel(async move {
			let outcome = dispatch(driver.as_ref(), &request.method, request.params).await;
			let frame = Frame::Response(Response::new(request.id, outcome)).encode()?;
			sender
				.send(Ok(Message::text(frame)))
				.map_err(|_| Error::Transport("closed".to_string()))
		});
		spawn_in_span(async move {
			if let Ok(Err(error)) = handle.await {
				debug!(%error, "Cannot send bridge response");
			}
		});
	}

	connection.interrupt("connection closed");
	debug!("Bridge connection closed");
}

fn args<T: DeserializeOwned>(
	method: &str,
	mut params: Vec<Value>,
	arity: usize,
) -> std::result::Result<T, RpcError> {
	if params.len() > arity {
		return Err(RpcError::invalid_params(
			method,
			format!("expected {arity} params, got {}", params.len()),
		));
	}
	// omitted trailing params read as null
	params.resize(arity, Value::Null);
	serde_json::from_value(Value::Array(params))
		.map_err(|error| RpcError::invalid_params(method, error))
}

fn reply<T: Serialize>(result: Result<T>) -> std::result::Result<Value, RpcError> {
	serde_json::to_value(result?).map_err(|error| RpcError {
		code: SERVER_ERROR,
		message: format!("cannot encode result: {error}"),
	})
}

/// Invokes `method` on `driver` with positional `params`.
pub async fn dispatch(
	driver: &dyn ChainDriver,
	method: &str,
	params: Vec<Value>,
) -> std::result::Result<Value, RpcError> {
	match method {
		"connect" => reply(Ok(Handshake {
			genesis: driver.genesis(),
			head: driver.head(),
		})),
		"pollHead" => reply(driver.poll_head().await),
		"getBlock" => {
			let (revision,): (Option<Revision>,) = args(method, params, 1)?;
			reply(driver.get_block(revision.unwrap_or_else(Revision::best)).await)
		},
		"getTransaction" => {
			let (id,): (String,) = args(method, params, 1)?;
			reply(driver.get_transaction(&id).await)
		},
		"getReceipt" => {
			let (id,): (String,) = args(method, params, 1)?;
			reply(driver.get_receipt(&id).await)
		},
		"getAccount" => {
			let (address, revision): (String, String) = args(method, params, 2)?;
			reply(driver.get_account(&address, &revision).await)
		},
		"getCode" => {
			let (address, revision): (String, String) = args(method, params, 2)?;
			reply(driver.get_code(&address, &revision).await)
		},
		"getStorage" => {
			let (address, key, revision): (String, String, String) = args(method, params, 3)?;
			reply(driver.get_storage(&address, &key, &revision).await)
		},
		"explain" => {
			let (arg, revision, ties): (ExplainArg, String, Option<Vec<String>>) =
				args(method, params, 3)?;
			reply(
				driver
					.explain(arg, &revision, ties.unwrap_or_default())
					.await,
			)
		},
		"filterEventLogs" => {
			let (arg,): (FilterArg,) = args(method, params, 1)?;
			reply(driver.filter_event_logs(arg).await)
		},
		"filterTransferLogs" => {
			let (arg,): (FilterArg,) = args(method, params, 1)?;
			reply(driver.filter_transfer_logs(arg).await)
		},
		"signTx" => {
			let (clauses, options): (Vec<Clause>, Option<SignTxOptions>) =
				args(method, params, 2)?;
			reply(driver.sign_tx(clauses, options.unwrap_or_default()).await)
		},
		"signCert" => {
			let (message, options): (CertMessage, Option<SignCertOptions>) =
				args(method, params, 2)?;
			reply(driver.sign_cert(message, options.unwrap_or_default()).await)
		},
		"isAddressOwned" => {
			let (address,): (String,) = args(method, params, 1)?;
			reply(driver.is_address_owned(&address).await)
		},
		method => Err(RpcError::method_not_found(method)),
	}
}
