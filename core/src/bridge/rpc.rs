//! JSON-RPC 2.0 framing and call correlation shared by both bridge ends.
//!
//! Requests and responses travel over the same socket in both directions.
//! Response frames carry a leading space, everything else is a request.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, fmt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::error::{Error, Result};

const VERSION: &str = "2.0";
const RESPONSE_MARKER: char = ' ';

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const SERVER_ERROR: i64 = -32000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
	pub jsonrpc: String,
	pub id: u64,
	pub method: String,
	#[serde(default)]
	pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
	pub jsonrpc: String,
	pub id: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<RpcError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
	pub code: i64,
	pub message: String,
}

impl RpcError {
	pub fn method_not_found(method: &str) -> Self {
		Self {
			code: METHOD_NOT_FOUND,
			message: format!("method not found: {method}"),
		}
	}

	pub fn invalid_params(method: &str, error: impl fmt::Display) -> Self {
		Self {
			code: INVALID_PARAMS,
			message: format!("{method}: invalid params: {error}"),
		}
	}
}

impl From<Error> for RpcError {
	fn from(error: Error) -> Self {
		Self {
			code: SERVER_ERROR,
			message: error.to_string(),
		}
	}
}

impl Response {
	pub fn new(id: u64, outcome: std::result::Result<Value, RpcError>) -> Self {
		let (result, error) = match outcome {
			Ok(result) => (Some(result), None),
			Err(error) => (None, Some(error)),
		};
		Self {
			jsonrpc: VERSION.to_string(),
			id,
			result,
			error,
		}
	}

	fn into_result(self) -> Result<Value> {
		match self.error {
			Some(RpcError { message, .. }) => Err(Error::Transport(message)),
			None => Ok(self.result.unwrap_or(Value::Null)),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
	Request(Request),
	Response(Response),
}

impl Frame {
	pub fn parse(frame: &str) -> Result<Self> {
		match frame.strip_prefix(RESPONSE_MARKER) {
			Some(response) => serde_json::from_str(response).map(Frame::Response),
			None => serde_json::from_str(frame).map(Frame::Request),
		}
		.map_err(|error| Error::malformed("bridge frame", error))
	}

	pub fn encode(&self) -> Result<String> {
		match self {
			Frame::Request(request) => serde_json::to_string(request),
			Frame::Response(response) => serde_json::to_string(response)
				.map(|response| format!("{RESPONSE_MARKER}{response}")),
		}
		.map_err(|error| Error::InvalidInput(error.to_string()))
	}
}

struct Calls {
	next_id: u64,
	pending: HashMap<u64, oneshot::Sender<Result<Value>>>,
	error: Option<Error>,
}

/// Calling side of a bridge connection.
///
/// Each call gets a fresh id; the matching response frame resolves it.
/// While an error is set, pending calls have failed with it and new calls are refused.
pub struct Endpoint {
	outbound: mpsc::UnboundedSender<String>,
	calls: Mutex<Calls>,
}

impl Endpoint {
	/// Creates an endpoint and the receiver its encoded request frames are written to.
	pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
		let (outbound, receiver) = mpsc::unbounded_channel();
		let endpoint = Self {
			outbound,
			calls: Mutex::new(Calls {
				next_id: 1,
				pending: HashMap::new(),
				error: None,
			}),
		};
		(endpoint, receiver)
	}

	pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
		let receiver = {
			let mut calls = self.calls.lock();
			if let Some(error) = calls.error.clone() {
				return Err(error);
			}
			let id = calls.next_id;
			calls.next_id += 1;

			let frame = Frame::Request(Request {
				jsonrpc: VERSION.to_string(),
				id,
				method: method.to_string(),
				params,
			})
			.encode()?;
			self.outbound
				.send(frame)
				.map_err(|_| Error::Transport("closed".to_string()))?;

			let (sender, receiver) = oneshot::channel();
			calls.pending.insert(id, sender);
			trace!(id, method, "Call sent");
			receiver
		};

		receiver
			.await
			.map_err(|_| Error::Transport("closed".to_string()))?
	}

	/// Resolves the call a response belongs to.
	pub fn resolve(&self, response: Response) {
		let Some(sender) = self.calls.lock().pending.remove(&response.id) else {
			debug!(id = response.id, "Response to unknown call");
			return;
		};
		// caller is gone, nothing to resolve
		let _ = sender.send(response.into_result());
	}

	/// Sets or clears the error state.
	///
	/// Setting an error fails every pending call with it.
	pub fn set_error(&self, error: Option<Error>) {
		let mut calls = self.calls.lock();
		if let Some(error) = &error {
			for (_, sender) in calls.pending.drain() {
				let _ = sender.send(Err(error.clone()));
			}
		}
		calls.error = error;
	}

	#[cfg(test)]
	fn pending(&self) -> usize {
		self.calls.lock().pending.len()
	}
}
