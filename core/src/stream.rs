//! In-order reader over one persistent streaming connection.

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
	error::{Error, Result},
	utils::spawn_in_span,
};

type Inbound = mpsc::UnboundedReceiver<Result<String>>;
type Outbound = mpsc::UnboundedSender<Result<String>>;

/// Reads JSON messages from one connection in arrival order.
///
/// Concurrent [`StreamReader::read`] calls are served in call order, one message each.
/// A malformed message, a transport failure or the connection closing moves the reader
/// into a terminal state: every pending and later read fails with the stored error.
/// The terminal state is permanent; a new reader is needed to resume.
pub struct StreamReader {
	inbound: AsyncMutex<Inbound>,
	error: Mutex<Option<Error>>,
	closed: CancellationToken,
}

impl StreamReader {
	/// Opens a websocket to `url` in the background.
	///
	/// Connection failures surface on the first [`StreamReader::read`].
	pub fn connect(url: String) -> Self {
		let (sender, inbound) = mpsc::unbounded_channel();
		let closed = CancellationToken::new();
		spawn_in_span(websocket_pump(url, sender, closed.clone()));
		Self::new(inbound, closed)
	}

	/// Reads text messages from any stream; the stream ending closes the reader.
	pub fn from_stream<S>(messages: S) -> Self
	where
		S: Stream<Item = Result<String>> + Send + Unpin + 'static,
	{
		let (sender, inbound) = mpsc::unbounded_channel();
		let closed = CancellationToken::new();
		spawn_in_span(stream_pump(messages, sender, closed.clone()));
		Self::new(inbound, closed)
	}

	fn new(inbound: Inbound, closed: CancellationToken) -> Self {
		Self {
			inbound: AsyncMutex::new(inbound),
			error: Mutex::new(None),
			closed,
		}
	}

	/// Hands back the next message, decoded as JSON.
	pub async fn read(&self) -> Result<Value> {
		if let Some(error) = self.terminal_error() {
			return Err(error);
		}
		// tokio's mutex queues waiters in FIFO order
		let mut inbound = self.inbound.lock().await;
		if let Some(error) = self.terminal_error() {
			return Err(error);
		}

		let message = tokio::select! {
			biased;
			_ = self.closed.cancelled() => None,
			message = inbound.recv() => message,
		};

		match message {
			Some(Ok(text)) => match serde_json::from_str(&text) {
				Ok(value) => Ok(value),
				Err(error) => Err(self.fail(Error::StreamTerminal(format!(
					"malformed message: {error}"
				)))),
			},
			Some(Err(error)) => Err(self.fail(error)),
			None => Err(self.fail(closed())),
		}
	}

	/// Forces the terminal state and closes the connection.
	pub fn close(&self) {
		self.fail(closed());
	}

	pub fn terminal_error(&self) -> Option<Error> {
		self.error.lock().clone()
	}

	/// Stores the first terminal error and returns the stored one.
	fn fail(&self, error: Error) -> Error {
		let stored = {
			let mut stored = self.error.lock();
			stored.get_or_insert(error).clone()
		};
		self.closed.cancel();
		stored
	}
}

impl Drop for StreamReader {
	fn drop(&mut self) {
		self.closed.cancel();
	}
}

fn closed() -> Error {
	Error::StreamTerminal("closed".to_string())
}

async fn websocket_pump(url: String, sender: Outbound, closed: CancellationToken) {
	let connect = tokio::select! {
		_ = closed.cancelled() => return,
		connect = connect_async(url.as_str()) => connect,
	};
	let mut socket = match connect {
		Ok((socket, _)) => socket,
		Err(error) => {
			debug!(%url, %error, "Cannot open stream");
			let _ = sender.send(Err(Error::StreamTerminal(error.to_string())));
			return;
		},
	};
	debug!(%url, "Stream opened");

	loop {
		let message = tokio::select! {
			_ = closed.cancelled() => break,
			message = socket.next() => message,
		};
		match message {
			Some(Ok(Message::Text(text))) => {
				if sender.send(Ok(text)).is_err() {
					break;
				}
			},
			Some(Ok(Message::Close(_))) | None => break,
			Some(Ok(_)) => trace!("Ignoring non-text frame"),
			Some(Err(error)) => {
				let _ = sender.send(Err(Error::StreamTerminal(error.to_string())));
				break;
			},
		}
	}
	let _ = socket.close(None).await;
	debug!(%url, "Stream closed");
}

async fn stream_pump<S>(mut messages: S, sender: Outbound, closed: CancellationToken)
where
	S: Stream<Item = Result<String>> + Unpin,
{
	loop {
		let message = tokio::select! {
			_ = closed.cancelled() => return,
			message = messages.next() => message,
		};
		let Some(message) = message else {
			return;
		};
		let failed = message.is_err();
		if sender.send(message).is_err() || failed {
			return;
		}
	}
}
