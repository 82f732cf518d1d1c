use thiserror::Error;

use crate::shutdown::Cancelled;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the driver.
///
/// The type is [`Clone`] because one failed fetch is reported to every
/// caller attached to it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
	/// Request failed, returned a bad status or a malformed body.
	#[error("{0}")]
	Transport(String),
	/// The stream reader reached its terminal state.
	#[error("stream: {0}")]
	StreamTerminal(String),
	/// The driver was closed while the operation was pending.
	#[error("cancelled: {0}")]
	Cancelled(String),
	/// Malformed caller arguments, rejected before any network activity.
	#[error("invalid input: {0}")]
	InvalidInput(String),
}

impl Error {
	pub fn malformed(context: impl std::fmt::Display, error: impl std::fmt::Display) -> Self {
		Error::Transport(format!("{context}: malformed response: {error}"))
	}

	pub fn is_cancelled(&self) -> bool {
		matches!(self, Error::Cancelled(_))
	}
}

impl From<Cancelled> for Error {
	fn from(Cancelled { reason }: Cancelled) -> Self {
		Error::Cancelled(reason)
	}
}
