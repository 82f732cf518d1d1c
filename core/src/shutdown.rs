use parking_lot::Mutex;
use std::{fmt, future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
/// Cancellation scope shared by everything a driver spawns or waits on.
///
/// The controller addresses problems such as:
/// * Failing every wrapped future once the driver closes.
/// * Refusing new work after the driver has closed.
/// * Retrieving the reason the scope was interrupted.
///
/// A scope is single-use: once interrupted it stays interrupted.
///
/// The Controller can be cloned and is thread-safe. Clones share the same scope.
pub struct Controller {
	token: CancellationToken,
	reason: Arc<Mutex<Option<String>>>,
}

/// Error yielded by a future that was cut short by [`Controller::interrupt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancelled {
	pub reason: String,
}

impl fmt::Display for Cancelled {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "cancelled: {}", self.reason)
	}
}

impl std::error::Error for Cancelled {}

impl Controller {
	#[inline]
	/// Instantiate new cancellation scope.
	pub fn new() -> Self {
		Self {
			token: CancellationToken::new(),
			reason: Arc::new(Mutex::new(None)),
		}
	}

	/// Checks if the scope has been interrupted.
	pub fn is_interrupted(&self) -> bool {
		self.token.is_cancelled()
	}

	/// Gets the interrupt reason.
	///
	/// Returns [`None`] if the scope has not been interrupted yet.
	pub fn reason(&self) -> Option<String> {
		self.reason.lock().clone()
	}

	/// Interrupts the scope.
	///
	/// Every future currently wrapped with [`Self::with_cancel`] resolves with [`Cancelled`],
	/// and so does every future wrapped afterwards.
	///
	/// Idempotent: only the first reason is kept. Returns `true` if this call did the interrupting.
	pub fn interrupt(&self, reason: impl Into<String>) -> bool {
		{
			let mut current = self.reason.lock();
			if current.is_some() {
				return false;
			}
			*current = Some(reason.into());
		}
		self.token.cancel();
		true
	}

	/// Awaits the interrupt and yields its reason.
	///
	/// If the scope is already interrupted, the returned future immediately resolves.
	pub fn interrupted(&self) -> impl Future<Output = String> + Send + 'static {
		let token = self.token.clone();
		let reason = self.reason.clone();
		async move {
			token.cancelled().await;
			reason.lock().clone().unwrap_or_default()
		}
	}

	/// Wraps a future to cancel it upon an interrupt.
	///
	/// The returned future completes with `Err(Cancelled)` if the scope is interrupted before the
	/// wrapped future completes, including when it was interrupted before the first poll.
	/// Otherwise it yields `Ok(value)`.
	pub fn with_cancel<F: Future>(
		&self,
		future: F,
	) -> impl Future<Output = Result<F::Output, Cancelled>> {
		let token = self.token.clone();
		let reason = self.reason.clone();
		async move {
			tokio::select! {
				biased;
				_ = token.cancelled() => Err(Cancelled {
					reason: reason.lock().clone().unwrap_or_default(),
				}),
				output = future => Ok(output),
			}
		}
	}

	/// Interrupts the scope when the user asks the process to terminate.
	pub async fn on_user_signal(self, reason: String) {
		user_signal().await;
		self.interrupt(reason);
	}
}

impl Default for Controller {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for Controller {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Controller")
			.field("reason", &self.reason())
			.finish()
	}
}

/// This utility function returns a [`Future`] that completes upon
/// receiving each of the default termination signals.
///
/// On Unix-based systems, these signals are Ctrl-C (SIGINT) or SIGTERM,
/// and on Windows, they are Ctrl-C, Ctrl-Close, Ctrl-Shutdown.
pub async fn user_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(all(unix, not(windows)))]
	{
		let sig = async {
			let mut os_sig =
				tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
			os_sig.recv().await;
			std::io::Result::Ok(())
		};

		tokio::select! {
			_ = ctrl_c => {},
			_ = sig => {}
		}
	}

	#[cfg(all(not(unix), windows))]
	{
		let ctrl_close = async {
			let mut sig = tokio::signal::windows::ctrl_close()?;
			sig.recv().await;
			std::io::Result::Ok(())
		};
		let ctrl_shutdown = async {
			let mut sig = tokio::signal::windows::ctrl_shutdown()?;
			sig.recv().await;
			std::io::Result::Ok(())
		};
		tokio::select! {
			_ = ctrl_c => {},
			_ = ctrl_close => {},
			_ = ctrl_shutdown => {},
		}
	}
}
