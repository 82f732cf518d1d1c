//! Chain head and cache entries, guarded by one lock.
//!
//! A head advance and the cache invalidation it causes happen under the same
//! lock, so no lookup can observe an entry already known to be stale.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{bloom::Bloom, cache::Entries, types::Head};

pub(crate) type SharedState = Arc<Mutex<ChainState>>;

pub(crate) struct ChainState {
	pub head: Head,
	pub entries: Entries,
	/// Callers waiting for the next accepted head.
	pub waiters: Vec<oneshot::Sender<Head>>,
}

pub(crate) fn shared(head: Head, content_capacity: usize, revision_capacity: usize) -> SharedState {
	Arc::new(Mutex::new(ChainState {
		head,
		entries: Entries::new(content_capacity, revision_capacity),
		waiters: vec![],
	}))
}

impl ChainState {
	/// Publishes `head` if it is accepted.
	///
	/// Replaces the stored head, invalidates the cache with the block filter when there is one,
	/// and resolves every registered waiter exactly once.
	pub fn advance(&mut self, head: Head, hint: Option<&Bloom>) -> bool {
		if !self.head.accepts(&head) {
			return false;
		}
		debug!(number = head.number, id = %head.id, filtered = hint.is_some(), "New head");

		self.head = head;
		self.entries.on_new_head(hint);
		for waiter in self.waiters.drain(..) {
			// waiter gave up, nothing to resolve
			let _ = waiter.send(self.head.clone());
		}
		true
	}

	/// Registers a waiter for the next accepted head.
	pub fn wait_for_head(&mut self) -> oneshot::Receiver<Head> {
		// drop waiters whose callers gave up
		self.waiters.retain(|waiter| !waiter.is_closed());
		let (sender, receiver) = oneshot::channel();
		self.waiters.push(sender);
		receiver
	}
}
