//! Revision-aware response cache.
//!
//! Entries are either content-addressed, kept until capacity pressure pushes them out,
//! or tied to the chain state, in which case every head advance may evict them.
//! Concurrent lookups of a missing key share a single fetch.

use futures::{
	future::{BoxFuture, Shared},
	FutureExt,
};
use lru::LruCache;
use serde_json::Value;
use std::{
	collections::{BTreeSet, HashMap},
	future::Future,
	num::NonZeroUsize,
	sync::Arc,
};
use tracing::{debug, trace};

use crate::{
	bloom::Bloom,
	error::Result,
	shutdown::Controller,
	state::SharedState,
};

type PendingFetch = Shared<BoxFuture<'static, Result<Value>>>;

struct Pending {
	id: u64,
	fetch: PendingFetch,
	/// Tie tokens of a revision-tied fetch, `None` for content-addressed ones.
	ties: Option<BTreeSet<String>>,
}

/// Consistency class of a cached query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheClass {
	/// The key alone pins the value; never invalidated by head advances.
	ContentAddressed,
	/// Valid until a block touches one of the tie tokens.
	RevisionTied(BTreeSet<String>),
}

impl CacheClass {
	/// Tied to the key itself plus any extra tokens.
	pub fn tied<I, T>(key: &str, extra: I) -> Self
	where
		I: IntoIterator<Item = T>,
		T: Into<String>,
	{
		let mut ties = BTreeSet::from([key.to_string()]);
		ties.extend(extra.into_iter().map(Into::into));
		CacheClass::RevisionTied(ties)
	}
}

struct TiedEntry {
	value: Value,
	revision: String,
	ties: BTreeSet<String>,
}

/// Entry tables, guarded by the chain state lock.
pub(crate) struct Entries {
	content: LruCache<String, Value>,
	tied: LruCache<String, TiedEntry>,
	pending: HashMap<String, Pending>,
	next_fetch: u64,
	/// Bumped on every head advance.
	generation: u64,
}

fn capacity(value: usize) -> NonZeroUsize {
	NonZeroUsize::new(value).unwrap_or(NonZeroUsize::MIN)
}

impl Entries {
	pub fn new(content_capacity: usize, revision_capacity: usize) -> Self {
		Self {
			content: LruCache::new(capacity(content_capacity)),
			tied: LruCache::new(capacity(revision_capacity)),
			pending: HashMap::new(),
			next_fetch: 0,
			generation: 0,
		}
	}

	fn lookup(&mut self, key: &str) -> Option<Value> {
		if let Some(value) = self.content.get(key) {
			return Some(value.clone());
		}
		self.tied.get(key).map(|entry| entry.value.clone())
	}

	/// Evicts tied entries a new head may have made stale.
	///
	/// With a Bloom hint only entries with a positive tie token go, without one all of them do.
	/// Tied fetches still in flight are detached the same way: callers already waiting get
	/// their result, later lookups start over.
	pub fn on_new_head(&mut self, hint: Option<&Bloom>) {
		self.generation += 1;

		let touched = |ties: &BTreeSet<String>| match hint {
			Some(bloom) => ties.iter().any(|tie| bloom.contains(tie)),
			None => true,
		};
		self.pending.retain(|key, pending| match &pending.ties {
			Some(ties) if touched(ties) => {
				trace!(%key, "Detached stale pending fetch");
				false
			},
			_ => true,
		});

		let Some(bloom) = hint else {
			debug!(evicted = self.tied.len(), "Evicting all revision-tied entries");
			self.tied.clear();
			return;
		};

		let stale = self
			.tied
			.iter()
			.filter(|(_, entry)| entry.ties.iter().any(|tie| bloom.contains(tie)))
			.map(|(key, _)| key.clone())
			.collect::<Vec<_>>();

		for key in &stale {
			if let Some(entry) = self.tied.pop(key) {
				trace!(%key, revision = %entry.revision, "Evicted revision-tied entry");
			}
		}
		debug!(
			evicted = stale.len(),
			retained = self.tied.len(),
			"Applied block filter to cache"
		);
	}

	/// Settles a pending fetch, installing successful non-null results.
	fn settle(
		&mut self,
		key: &str,
		id: u64,
		class: CacheClass,
		revision: String,
		generation: u64,
		result: &Result<Value>,
	) {
		// a detached fetch may have been replaced by a newer one
		if self.pending.get(key).is_some_and(|pending| pending.id == id) {
			self.pending.remove(key);
		}

		let Ok(value) = result else {
			return;
		};
		if value.is_null() {
			return;
		}

		match class {
			CacheClass::ContentAddressed => {
				self.content.put(key.to_string(), value.clone());
			},
			CacheClass::RevisionTied(ties) => {
				if generation != self.generation {
					trace!(%key, "Head advanced during fetch, skipping install");
					return;
				}
				self.tied.put(
					key.to_string(),
					TiedEntry {
						value: value.clone(),
						revision,
						ties,
					},
				);
			},
		}
	}

	#[cfg(test)]
	pub fn len(&self) -> (usize, usize) {
		(self.content.len(), self.tied.len())
	}
}

enum Lookup {
	Hit(Value),
	Fetch(PendingFetch),
}

/// Front of the entry tables shared with the head tracker.
#[derive(Clone)]
pub struct ResponseCache {
	state: SharedState,
	shutdown: Controller,
}

impl ResponseCache {
	pub(crate) fn new(state: SharedState, shutdown: Controller) -> Self {
		Self { state, shutdown }
	}

	/// Returns the cached value of `key`, or the outcome of `fetch`.
	///
	/// A fetch already in flight for `key` is joined instead of started again.
	/// Failures and `null` results are handed to every waiting caller and not cached.
	/// Fails with `Cancelled` once the owning driver is closed.
	pub async fn get<F>(
		&self,
		key: String,
		class: CacheClass,
		revision: String,
		fetch: F,
	) -> Result<Value>
	where
		F: Future<Output = Result<Value>> + Send + 'static,
	{
		self.shutdown
			.with_cancel(async move {
				match self.lookup(key, class, revision, fetch) {
					Lookup::Hit(value) => Ok(value),
					Lookup::Fetch(pending) => pending.await,
				}
			})
			.await?
	}

	fn lookup<F>(&self, key: String, class: CacheClass, revision: String, fetch: F) -> Lookup
	where
		F: Future<Output = Result<Value>> + Send + 'static,
	{
		let mut state = self.state.lock();
		let entries = &mut state.entries;

		if let Some(value) = entries.lookup(&key) {
			trace!(%key, "Cache hit");
			return Lookup::Hit(value);
		}
		if let Some(pending) = entries.pending.get(&key) {
			trace!(%key, "Joining pending fetch");
			return Lookup::Fetch(pending.fetch.clone());
		}

		trace!(%key, "Cache miss");
		let generation = entries.generation;
		let id = entries.next_fetch;
		entries.next_fetch += 1;
		let ties = match &class {
			CacheClass::ContentAddressed => None,
			CacheClass::RevisionTied(ties) => Some(ties.clone()),
		};
		let weak = Arc::downgrade(&self.state);
		let pending = {
			let key = key.clone();
			async move {
				let result = fetch.await;
				// a dropped driver has nothing left to install into
				if let Some(state) = weak.upgrade() {
					state
						.lock()
						.entries
						.settle(&key, id, class, revision, generation, &result);
				}
				result
			}
		}
		.boxed()
		.shared();

		entries.pending.insert(
			key,
			Pending {
				id,
				fetch: pending.clone(),
				ties,
			},
		);
		Lookup::Fetch(pending)
	}
}

#[cfg(test)]
mod tests {
	use super::{CacheClass, ResponseCache};
	use crate::{
		bloom,
		error::{Error, Result},
		shutdown::Controller,
		state::{self, SharedState},
		types::Head,
	};
	use serde_json::{json, Value};
	use std::{
		future::Future,
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc,
		},
		time::Duration,
	};
	use test_case::test_case;
	use tokio::time::{sleep, timeout};

	const ADDRESS: &str = "0x7567d83b7b8d80addcb281a71d54fc7b3364ffed";
	const OTHER: &str = "0x0000000000000000000000000000456e65726779";

	fn head(number: u32) -> Head {
		Head {
			id: format!("0x{number:064x}"),
			number,
			timestamp: 0,
			parent_id: format!("0x{:064x}", number.saturating_sub(1)),
			txs_features: None,
		}
	}

	fn new_cache(capacity: usize) -> (SharedState, ResponseCache, Controller) {
		let state = state::shared(head(10), capacity, capacity);
		let shutdown = Controller::new();
		let cache = ResponseCache::new(state.clone(), shutdown.clone());
		(state, cache, shutdown)
	}

	/// Fetch returning `value` after a short delay, counting invocations.
	fn fetch(
		calls: &Arc<AtomicUsize>,
		value: Value,
	) -> impl Future<Output = Result<Value>> + Send + 'static {
		let calls = calls.clone();
		async move {
			calls.fetch_add(1, Ordering::SeqCst);
			sleep(Duration::from_millis(10)).await;
			Ok(value)
		}
	}

	async fn get(
		cache: &ResponseCache,
		key: &str,
		class: CacheClass,
		calls: &Arc<AtomicUsize>,
	) -> Result<Value> {
		let value = json!({ "key": key });
		timeout(
			Duration::from_secs(1),
			cache.get(key.to_string(), class, "best".to_string(), fetch(calls, value)),
		)
		.await
		.unwrap()
	}

	#[tokio::test]
	async fn concurrent_identical_queries_fetch_once() {
		let (_, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));
		let class = CacheClass::tied(ADDRESS, Vec::<String>::new());

		let (first, second) = futures::join!(
			get(&cache, ADDRESS, class.clone(), &calls),
			get(&cache, ADDRESS, class.clone(), &calls)
		);
		assert_eq!(first.unwrap(), second.unwrap());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn content_addressed_survives_head_advances() {
		let (state, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));

		get(&cache, "block-1", CacheClass::ContentAddressed, &calls)
			.await
			.unwrap();
		for number in 11..20 {
			assert!(state.lock().advance(head(number), None));
		}
		get(&cache, "block-1", CacheClass::ContentAddressed, &calls)
			.await
			.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn tied_entry_follows_block_filters() {
		let (state, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));
		let class = CacheClass::tied(ADDRESS, Vec::<String>::new());

		get(&cache, ADDRESS, class.clone(), &calls).await.unwrap();

		// blocks touching other accounts keep the entry
		for number in 11..15 {
			let filter = bloom::build(5, 256, &[OTHER]);
			assert!(state.lock().advance(head(number), Some(&filter)));
			get(&cache, ADDRESS, class.clone(), &calls).await.unwrap();
		}
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		let filter = bloom::build(5, 256, &[ADDRESS]);
		assert!(state.lock().advance(head(15), Some(&filter)));
		assert_eq!(state.lock().entries.len(), (0, 0));
		get(&cache, ADDRESS, class, &calls).await.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn extra_ties_evict_entry() {
		let (state, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));
		let class = CacheClass::tied("explain-01", [OTHER]);

		get(&cache, "explain-01", class.clone(), &calls)
			.await
			.unwrap();
		let filter = bloom::build(5, 256, &[OTHER]);
		state.lock().advance(head(11), Some(&filter));
		get(&cache, "explain-01", class, &calls).await.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn advance_without_filter_evicts_every_tied_entry() {
		let (state, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));

		get(&cache, "block-1", CacheClass::ContentAddressed, &calls)
			.await
			.unwrap();
		for key in [ADDRESS, OTHER] {
			get(&cache, key, CacheClass::tied(key, Vec::<String>::new()), &calls)
				.await
				.unwrap();
		}
		assert_eq!(state.lock().entries.len(), (1, 2));

		state.lock().advance(head(11), None);
		assert_eq!(state.lock().entries.len(), (1, 0));
	}

	#[tokio::test]
	async fn failures_are_shared_but_not_cached() {
		let (state, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));

		let failing = || {
			let calls = calls.clone();
			async move {
				calls.fetch_add(1, Ordering::SeqCst);
				sleep(Duration::from_millis(10)).await;
				Err(Error::Transport("503 GET blocks/1".to_string()))
			}
		};
		let (first, second) = futures::join!(
			cache.get(
				"block-1".to_string(),
				CacheClass::ContentAddressed,
				"1".to_string(),
				failing()
			),
			cache.get(
				"block-1".to_string(),
				CacheClass::ContentAddressed,
				"1".to_string(),
				failing()
			)
		);
		let expected = Err(Error::Transport("503 GET blocks/1".to_string()));
		assert_eq!(first, expected);
		assert_eq!(second, expected);
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert!(state.lock().entries.pending.is_empty());

		get(&cache, "block-1", CacheClass::ContentAddressed, &calls)
			.await
			.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn not_found_is_not_cached() {
		let (_, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));

		for _ in 0..2 {
			let value = cache
				.get(
					"tx-0x01".to_string(),
					CacheClass::ContentAddressed,
					"best".to_string(),
					fetch(&calls, Value::Null),
				)
				.await
				.unwrap();
			assert!(value.is_null());
		}
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn stale_fetch_is_not_installed() {
		let (state, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));
		let class = CacheClass::tied(ADDRESS, Vec::<String>::new());

		let (result, _) = futures::join!(get(&cache, ADDRESS, class.clone(), &calls), async {
			sleep(Duration::from_millis(2)).await;
			state.lock().advance(head(11), None);
		});
		result.unwrap();
		assert_eq!(state.lock().entries.len(), (0, 0));
	}

	#[test_case(true ; "touched by block filter")]
	#[test_case(false ; "advance without filter")]
	#[tokio::test]
	async fn lookup_after_advance_skips_stale_pending_fetch(filtered: bool) {
		let (state, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));
		let class = CacheClass::tied(ADDRESS, Vec::<String>::new());
		let lookup = |value: &str| {
			cache.get(
				ADDRESS.to_string(),
				class.clone(),
				"best".to_string(),
				fetch(&calls, json!(value)),
			)
		};

		let (first, second) = futures::join!(lookup("pre-advance balance"), async {
			sleep(Duration::from_millis(2)).await;
			let filter = bloom::build(5, 256, &[ADDRESS]);
			state
				.lock()
				.advance(head(11), filtered.then_some(&filter));
			lookup("post-advance balance").await
		});
		assert_eq!(first.unwrap(), json!("pre-advance balance"));
		assert_eq!(second.unwrap(), json!("post-advance balance"));
		assert_eq!(calls.load(Ordering::SeqCst), 2);

		// the newer fetch is the one installed
		assert!(state.lock().entries.pending.is_empty());
		assert_eq!(
			lookup("unused").await.unwrap(),
			json!("post-advance balance")
		);
		assert_eq!(calls.load(Ordering::SeqCst), 2);
	}

	#[tokio::test]
	async fn untouched_pending_fetch_is_joined_after_advance() {
		let (state, cache, _) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));
		let class = CacheClass::tied(ADDRESS, Vec::<String>::new());

		let (first, second) = futures::join!(get(&cache, ADDRESS, class.clone(), &calls), async {
			sleep(Duration::from_millis(2)).await;
			let filter = bloom::build(5, 256, &[OTHER]);
			state.lock().advance(head(11), Some(&filter));
			get(&cache, ADDRESS, class.clone(), &calls).await
		});
		assert_eq!(first.unwrap(), second.unwrap());
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn capacity_bounds_entries() {
		let (state, cache, _) = new_cache(2);
		let calls = Arc::new(AtomicUsize::new(0));

		for number in 0..3 {
			let key = format!("block-{number}");
			get(&cache, &key, CacheClass::ContentAddressed, &calls)
				.await
				.unwrap();
		}
		assert_eq!(state.lock().entries.len(), (2, 0));

		// least recently used entry went first
		get(&cache, "block-0", CacheClass::ContentAddressed, &calls)
			.await
			.unwrap();
		assert_eq!(calls.load(Ordering::SeqCst), 4);
	}

	#[tokio::test]
	async fn close_cancels_pending_and_later_lookups() {
		let (_, cache, shutdown) = new_cache(16);
		let calls = Arc::new(AtomicUsize::new(0));

		get(&cache, "block-1", CacheClass::ContentAddressed, &calls)
			.await
			.unwrap();

		let pending = cache.get(
			"block-2".to_string(),
			CacheClass::ContentAddressed,
			"2".to_string(),
			futures::future::pending(),
		);
		let (result, _) = futures::join!(pending, async {
			sleep(Duration::from_millis(5)).await;
			shutdown.interrupt("driver closed");
		});
		assert_eq!(result, Err(Error::Cancelled("driver closed".to_string())));

		let cached = get(&cache, "block-1", CacheClass::ContentAddressed, &calls).await;
		assert!(cached.unwrap_err().is_cancelled());
	}
}
