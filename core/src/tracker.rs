//! Head tracking.
//!
//! The tracker polls the node's best block until the local head is nearly synced,
//! then subscribes to the beat stream anchored at the head's parent. Stream failures
//! fall back to polling. The loop runs until the cancellation scope is interrupted.

use std::{
	sync::Arc,
	time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::{
	bloom::Bloom,
	configuration::DriverConfig,
	error::{Error, Result},
	net::{Method, Net, Params},
	shutdown::{Cancelled, Controller},
	state::SharedState,
	stream::StreamReader,
	types::{Beat, Block, Head, GENESIS_HEADER},
};

enum Mode {
	Polling { fresh_polls: u32 },
	Streaming(StreamReader),
}

#[derive(Clone)]
pub struct HeadTracker {
	state: SharedState,
	net: Arc<dyn Net>,
	shutdown: Controller,
	config: DriverConfig,
	genesis_id: String,
}

impl HeadTracker {
	pub(crate) fn new(
		state: SharedState,
		net: Arc<dyn Net>,
		shutdown: Controller,
		config: DriverConfig,
		genesis_id: String,
	) -> Self {
		Self {
			state,
			net,
			shutdown,
			config,
			genesis_id,
		}
	}

	pub fn head(&self) -> Head {
		self.state.lock().head.clone()
	}

	/// Resolves with the next accepted head.
	///
	/// Heads published before the call are not observed.
	pub async fn wait_for_head(&self) -> Result<Head> {
		let receiver = self.state.lock().wait_for_head();

		self.shutdown
			.with_cancel(receiver)
			.await?
			// waiters are only dropped along with the driver
			.map_err(|_| Error::Cancelled("driver dropped".to_string()))
	}

	/// Accepts `head` if it is ahead of the current one, invalidating the cache.
	pub fn publish(&self, head: Head, hint: Option<&Bloom>) -> bool {
		self.state.lock().advance(head, hint)
	}

	pub async fn run(self) {
		info!(head = %self.head(), "Starting head tracker");
		let mut mode = Mode::Polling { fresh_polls: 0 };

		loop {
			let next = match mode {
				Mode::Polling { fresh_polls } => self.poll(fresh_polls).await,
				Mode::Streaming(reader) => self.read_beat(reader).await,
			};
			match next {
				Ok(next) => mode = next,
				Err(Cancelled { reason }) => {
					info!(%reason, "Head tracker stopped");
					return;
				},
			}
		}
	}

	async fn poll(&self, mut fresh_polls: u32) -> std::result::Result<Mode, Cancelled> {
		match self.shutdown.with_cancel(self.best_block()).await? {
			Ok(best) => {
				self.publish(best.head(), None);

				if self.is_nearly_synced() {
					fresh_polls += 1;
					if fresh_polls > self.config.stream_debounce {
						fresh_polls = 0;
						match self.subscribe() {
							Ok(reader) => return Ok(Mode::Streaming(reader)),
							Err(error) => warn!(%error, "Cannot subscribe to beats"),
						}
					}
				} else {
					fresh_polls = 0;
				}
			},
			Err(error) => warn!(%error, "Cannot fetch best block"),
		}

		self.shutdown
			.with_cancel(sleep(self.config.poll_interval))
			.await?;
		Ok(Mode::Polling { fresh_polls })
	}

	async fn read_beat(&self, reader: StreamReader) -> std::result::Result<Mode, Cancelled> {
		let message = match self.shutdown.with_cancel(reader.read()).await {
			Ok(message) => message,
			Err(cancelled) => {
				reader.close();
				return Err(cancelled);
			},
		};

		let beat = message.and_then(|message| {
			serde_json::from_value::<Beat>(message)
				.map_err(|error| Error::StreamTerminal(format!("malformed beat: {error}")))
		});

		match beat {
			Ok(beat) if beat.obsolete => {
				trace!(number = beat.number, id = %beat.id, "Ignoring obsolete beat");
			},
			Ok(beat) => {
				self.publish(beat.head(), Some(&beat.bloom()));
			},
			Err(error) => {
				warn!(%error, "Beat stream failed, falling back to polling");
				reader.close();
				return Ok(Mode::Polling { fresh_polls: 0 });
			},
		}
		Ok(Mode::Streaming(reader))
	}

	async fn best_block(&self) -> Result<Block> {
		let params = Params::default().header(GENESIS_HEADER, &self.genesis_id);
		let best = self.net.http(Method::Get, "blocks/best", params).await?;
		serde_json::from_value(best).map_err(|error| Error::malformed("GET blocks/best", error))
	}

	fn subscribe(&self) -> Result<StreamReader> {
		let path = format!("subscriptions/beat?pos={}", self.head().parent_id);
		debug!(%path, "Subscribing to beats");
		self.net.open_stream(&path)
	}

	fn is_nearly_synced(&self) -> bool {
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs();
		let age = Duration::from_secs(now.saturating_sub(self.head().timestamp));
		age < self.config.freshness_window
	}
}

#[cfg(test)]
mod tests {
	use super::HeadTracker;
	use crate::{
		bloom,
		cache::{CacheClass, ResponseCache},
		configuration::DriverConfig,
		error::{Error, Result},
		net::{MockNet, Net},
		shutdown::Controller,
		state::{self, SharedState},
		stream::StreamReader,
		types::Head,
	};
	use serde_json::{json, Value};
	use std::{
		sync::{
			atomic::{AtomicUsize, Ordering},
			Arc,
		},
		time::{Duration, SystemTime, UNIX_EPOCH},
	};
	use tokio::{sync::mpsc, time::timeout};
	use tokio_stream::wrappers::UnboundedReceiverStream;

	type BeatSender = mpsc::UnboundedSender<Result<String>>;

	const DEAD: &str = "0xDEAD";

	fn now() -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap()
			.as_secs()
	}

	fn head(id: &str, number: u32) -> Head {
		Head {
			id: id.to_string(),
			number,
			timestamp: now(),
			parent_id: format!("{id}-parent"),
			txs_features: None,
		}
	}

	fn block(head: &Head) -> Value {
		json!({
			"id": head.id,
			"number": head.number,
			"parentID": head.parent_id,
			"timestamp": head.timestamp,
		})
	}

	fn beat(head: &Head, tokens: &[&str], obsolete: bool) -> Result<String> {
		let filter = bloom::build(5, 64, tokens);
		Ok(json!({
			"id": head.id,
			"number": head.number,
			"parentID": head.parent_id,
			"timestamp": head.timestamp,
			"bloom": format!("0x{}", hex::encode(filter.bits())),
			"k": filter.k(),
			"obsolete": obsolete,
		})
		.to_string())
	}

	fn config(stream_debounce: u32) -> DriverConfig {
		DriverConfig {
			poll_interval: Duration::from_millis(5),
			stream_debounce,
			..Default::default()
		}
	}

	/// Node whose best block is always `best`, handing every opened stream to the test.
	fn node(
		best: Head,
		polls: Arc<AtomicUsize>,
	) -> (MockNet, mpsc::UnboundedReceiver<BeatSender>) {
		let (streams, opened) = mpsc::unbounded_channel();
		let mut net = MockNet::new();
		net.expect_http().returning(move |_, path, params| {
			assert_eq!(path, "blocks/best");
			assert_eq!(params.headers, vec![("x-genesis-id".to_string(), "0xgenesis".to_string())]);
			polls.fetch_add(1, Ordering::SeqCst);
			let best = block(&best);
			Box::pin(async move { Ok(best) })
		});
		net.expect_open_stream().returning(move |path| {
			assert!(path.starts_with("subscriptions/beat?pos="));
			let (sender, receiver) = mpsc::unbounded_channel();
			streams.send(sender).unwrap();
			Ok(StreamReader::from_stream(UnboundedReceiverStream::new(receiver)))
		});
		(net, opened)
	}

	fn tracker(initial: Head, net: impl Net + 'static, config: DriverConfig) -> (SharedState, HeadTracker) {
		let state = state::shared(initial, 16, 16);
		let tracker = HeadTracker::new(
			state.clone(),
			Arc::new(net),
			Controller::new(),
			config,
			"0xgenesis".to_string(),
		);
		(state, tracker)
	}

	#[tokio::test]
	async fn switches_to_stream_after_debounce_and_back_on_failure() {
		let a = head("0xaa", 10);
		let polls = Arc::new(AtomicUsize::new(0));
		let (net, mut opened) = node(a.clone(), polls.clone());
		let (_, tracker) = tracker(a, net, config(3));
		tokio::spawn(tracker.clone().run());

		let stream = timeout(Duration::from_secs(1), opened.recv())
			.await
			.unwrap()
			.unwrap();
		// three nearly synced polls, streaming on the fourth
		assert_eq!(polls.load(Ordering::SeqCst), 4);

		stream
			.send(Err(Error::StreamTerminal("connection reset".to_string())))
			.unwrap();

		// polling resumes and debounces again before the next subscription
		let _stream = timeout(Duration::from_secs(1), opened.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(polls.load(Ordering::SeqCst), 8);
	}

	#[tokio::test]
	async fn beats_advance_head_and_evict_touched_entries() {
		let a = head("0xaa", 10);
		let (net, mut opened) = node(a.clone(), Arc::new(AtomicUsize::new(0)));
		let (state, tracker) = tracker(a, net, config(0));
		let cache = ResponseCache::new(state.clone(), Controller::new());
		tokio::spawn(tracker.clone().run());

		let stream = timeout(Duration::from_secs(1), opened.recv())
			.await
			.unwrap()
			.unwrap();

		let class = CacheClass::tied(DEAD, Vec::<String>::new());
		cache
			.get(DEAD.to_string(), class, "0xaa".to_string(), async {
				Ok(json!({ "balance": "0x0" }))
			})
			.await
			.unwrap();
		assert_eq!(state.lock().entries.len(), (0, 1));

		let b = head("0xbb", 11);
		let next = tokio::spawn({
			let tracker = tracker.clone();
			async move { tracker.wait_for_head().await }
		});
		tokio::task::yield_now().await;
		stream.send(beat(&b, &[DEAD], false)).unwrap();
		assert_eq!(timeout(Duration::from_secs(1), next).await.unwrap().unwrap(), Ok(b.clone()));
		assert_eq!(state.lock().entries.len(), (0, 0));

		// obsolete beats are skipped, the following one is taken
		let c = head("0xcc", 11);
		let d = head("0xdd", 12);
		let next = tokio::spawn({
			let tracker = tracker.clone();
			async move { tracker.wait_for_head().await }
		});
		tokio::task::yield_now().await;
		stream.send(beat(&c, &[], true)).unwrap();
		stream.send(beat(&d, &[], false)).unwrap();
		assert_eq!(timeout(Duration::from_secs(1), next).await.unwrap().unwrap(), Ok(d.clone()));
		assert_eq!(tracker.head(), d);
	}

	#[tokio::test]
	async fn stale_and_repeated_beats_are_rejected() {
		let a = head("0xaa", 10);
		let (_, tracker) = tracker(a.clone(), MockNet::new(), config(0));

		assert!(!tracker.publish(head("0xaa", 11), None));
		assert!(!tracker.publish(head("0x99", 9), None));
		assert_eq!(tracker.head(), a);
		assert!(tracker.publish(head("0xbb", 10), None));
	}

	#[tokio::test]
	async fn polling_survives_transport_errors() {
		let a = head("0xaa", 10);
		let b = head("0xbb", 11);
		let calls = Arc::new(AtomicUsize::new(0));
		let mut net = MockNet::new();
		net.expect_http().returning({
			let calls = calls.clone();
			move |_, _, _| {
				let b = block(&b);
				let call = calls.fetch_add(1, Ordering::SeqCst);
				Box::pin(async move {
					match call {
						0 | 1 => Err(Error::Transport("GET blocks/best: connection refused".to_string())),
						_ => Ok(b),
					}
				})
			}
		});
		// a stale head never qualifies for streaming
		let mut stale = a.clone();
		stale.timestamp = 0;
		let (_, tracker) = tracker(stale, net, config(3));
		tokio::spawn(tracker.clone().run());

		let next = timeout(Duration::from_secs(1), tracker.wait_for_head())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(next.id, "0xbb");
		assert!(calls.load(Ordering::SeqCst) >= 3);
	}

	#[tokio::test]
	async fn interrupt_stops_loop_and_waiters() {
		let a = head("0xaa", 10);
		let polls = Arc::new(AtomicUsize::new(0));
		let (net, _opened) = node(a.clone(), polls.clone());
		let shutdown = Controller::new();
		let state = state::shared(a, 16, 16);
		let tracker = HeadTracker::new(
			state,
			Arc::new(net),
			shutdown.clone(),
			DriverConfig {
				poll_interval: Duration::from_millis(5),
				stream_debounce: 1000,
				..Default::default()
			},
			"0xgenesis".to_string(),
		);
		let run = tokio::spawn(tracker.clone().run());
		let waiter = tokio::spawn({
			let tracker = tracker.clone();
			async move { tracker.wait_for_head().await }
		});

		tokio::time::sleep(Duration::from_millis(20)).await;
		shutdown.interrupt("driver closed");

		timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
		assert_eq!(
			waiter.await.unwrap(),
			Err(Error::Cancelled("driver closed".to_string()))
		);
		let stopped_at = polls.load(Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(20)).await;
		assert_eq!(polls.load(Ordering::SeqCst), stopped_at);
		assert!(tracker.wait_for_head().await.unwrap_err().is_cancelled());
	}
}
