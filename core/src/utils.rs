use crate::shutdown::Controller;
use color_eyre::Result;
use futures::Future;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, Instrument, Level, Subscriber};
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt::format, EnvFilter, FmtSubscriber};

pub fn spawn_in_span<F>(future: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tokio::spawn(future.in_current_span())
}

pub fn install_panic_hooks(shutdown: Controller) -> Result<()> {
	// initialize color-eyre hooks
	let (panic_hook, eyre_hook) = color_eyre::config::HookBuilder::default()
		.display_location_section(true)
		.display_env_section(true)
		.into_hooks();

	// install hook as global handler
	eyre_hook.install()?;

	std::panic::set_hook(Box::new(move |panic_info| {
		// interrupt the driver so pending operations unwind
		shutdown.interrupt("Panic occurred, shutting down");

		let msg = format!("{}", panic_hook.panic_report(panic_info));
		error!("Error: {}", strip_ansi_escapes::strip_str(msg));
	}));
	Ok(())
}

fn env_filter(log_level: Level) -> EnvFilter {
	EnvFilter::new(format!("thor_driver={log_level},warn"))
}

pub fn json_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.json()
		.with_env_filter(env_filter(log_level))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}

pub fn default_subscriber(log_level: Level) -> impl Subscriber + Send + Sync {
	FmtSubscriber::builder()
		.with_env_filter(env_filter(log_level))
		.with_span_events(format::FmtSpan::CLOSE)
		.finish()
		.with(ErrorLayer::default())
}

pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
	let mut out = [0u8; 32];
	out.copy_from_slice(
		blake2b_simd::Params::new()
			.hash_length(32)
			.hash(data)
			.as_bytes(),
	);
	out
}

/// Deterministic cache key of a query's full argument set.
///
/// Keys are `{prefix}-{hex blake2b-256 of the JSON form}`; struct fields serialize
/// in declaration order and `serde_json` maps are sorted, so equal arguments give equal keys.
pub fn content_key(prefix: &str, args: &impl Serialize) -> String {
	// serializing plain data into a Vec cannot fail
	let json = serde_json::to_vec(args).unwrap_or_default();
	format!("{prefix}-{}", hex::encode(blake2b_256(&json)))
}

/// Random bytes for transaction nonces.
pub fn random_bytes<const N: usize>() -> [u8; N] {
	use rand::RngCore;
	let mut bytes = [0u8; N];
	rand::thread_rng().fill_bytes(&mut bytes);
	bytes
}
