use clap::{command, Parser};
use tracing::Level;

#[derive(Parser)]
#[command(version)]
pub struct CliOpts {
	/// Path to the toml configuration file
	#[arg(short, long, value_name = "FILE")]
	pub config: Option<String>,
	/// Thor node API URL, e.g. http://127.0.0.1:8669/
	#[arg(short, long)]
	pub url: Option<String>,
	/// Log level
	#[arg(long)]
	pub verbosity: Option<Level>,
	/// Set logs format to JSON
	#[arg(long)]
	pub logs_json: bool,
	/// Port to host the driver bridge on (default: bridge disabled)
	#[arg(long)]
	pub bridge_port: Option<u16>,
}
