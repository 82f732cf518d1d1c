//! Transport to the node: JSON over HTTP plus websocket subscriptions.

use async_trait::async_trait;
use mockall::automock;
use reqwest::Url;
use semver::Version;
use serde_json::Value;
use std::fmt;
use tracing::trace;

use crate::{
	configuration::NetConfig,
	error::{Error, Result},
	stream::StreamReader,
};

const VERSION_HEADER: &str = "x-thorest-ver";
const MAX_ERROR_BODY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
	Get,
	Post,
}

impl fmt::Display for Method {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Method::Get => f.write_str("GET"),
			Method::Post => f.write_str("POST"),
		}
	}
}

impl From<Method> for reqwest::Method {
	fn from(method: Method) -> Self {
		match method {
			Method::Get => reqwest::Method::GET,
			Method::Post => reqwest::Method::POST,
		}
	}
}

/// Optional parts of a request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
	pub query: Vec<(String, String)>,
	pub body: Option<Value>,
	pub headers: Vec<(String, String)>,
}

impl Params {
	pub fn query(mut self, name: &str, value: impl ToString) -> Self {
		self.query.push((name.to_string(), value.to_string()));
		self
	}

	pub fn body(mut self, body: Value) -> Self {
		self.body = Some(body);
		self
	}

	pub fn header(mut self, name: &str, value: impl ToString) -> Self {
		self.headers.push((name.to_string(), value.to_string()));
		self
	}
}

#[async_trait]
#[automock]
pub trait Net: Send + Sync {
	fn base_url(&self) -> &str;

	/// Performs a request and returns the JSON decoded response body.
	async fn http(&self, method: Method, path: &str, params: Params) -> Result<Value>;

	/// Opens a reader over a websocket at `path`, relative to the base URL.
	fn open_stream(&self, path: &str) -> Result<StreamReader>;
}

/// [`Net`] over `reqwest`.
pub struct HttpNet {
	client: reqwest::Client,
	base_url: Url,
	min_version: Option<Version>,
}

impl HttpNet {
	pub fn new(config: &NetConfig) -> Result<Self> {
		let base_url = Url::parse(&config.base_url)
			.map_err(|error| Error::InvalidInput(format!("{}: {error}", config.base_url)))?;
		let min_version = config
			.min_node_version
			.as_deref()
			.map(Version::parse)
			.transpose()
			.map_err(|error| Error::InvalidInput(format!("minimum node version: {error}")))?;
		let client = reqwest::Client::builder()
			.timeout(config.request_timeout)
			.build()
			.map_err(|error| Error::InvalidInput(error.to_string()))?;

		Ok(Self {
			client,
			base_url,
			min_version,
		})
	}
}

#[async_trait]
impl Net for HttpNet {
	fn base_url(&self) -> &str {
		self.base_url.as_str()
	}

	async fn http(&self, method: Method, path: &str, params: Params) -> Result<Value> {
		let url = self
			.base_url
			.join(path)
			.map_err(|error| Error::InvalidInput(format!("{method} {path}: {error}")))?;
		trace!(%method, %url, "Sending request");

		let mut request = self.client.request(method.into(), url).query(&params.query);
		for (name, value) in &params.headers {
			request = request.header(name, value);
		}
		if let Some(body) = &params.body {
			request = request.json(body);
		}

		let response = request
			.send()
			.await
			.map_err(|error| Error::Transport(format!("{method} {path}: {error}")))?;

		let status = response.status();
		if !status.is_success() {
			let text = response.text().await.unwrap_or_default();
			return Err(Error::Transport(status_error(
				status.as_u16(),
				method,
				path,
				&text,
			)));
		}

		if let Some(min_version) = &self.min_version {
			let version = response
				.headers()
				.get(VERSION_HEADER)
				.and_then(|value| value.to_str().ok());
			if !version_satisfies(version, min_version) {
				return Err(Error::Transport(format!(
					"{method} {path}: node version too low"
				)));
			}
		}

		let body = response
			.bytes()
			.await
			.map_err(|error| Error::Transport(format!("{method} {path}: {error}")))?;
		serde_json::from_slice(&body).map_err(|error| Error::malformed(format!("{method} {path}"), error))
	}

	fn open_stream(&self, path: &str) -> Result<StreamReader> {
		let url = stream_url(self.base_url.as_str(), path)?;
		Ok(StreamReader::connect(url))
	}
}

/// Formats a failed response as `"{status} {METHOD} {path}: {body}"`.
fn status_error(status: u16, method: Method, path: &str, body: &str) -> String {
	let text = body.trim();
	if text.is_empty() {
		return format!("{status} {method} {path}");
	}
	if text.chars().count() > MAX_ERROR_BODY {
		let truncated = text.chars().take(MAX_ERROR_BODY).collect::<String>();
		return format!("{status} {method} {path}: {truncated}...");
	}
	format!("{status} {method} {path}: {text}")
}

/// A node that does not report its version counts as `0.0.0`.
fn version_satisfies(version: Option<&str>, min_version: &Version) -> bool {
	let version = version
		.and_then(|version| Version::parse(version.trim()).ok())
		.unwrap_or_else(|| Version::new(0, 0, 0));
	version >= *min_version
}

/// Websocket URL of `path`, resolved against `base` with the scheme swapped.
pub fn stream_url(base: &str, path: &str) -> Result<String> {
	let base = if let Some(rest) = strip_scheme(base, "https:") {
		format!("wss:{rest}")
	} else if let Some(rest) = strip_scheme(base, "http:") {
		format!("ws:{rest}")
	} else {
		base.to_string()
	};
	Url::parse(&base)
		.and_then(|base| base.join(path))
		.map(String::from)
		.map_err(|error| Error::InvalidInput(format!("{path}: {error}")))
}

fn strip_scheme<'a>(url: &'a str, scheme: &str) -> Option<&'a str> {
	let prefix = url.get(..scheme.len())?;
	prefix
		.eq_ignore_ascii_case(scheme)
		.then(|| &url[scheme.len()..])
}
