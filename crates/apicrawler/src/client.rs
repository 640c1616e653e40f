use bytes::Bytes;
use http::header::{CONTENT_TYPE, COOKIE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use url::Url;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_FORM: &str = "application/x-www-form-urlencoded";

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid url {url:?}: {detail}")]
	InvalidUrl { url: String, detail: String },
	#[error("unsupported content type {0:?} for a request with a body")]
	UnsupportedContentType(String),
	#[error("body encoding failed: {0}")]
	BodyEncoding(String),
	#[error("request build failed: {0}")]
	RequestBuild(String),
	#[error("request failed: {0}")]
	Http(#[from] reqwest::Error),
	#[error("response is not valid JSON: {0}")]
	Decode(#[from] serde_json::Error),
	#[error("request cancelled")]
	Cancelled,
}

/// A request under construction: the paginator, the templates and the
/// authenticator all mutate this before it is handed to the wire client.
#[derive(Debug, Clone)]
pub struct PendingRequest {
	pub method: Method,
	pub url: Url,
	pub headers: HeaderMap,
	pub body: Option<Bytes>,
}

impl PendingRequest {
	pub fn new(method: Method, url: &str) -> Result<PendingRequest, Error> {
		let url = Url::parse(url).map_err(|e| Error::InvalidUrl {
			url: url.to_string(),
			detail: e.to_string(),
		})?;
		Ok(PendingRequest {
			method,
			url,
			headers: HeaderMap::new(),
			body: None,
		})
	}

	pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
		let name = HeaderName::try_from(name).map_err(|e| Error::RequestBuild(e.to_string()))?;
		let value = HeaderValue::try_from(value).map_err(|e| Error::RequestBuild(e.to_string()))?;
		self.headers.insert(name, value);
		Ok(())
	}

	pub fn add_query_pair(&mut self, name: &str, value: &str) {
		self.url.query_pairs_mut().append_pair(name, value);
	}

	/// Add a cookie, preserving any already present on the request.
	pub fn add_cookie(&mut self, name: &str, value: &str) -> Result<(), Error> {
		let pair = format!("{name}={value}");
		let merged = match self.headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
			Some(existing) if !existing.is_empty() => format!("{existing}; {pair}"),
			_ => pair,
		};
		self.headers.insert(
			COOKIE,
			HeaderValue::try_from(merged).map_err(|e| Error::RequestBuild(e.to_string()))?,
		);
		Ok(())
	}

	/// The request's content type, lowercased and stripped of parameters.
	pub fn content_type(&self) -> Option<String> {
		content_type_of(&self.headers)
	}
}

pub fn content_type_of(headers: &HeaderMap) -> Option<String> {
	headers
		.get(CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| {
			v.split(';')
				.next()
				.unwrap_or_default()
				.trim()
				.to_ascii_lowercase()
		})
}

/// Serialize a structured body according to the request's content type.
/// Anything other than JSON or form encoding is rejected when a body exists.
pub fn encode_body(content_type: &str, body: &Map<String, Value>) -> Result<Bytes, Error> {
	match content_type {
		CONTENT_TYPE_JSON => {
			let buf = serde_json::to_vec(body).map_err(|e| Error::BodyEncoding(e.to_string()))?;
			Ok(Bytes::from(buf))
		},
		CONTENT_TYPE_FORM => {
			let pairs = body
				.iter()
				.map(|(k, v)| {
					let flat = match v {
						Value::String(s) => s.clone(),
						Value::Null => String::new(),
						Value::Number(_) | Value::Bool(_) => v.to_string(),
						Value::Array(_) | Value::Object(_) => {
							return Err(Error::BodyEncoding(format!(
								"form field {k:?} is not a scalar"
							)));
						},
					};
					Ok((k.clone(), flat))
				})
				.collect::<Result<Vec<_>, _>>()?;
			let buf =
				serde_urlencoded::to_string(&pairs).map_err(|e| Error::BodyEncoding(e.to_string()))?;
			Ok(Bytes::from(buf))
		},
		other => Err(Error::UnsupportedContentType(other.to_string())),
	}
}

/// A fully buffered response. Buffering keeps the paginator's inspection and
/// the interpreter's JSON decode working from the same bytes.
#[derive(Debug, Clone)]
pub struct HttpResponse {
	pub status: StatusCode,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl HttpResponse {
	/// Decode the body as JSON. An empty body decodes as `null` so that
	/// header-only pagination keeps working against bodyless responses.
	pub fn decode_json(&self) -> Result<Value, Error> {
		if self.body.is_empty() {
			return Ok(Value::Null);
		}
		Ok(serde_json::from_slice(&self.body)?)
	}

	/// Values of every `Set-Cookie` header, parsed into (name, value) pairs.
	pub fn cookies(&self) -> Vec<(String, String)> {
		self
			.headers
			.get_all(http::header::SET_COOKIE)
			.iter()
			.filter_map(|v| v.to_str().ok())
			.filter_map(|raw| cookie::Cookie::parse(raw.to_string()).ok())
			.map(|c| (c.name().to_string(), c.value().to_string()))
			.collect()
	}
}

/// Thin wrapper over the shared connection-pooled client. All crawl traffic,
/// auth logins included, goes through here so cancellation behaves uniformly.
#[derive(Debug, Clone)]
pub struct Client {
	inner: reqwest::Client,
}

impl Client {
	pub fn new(inner: reqwest::Client) -> Client {
		Client { inner }
	}

	pub async fn execute(
		&self,
		req: PendingRequest,
		cancel: &CancellationToken,
	) -> Result<HttpResponse, Error> {
		let mut builder = self.inner.request(req.method, req.url).headers(req.headers);
		if let Some(body) = req.body {
			builder = builder.body(body);
		}
		let resp = tokio::select! {
			_ = cancel.cancelled() => return Err(Error::Cancelled),
			resp = builder.send() => resp?,
		};
		let status = resp.status();
		let headers = resp.headers().clone();
		let body = tokio::select! {
			_ = cancel.cancelled() => return Err(Error::Cancelled),
			body = resp.bytes() => body?,
		};
		Ok(HttpResponse {
			status,
			headers,
			body,
		})
	}
}
