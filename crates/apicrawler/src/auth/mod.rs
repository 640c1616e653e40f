use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{HeaderValue, Method, StatusCode};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::{self, Client, HttpResponse, PendingRequest};
use crate::jq;
use crate::profile::{EventKind, Profiler};

mod oauth;
pub use oauth::{Grant, OAuth2Auth};

#[cfg(test)]
#[path = "auth_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("login failed with status {0}")]
	LoginFailed(StatusCode),
	#[error("login request failed: {0}")]
	LoginRequest(String),
	#[error("extraction via {selector:?} failed: {detail}")]
	Extraction { selector: String, detail: String },
	#[error("invalid auth config: {0}")]
	InvalidConfig(String),
	#[error("cannot inject credential into {0:?}")]
	UnsupportedInjection(String),
	#[error("token request failed: {0}")]
	TokenRequest(String),
	#[error("login cancelled")]
	Cancelled,
}

/// Everything an authenticator needs from the surrounding crawl: the shared
/// wire client for login sub-requests, the cancellation token and the
/// profiler scope to hang AUTH_* events off.
pub struct AuthEnv<'a> {
	pub client: &'a Client,
	pub cancel: &'a CancellationToken,
	pub profiler: &'a Profiler,
	pub parent: Option<Uuid>,
}

/// Polymorphic credential provider. Stateless variants only stamp headers;
/// the login-driven ones cache their credential behind a mutex so refreshes
/// are serialized per instance.
pub enum Authenticator {
	None,
	Basic { username: String, password: String },
	Bearer { token: String },
	OAuth2(OAuth2Auth),
	Cookie(LoginAuth),
	Jwt(LoginAuth),
	Custom(LoginAuth),
}

impl Debug for Authenticator {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			Authenticator::None => "None",
			Authenticator::Basic { .. } => "Basic",
			Authenticator::Bearer { .. } => "Bearer",
			Authenticator::OAuth2(_) => "OAuth2",
			Authenticator::Cookie(_) => "Cookie",
			Authenticator::Jwt(_) => "Jwt",
			Authenticator::Custom(_) => "Custom",
		};
		f.debug_struct("Authenticator").field("kind", &name).finish()
	}
}

impl Authenticator {
	/// Mutate the outgoing request to carry credentials, running (or reusing)
	/// the login flow for the stateful variants.
	pub async fn prepare(&self, req: &mut PendingRequest, env: &AuthEnv<'_>) -> Result<(), Error> {
		if matches!(self, Authenticator::None) {
			return Ok(());
		}
		let started = Instant::now();
		let id = env
			.profiler
			.start(EventKind::AuthStart, env.parent, json!({"kind": format!("{self:?}")}));
		let scoped = AuthEnv {
			parent: Some(id),
			..*env
		};
		let res = match self {
			Authenticator::None => Ok(()),
			Authenticator::Basic { username, password } => {
				let creds = base64_basic(username, password);
				set_sensitive_header(req, "authorization", &format!("Basic {creds}"))
			},
			Authenticator::Bearer { token } => {
				set_sensitive_header(req, "authorization", &format!("Bearer {token}"))
			},
			Authenticator::OAuth2(oauth) => oauth.apply(req, &scoped).await,
			Authenticator::Cookie(login) | Authenticator::Jwt(login) | Authenticator::Custom(login) => {
				login.apply(req, &scoped).await
			},
		};
		env
			.profiler
			.end(EventKind::AuthEnd, id, env.parent, started, json!({"ok": res.is_ok()}));
		res
	}
}

/// Where to pull the credential out of the login response.
#[derive(Debug, Clone)]
pub enum Extract {
	Cookie(String),
	Header(String),
	Body(Arc<jq::Expression>),
}

impl Extract {
	fn describe(&self) -> String {
		match self {
			Extract::Cookie(name) => format!("cookie:{name}"),
			Extract::Header(name) => format!("header:{name}"),
			Extract::Body(expr) => format!("body:{}", expr.source()),
		}
	}
}

/// Where to put the credential on outgoing requests.
#[derive(Debug, Clone)]
pub enum Inject {
	Cookie(String),
	Header(String),
	Bearer,
	Query(String),
}

/// The single login sub-request a stateful authenticator issues. Mirrors a
/// plain request step without templating or pagination.
#[derive(Debug, Clone)]
pub struct LoginRequest {
	pub url: String,
	pub method: Method,
	pub headers: Vec<(String, String)>,
	pub body: Option<Map<String, Value>>,
}

struct Credential {
	value: String,
	acquired_at: Instant,
}

/// Login-flow authenticator backing the cookie, jwt and custom variants.
pub struct LoginAuth {
	login: LoginRequest,
	extract: Extract,
	inject: Inject,
	// None means the credential never goes stale
	max_age: Option<Duration>,
	one_per_run: bool,
	state: tokio::sync::Mutex<Option<Credential>>,
}

impl LoginAuth {
	pub fn new(
		login: LoginRequest,
		extract: Extract,
		inject: Inject,
		max_age_seconds: u64,
		one_per_run: bool,
	) -> LoginAuth {
		LoginAuth {
			login,
			extract,
			inject,
			max_age: (max_age_seconds > 0).then(|| Duration::from_secs(max_age_seconds)),
			one_per_run,
			state: tokio::sync::Mutex::new(None),
		}
	}

	async fn apply(&self, req: &mut PendingRequest, env: &AuthEnv<'_>) -> Result<(), Error> {
		// The lock is held across the login sub-request: concurrent callers
		// wait for the first login instead of racing their own.
		let mut state = self.state.lock().await;
		let value = match state.as_ref() {
			Some(cred) if self.still_fresh(cred) => {
				env
					.profiler
					.note(EventKind::AuthCached, env.parent, Value::Null);
				cred.value.clone()
			},
			_ => {
				let value = self.login(env).await?;
				*state = Some(Credential {
					value: value.clone(),
					acquired_at: Instant::now(),
				});
				value
			},
		};
		drop(state);
		env.profiler.note(
			EventKind::AuthTokenInject,
			env.parent,
			json!({"into": format!("{:?}", self.inject)}),
		);
		inject(req, &self.inject, &value)
	}

	fn still_fresh(&self, cred: &Credential) -> bool {
		if self.one_per_run {
			return true;
		}
		match self.max_age {
			None => true,
			Some(max_age) => cred.acquired_at.elapsed() <= max_age,
		}
	}

	async fn login(&self, env: &AuthEnv<'_>) -> Result<String, Error> {
		let started = Instant::now();
		let id = env.profiler.start(
			EventKind::AuthLoginStart,
			env.parent,
			json!({"url": self.login.url}),
		);
		let mut req = PendingRequest::new(self.login.method.clone(), &self.login.url)
			.map_err(|e| Error::LoginRequest(e.to_string()))?;
		for (name, value) in &self.login.headers {
			req
				.set_header(name, value)
				.map_err(|e| Error::LoginRequest(e.to_string()))?;
		}
		if let Some(body) = &self.login.body {
			let content_type = req.content_type().ok_or_else(|| {
				Error::InvalidConfig("login request with a body needs a content-type header".to_string())
			})?;
			let encoded = client::encode_body(&content_type, body).map_err(|e| match e {
				client::Error::UnsupportedContentType(t) => {
					Error::InvalidConfig(format!("login content type {t:?} is not supported"))
				},
				e => Error::LoginRequest(e.to_string()),
			})?;
			req.body = Some(encoded);
		}
		let resp = env.client.execute(req, env.cancel).await.map_err(|e| match e {
			client::Error::Cancelled => Error::Cancelled,
			e => Error::LoginRequest(e.to_string()),
		})?;
		if !resp.status.is_success() {
			return Err(Error::LoginFailed(resp.status));
		}
		let value = extract(&self.extract, &resp)?;
		env.profiler.note(
			EventKind::AuthTokenExtract,
			env.parent,
			json!({"from": self.extract.describe()}),
		);
		env
			.profiler
			.end(EventKind::AuthLoginEnd, id, env.parent, started, json!({"status": resp.status.as_u16()}));
		Ok(value)
	}
}

fn extract(extract: &Extract, resp: &HttpResponse) -> Result<String, Error> {
	match extract {
		Extract::Cookie(name) => resp
			.cookies()
			.into_iter()
			.find(|(n, _)| n == name)
			.map(|(_, v)| v)
			.ok_or_else(|| Error::Extraction {
				selector: extract.describe(),
				detail: "cookie not present in login response".to_string(),
			}),
		Extract::Header(name) => resp
			.headers
			.get(name.as_str())
			.and_then(|v| v.to_str().ok())
			.map(|s| s.to_string())
			.ok_or_else(|| Error::Extraction {
				selector: extract.describe(),
				detail: "header not present in login response".to_string(),
			}),
		Extract::Body(expr) => {
			let body = resp.decode_json().map_err(|e| Error::Extraction {
				selector: extract.describe(),
				detail: e.to_string(),
			})?;
			let value = expr.eval_one(&body, &[]).map_err(|e| Error::Extraction {
				selector: extract.describe(),
				detail: e.to_string(),
			})?;
			match value {
				Value::String(s) => Ok(s),
				other => Err(Error::Extraction {
					selector: extract.describe(),
					detail: format!("expected a string token, got {}", jq::type_name(&other)),
				}),
			}
		},
	}
}

fn inject(req: &mut PendingRequest, inject: &Inject, value: &str) -> Result<(), Error> {
	match inject {
		Inject::Bearer => set_sensitive_header(req, "authorization", &format!("Bearer {value}")),
		Inject::Header(name) => set_sensitive_header(req, name, value),
		Inject::Cookie(name) => req
			.add_cookie(name, value)
			.map_err(|e| Error::UnsupportedInjection(e.to_string())),
		Inject::Query(name) => {
			req.add_query_pair(name, value);
			Ok(())
		},
	}
}

fn set_sensitive_header(req: &mut PendingRequest, name: &str, value: &str) -> Result<(), Error> {
	let name = http::HeaderName::try_from(name)
		.map_err(|e| Error::UnsupportedInjection(e.to_string()))?;
	let mut value =
		HeaderValue::try_from(value).map_err(|e| Error::UnsupportedInjection(e.to_string()))?;
	value.set_sensitive(true);
	req.headers.insert(name, value);
	Ok(())
}

fn base64_basic(username: &str, password: &str) -> String {
	use base64::Engine;
	base64::engine::general_purpose::STANDARD.encode(format!("{username}:{password}"))
}
