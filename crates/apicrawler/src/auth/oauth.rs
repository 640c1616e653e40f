use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use bytes::Bytes;
use oauth2::basic::BasicClient;
use oauth2::{
	AsyncHttpClient, ClientId, ClientSecret, ResourceOwnerPassword, ResourceOwnerUsername, Scope,
	TokenResponse, TokenUrl,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use super::{AuthEnv, Error, set_sensitive_header};
use crate::client::{self, Client, PendingRequest};
use crate::profile::EventKind;

#[derive(Debug, Clone)]
pub enum Grant {
	Password { username: String, password: String },
	ClientCredentials,
}

struct CachedToken {
	access_token: String,
	expires_at: Option<Instant>,
}

/// OAuth2 authenticator for the password and client-credentials grants.
/// Token fetches go through the shared wire client so they observe the same
/// cancellation and pooling as every other request.
pub struct OAuth2Auth {
	grant: Grant,
	client_id: String,
	client_secret: Option<String>,
	token_url: String,
	scopes: Vec<String>,
	state: tokio::sync::Mutex<Option<CachedToken>>,
}

impl OAuth2Auth {
	pub fn new(
		grant: Grant,
		client_id: String,
		client_secret: Option<String>,
		token_url: String,
		scopes: Vec<String>,
	) -> OAuth2Auth {
		OAuth2Auth {
			grant,
			client_id,
			client_secret,
			token_url,
			scopes,
			state: tokio::sync::Mutex::new(None),
		}
	}

	pub(super) async fn apply(
		&self,
		req: &mut PendingRequest,
		env: &AuthEnv<'_>,
	) -> Result<(), Error> {
		let mut state = self.state.lock().await;
		let token = match state.as_ref() {
			Some(t) if t.expires_at.is_none_or(|at| Instant::now() < at) => {
				env
					.profiler
					.note(EventKind::AuthCached, env.parent, Value::Null);
				t.access_token.clone()
			},
			_ => {
				let fetched = self.fetch(env).await?;
				let token = fetched.access_token.clone();
				*state = Some(fetched);
				token
			},
		};
		drop(state);
		env.profiler.note(
			EventKind::AuthTokenInject,
			env.parent,
			json!({"into": "bearer"}),
		);
		set_sensitive_header(req, "authorization", &format!("Bearer {token}"))
	}

	async fn fetch(&self, env: &AuthEnv<'_>) -> Result<CachedToken, Error> {
		let started = Instant::now();
		let id = env.profiler.start(
			EventKind::AuthLoginStart,
			env.parent,
			json!({"tokenUrl": self.token_url}),
		);
		let token_url = TokenUrl::new(self.token_url.clone())
			.map_err(|e| Error::InvalidConfig(format!("token url: {e}")))?;
		let mut oauth = BasicClient::new(ClientId::new(self.client_id.clone()));
		if let Some(secret) = &self.client_secret {
			oauth = oauth.set_client_secret(ClientSecret::new(secret.clone()));
		}
		let oauth = oauth.set_token_uri(token_url);
		let http = Adapter {
			client: env.client.clone(),
			cancel: env.cancel.clone(),
		};
		let result = match &self.grant {
			Grant::Password { username, password } => {
				let username = ResourceOwnerUsername::new(username.clone());
				let password = ResourceOwnerPassword::new(password.clone());
				let mut exchange = oauth.exchange_password(&username, &password);
				for scope in &self.scopes {
					exchange = exchange.add_scope(Scope::new(scope.clone()));
				}
				exchange.request_async(&http).await
			},
			Grant::ClientCredentials => {
				let mut exchange = oauth.exchange_client_credentials();
				for scope in &self.scopes {
					exchange = exchange.add_scope(Scope::new(scope.clone()));
				}
				exchange.request_async(&http).await
			},
		};
		let resp = result.map_err(|e| match &e {
			oauth2::RequestTokenError::Request(client::Error::Cancelled) => Error::Cancelled,
			_ => Error::TokenRequest(e.to_string()),
		})?;
		env
			.profiler
			.end(EventKind::AuthLoginEnd, id, env.parent, started, Value::Null);
		Ok(CachedToken {
			access_token: resp.access_token().secret().clone(),
			expires_at: resp.expires_in().map(|ttl| Instant::now() + ttl),
		})
	}
}

/// Bridges the oauth2 crate onto the crawl's own client, so token requests
/// share its pool and respond to cancellation.
struct Adapter {
	client: Client,
	cancel: CancellationToken,
}

impl<'c> AsyncHttpClient<'c> for Adapter {
	type Error = client::Error;
	type Future = Pin<Box<dyn Future<Output = Result<oauth2::HttpResponse, Self::Error>> + Send + 'c>>;

	fn call(&'c self, request: oauth2::HttpRequest) -> Self::Future {
		Box::pin(async move {
			let (parts, body) = request.into_parts();
			let mut pending = PendingRequest::new(parts.method, &parts.uri.to_string())?;
			pending.headers = parts.headers;
			if !body.is_empty() {
				pending.body = Some(Bytes::from(body));
			}
			let resp = self.client.execute(pending, &self.cancel).await?;
			let mut builder = http::Response::builder().status(resp.status);
			if let Some(headers) = builder.headers_mut() {
				*headers = resp.headers;
			}
			builder
				.body(resp.body.to_vec())
				.map_err(|e| client::Error::RequestBuild(e.to_string()))
		})
	}
}
