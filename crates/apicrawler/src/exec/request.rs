use std::time::Instant;

use serde_json::{Map, Value, json};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use super::Executor;
use crate::auth::AuthEnv;
use crate::client::{self, CONTENT_TYPE_JSON, PendingRequest};
use crate::context::ContextStore;
use crate::paginate::{PageParams, Paginator};
use crate::profile::EventKind;
use crate::template::{self, Template};
use crate::types::RequestStep;
use crate::Error;

impl Executor {
	pub(super) async fn execute_request(
		&self,
		step: &RequestStep,
		store: &ContextStore,
		parent: Option<Uuid>,
	) -> Result<(), Error> {
		let started = Instant::now();
		let id = self.profiler.start(
			EventKind::RequestStepStart,
			parent,
			json!({"step": step.name}),
		);
		let res = self.request_pages(step, store, Some(id)).await;
		if let Err(e) = &res {
			self
				.profiler
				.note(EventKind::Error, Some(id), json!({"error": e.to_string()}));
		}
		self.profiler.end(
			EventKind::RequestStepEnd,
			id,
			parent,
			started,
			json!({"ok": res.is_ok()}),
		);
		res
	}

	/// The page loop: prepare, issue, advance, decode, transform, recurse,
	/// merge, stream. The paginator decides how many times it spins.
	async fn request_pages(
		&self,
		step: &RequestStep,
		store: &ContextStore,
		parent: Option<Uuid>,
	) -> Result<(), Error> {
		let template_ctx = store.template_context();
		let auth = step.request.auth.as_ref().or(self.manifest.auth.as_ref());
		let mut paginator = Paginator::new(step.request.pagination.clone());
		let mut next = Some(paginator.first());

		while let Some(page) = next.take() {
			if self.cancel.is_cancelled() {
				return Err(Error::Cancelled);
			}
			let page_started = Instant::now();
			let page_ev = self.profiler.start(
				EventKind::RequestPageStart,
				parent,
				json!({"page": paginator.page_num()}),
			);

			let mut req = self.build_page_request(step, &page, &template_ctx, Some(page_ev))?;
			debug!(step = %step.name, page = paginator.page_num(), url = %req.url, "issuing page");
			self.profiler.note(
				EventKind::RequestDetails,
				Some(page_ev),
				json!({"method": req.method.as_str(), "url": req.url.as_str()}),
			);
			if let Some(auth) = auth {
				let env = AuthEnv {
					client: &self.client,
					cancel: &self.cancel,
					profiler: &self.profiler,
					parent: Some(page_ev),
				};
				auth.prepare(&mut req, &env).await?;
			}

			let resp = self.client.execute(req, &self.cancel).await?;
			debug!(step = %step.name, status = resp.status.as_u16(), bytes = resp.body.len(), "page response");
			self.profiler.note(
				EventKind::RequestResponse,
				Some(page_ev),
				json!({"status": resp.status.as_u16(), "bytes": resp.body.len()}),
			);
			// A non-2xx main response is not an error; the body (or null)
			// flows on and stop conditions get to look at it.
			let body = resp.decode_json()?;
			next = paginator.advance(&resp.headers, &body)?;

			let value = match &step.result_transformer {
				Some(transform) => {
					let ctx = Value::Object(template_ctx.clone());
					let out = transform.eval_one(&body, &[("$ctx", &ctx)])?;
					self.profiler.note(
						EventKind::ResponseTransform,
						Some(page_ev),
						json!({"expression": transform.source()}),
					);
					out
				},
				None => body,
			};

			let child_name = step
				.bind_as
				.clone()
				.unwrap_or_else(|| store.current().name.clone());
			let child = store.child(&child_name, value);
			self
				.execute_steps(&step.steps, &child, Some(page_ev))
				.await?;

			// Nested steps may have rewritten the child's data; that final
			// value is what merges upward.
			let incoming = child.current().data();
			self.apply_merge(&step.merge, store, incoming, &template_ctx, Some(page_ev))?;
			self.maybe_stream(store, 0, Some(page_ev)).await?;

			self
				.profiler
				.end(EventKind::RequestPageEnd, page_ev, parent, page_started, Value::Null);
		}
		Ok(())
	}

	fn build_page_request(
		&self,
		step: &RequestStep,
		page: &PageParams,
		template_ctx: &Map<String, Value>,
		parent: Option<Uuid>,
	) -> Result<PendingRequest, Error> {
		let url = match &page.next_page_url {
			Some(next) if !next.is_empty() => next.clone(),
			_ => step.request.url.render(template_ctx)?,
		};
		self
			.profiler
			.note(EventKind::UrlComposition, parent, json!({"url": url}));
		let mut req = PendingRequest::new(step.request.method.clone(), &url)?;
		for (key, value) in &page.query {
			set_query_param(&mut req.url, key, value);
		}

		// Headers apply in priority order: global < request < paginator.
		for (name, template) in &self.manifest.headers {
			req.set_header(name, &template.render(template_ctx)?)?;
		}
		for (name, template) in &step.request.headers {
			req.set_header(name, &template.render(template_ctx)?)?;
		}
		for (name, value) in &page.headers {
			req.set_header(name, value)?;
		}

		let has_body = step.request.body.is_some() || !page.body.is_empty();
		if has_body {
			let content_type = step
				.request
				.content_type
				.clone()
				.unwrap_or_else(|| CONTENT_TYPE_JSON.to_string());
			let mut body = step
				.request
				.body
				.clone()
				.map(|b| render_body_templates(b, template_ctx))
				.transpose()?
				.unwrap_or_default();
			// Paginator body params win over configured fields
			for (key, value) in &page.body {
				body.insert(key.clone(), value.clone());
			}
			req.body = Some(client::encode_body(&content_type, &body)?);
			if req.content_type().is_none() {
				req.set_header("content-type", &content_type)?;
			}
		}
		Ok(req)
	}
}

/// Set a query parameter, replacing any value the rendered URL already had.
fn set_query_param(url: &mut Url, key: &str, value: &str) {
	let kept: Vec<(String, String)> = url
		.query_pairs()
		.filter(|(k, _)| k.as_ref() != key)
		.map(|(k, v)| (k.into_owned(), v.into_owned()))
		.collect();
	{
		let mut pairs = url.query_pairs_mut();
		pairs.clear();
		for (k, v) in kept {
			pairs.append_pair(&k, &v);
		}
		pairs.append_pair(key, value);
	}
}

fn render_body_templates(
	body: Map<String, Value>,
	ctx: &Map<String, Value>,
) -> Result<Map<String, Value>, template::Error> {
	body
		.into_iter()
		.map(|(key, value)| Ok((key, render_body_value(value, ctx)?)))
		.collect()
}

fn render_body_value(value: Value, ctx: &Map<String, Value>) -> Result<Value, template::Error> {
	Ok(match value {
		Value::String(s) => Value::String(Template::parse(&s).render(ctx)?),
		Value::Array(items) => Value::Array(
			items
				.into_iter()
				.map(|v| render_body_value(v, ctx))
				.collect::<Result<_, _>>()?,
		),
		Value::Object(map) => Value::Object(render_body_templates(map, ctx)?),
		other => other,
	})
}
