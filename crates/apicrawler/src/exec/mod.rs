use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::client::Client;
use crate::context::{Context, ContextStore, ROOT_CONTEXT};
use crate::jq;
use crate::profile::{EventKind, Profiler};
use crate::stream::Streamer;
use crate::types::{Manifest, Merge, Step};
use crate::Error;

mod foreach;
mod request;

#[cfg(test)]
#[path = "exec_tests.rs"]
mod tests;

/// Drives one crawl: walks the step tree against the context store, issuing
/// requests and iterations, merging results and draining the root sequence
/// into the stream when enabled.
pub(crate) struct Executor {
	pub manifest: Arc<Manifest>,
	pub client: Client,
	pub cancel: CancellationToken,
	pub profiler: Profiler,
	pub streamer: Option<Streamer>,
}

impl Executor {
	pub async fn run(&self) -> Result<Value, Error> {
		let store = ContextStore::new_root(self.manifest.root.initial());
		let root_ev = self.profiler.note(
			EventKind::RootStart,
			None,
			json!({"steps": self.manifest.steps.len()}),
		);
		self
			.execute_steps(&self.manifest.steps, &store, Some(root_ev))
			.await?;
		Ok(store.current().data())
	}

	/// Execute steps in declaration order. Boxed because the step tree
	/// recurses through nested request/forEach bodies.
	pub(crate) fn execute_steps<'a>(
		&'a self,
		steps: &'a [Step],
		store: &'a ContextStore,
		parent: Option<Uuid>,
	) -> BoxFuture<'a, Result<(), Error>> {
		async move {
			for step in steps {
				if self.cancel.is_cancelled() {
					return Err(Error::Cancelled);
				}
				match step {
					Step::Request(step) => self.execute_request(step, store, parent).await?,
					Step::ForEach(step) => self.execute_for_each(step, store, parent).await?,
				}
			}
			Ok(())
		}
		.boxed()
	}

	/// Bind a step's result into its designated target context. Every
	/// strategy runs under the crawl-wide merge lock so parallel iterations
	/// serialize their read-evaluate-write cycles.
	pub(crate) fn apply_merge(
		&self,
		merge: &Merge,
		store: &ContextStore,
		incoming: Value,
		template_ctx: &Map<String, Value>,
		parent: Option<Uuid>,
	) -> Result<(), Error> {
		let _guard = store.merge_lock().lock();
		let target_name = match merge {
			Merge::Noop => {
				return Ok(());
			},
			Merge::On(rule) => {
				let target = store.current();
				merge_with_rule(target, rule, &incoming, template_ctx)?;
				target.name.clone()
			},
			Merge::WithParent(rule) => {
				let target = store
					.parent_of_current()
					.ok_or_else(|| Error::MergeTargetMissing("parent".to_string()))?;
				merge_with_rule(target, rule, &incoming, template_ctx)?;
				target.name.clone()
			},
			Merge::WithContext { name, rule } => {
				let target = store
					.lookup(name)
					.ok_or_else(|| Error::MergeTargetMissing(name.clone()))?;
				merge_with_rule(target, rule, &incoming, template_ctx)?;
				target.name.clone()
			},
			Merge::Default => {
				let target = store.current();
				default_merge(target, incoming);
				target.name.clone()
			},
		};
		self.profiler.note(
			EventKind::ContextMerge,
			parent,
			json!({"target": target_name}),
		);
		Ok(())
	}

	/// Drain the root sequence into the stream and reset it, when streaming
	/// is enabled and the current context sits at a root-scope boundary.
	pub(crate) async fn maybe_stream(
		&self,
		store: &ContextStore,
		max_depth: usize,
		parent: Option<Uuid>,
	) -> Result<(), Error> {
		let Some(streamer) = &self.streamer else {
			return Ok(());
		};
		if store.current().depth > max_depth {
			return Ok(());
		}
		let root = store
			.lookup(ROOT_CONTEXT)
			.expect("root context is always bound");
		let drained = {
			let _guard = store.merge_lock().lock();
			match root.data() {
				Value::Array(items) if !items.is_empty() => {
					root.set_data(Value::Array(Vec::new()));
					items
				},
				_ => Vec::new(),
			}
		};
		for record in drained {
			self
				.profiler
				.note(EventKind::StreamResult, parent, json!({"record": record}));
			streamer.emit(record, &self.cancel).await?;
		}
		Ok(())
	}
}

fn merge_with_rule(
	target: &Arc<Context>,
	rule: &jq::Expression,
	incoming: &Value,
	template_ctx: &Map<String, Value>,
) -> Result<(), Error> {
	let input = target.data();
	let ctx = Value::Object(template_ctx.clone());
	let merged = rule
		.eval_one(&input, &[("$res", incoming), ("$ctx", &ctx)])
		.map_err(|e| match e {
			e @ jq::Error::Cardinality { .. } => Error::Expression(e),
			e => Error::MergeFailed(e),
		})?;
	target.set_data(merged);
	Ok(())
}

/// Default merge: append sequences, overlay mappings, replace anything else.
fn default_merge(target: &Arc<Context>, incoming: Value) {
	let merged = match (target.data(), incoming) {
		(Value::Array(mut current), Value::Array(new)) => {
			current.extend(new);
			Value::Array(current)
		},
		(Value::Object(mut current), Value::Object(new)) => {
			for (key, value) in new {
				current.insert(key, value);
			}
			Value::Object(current)
		},
		// Shape mismatch replaces the target
		(_, incoming) => incoming,
	};
	target.set_data(merged);
}
