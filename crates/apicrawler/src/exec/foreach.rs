use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::debug;
use uuid::Uuid;

use super::Executor;
use crate::context::ContextStore;
use crate::jq;
use crate::profile::EventKind;
use crate::types::{ForEachStep, ItemSource, Merge, RateLimit};
use crate::Error;

impl Executor {
	pub(super) async fn execute_for_each(
		&self,
		step: &ForEachStep,
		store: &ContextStore,
		parent: Option<Uuid>,
	) -> Result<(), Error> {
		let started = Instant::now();
		let id = self.profiler.start(
			EventKind::ForEachStepStart,
			parent,
			json!({"step": step.name}),
		);
		let res = self.for_each_items(step, store, Some(id)).await;
		if let Err(e) = &res {
			self
				.profiler
				.note(EventKind::Error, Some(id), json!({"error": e.to_string()}));
		}
		self.profiler.end(
			EventKind::ForEachStepEnd,
			id,
			parent,
			started,
			json!({"ok": res.is_ok()}),
		);
		res
	}

	async fn for_each_items(
		&self,
		step: &ForEachStep,
		store: &ContextStore,
		parent: Option<Uuid>,
	) -> Result<(), Error> {
		let template_ctx = store.template_context();
		let items = extract_items(step, store)?;
		debug!(step = %step.name, items = items.len(), parallel = step.parallel, "iterating");
		self.profiler.note(
			EventKind::ItemSelection,
			parent,
			json!({"count": items.len()}),
		);

		let results = if step.parallel && items.len() > 1 {
			self.iterate_parallel(step, store, items, parent).await?
		} else {
			self.iterate_serial(step, store, items, parent).await?
		};
		let aggregated = Value::Array(results);

		match &step.merge {
			Merge::Default => self.apply_default_patch(step, store, &aggregated)?,
			custom => self.apply_merge(custom, store, aggregated, &template_ctx, parent)?,
		}
		self.maybe_stream(store, 1, parent).await?;
		Ok(())
	}

	/// Without a directive, the extracted location is patched with the new
	/// array. Literal-values loops have no location and merge nothing.
	fn apply_default_patch(
		&self,
		step: &ForEachStep,
		store: &ContextStore,
		aggregated: &Value,
	) -> Result<(), Error> {
		let ItemSource::Path { patch, .. } = &step.items else {
			return Ok(());
		};
		let _guard = store.merge_lock().lock();
		let target = store.current();
		let patched = patch
			.eval_one(&target.data(), &[("$new", aggregated)])
			.map_err(|e| match e {
				e @ jq::Error::Cardinality { .. } => Error::Expression(e),
				e => Error::MergeFailed(e),
			})?;
		target.set_data(patched);
		Ok(())
	}

	async fn iterate_serial(
		&self,
		step: &ForEachStep,
		store: &ContextStore,
		items: Vec<Value>,
		parent: Option<Uuid>,
	) -> Result<Vec<Value>, Error> {
		let limiter = make_limiter(step.rate_limit);
		let mut results = Vec::with_capacity(items.len());
		for (index, item) in items.into_iter().enumerate() {
			results.push(
				self
					.run_iteration(step, store, item, index, limiter.as_deref(), parent)
					.await?,
			);
		}
		Ok(results)
	}

	/// Bounded-parallel iteration: a semaphore caps in-flight work while
	/// `try_join_all` keeps results in iteration-index order regardless of
	/// completion order.
	async fn iterate_parallel(
		&self,
		step: &ForEachStep,
		store: &ContextStore,
		items: Vec<Value>,
		parent: Option<Uuid>,
	) -> Result<Vec<Value>, Error> {
		self.profiler.note(
			EventKind::ParallelismSetup,
			parent,
			json!({"maxConcurrency": step.max_concurrency, "items": items.len()}),
		);
		let semaphore = Arc::new(Semaphore::new(step.max_concurrency));
		let limiter = make_limiter(step.rate_limit);
		let iterations = items.into_iter().enumerate().map(|(index, item)| {
			let semaphore = semaphore.clone();
			let limiter = limiter.clone();
			async move {
				let _permit = semaphore
					.acquire()
					.await
					.map_err(|_| Error::Cancelled)?;
				self
					.run_iteration(step, store, item, index, limiter.as_deref(), parent)
					.await
			}
		});
		futures::future::try_join_all(iterations).await
	}

	async fn run_iteration(
		&self,
		step: &ForEachStep,
		store: &ContextStore,
		item: Value,
		index: usize,
		limiter: Option<&DefaultDirectRateLimiter>,
		parent: Option<Uuid>,
	) -> Result<Value, Error> {
		if self.cancel.is_cancelled() {
			return Err(Error::Cancelled);
		}
		if let Some(limiter) = limiter {
			tokio::select! {
				_ = self.cancel.cancelled() => return Err(Error::Cancelled),
				_ = limiter.until_ready() => {},
			}
		}
		self.profiler.note_worker(
			EventKind::ContextSelection,
			parent,
			index,
			json!({"as": step.bind_as}),
		);
		let child = store.child(&step.bind_as, item);
		self.execute_steps(&step.steps, &child, parent).await?;
		Ok(child.current().data())
	}
}

fn extract_items(step: &ForEachStep, store: &ContextStore) -> Result<Vec<Value>, Error> {
	match &step.items {
		ItemSource::Path { expr, .. } => {
			let current = store.current().data();
			let mut out = expr.eval(&current, &[])?;
			if out.len() == 1 {
				return Ok(match out.remove(0) {
					// A single sequence result is unwrapped into its items
					Value::Array(items) => items,
					single => vec![single],
				});
			}
			Ok(out)
		},
		ItemSource::Values(values) => Ok(
			values
				.iter()
				.map(|v| json!({"value": v}))
				.collect(),
		),
	}
}

fn make_limiter(config: Option<RateLimit>) -> Option<Arc<DefaultDirectRateLimiter>> {
	let config = config?;
	let period = Duration::from_secs_f64(1.0 / config.requests_per_second);
	let quota = Quota::with_period(period)?
		.allow_burst(NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN));
	Some(Arc::new(RateLimiter::direct(quota)))
}
