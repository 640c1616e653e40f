use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lifecycle event kinds, roughly one per interesting transition of the
/// request / forEach / auth state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
	RootStart,
	RequestStepStart,
	RequestStepEnd,
	RequestPageStart,
	RequestPageEnd,
	UrlComposition,
	RequestDetails,
	RequestResponse,
	ResponseTransform,
	ContextMerge,
	ForEachStepStart,
	ForEachStepEnd,
	ParallelismSetup,
	ItemSelection,
	ContextSelection,
	AuthStart,
	AuthCached,
	AuthLoginStart,
	AuthLoginEnd,
	AuthTokenExtract,
	AuthTokenInject,
	AuthEnd,
	StreamResult,
	Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
	pub id: Uuid,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub parent: Option<Uuid>,
	pub kind: EventKind,
	pub at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration_ms: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub worker: Option<usize>,
	pub payload: Value,
}

/// Observer channel for crawl lifecycle events. The channel is bounded and
/// sends never block the interpreter: when no consumer keeps up (or none is
/// attached) events are dropped.
#[derive(Debug, Clone)]
pub struct Profiler {
	tx: Option<mpsc::Sender<Event>>,
}

impl Profiler {
	pub fn disabled() -> Profiler {
		Profiler { tx: None }
	}

	pub fn new(buffer: usize) -> (Profiler, mpsc::Receiver<Event>) {
		let (tx, rx) = mpsc::channel(buffer);
		(Profiler { tx: Some(tx) }, rx)
	}

	pub fn enabled(&self) -> bool {
		self.tx.is_some()
	}

	/// Emit a START event and return its id; the matching END reuses it.
	pub fn start(&self, kind: EventKind, parent: Option<Uuid>, payload: Value) -> Uuid {
		let id = Uuid::new_v4();
		self.push(Event {
			id,
			parent,
			kind,
			at: Utc::now(),
			duration_ms: None,
			worker: None,
			payload,
		});
		id
	}

	/// Emit the END half of a START event, carrying the measured duration.
	pub fn end(
		&self,
		kind: EventKind,
		id: Uuid,
		parent: Option<Uuid>,
		started: Instant,
		payload: Value,
	) {
		self.push(Event {
			id,
			parent,
			kind,
			at: Utc::now(),
			duration_ms: Some(started.elapsed().as_millis() as u64),
			worker: None,
			payload,
		});
	}

	/// Emit a standalone event.
	pub fn note(&self, kind: EventKind, parent: Option<Uuid>, payload: Value) -> Uuid {
		self.start(kind, parent, payload)
	}

	/// Emit a standalone event attributed to a worker in a parallel pool.
	pub fn note_worker(
		&self,
		kind: EventKind,
		parent: Option<Uuid>,
		worker: usize,
		payload: Value,
	) -> Uuid {
		let id = Uuid::new_v4();
		self.push(Event {
			id,
			parent,
			kind,
			at: Utc::now(),
			duration_ms: None,
			worker: Some(worker),
			payload,
		});
		id
	}

	fn push(&self, event: Event) {
		if let Some(tx) = &self.tx {
			// Lossy on purpose: a slow observer must not stall the crawl.
			if tx.try_send(event).is_err() {
				tracing::trace!("profiler buffer full, dropping event");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[tokio::test]
	async fn start_end_share_an_id() {
		let (p, mut rx) = Profiler::new(8);
		let started = Instant::now();
		let id = p.start(EventKind::RequestStepStart, None, json!({"step": "a"}));
		p.end(EventKind::RequestStepEnd, id, None, started, json!({}));
		let first = rx.recv().await.unwrap();
		let second = rx.recv().await.unwrap();
		assert_eq!(first.id, second.id);
		assert_eq!(first.kind, EventKind::RequestStepStart);
		assert_eq!(second.kind, EventKind::RequestStepEnd);
		assert!(second.duration_ms.is_some());
	}

	#[tokio::test]
	async fn full_buffer_drops_instead_of_blocking() {
		let (p, mut rx) = Profiler::new(1);
		p.note(EventKind::ItemSelection, None, json!(1));
		p.note(EventKind::ItemSelection, None, json!(2));
		p.note(EventKind::ItemSelection, None, json!(3));
		let got = rx.recv().await.unwrap();
		assert_eq!(got.payload, json!(1));
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn disabled_profiler_is_a_noop() {
		let p = Profiler::disabled();
		assert!(!p.enabled());
		p.note(EventKind::RootStart, None, Value::Null);
	}
}
