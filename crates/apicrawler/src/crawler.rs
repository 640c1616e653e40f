use std::future::Future;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::client::Client;
use crate::exec::Executor;
use crate::profile::{Event, Profiler};
use crate::stream::Streamer;
use crate::types::Manifest;

/// A compiled manifest bound to an HTTP client, ready to crawl. The client
/// is shared across every request of every crawl, login sub-requests
/// included; pooling, TLS and timeouts are configured on it by the caller.
#[derive(Debug)]
pub struct Crawler {
	manifest: Arc<Manifest>,
	client: Client,
	profiler: Profiler,
}

impl Crawler {
	pub fn new(manifest: Manifest, http: reqwest::Client) -> Crawler {
		Crawler {
			manifest: Arc::new(manifest),
			client: Client::new(http),
			profiler: Profiler::disabled(),
		}
	}

	/// Attach a profiler; the receiver gets the hierarchical lifecycle event
	/// stream of every subsequent crawl.
	pub fn with_profiler(mut self, buffer: usize) -> (Crawler, mpsc::Receiver<Event>) {
		let (profiler, rx) = Profiler::new(buffer);
		self.profiler = profiler;
		(self, rx)
	}

	/// Run the crawl to completion and return the root context's final data.
	pub async fn run(&self, cancel: CancellationToken) -> Result<Value, Error> {
		self.executor(cancel, None).run().await
	}

	/// Run the crawl in streaming mode: top-level records arrive on the
	/// returned channel as they complete. The returned future drives the
	/// crawl and must be polled alongside the receiver. When the manifest
	/// does not enable `stream`, the channel stays silent and the future
	/// resolves to the aggregate, same as `run`.
	pub fn run_streaming(
		&self,
		cancel: CancellationToken,
		buffer: usize,
	) -> (
		mpsc::Receiver<Value>,
		impl Future<Output = Result<Value, Error>>,
	) {
		let (streamer, rx) = Streamer::channel(buffer);
		let executor = self.executor(cancel, self.manifest.stream.then_some(streamer));
		(rx, async move { executor.run().await })
	}

	fn executor(&self, cancel: CancellationToken, streamer: Option<Streamer>) -> Executor {
		Executor {
			manifest: self.manifest.clone(),
			client: self.client.clone(),
			cancel,
			profiler: self.profiler.clone(),
			streamer,
		}
	}
}
