use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Single-consumer channel of root-scope records. Records drained from the
/// root sequence are pushed here as they complete; a dropped receiver simply
/// discards further records, it does not fail the crawl.
#[derive(Debug, Clone)]
pub struct Streamer {
	tx: mpsc::Sender<Value>,
}

impl Streamer {
	pub fn channel(buffer: usize) -> (Streamer, mpsc::Receiver<Value>) {
		let (tx, rx) = mpsc::channel(buffer);
		(Streamer { tx }, rx)
	}

	/// Send one record, waiting for channel capacity unless cancelled.
	pub async fn emit(&self, record: Value, cancel: &CancellationToken) -> Result<(), crate::Error> {
		tokio::select! {
			_ = cancel.cancelled() => Err(crate::Error::Cancelled),
			sent = self.tx.send(record) => {
				if sent.is_err() {
					tracing::debug!("stream consumer gone, discarding record");
				}
				Ok(())
			},
		}
	}
}
