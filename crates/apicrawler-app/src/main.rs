use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "apicrawler", about = "Declarative, manifest-driven API crawler")]
struct Args {
	/// Tracing filter directive, e.g. "info" or "apicrawler=debug"
	#[arg(long, default_value = "info", global = true)]
	log_filter: String,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Run a crawl and print the aggregated result as JSON
	Run {
		manifest: PathBuf,

		/// Print top-level records as NDJSON while the crawl runs
		/// (requires `stream: true` in the manifest)
		#[arg(long)]
		stream: bool,
	},
	/// Check a manifest and report diagnostics without crawling
	Validate { manifest: PathBuf },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
	let args = Args::parse();
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_new(&args.log_filter)?)
		.init();

	match args.command {
		Command::Validate { manifest } => {
			let text = std::fs::read_to_string(&manifest)
				.with_context(|| format!("reading {}", manifest.display()))?;
			match apicrawler::Manifest::from_yaml(&text) {
				Ok(_) => {
					println!("{}: ok", manifest.display());
					Ok(ExitCode::SUCCESS)
				},
				Err(e) => {
					eprintln!("{e}");
					Ok(ExitCode::FAILURE)
				},
			}
		},
		Command::Run { manifest, stream } => {
			let text = std::fs::read_to_string(&manifest)
				.with_context(|| format!("reading {}", manifest.display()))?;
			let manifest = apicrawler::Manifest::from_yaml(&text)?;
			let crawler = apicrawler::Crawler::new(manifest, reqwest::Client::new());

			let cancel = CancellationToken::new();
			tokio::spawn({
				let cancel = cancel.clone();
				async move {
					if tokio::signal::ctrl_c().await.is_ok() {
						tracing::info!("interrupt received, cancelling crawl");
						cancel.cancel();
					}
				}
			});

			if stream {
				let (mut rx, crawl) = crawler.run_streaming(cancel, 64);
				let printer = async {
					while let Some(record) = rx.recv().await {
						println!("{record}");
					}
				};
				let (result, ()) = tokio::join!(crawl, printer);
				result?;
			} else {
				let out = crawler.run(cancel).await?;
				println!("{}", serde_json::to_string_pretty(&out)?);
			}
			Ok(ExitCode::SUCCESS)
		},
	}
}
