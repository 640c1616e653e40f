pub mod auth;
pub mod client;
pub mod context;
mod crawler;
mod exec;
pub mod jq;
pub mod paginate;
pub mod profile;
pub mod stream;
pub mod template;
pub mod types;
pub mod validate;

pub use crawler::Crawler;
pub use types::Manifest;

/// The crawl error surface. Validation problems are reported as a batch
/// before execution; everything else halts the step it occurred in and
/// propagates unchanged.
#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("validation failed:\n{}", validate::render(.0))]
	Validation(Vec<validate::Diagnostic>),
	#[error("expression: {0}")]
	Expression(#[from] jq::Error),
	#[error("template: {0}")]
	Template(#[from] template::Error),
	#[error("pagination: {0}")]
	Pagination(#[from] paginate::Error),
	#[error("auth: {0}")]
	Auth(auth::Error),
	#[error("http: {0}")]
	Http(client::Error),
	#[error("merge target {0:?} is not in scope")]
	MergeTargetMissing(String),
	#[error("merge failed: {0}")]
	MergeFailed(jq::Error),
	#[error("crawl cancelled")]
	Cancelled,
}

impl From<client::Error> for Error {
	fn from(e: client::Error) -> Self {
		match e {
			client::Error::Cancelled => Error::Cancelled,
			e => Error::Http(e),
		}
	}
}

impl From<auth::Error> for Error {
	fn from(e: auth::Error) -> Self {
		match e {
			auth::Error::Cancelled => Error::Cancelled,
			e => Error::Auth(e),
		}
	}
}
