use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("unresolved placeholder {{{{ .{0} }}}}")]
	Unresolved(String),
}

static PLACEHOLDER: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"\{\{\s*\.([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)?\s*\}\}").unwrap());

#[derive(Debug, Clone, PartialEq)]
enum Segment {
	Lit(String),
	// Dotted accessor path; empty means the whole context ({{ . }})
	Path(Vec<String>),
}

/// A text template with `{{ .name.field }}` placeholders, parsed once and
/// rendered against the template context. Text without placeholders renders
/// as itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
	source: String,
	segments: Vec<Segment>,
}

impl Template {
	pub fn parse(source: &str) -> Template {
		let mut segments = Vec::new();
		let mut last = 0;
		for caps in PLACEHOLDER.captures_iter(source) {
			let m = caps.get(0).unwrap();
			if m.start() > last {
				segments.push(Segment::Lit(source[last..m.start()].to_string()));
			}
			let path = caps
				.get(1)
				.map(|p| p.as_str().split('.').map(str::to_string).collect())
				.unwrap_or_default();
			segments.push(Segment::Path(path));
			last = m.end();
		}
		if last < source.len() {
			segments.push(Segment::Lit(source[last..].to_string()));
		}
		Template {
			source: source.to_string(),
			segments,
		}
	}

	pub fn source(&self) -> &str {
		&self.source
	}

	/// True when the template contains no placeholders.
	pub fn is_literal(&self) -> bool {
		self
			.segments
			.iter()
			.all(|s| matches!(s, Segment::Lit(_)))
	}

	pub fn render(&self, ctx: &Map<String, Value>) -> Result<String, Error> {
		let mut out = String::with_capacity(self.source.len());
		for seg in &self.segments {
			match seg {
				Segment::Lit(s) => out.push_str(s),
				Segment::Path(path) => {
					let v = resolve(ctx, path).ok_or_else(|| Error::Unresolved(path.join(".")))?;
					match v {
						Value::String(s) => out.push_str(s),
						other => out.push_str(&other.to_string()),
					}
				},
			}
		}
		Ok(out)
	}
}

fn resolve<'a>(ctx: &'a Map<String, Value>, path: &[String]) -> Option<&'a Value> {
	let (first, rest) = path.split_first()?;
	let mut cur = ctx.get(first)?;
	for part in rest {
		cur = cur.as_object()?.get(part)?;
	}
	Some(cur)
}
