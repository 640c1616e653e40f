use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use http::HeaderMap;
use serde_json::{Map, Value};

use crate::jq;
use crate::types::Selector;

#[cfg(test)]
#[path = "paginate_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid pagination config: {0}")]
	InvalidConfig(String),
	#[error("dynamic extraction via {selector:?} failed: {detail}")]
	DynamicExtraction { selector: String, detail: String },
	#[error("parse: {0}")]
	Parse(String),
}

#[derive(Debug)]
pub struct PaginationConfig {
	pub next_page_url: Option<Selector>,
	pub params: Vec<Param>,
	pub stop_on: Vec<StopCondition>,
}

#[derive(Debug)]
pub struct Param {
	pub name: String,
	pub location: Location,
	pub kind: Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
	Query,
	Header,
	Body,
}

#[derive(Debug)]
pub enum Kind {
	Int {
		start: i64,
		increment: i64,
	},
	Float {
		start: f64,
		increment: f64,
	},
	Datetime {
		// When unset, the paginator starts from the current time.
		start: Option<DateTime<Utc>>,
		increment: TimeDelta,
		format: Option<String>,
	},
	Dynamic {
		source: Selector,
	},
}

#[derive(Debug)]
pub enum StopCondition {
	ResponseBody(Arc<jq::Expression>),
	RequestParam {
		param: String,
		compare: Compare,
		value: Value,
	},
	PageNum(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
	Lt,
	Lte,
	Eq,
	Gt,
	Gte,
}

/// The parameters of one page: what to add to the query string, the headers
/// and the body, plus an override URL when a next-page selector produced one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageParams {
	pub query: Vec<(String, String)>,
	pub headers: Vec<(String, String)>,
	pub body: Map<String, Value>,
	pub next_page_url: Option<String>,
}

#[derive(Debug, Clone)]
enum State {
	Int(i64),
	Float(f64),
	Datetime(DateTime<Utc>),
	Dynamic(Value),
}

/// Per-request page loop state. The interpreter drives it: `first` emits the
/// initial page unconditionally, then each response is fed to `advance`,
/// which either derives the next page's parameters or signals the stop.
#[derive(Debug)]
pub struct Paginator {
	config: Option<Arc<PaginationConfig>>,
	page_num: u64,
	values: Vec<State>,
}

impl Paginator {
	pub fn new(config: Option<Arc<PaginationConfig>>) -> Paginator {
		let values = config
			.as_deref()
			.map(|c| c.params.iter().map(|p| initial_state(&p.kind)).collect())
			.unwrap_or_default();
		Paginator {
			config,
			page_num: 0,
			values,
		}
	}

	/// Pages issued so far.
	pub fn page_num(&self) -> u64 {
		self.page_num
	}

	/// Parameters of the first page. Never checks stop conditions.
	pub fn first(&self) -> PageParams {
		self.emit(None)
	}

	/// Advance past a received response. Returns the next page's parameters,
	/// or `None` once a stop condition matches (or the request was
	/// unpaginated to begin with).
	pub fn advance(&mut self, headers: &HeaderMap, body: &Value) -> Result<Option<PageParams>, Error> {
		let Some(config) = self.config.clone() else {
			return Ok(None);
		};
		self.page_num += 1;

		if let Some(selector) = &config.next_page_url {
			let next = extract(selector, headers, body)?;
			let url = match next {
				Value::String(s) => s,
				Value::Null => String::new(),
				other => other.to_string(),
			};
			if self.stopped(&config, body)? || url.is_empty() {
				return Ok(None);
			}
			return Ok(Some(self.emit(Some(url))));
		}

		for (param, state) in config.params.iter().zip(self.values.iter_mut()) {
			step(param, state, headers, body)?;
		}
		if self.stopped(&config, body)? {
			return Ok(None);
		}
		Ok(Some(self.emit(None)))
	}

	fn stopped(&self, config: &PaginationConfig, body: &Value) -> Result<bool, Error> {
		for stop in &config.stop_on {
			let hit = match stop {
				StopCondition::ResponseBody(expr) => {
					let v = expr.eval_one(body, &[]).map_err(|e| Error::Parse(e.to_string()))?;
					jq::truthy(&v)
				},
				StopCondition::RequestParam {
					param,
					compare,
					value,
				} => {
					let state = config
						.params
						.iter()
						.position(|p| &p.name == param)
						.and_then(|i| self.values.get(i))
						.ok_or_else(|| Error::InvalidConfig(format!("unknown stop param {param:?}")))?;
					compare_param(state, *compare, value)?
				},
				StopCondition::PageNum(n) => self.page_num >= *n,
			};
			if hit {
				return Ok(true);
			}
		}
		Ok(false)
	}

	fn emit(&self, next_page_url: Option<String>) -> PageParams {
		let mut page = PageParams {
			next_page_url,
			..Default::default()
		};
		let Some(config) = self.config.as_deref() else {
			return page;
		};
		for (param, state) in config.params.iter().zip(self.values.iter()) {
			// Dynamic params stay off the wire until a value was extracted.
			if let State::Dynamic(v) = state {
				if matches!(v, Value::Null) || matches!(v, Value::String(s) if s.is_empty()) {
					continue;
				}
			}
			match param.location {
				Location::Query => page.query.push((param.name.clone(), render(param, state))),
				Location::Header => page.headers.push((param.name.clone(), render(param, state))),
				Location::Body => {
					page.body.insert(param.name.clone(), body_value(param, state));
				},
			}
		}
		page
	}
}

fn initial_state(kind: &Kind) -> State {
	match kind {
		Kind::Int { start, .. } => State::Int(*start),
		Kind::Float { start, .. } => State::Float(*start),
		Kind::Datetime { start, .. } => State::Datetime(start.unwrap_or_else(Utc::now)),
		Kind::Dynamic { .. } => State::Dynamic(Value::String(String::new())),
	}
}

fn step(param: &Param, state: &mut State, headers: &HeaderMap, body: &Value) -> Result<(), Error> {
	match (&param.kind, state) {
		(Kind::Int { increment, .. }, State::Int(v)) => *v += increment,
		(Kind::Float { increment, .. }, State::Float(v)) => *v += increment,
		(Kind::Datetime { increment, .. }, State::Datetime(v)) => *v += *increment,
		(Kind::Dynamic { source }, State::Dynamic(v)) => {
			*v = extract(source, headers, body)?;
		},
		_ => unreachable!("paginator state always matches its param kind"),
	}
	Ok(())
}

fn extract(selector: &Selector, headers: &HeaderMap, body: &Value) -> Result<Value, Error> {
	match selector {
		Selector::Body(expr) => {
			let mut out = expr
				.eval(body, &[])
				.map_err(|e| Error::DynamicExtraction {
					selector: format!("body:{}", expr.source()),
					detail: e.to_string(),
				})?;
			match out.len() {
				0 => Ok(Value::Null),
				1 => Ok(out.remove(0)),
				n => Err(Error::DynamicExtraction {
					selector: format!("body:{}", expr.source()),
					detail: format!("expected one value, got {n}"),
				}),
			}
		},
		Selector::Header(name) => Ok(
			headers
				.get(name.as_str())
				.and_then(|v| v.to_str().ok())
				.map(|s| Value::String(s.to_string()))
				.unwrap_or(Value::Null),
		),
	}
}

fn render(param: &Param, state: &State) -> String {
	match state {
		State::Int(v) => v.to_string(),
		State::Float(v) => v.to_string(),
		State::Datetime(v) => format_datetime(param, *v),
		State::Dynamic(v) => match v {
			Value::String(s) => s.clone(),
			Value::Null => String::new(),
			other => other.to_string(),
		},
	}
}

fn body_value(param: &Param, state: &State) -> Value {
	match state {
		State::Int(v) => Value::from(*v),
		State::Float(v) => Value::from(*v),
		State::Datetime(v) => Value::String(format_datetime(param, *v)),
		State::Dynamic(v) => v.clone(),
	}
}

fn format_datetime(param: &Param, v: DateTime<Utc>) -> String {
	match &param.kind {
		Kind::Datetime {
			format: Some(fmt), ..
		} => v.format(fmt).to_string(),
		_ => v.to_rfc3339_opts(SecondsFormat::Secs, true),
	}
}

fn compare_param(state: &State, compare: Compare, literal: &Value) -> Result<bool, Error> {
	let lhs = match state {
		State::Int(v) => Value::from(*v),
		State::Float(v) => Value::from(*v),
		State::Datetime(v) => Value::String(v.to_rfc3339()),
		State::Dynamic(v) => v.clone(),
	};
	if let (Some(l), Some(r)) = (as_f64(&lhs), as_f64(literal)) {
		return Ok(match compare {
			Compare::Lt => l < r,
			Compare::Lte => l <= r,
			Compare::Eq => l == r,
			Compare::Gt => l > r,
			Compare::Gte => l >= r,
		});
	}
	// Non-numeric operands only support equality.
	match compare {
		Compare::Eq => Ok(stringish(&lhs) == stringish(literal)),
		_ => Err(Error::Parse(format!(
			"cannot order {lhs} against {literal}: not numbers"
		))),
	}
}

fn as_f64(v: &Value) -> Option<f64> {
	match v {
		Value::Number(n) => n.as_f64(),
		Value::String(s) => s.parse().ok(),
		_ => None,
	}
}

fn stringish(v: &Value) -> String {
	match v {
		Value::String(s) => s.clone(),
		other => other.to_string(),
	}
}
