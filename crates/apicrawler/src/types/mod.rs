use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use http::Method;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::auth::{Authenticator, Extract, Grant, Inject, LoginAuth, LoginRequest, OAuth2Auth};
use crate::jq;
use crate::paginate::{
	Compare, Kind, Location, PaginationConfig, Param, StopCondition,
};
use crate::template::Template;
use crate::{Error, validate};


// Variable sets the different expression slots are compiled against.
pub(crate) const MERGE_VARS: &[&str] = &["$res", "$ctx"];
pub(crate) const TRANSFORM_VARS: &[&str] = &["$ctx"];
pub(crate) const PATCH_VARS: &[&str] = &["$new"];

// ---------------------------------------------------------------------------
// Raw manifest, exactly as users write it. Kept permissive (everything
// optional) so the validator can report all problems with locations instead
// of bailing at the first missing field.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalManifest {
	pub root_context: Option<Value>,
	#[serde(default)]
	pub auth: Option<LocalAuth>,
	#[serde(default)]
	pub headers: IndexMap<String, String>,
	#[serde(default)]
	pub stream: bool,
	#[serde(default)]
	pub steps: Vec<LocalStep>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalStep {
	#[serde(rename = "type")]
	pub step_type: Option<String>,
	pub name: Option<String>,
	#[serde(default)]
	pub path: Option<String>,
	#[serde(default, rename = "as")]
	pub bind_as: Option<String>,
	#[serde(default)]
	pub values: Option<Vec<Value>>,
	#[serde(default)]
	pub steps: Vec<LocalStep>,
	#[serde(default)]
	pub request: Option<LocalRequest>,
	#[serde(default)]
	pub result_transformer: Option<String>,
	#[serde(default)]
	pub merge_on: Option<String>,
	#[serde(default)]
	pub merge_with_parent_on: Option<String>,
	#[serde(default)]
	pub merge_with_context: Option<LocalMergeWithContext>,
	#[serde(default)]
	pub noop_merge: bool,
	#[serde(default)]
	pub parallel: bool,
	#[serde(default)]
	pub max_concurrency: Option<usize>,
	#[serde(default)]
	pub rate_limit: Option<LocalRateLimit>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalMergeWithContext {
	pub name: String,
	pub rule: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalRateLimit {
	pub requests_per_second: f64,
	#[serde(default)]
	pub burst: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalRequest {
	pub url: Option<String>,
	pub method: Option<String>,
	#[serde(default)]
	pub headers: IndexMap<String, String>,
	#[serde(default)]
	pub content_type: Option<String>,
	#[serde(default)]
	pub body: Option<Value>,
	#[serde(default)]
	pub pagination: Option<LocalPagination>,
	#[serde(default)]
	pub auth: Option<LocalAuth>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalPagination {
	#[serde(default)]
	pub next_page_url_selector: Option<String>,
	#[serde(default)]
	pub params: Vec<LocalPaginationParam>,
	#[serde(default)]
	pub stop_on: Vec<LocalStopCondition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalPaginationParam {
	pub name: Option<String>,
	pub location: Option<String>,
	#[serde(rename = "type")]
	pub param_type: Option<String>,
	#[serde(default)]
	pub format: Option<String>,
	#[serde(default)]
	pub default: Option<Value>,
	#[serde(default)]
	pub increment: Option<Value>,
	#[serde(default)]
	pub source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalStopCondition {
	#[serde(rename = "type")]
	pub stop_type: Option<String>,
	#[serde(default)]
	pub expression: Option<String>,
	#[serde(default)]
	pub param: Option<String>,
	#[serde(default)]
	pub compare: Option<String>,
	#[serde(default)]
	pub value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalAuth {
	#[serde(rename = "type")]
	pub auth_type: Option<String>,
	#[serde(default)]
	pub username: Option<String>,
	#[serde(default)]
	pub password: Option<String>,
	#[serde(default)]
	pub token: Option<String>,
	#[serde(default)]
	pub method: Option<String>,
	#[serde(default)]
	pub token_url: Option<String>,
	#[serde(default)]
	pub client_id: Option<String>,
	#[serde(default)]
	pub client_secret: Option<String>,
	#[serde(default)]
	pub scopes: Vec<String>,
	#[serde(default)]
	pub login_request: Option<LocalLoginRequest>,
	#[serde(default)]
	pub extract_from: Option<String>,
	#[serde(default)]
	pub extract_selector: Option<String>,
	#[serde(default)]
	pub inject_into: Option<String>,
	#[serde(default)]
	pub inject_key: Option<String>,
	#[serde(default)]
	pub max_age_seconds: Option<u64>,
	#[serde(default)]
	pub one_per_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalLoginRequest {
	pub url: Option<String>,
	pub method: Option<String>,
	#[serde(default)]
	pub headers: IndexMap<String, String>,
	#[serde(default)]
	pub body: Option<Value>,
}

// ---------------------------------------------------------------------------
// Compiled manifest: validated, expressions compiled, templates parsed.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootContext {
	Sequence,
	Mapping,
}

impl RootContext {
	pub fn initial(&self) -> Value {
		match self {
			RootContext::Sequence => Value::Array(Vec::new()),
			RootContext::Mapping => Value::Object(Map::new()),
		}
	}
}

#[derive(Debug)]
pub struct Manifest {
	pub root: RootContext,
	pub auth: Option<Arc<Authenticator>>,
	pub headers: Vec<(String, Template)>,
	pub stream: bool,
	pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub enum Step {
	Request(Arc<RequestStep>),
	ForEach(Arc<ForEachStep>),
}

impl Step {
	pub fn name(&self) -> &str {
		match self {
			Step::Request(s) => &s.name,
			Step::ForEach(s) => &s.name,
		}
	}
}

#[derive(Debug)]
pub struct RequestStep {
	pub name: String,
	pub request: RequestConfig,
	pub result_transformer: Option<Arc<jq::Expression>>,
	pub merge: Merge,
	pub bind_as: Option<String>,
	pub steps: Vec<Step>,
}

#[derive(Debug)]
pub struct RequestConfig {
	pub url: Template,
	pub method: Method,
	pub headers: Vec<(String, Template)>,
	pub content_type: Option<String>,
	pub body: Option<Map<String, Value>>,
	pub pagination: Option<Arc<PaginationConfig>>,
	pub auth: Option<Arc<Authenticator>>,
}

#[derive(Debug, Clone)]
pub enum Merge {
	Default,
	Noop,
	On(Arc<jq::Expression>),
	WithParent(Arc<jq::Expression>),
	WithContext {
		name: String,
		rule: Arc<jq::Expression>,
	},
}

#[derive(Debug)]
pub enum ItemSource {
	Path {
		expr: Arc<jq::Expression>,
		// Writes the aggregated sequence back to the extracted location
		patch: Arc<jq::Expression>,
	},
	Values(Vec<Value>),
}

#[derive(Debug)]
pub struct ForEachStep {
	pub name: String,
	pub items: ItemSource,
	pub bind_as: String,
	pub merge: Merge,
	pub steps: Vec<Step>,
	pub parallel: bool,
	pub max_concurrency: usize,
	pub rate_limit: Option<RateLimit>,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
	pub requests_per_second: f64,
	pub burst: u32,
}

/// Where to read a value out of a response: a jq expression over the decoded
/// body, or a named header.
#[derive(Debug, Clone)]
pub enum Selector {
	Body(Arc<jq::Expression>),
	Header(String),
}

pub fn parse_selector(raw: &str) -> Result<Selector, String> {
	if let Some(expr) = raw.strip_prefix("body:") {
		let compiled =
			jq::Expression::compile(expr, &[]).map_err(|e| format!("selector expression: {e}"))?;
		return Ok(Selector::Body(compiled));
	}
	if let Some(name) = raw.strip_prefix("header:") {
		return Ok(Selector::Header(name.to_string()));
	}
	Err(format!(
		"selector {raw:?} must start with \"body:\" or \"header:\""
	))
}

impl Manifest {
	/// Parse, validate and compile a YAML manifest. Validation problems are
	/// all reported together; compilation stops at the first failure.
	pub fn from_yaml(input: &str) -> Result<Manifest, Error> {
		let local: LocalManifest = serde_yaml::from_str(input).map_err(|e| {
			Error::Validation(vec![validate::Diagnostic {
				location: String::new(),
				message: e.to_string(),
			}])
		})?;
		let diagnostics = validate::validate(&local);
		if !diagnostics.is_empty() {
			return Err(Error::Validation(diagnostics));
		}
		compile(local)
	}
}

fn compile(local: LocalManifest) -> Result<Manifest, Error> {
	let root = match local.root_context {
		Some(Value::Array(_)) => RootContext::Sequence,
		_ => RootContext::Mapping,
	};
	let auth = local.auth.map(compile_auth).transpose()?.map(Arc::new);
	let headers = local
		.headers
		.into_iter()
		.map(|(name, value)| (name, Template::parse(&value)))
		.collect();
	let steps = local
		.steps
		.into_iter()
		.map(compile_step)
		.collect::<Result<_, _>>()?;
	Ok(Manifest {
		root,
		auth,
		headers,
		stream: local.stream,
		steps,
	})
}

fn compile_step(local: LocalStep) -> Result<Step, Error> {
	let name = local.name.clone().unwrap_or_default();
	let merge = compile_merge(&local)?;
	let steps = local
		.steps
		.into_iter()
		.map(compile_step)
		.collect::<Result<Vec<_>, _>>()?;

	match local.step_type.as_deref() {
		Some("forEach") => {
			let bind_as = local.bind_as.clone().unwrap_or_default();
			let items = match (local.path, local.values) {
				(Some(path), _) => {
					let expr = jq::Expression::compile(&path, &[])?;
					let patch = jq::Expression::compile(&format!("{path} = $new"), PATCH_VARS)?;
					ItemSource::Path { expr, patch }
				},
				(None, Some(values)) => ItemSource::Values(values),
				(None, None) => ItemSource::Values(Vec::new()),
			};
			let parallel = local.parallel;
			let max_concurrency = local.max_concurrency.unwrap_or(10).max(1);
			let rate_limit = local.rate_limit.map(|r| RateLimit {
				requests_per_second: r.requests_per_second,
				burst: r.burst.unwrap_or(1).max(1),
			});
			Ok(Step::ForEach(Arc::new(ForEachStep {
				name,
				items,
				bind_as,
				merge,
				steps,
				parallel,
				max_concurrency,
				rate_limit,
			})))
		},
		_ => {
			let request = local
				.request
				.ok_or_else(|| invalid_manifest("request step without a request block"))?;
			let result_transformer = local
				.result_transformer
				.map(|t| jq::Expression::compile(&t, TRANSFORM_VARS))
				.transpose()?;
			Ok(Step::Request(Arc::new(RequestStep {
				name,
				request: compile_request(request)?,
				result_transformer,
				merge,
				bind_as: local.bind_as,
				steps,
			})))
		},
	}
}

fn compile_merge(local: &LocalStep) -> Result<Merge, Error> {
	if local.noop_merge {
		return Ok(Merge::Noop);
	}
	if let Some(rule) = &local.merge_on {
		return Ok(Merge::On(jq::Expression::compile(rule, MERGE_VARS)?));
	}
	if let Some(rule) = &local.merge_with_parent_on {
		return Ok(Merge::WithParent(jq::Expression::compile(rule, MERGE_VARS)?));
	}
	if let Some(with) = &local.merge_with_context {
		return Ok(Merge::WithContext {
			name: with.name.clone(),
			rule: jq::Expression::compile(&with.rule, MERGE_VARS)?,
		});
	}
	Ok(Merge::Default)
}

fn compile_request(local: LocalRequest) -> Result<RequestConfig, Error> {
	let url = Template::parse(&local.url.unwrap_or_default());
	let method = match local.method.as_deref() {
		Some("POST") => Method::POST,
		_ => Method::GET,
	};
	let content_type = local.content_type.map(|c| normalize_content_type(&c)).or_else(|| {
		local
			.headers
			.iter()
			.find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
			.map(|(_, value)| normalize_content_type(value))
	});
	let headers = local
		.headers
		.into_iter()
		.map(|(name, value)| (name, Template::parse(&value)))
		.collect();
	let body = match local.body {
		Some(Value::Object(map)) => Some(map),
		Some(other) => {
			return Err(invalid_manifest(format!(
				"request body must be a mapping, got {}",
				jq::type_name(&other)
			)));
		},
		None => None,
	};
	let pagination = local
		.pagination
		.map(compile_pagination)
		.transpose()?
		.map(Arc::new);
	let auth = local.auth.map(compile_auth).transpose()?.map(Arc::new);
	Ok(RequestConfig {
		url,
		method,
		headers,
		content_type,
		body,
		pagination,
		auth,
	})
}

fn normalize_content_type(raw: &str) -> String {
	raw
		.split(';')
		.next()
		.unwrap_or_default()
		.trim()
		.to_ascii_lowercase()
}

fn compile_pagination(local: LocalPagination) -> Result<PaginationConfig, Error> {
	let next_page_url = local
		.next_page_url_selector
		.as_deref()
		.map(|s| parse_selector(s).map_err(invalid))
		.transpose()?;
	let params = local
		.params
		.into_iter()
		.map(compile_pagination_param)
		.collect::<Result<_, _>>()?;
	let stop_on = local
		.stop_on
		.into_iter()
		.map(compile_stop_condition)
		.collect::<Result<_, _>>()?;
	Ok(PaginationConfig {
		next_page_url,
		params,
		stop_on,
	})
}

fn compile_pagination_param(local: LocalPaginationParam) -> Result<Param, Error> {
	let name = local.name.unwrap_or_default();
	let location = match local.location.as_deref() {
		Some("header") => Location::Header,
		Some("body") => Location::Body,
		_ => Location::Query,
	};
	let kind = match local.param_type.as_deref() {
		Some("int") => Kind::Int {
			start: local
				.default
				.as_ref()
				.and_then(Value::as_i64)
				.unwrap_or(0),
			increment: local
				.increment
				.as_ref()
				.and_then(Value::as_i64)
				.unwrap_or(1),
		},
		Some("float") => Kind::Float {
			start: local
				.default
				.as_ref()
				.and_then(Value::as_f64)
				.unwrap_or(0.0),
			increment: local
				.increment
				.as_ref()
				.and_then(Value::as_f64)
				.unwrap_or(1.0),
		},
		Some("datetime") => {
			let start = local
				.default
				.as_ref()
				.and_then(Value::as_str)
				.map(|s| parse_datetime(s, local.format.as_deref()))
				.transpose()
				.map_err(invalid)?;
			let increment = local
				.increment
				.as_ref()
				.map(|v| parse_duration_value(v))
				.transpose()
				.map_err(invalid)?
				.unwrap_or_else(|| TimeDelta::days(1));
			Kind::Datetime {
				start,
				increment,
				format: local.format,
			}
		},
		Some("dynamic") => {
			let source = local
				.source
				.as_deref()
				.ok_or_else(|| invalid(format!("dynamic param {name:?} needs a source")))?;
			Kind::Dynamic {
				source: parse_selector(source).map_err(invalid)?,
			}
		},
		other => {
			return Err(invalid(format!(
				"pagination param {name:?} has unknown type {other:?}"
			)));
		},
	};
	Ok(Param {
		name,
		location,
		kind,
	})
}

fn compile_stop_condition(local: LocalStopCondition) -> Result<StopCondition, Error> {
	match local.stop_type.as_deref() {
		Some("responseBody") => {
			let expr = local
				.expression
				.as_deref()
				.ok_or_else(|| invalid("responseBody stop condition needs an expression"))?;
			Ok(StopCondition::ResponseBody(jq::Expression::compile(
				expr,
				&[],
			)?))
		},
		Some("requestParam") => Ok(StopCondition::RequestParam {
			param: local.param.unwrap_or_default(),
			compare: match local.compare.as_deref() {
				Some("lt") => Compare::Lt,
				Some("lte") => Compare::Lte,
				Some("gt") => Compare::Gt,
				Some("gte") => Compare::Gte,
				_ => Compare::Eq,
			},
			value: local.value.unwrap_or(Value::Null),
		}),
		Some("pageNum") => {
			let value = local
				.value
				.as_ref()
				.and_then(Value::as_u64)
				.ok_or_else(|| invalid("pageNum stop condition needs a non-negative value"))?;
			Ok(StopCondition::PageNum(value))
		},
		other => Err(invalid(format!("unknown stop condition type {other:?}"))),
	}
}

fn compile_auth(local: LocalAuth) -> Result<Authenticator, Error> {
	let auth = match local.auth_type.as_deref() {
		None | Some("none") => Authenticator::None,
		Some("basic") => Authenticator::Basic {
			username: local.username.unwrap_or_default(),
			password: local.password.unwrap_or_default(),
		},
		Some("bearer") => Authenticator::Bearer {
			token: local.token.unwrap_or_default(),
		},
		Some("oauth2") => {
			let grant = match local.method.as_deref() {
				Some("clientCredentials") => Grant::ClientCredentials,
				_ => Grant::Password {
					username: local.username.unwrap_or_default(),
					password: local.password.unwrap_or_default(),
				},
			};
			Authenticator::OAuth2(OAuth2Auth::new(
				grant,
				local.client_id.unwrap_or_default(),
				local.client_secret,
				local.token_url.unwrap_or_default(),
				local.scopes,
			))
		},
		Some(kind @ ("cookie" | "jwt" | "custom")) => {
			let login = compile_login_request(
				local
					.login_request
					.ok_or_else(|| invalid_auth(format!("{kind} auth needs a loginRequest")))?,
			)?;
			let selector = local
				.extract_selector
				.ok_or_else(|| invalid_auth(format!("{kind} auth needs an extractSelector")))?;
			let (extract, inject) = match kind {
				"cookie" => {
					let inject_name = local.inject_key.unwrap_or_else(|| selector.clone());
					(Extract::Cookie(selector), Inject::Cookie(inject_name))
				},
				"jwt" => {
					let extract = match local.extract_from.as_deref() {
						Some("header") => Extract::Header(selector),
						_ => Extract::Body(
							jq::Expression::compile(&selector, &[])
								.map_err(|e| invalid_auth(format!("extractSelector: {e}")))?,
						),
					};
					(extract, Inject::Bearer)
				},
				_ => {
					let extract = match local.extract_from.as_deref() {
						Some("cookie") => Extract::Cookie(selector),
						Some("header") => Extract::Header(selector),
						Some("body") => Extract::Body(
							jq::Expression::compile(&selector, &[])
								.map_err(|e| invalid_auth(format!("extractSelector: {e}")))?,
						),
						other => {
							return Err(invalid_auth(format!("unknown extractFrom {other:?}")));
						},
					};
					let key = local.inject_key.unwrap_or_default();
					let inject = match local.inject_into.as_deref() {
						Some("cookie") => Inject::Cookie(key),
						Some("header") => Inject::Header(key),
						Some("bearer") => Inject::Bearer,
						Some("query") => Inject::Query(key),
						other => {
							return Err(invalid_auth(format!("unknown injectInto {other:?}")));
						},
					};
					(extract, inject)
				},
			};
			let login_auth = LoginAuth::new(
				login,
				extract,
				inject,
				local.max_age_seconds.unwrap_or(0),
				local.one_per_run,
			);
			match kind {
				"cookie" => Authenticator::Cookie(login_auth),
				"jwt" => Authenticator::Jwt(login_auth),
				_ => Authenticator::Custom(login_auth),
			}
		},
		Some(other) => {
			return Err(invalid_auth(format!("unknown auth type {other:?}")));
		},
	};
	Ok(auth)
}

fn compile_login_request(local: LocalLoginRequest) -> Result<LoginRequest, Error> {
	let method = match local.method.as_deref() {
		Some("GET") => Method::GET,
		_ => Method::POST,
	};
	let body = match local.body {
		Some(Value::Object(map)) => Some(map),
		Some(other) => {
			return Err(invalid_auth(format!(
				"login body must be a mapping, got {}",
				jq::type_name(&other)
			)));
		},
		None => None,
	};
	Ok(LoginRequest {
		url: local.url.unwrap_or_default(),
		method,
		headers: local.headers.into_iter().collect(),
		body,
	})
}

fn parse_datetime(raw: &str, format: Option<&str>) -> Result<DateTime<Utc>, String> {
	if let Some(fmt) = format {
		if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
			return Ok(dt.with_timezone(&Utc));
		}
		if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
			return Ok(Utc.from_utc_datetime(&naive));
		}
		if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
			return Ok(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).expect("midnight is valid")));
		}
		return Err(format!("datetime {raw:?} does not match format {fmt:?}"));
	}
	DateTime::parse_from_rfc3339(raw)
		.map(|dt| dt.with_timezone(&Utc))
		.map_err(|e| format!("datetime {raw:?}: {e}"))
}

fn parse_duration_value(value: &Value) -> Result<TimeDelta, String> {
	match value {
		// Bare numbers are seconds
		Value::Number(n) => n
			.as_i64()
			.map(TimeDelta::seconds)
			.ok_or_else(|| format!("increment {n} is not a whole number of seconds")),
		Value::String(s) => {
			let nanos = go_parse_duration::parse_duration(s)
				.map_err(|e| format!("increment {s:?}: {e:?}"))?;
			Ok(TimeDelta::nanoseconds(nanos))
		},
		other => Err(format!(
			"increment must be a duration string or seconds, got {}",
			jq::type_name(other)
		)),
	}
}

fn invalid(message: impl Into<String>) -> Error {
	Error::Pagination(crate::paginate::Error::InvalidConfig(message.into()))
}

fn invalid_manifest(message: impl Into<String>) -> Error {
	Error::Validation(vec![validate::Diagnostic {
		location: String::new(),
		message: message.into(),
	}])
}

fn invalid_auth(message: impl Into<String>) -> Error {
	Error::Auth(crate::auth::Error::InvalidConfig(message.into()))
}
