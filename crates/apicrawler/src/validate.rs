use std::fmt::{Display, Formatter};

use serde_json::Value;

use crate::types::{
	LocalAuth, LocalManifest, LocalPagination, LocalRequest, LocalStep, parse_selector,
};

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;

/// One manifest problem, located by a dotted path into the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
	pub location: String,
	pub message: String,
}

impl Display for Diagnostic {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		if self.location.is_empty() {
			write!(f, "{}", self.message)
		} else {
			write!(f, "{}: {}", self.location, self.message)
		}
	}
}

pub fn render(diagnostics: &[Diagnostic]) -> String {
	diagnostics
		.iter()
		.map(|d| format!("  {d}"))
		.collect::<Vec<_>>()
		.join("\n")
}

/// Structural and semantic checks over the raw manifest. Returns every
/// problem found rather than stopping at the first.
pub fn validate(manifest: &LocalManifest) -> Vec<Diagnostic> {
	let mut v = Validator::default();
	v.manifest(manifest);
	v.out
}

#[derive(Default)]
struct Validator {
	out: Vec<Diagnostic>,
}

impl Validator {
	fn report(&mut self, location: impl Into<String>, message: impl Into<String>) {
		self.out.push(Diagnostic {
			location: location.into(),
			message: message.into(),
		});
	}

	fn manifest(&mut self, m: &LocalManifest) {
		match &m.root_context {
			None => self.report("rootContext", "required"),
			Some(Value::Array(_)) | Some(Value::Object(_)) => {},
			Some(_) => self.report("rootContext", "must be a sequence or a mapping"),
		}
		if m.stream && !matches!(m.root_context, Some(Value::Array(_))) {
			self.report("stream", "streaming requires a sequence rootContext");
		}
		if let Some(auth) = &m.auth {
			self.auth("auth", auth);
		}
		if m.steps.is_empty() {
			self.report("steps", "at least one step is required");
		}
		for (i, step) in m.steps.iter().enumerate() {
			self.step(&format!("steps.{i}"), step);
		}
	}

	fn step(&mut self, at: &str, step: &LocalStep) {
		if step.name.as_deref().unwrap_or_default().is_empty() {
			self.report(format!("{at}.name"), "required");
		}
		match step.step_type.as_deref() {
			Some("request") => self.request_step(at, step),
			Some("forEach") => self.for_each_step(at, step),
			Some(other) => self.report(
				format!("{at}.type"),
				format!("unknown step type {other:?}, expected \"request\" or \"forEach\""),
			),
			None => self.report(format!("{at}.type"), "required"),
		}
		self.merge_directives(at, step);
		for (i, nested) in step.steps.iter().enumerate() {
			self.step(&format!("{at}.steps.{i}"), nested);
		}
	}

	fn merge_directives(&mut self, at: &str, step: &LocalStep) {
		let expressions = [
			step.merge_on.is_some(),
			step.merge_with_parent_on.is_some(),
			step.merge_with_context.is_some(),
		]
		.iter()
		.filter(|set| **set)
		.count();
		if step.noop_merge && expressions > 0 {
			self.report(
				format!("{at}.noopMerge"),
				"mutually exclusive with mergeOn, mergeWithParentOn and mergeWithContext",
			);
		} else if expressions > 1 {
			self.report(
				at,
				"at most one of mergeOn, mergeWithParentOn and mergeWithContext may be set",
			);
		}
	}

	fn request_step(&mut self, at: &str, step: &LocalStep) {
		if step.path.is_some() || step.values.is_some() {
			self.report(at, "path and values are only valid on forEach steps");
		}
		let Some(request) = &step.request else {
			self.report(format!("{at}.request"), "required for request steps");
			return;
		};
		self.request(&format!("{at}.request"), request);
	}

	fn request(&mut self, at: &str, request: &LocalRequest) {
		if request.url.as_deref().unwrap_or_default().is_empty() {
			self.report(format!("{at}.url"), "required");
		}
		match request.method.as_deref() {
			None => self.report(format!("{at}.method"), "required"),
			Some("GET") | Some("POST") => {},
			Some(other) => self.report(
				format!("{at}.method"),
				format!("unsupported method {other:?}, expected GET or POST"),
			),
		}
		let has_content_type = request.content_type.is_some()
			|| request
				.headers
				.keys()
				.any(|name| name.eq_ignore_ascii_case("content-type"));
		if request.body.is_some() && request.method.as_deref() == Some("POST") && !has_content_type {
			self.report(
				format!("{at}.contentType"),
				"a POST with a body needs a content type (field or header)",
			);
		}
		if let Some(body) = &request.body {
			if !body.is_object() {
				self.report(format!("{at}.body"), "must be a mapping");
			}
		}
		if let Some(pagination) = &request.pagination {
			self.pagination(&format!("{at}.pagination"), pagination);
		}
		if let Some(auth) = &request.auth {
			self.auth(&format!("{at}.auth"), auth);
		}
	}

	fn for_each_step(&mut self, at: &str, step: &LocalStep) {
		if step.request.is_some() {
			self.report(format!("{at}.request"), "only valid on request steps");
		}
		if step.bind_as.as_deref().unwrap_or_default().is_empty() {
			self.report(format!("{at}.as"), "required for forEach steps");
		}
		match (&step.path, &step.values) {
			(Some(_), Some(_)) => self.report(at, "path and values are mutually exclusive"),
			(None, None) => self.report(at, "forEach needs either path or values"),
			_ => {},
		}
		if step.max_concurrency == Some(0) {
			self.report(format!("{at}.maxConcurrency"), "must be a positive integer");
		}
		if let Some(rate) = &step.rate_limit {
			if rate.requests_per_second <= 0.0 {
				self.report(
					format!("{at}.rateLimit.requestsPerSecond"),
					"must be greater than zero",
				);
			}
			if rate.burst == Some(0) {
				self.report(format!("{at}.rateLimit.burst"), "must be a positive integer");
			}
		}
	}

	fn pagination(&mut self, at: &str, pagination: &LocalPagination) {
		if let Some(selector) = &pagination.next_page_url_selector {
			if let Err(e) = parse_selector(selector) {
				self.report(format!("{at}.nextPageUrlSelector"), e);
			}
		} else {
			if pagination.params.is_empty() {
				self.report(at, "needs either nextPageUrlSelector or params");
			}
			if pagination.stop_on.is_empty() {
				self.report(
					format!("{at}.stopOn"),
					"required unless nextPageUrlSelector is used",
				);
			}
		}
		for (i, param) in pagination.params.iter().enumerate() {
			let at = format!("{at}.params.{i}");
			if param.name.as_deref().unwrap_or_default().is_empty() {
				self.report(format!("{at}.name"), "required");
			}
			match param.location.as_deref() {
				None => self.report(format!("{at}.location"), "required"),
				Some("query") | Some("header") | Some("body") => {},
				Some(other) => self.report(
					format!("{at}.location"),
					format!("unknown location {other:?}"),
				),
			}
			match param.param_type.as_deref() {
				None => self.report(format!("{at}.type"), "required"),
				Some("int") | Some("float") | Some("datetime") => {},
				Some("dynamic") => match param.source.as_deref() {
					None => self.report(format!("{at}.source"), "required for dynamic params"),
					Some(source) => {
						if let Err(e) = parse_selector(source) {
							self.report(format!("{at}.source"), e);
						}
					},
				},
				Some(other) => {
					self.report(format!("{at}.type"), format!("unknown type {other:?}"));
				},
			}
		}
		for (i, stop) in pagination.stop_on.iter().enumerate() {
			let at = format!("{at}.stopOn.{i}");
			match stop.stop_type.as_deref() {
				Some("responseBody") => {
					if stop.expression.as_deref().unwrap_or_default().is_empty() {
						self.report(format!("{at}.expression"), "required");
					}
				},
				Some("requestParam") => {
					if stop.param.as_deref().unwrap_or_default().is_empty() {
						self.report(format!("{at}.param"), "required");
					}
					match stop.compare.as_deref() {
						None => self.report(format!("{at}.compare"), "required"),
						Some("lt") | Some("lte") | Some("eq") | Some("gt") | Some("gte") => {},
						Some(other) => self.report(
							format!("{at}.compare"),
							format!("unknown comparison {other:?}"),
						),
					}
					if stop.value.is_none() {
						self.report(format!("{at}.value"), "required");
					}
				},
				Some("pageNum") => {
					if !matches!(&stop.value, Some(v) if v.as_u64().is_some()) {
						self.report(format!("{at}.value"), "must be a non-negative integer");
					}
				},
				Some(other) => {
					self.report(format!("{at}.type"), format!("unknown type {other:?}"));
				},
				None => self.report(format!("{at}.type"), "required"),
			}
		}
	}

	fn auth(&mut self, at: &str, auth: &LocalAuth) {
		let require = |v: &mut Validator, field: &str, present: bool| {
			if !present {
				v.report(format!("{at}.{field}"), "required for this auth type");
			}
		};
		match auth.auth_type.as_deref() {
			None => self.report(format!("{at}.type"), "required"),
			Some("none") => {},
			Some("basic") => {
				require(self, "username", auth.username.is_some());
				require(self, "password", auth.password.is_some());
			},
			Some("bearer") => require(self, "token", auth.token.is_some()),
			Some("oauth2") => {
				require(self, "tokenUrl", auth.token_url.is_some());
				require(self, "clientId", auth.client_id.is_some());
				match auth.method.as_deref() {
					None => self.report(format!("{at}.method"), "required for oauth2"),
					Some("password") => {
						require(self, "username", auth.username.is_some());
						require(self, "password", auth.password.is_some());
					},
					Some("clientCredentials") => {
						require(self, "clientSecret", auth.client_secret.is_some());
					},
					Some(other) => self.report(
						format!("{at}.method"),
						format!("unknown oauth2 method {other:?}"),
					),
				}
			},
			Some(kind @ ("cookie" | "jwt" | "custom")) => {
				require(self, "loginRequest", auth.login_request.is_some());
				require(self, "extractSelector", auth.extract_selector.is_some());
				if let Some(login) = &auth.login_request {
					if login.url.as_deref().unwrap_or_default().is_empty() {
						self.report(format!("{at}.loginRequest.url"), "required");
					}
				}
				if kind == "jwt" {
					if let Some(from) = auth.extract_from.as_deref() {
						if !matches!(from, "body" | "header") {
							self.report(
								format!("{at}.extractFrom"),
								format!("jwt tokens come from body or header, not {from:?}"),
							);
						}
					}
				}
				if kind == "custom" {
					match auth.extract_from.as_deref() {
						Some("cookie") | Some("header") | Some("body") => {},
						other => self.report(
							format!("{at}.extractFrom"),
							format!("expected cookie, header or body, got {other:?}"),
						),
					}
					match auth.inject_into.as_deref() {
						Some("bearer") => {},
						Some("cookie") | Some("header") | Some("query") => {
							if auth.inject_key.as_deref().unwrap_or_default().is_empty() {
								self.report(format!("{at}.injectKey"), "required for this injection");
							}
						},
						other => self.report(
							format!("{at}.injectInto"),
							format!("expected cookie, header, bearer or query, got {other:?}"),
						),
					}
				}
			},
			Some(other) => {
				self.report(format!("{at}.type"), format!("unknown auth type {other:?}"));
			},
		}
	}
}
