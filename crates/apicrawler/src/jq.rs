use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use itertools::Itertools;
use jaq_core::load::{Arena, File, Loader};
use jaq_core::{Compiler, Ctx, Filter, Native, RcIter};
use jaq_json::Val;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::Value;

#[cfg(test)]
#[path = "jq_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("invalid expression {expr:?}: {detail}")]
	Invalid { expr: String, detail: String },
	#[error("evaluation of {expr:?} failed: {detail}")]
	Eval { expr: String, detail: String },
	#[error("expression {expr:?} produced {count} values, expected exactly one")]
	Cardinality { expr: String, count: usize },
	#[error("expected a {expected}, got {found}")]
	Type {
		expected: &'static str,
		found: &'static str,
	},
}

/// A compiled jq filter together with the global variables it was compiled
/// against. Variable order is normalized so that equal (source, variables)
/// pairs share one cache entry.
pub struct Expression {
	filter: Filter<Native<Val>>,
	vars: Vec<String>,
	source: String,
}

impl Debug for Expression {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Expression")
			.field("source", &self.source)
			.field("vars", &self.vars)
			.finish()
	}
}

static CACHE: Lazy<RwLock<HashMap<(String, Vec<String>), Arc<Expression>>>> =
	Lazy::new(Default::default);

impl Expression {
	/// Compile `source` with the given `$`-prefixed global variables.
	/// Compiled filters are cached for the lifetime of the process, keyed by
	/// (source, sorted variable names).
	pub fn compile(source: &str, vars: &[&str]) -> Result<Arc<Expression>, Error> {
		let vars: Vec<String> = vars.iter().sorted().map(|v| v.to_string()).collect();
		let key = (source.to_string(), vars.clone());
		if let Some(hit) = CACHE.read().get(&key) {
			return Ok(hit.clone());
		}

		let program = File {
			code: source,
			path: (),
		};
		let loader = Loader::new(jaq_std::defs().chain(jaq_json::defs()));
		let arena = Arena::default();
		let modules = loader.load(&arena, program).map_err(|errs| Error::Invalid {
			expr: source.to_string(),
			detail: errs.into_iter().map(|(_, e)| format!("{e:?}")).join("; "),
		})?;
		let filter = Compiler::default()
			.with_funs(jaq_std::funs().chain(jaq_json::funs()))
			.with_global_vars(vars.iter().map(|v| v.as_str()))
			.compile(modules)
			.map_err(|errs| Error::Invalid {
				expr: source.to_string(),
				detail: errs.into_iter().map(|(_, e)| format!("{e:?}")).join("; "),
			})?;

		let compiled = Arc::new(Expression {
			filter,
			vars,
			source: source.to_string(),
		});
		CACHE.write().insert(key, compiled.clone());
		Ok(compiled)
	}

	pub fn source(&self) -> &str {
		&self.source
	}

	/// Run the filter over `input`, returning every produced value.
	/// `bindings` must cover exactly the variables the expression was
	/// compiled with; extra names are rejected so misuse fails loudly.
	pub fn eval(&self, input: &Value, bindings: &[(&str, &Value)]) -> Result<Vec<Value>, Error> {
		let mut by_name: HashMap<&str, &Value> = bindings.iter().copied().collect();
		let vals = self
			.vars
			.iter()
			.map(|name| {
				by_name
					.remove(name.as_str())
					.map(|v| Val::from(v.clone()))
					.ok_or_else(|| Error::Eval {
						expr: self.source.clone(),
						detail: format!("missing binding for {name}"),
					})
			})
			.collect::<Result<Vec<_>, _>>()?;

		let inputs = RcIter::new(core::iter::empty());
		let ctx = Ctx::new(vals, &inputs);
		self
			.filter
			.run((ctx, Val::from(input.clone())))
			.map(|r| {
				r.map(Value::from).map_err(|e| Error::Eval {
					expr: self.source.clone(),
					detail: e.to_string(),
				})
			})
			.collect()
	}

	/// Run the filter and require exactly one produced value.
	pub fn eval_one(&self, input: &Value, bindings: &[(&str, &Value)]) -> Result<Value, Error> {
		let mut out = self.eval(input, bindings)?;
		if out.len() != 1 {
			return Err(Error::Cardinality {
				expr: self.source.clone(),
				count: out.len(),
			});
		}
		Ok(out.remove(0))
	}
}

/// jq truthiness: everything except `null` and `false`.
pub fn truthy(v: &Value) -> bool {
	!matches!(v, Value::Null | Value::Bool(false))
}

/// Describe a value's JSON type, for error reporting.
pub fn type_name(v: &Value) -> &'static str {
	match v {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
