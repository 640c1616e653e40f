use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use uuid::Uuid;

pub const ROOT_CONTEXT: &str = "root";

/// A named data slot in the crawl's context tree. The payload lives behind a
/// mutex so merges from parallel iterations can rewrite it in place while the
/// store itself stays immutable.
#[derive(Debug)]
pub struct Context {
	pub name: String,
	pub key: String,
	pub parent: Option<String>,
	pub depth: usize,
	data: Mutex<Value>,
}

impl Context {
	pub fn data(&self) -> Value {
		self.data.lock().clone()
	}

	pub fn set_data(&self, value: Value) {
		*self.data.lock() = value;
	}
}

/// Visible contexts at one point of the step tree. Spawning a child clones
/// the name map and adds (or shadows) a single binding; ancestors' stores are
/// never mutated. Data mutation is shared: a context reached from two stores
/// is the same cell.
#[derive(Debug, Clone)]
pub struct ContextStore {
	by_name: HashMap<String, Arc<Context>>,
	current: String,
	merge_lock: Arc<Mutex<()>>,
}

impl ContextStore {
	pub fn new_root(value: Value) -> ContextStore {
		let root = Arc::new(Context {
			name: ROOT_CONTEXT.to_string(),
			key: ROOT_CONTEXT.to_string(),
			parent: None,
			depth: 0,
			data: Mutex::new(value),
		});
		ContextStore {
			by_name: HashMap::from([(ROOT_CONTEXT.to_string(), root)]),
			current: ROOT_CONTEXT.to_string(),
			merge_lock: Arc::new(Mutex::new(())),
		}
	}

	pub fn current(&self) -> &Arc<Context> {
		self
			.by_name
			.get(&self.current)
			.expect("current context is always bound")
	}

	pub fn lookup(&self, name: &str) -> Option<&Arc<Context>> {
		self.by_name.get(name)
	}

	/// The lock serializing every merge in this crawl.
	pub fn merge_lock(&self) -> &Arc<Mutex<()>> {
		&self.merge_lock
	}

	/// Create a child of the current context and return a store in which it
	/// is both visible under `name` and current. The parent store is left
	/// untouched; an existing binding with the same name is shadowed.
	pub fn child(&self, name: &str, value: Value) -> ContextStore {
		let parent = self.current();
		let child = Arc::new(Context {
			name: name.to_string(),
			key: Uuid::new_v4().to_string(),
			parent: Some(parent.key.clone()),
			depth: parent.depth + 1,
			data: Mutex::new(value),
		});
		let mut by_name = self.by_name.clone();
		by_name.insert(name.to_string(), child);
		ContextStore {
			by_name,
			current: name.to_string(),
			merge_lock: self.merge_lock.clone(),
		}
	}

	/// The parent of the current context, if it is still visible by name.
	pub fn parent_of_current(&self) -> Option<&Arc<Context>> {
		let parent_key = self.current().parent.as_ref()?;
		self.by_name.values().find(|c| &c.key == parent_key)
	}

	/// Snapshot for URL templates and `$ctx` bindings: every named context
	/// under its name, with a mapping-shaped root promoted to the top level.
	/// A sequence root contributes nothing at the top level.
	pub fn template_context(&self) -> Map<String, Value> {
		let mut top = Map::new();
		if let Some(root) = self.by_name.get(ROOT_CONTEXT) {
			if let Value::Object(fields) = root.data() {
				top.extend(fields);
			}
		}
		for (name, ctx) in &self.by_name {
			if name == ROOT_CONTEXT {
				continue;
			}
			top.insert(name.clone(), ctx.data());
		}
		top
	}
}
