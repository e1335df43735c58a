use std::collections::BTreeSet;
use std::collections::HashMap;
use std::iter;
use std::sync::Arc;
use std::sync::Weak;

use chrono::Local;
use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Serialize;

use crate::FakeDataProvider;
use crate::FieldValue;
use crate::ObjectRow;
use crate::OutputStream;
use crate::RowRef;
use crate::fake::SharedRng;

/// Hands out 1-based, gapless ids per table.
#[derive(Debug, Default, Clone)]
pub struct IdManager {
	last_used_ids: HashMap<String, u64>,
}

impl IdManager {
	pub fn generate_id(&mut self, table: &str) -> u64 {
		let id = self.last_used_ids.entry(table.to_owned()).or_insert(0);
		*id += 1;
		*id
	}

	pub fn last_id(&self, table: &str) -> Option<u64> {
		self.last_used_ids.get(table).copied()
	}
}

/// Named counters. Each runtime context owns one; the run keeps another
/// that accumulates every increment.
#[derive(Debug, Default, Clone)]
pub struct CounterGenerator {
	counters: HashMap<String, u64>,
}

impl CounterGenerator {
	pub fn get_value(&self, name: &str) -> u64 {
		self.counters.get(name).copied().unwrap_or_default()
	}

	pub fn incr(&mut self, name: &str) -> u64 {
		let counter = self.counters.entry(name.to_owned()).or_insert(0);
		*counter += 1;
		*counter
	}

	pub(crate) fn snapshot(&self) -> HashMap<String, u64> {
		self.counters.clone()
	}
}

/// `table_name_from.field_name` points at a row of `table_name_to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Dependency {
	pub table_name_from: String,
	pub table_name_to: String,
	pub field_name: String,
}

impl Dependency {
	pub fn new(from: impl Into<String>, to: impl Into<String>, field: impl Into<String>) -> Self {
		Self {
			table_name_from: from.into(),
			table_name_to: to.into(),
			field_name: field.into(),
		}
	}
}

/// State shared by every context of one run.
#[derive(Debug)]
pub struct Globals {
	pub(crate) id_manager: IdManager,
	named_objects: IndexMap<String, RowRef>,
	last_seen_obj_of_type: IndexMap<String, RowRef>,
	pub(crate) intertable_dependencies: BTreeSet<Dependency>,
	pub(crate) counter_totals: CounterGenerator,
	pub(crate) rng: SharedRng,
	pub(crate) fake: Arc<dyn FakeDataProvider>,
	pub(crate) today: NaiveDate,
	/// Rows holding references to other rows. Their fields are emptied when
	/// the run ends so that rows referencing each other are freed.
	referencing_rows: Vec<Weak<ObjectRow>>,
}

impl Globals {
	pub(crate) fn new(seed: Option<u64>, fake: Arc<dyn FakeDataProvider>) -> Self {
		Self {
			id_manager: IdManager::default(),
			named_objects: IndexMap::new(),
			last_seen_obj_of_type: IndexMap::new(),
			intertable_dependencies: BTreeSet::new(),
			counter_totals: CounterGenerator::default(),
			rng: SharedRng::new(seed),
			fake,
			today: Local::now().date_naive(),
			referencing_rows: Vec::new(),
		}
	}

	pub(crate) fn register_object(&mut self, row: &RowRef, nickname: Option<&str>) {
		if let Some(nickname) = nickname {
			self.named_objects.insert(nickname.to_owned(), row.clone());
		}

		self.last_seen_obj_of_type
			.insert(row.table().to_owned(), row.clone());
	}

	/// Resolve a nickname, falling back to the latest row of that table.
	pub fn find_object(&self, name: &str) -> Option<&RowRef> {
		self.named_objects
			.get(name)
			.or_else(|| self.last_seen_obj_of_type.get(name))
	}

	/// The row an expression sees under `name`: the latest row of that
	/// table, else the nicknamed row.
	pub(crate) fn visible_object(&self, name: &str) -> Option<&RowRef> {
		self.last_seen_obj_of_type
			.get(name)
			.or_else(|| self.named_objects.get(name))
	}

	/// Rows addressable by name: nicknames, then the latest row per table,
	/// which wins when a nickname is also a table name.
	pub(crate) fn visible_objects(&self) -> impl Iterator<Item = (&str, &RowRef)> {
		self.named_objects
			.iter()
			.chain(&self.last_seen_obj_of_type)
			.map(|(name, row)| (name.as_str(), row))
	}

	/// Every name [`find_object`](Self::find_object) resolves, later entries
	/// winning, so nicknames take precedence as they do there.
	pub(crate) fn findable_objects(&self) -> impl Iterator<Item = (&str, &RowRef)> {
		self.last_seen_obj_of_type
			.iter()
			.chain(&self.named_objects)
			.map(|(name, row)| (name.as_str(), row))
	}

	pub(crate) fn track_references(&mut self, row: &RowRef) {
		self.referencing_rows.push(Arc::downgrade(row));
	}

	pub(crate) fn register_dependency(&mut self, dependency: Dependency) {
		self.intertable_dependencies.insert(dependency);
	}
}

impl Drop for Globals {
	fn drop(&mut self) {
		for row in self.referencing_rows.drain(..).filter_map(|row| row.upgrade()) {
			row.clear();
		}
	}
}

/// The mutable half of a run: the registry and the sink rows are written to.
///
/// Kept apart from [`RuntimeContext`] so that contexts can be borrowed by
/// their children while rows are still being written.
pub struct Interpreter<'o> {
	pub globals: Globals,
	pub(crate) output: &'o mut dyn OutputStream,
}

impl<'o> Interpreter<'o> {
	pub(crate) fn new(globals: Globals, output: &'o mut dyn OutputStream) -> Self {
		Self { globals, output }
	}
}

/// One scope per object-template activation, linked to its parent.
#[derive(Debug)]
pub struct RuntimeContext<'p> {
	parent: Option<&'p RuntimeContext<'p>>,
	table: Option<String>,
	current_id: Option<u64>,
	obj: Option<RowRef>,
	counter_generator: CounterGenerator,
	options: Arc<IndexMap<String, FieldValue>>,
}

impl RuntimeContext<'static> {
	pub fn root(options: IndexMap<String, FieldValue>) -> Self {
		Self {
			parent: None,
			table: None,
			current_id: None,
			obj: None,
			counter_generator: CounterGenerator::default(),
			options: Arc::new(options),
		}
	}
}

impl RuntimeContext<'_> {
	/// A fresh scope for generating rows of `table` underneath this one.
	pub fn child(&self, table: &str) -> RuntimeContext<'_> {
		RuntimeContext {
			parent: Some(self),
			table: Some(table.to_owned()),
			current_id: None,
			obj: None,
			counter_generator: CounterGenerator::default(),
			options: self.options.clone(),
		}
	}

	pub fn table(&self) -> Option<&str> {
		self.table.as_deref()
	}

	pub fn current_id(&self) -> Option<u64> {
		self.current_id
	}

	/// The row being built in this scope.
	pub fn obj(&self) -> Option<&RowRef> {
		self.obj.as_ref()
	}

	pub fn options(&self) -> &IndexMap<String, FieldValue> {
		&self.options
	}

	/// This scope's own counter for its table.
	pub fn number(&self) -> u64 {
		self.table
			.as_deref()
			.map(|table| self.counter_generator.get_value(table))
			.unwrap_or_default()
	}

	pub(crate) fn incr(&mut self, globals: &mut Globals) {
		if let Some(table) = &self.table {
			self.counter_generator.incr(table);
			globals.counter_totals.incr(table);
		}
	}

	pub(crate) fn start_row(&mut self, row: &RowRef, nickname: Option<&str>, globals: &mut Globals) {
		self.current_id = Some(row.id());
		self.obj = Some(row.clone());
		globals.register_object(row, nickname);
	}

	/// Rows of the enclosing scopes, nearest first.
	pub fn ancestors(&self) -> impl Iterator<Item = &RowRef> {
		iter::successors(self.parent, |context| context.parent).filter_map(|context| context.obj.as_ref())
	}

	/// The nearest enclosing row of `table`.
	pub fn ancestor(&self, table: &str) -> Option<&RowRef> {
		self.ancestors().find(|row| row.table() == table)
	}
}
