use std::collections::BTreeSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::BuiltinFakeData;
use crate::Dependency;
use crate::FakeDataProvider;
use crate::FieldValue;
use crate::Globals;
use crate::Interpreter;
use crate::OutputStream;
use crate::ParsedRecipe;
use crate::RuntimeContext;
use crate::SynthgenResult;
use crate::merge_options;
use crate::parse_recipe;
use crate::parse_recipe_file;

/// Settings for one generation run.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
	/// How many times the whole recipe is executed. Ids keep counting up
	/// across batches.
	pub count: u64,
	/// Values for the recipe's declared options.
	pub options: IndexMap<String, FieldValue>,
	/// Seed for every random choice made during the run.
	pub seed: Option<u64>,
	/// Replaces the built-in `fake` data.
	pub fake_provider: Option<Arc<dyn FakeDataProvider>>,
	/// The date `today` refers to; the local date when unset.
	pub today: Option<NaiveDate>,
}

impl Default for GenerateOptions {
	fn default() -> Self {
		Self {
			count: 1,
			options: IndexMap::new(),
			seed: None,
			fake_provider: None,
			today: None,
		}
	}
}

/// What a run produced, for building load mappings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionSummary {
	/// Every table with its written fields.
	pub tables: IndexMap<String, Vec<String>>,
	/// Reference fields observed while generating.
	pub dependencies: BTreeSet<Dependency>,
	/// Caller options the recipe did not declare.
	pub extra_options: BTreeSet<String>,
}

/// A serializable view of an [`ExecutionSummary`].
#[derive(Debug, Serialize)]
pub struct DebugSummary<'s> {
	pub tables: &'s IndexMap<String, Vec<String>>,
	pub dependencies: Vec<&'s Dependency>,
	#[serde(skip_serializing_if = "BTreeSet::is_empty")]
	pub extra_options: &'s BTreeSet<String>,
}

impl ExecutionSummary {
	pub fn summarize_for_debugging(&self) -> DebugSummary<'_> {
		DebugSummary {
			tables: &self.tables,
			dependencies: self.dependencies.iter().collect(),
			extra_options: &self.extra_options,
		}
	}
}

/// Read a recipe from `source` and write its rows to `output`.
///
/// `filename` labels error locations and anchors `include_file` paths. The
/// output is flushed but not closed.
pub fn generate(
	mut source: impl Read,
	filename: &str,
	options: &GenerateOptions,
	output: &mut dyn OutputStream,
) -> SynthgenResult<ExecutionSummary> {
	let mut text = String::new();
	source.read_to_string(&mut text)?;
	let recipe = parse_recipe(&text, filename)?;

	generate_recipe(&recipe, options, output)
}

pub fn generate_file(
	path: &Path,
	options: &GenerateOptions,
	output: &mut dyn OutputStream,
) -> SynthgenResult<ExecutionSummary> {
	let recipe = parse_recipe_file(path)?;
	generate_recipe(&recipe, options, output)
}

/// Execute an already parsed recipe.
pub fn generate_recipe(
	recipe: &ParsedRecipe,
	options: &GenerateOptions,
	output: &mut dyn OutputStream,
) -> SynthgenResult<ExecutionSummary> {
	let merged = merge_options(&recipe.options, &options.options)?;
	let tables = recipe.tables();
	output.create_or_validate_tables(&tables)?;

	let fake = options
		.fake_provider
		.clone()
		.unwrap_or_else(|| Arc::new(BuiltinFakeData));
	let mut globals = Globals::new(options.seed, fake);
	if let Some(today) = options.today {
		globals.today = today;
	}

	let mut interpreter = Interpreter::new(globals, output);
	let root = RuntimeContext::root(merged.values);
	for batch in 0..options.count {
		debug!(batch, filename = %recipe.filename, "starting batch");
		for template in &recipe.templates {
			template.generate_rows(&mut interpreter, &root)?;
		}
	}
	interpreter.output.flush()?;

	Ok(ExecutionSummary {
		tables,
		dependencies: std::mem::take(&mut interpreter.globals.intertable_dependencies),
		extra_options: merged.extra,
	})
}
