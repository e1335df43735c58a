//! The expression language embedded in recipe strings.
//!
//! Expressions use `<< >>` for values, `<% %>` for statements and `<# #>` for
//! comments, none of which mean anything to YAML. Templates are compiled
//! once per distinct string and cached in a process-wide environment; the
//! cache only holds compiled source, so it is shared safely between runs.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use minijinja::AutoEscape;
use minijinja::Environment;
use minijinja::ErrorKind;
use minijinja::UndefinedBehavior;
use minijinja::Value;
use minijinja::syntax::SyntaxConfig;

use crate::FieldValue;
use crate::Globals;
use crate::RuntimeContext;
use crate::SynthgenError;
use crate::SynthgenResult;
use crate::fake::FakeHandle;
use crate::functions;
use crate::functions::RunHandle;
use crate::value::RowHandle;

const NATIVE_VALUE: &str = "__value";

static ENVIRONMENT: LazyLock<Result<Environment<'static>, minijinja::Error>> =
	LazyLock::new(build_environment);

fn build_environment() -> Result<Environment<'static>, minijinja::Error> {
	let mut env = Environment::new();
	env.set_syntax(
		SyntaxConfig::builder()
			.block_delimiters("<%", "%>")
			.variable_delimiters("<<", ">>")
			.comment_delimiters("<#", "#>")
			.build()?,
	);
	env.set_undefined_behavior(UndefinedBehavior::Strict);
	env.set_auto_escape_callback(|_| AutoEscape::None);
	// Template names are the template sources, so the loader's cache doubles
	// as the compilation cache.
	env.set_loader(|source| Ok(Some(source.to_owned())));
	functions::register_inline_functions(&mut env);

	Ok(env)
}

fn environment() -> SynthgenResult<&'static Environment<'static>> {
	ENVIRONMENT.as_ref().map_err(|error| {
		SynthgenError::generic(format!("cannot configure the expression language: {error}"))
	})
}

/// Does `text` contain anything the expression language would interpret?
pub(crate) fn has_expression_syntax(text: &str) -> bool {
	text.contains("<<") || text.contains("<%")
}

/// How a string definition is turned into a value.
#[derive(Debug, Clone)]
pub(crate) enum Evaluator {
	/// No expression syntax: the text itself, numerically coerced.
	Literal,
	/// Exactly one `<< expr >>`: the expression's own value, not its text.
	Expression(String),
	/// Anything else renders to text.
	Template(String),
}

impl Evaluator {
	/// Compile `definition`, surfacing syntax errors immediately.
	pub(crate) fn compile(definition: &str) -> SynthgenResult<Self> {
		if !has_expression_syntax(definition) {
			return Ok(Self::Literal);
		}

		let evaluator = match single_expression(definition) {
			Some(expression) => {
				Self::Expression(format!("<% set {NATIVE_VALUE} = ({expression}) %>"))
			}
			None => Self::Template(definition.to_owned()),
		};

		if let Self::Expression(source) | Self::Template(source) = &evaluator {
			environment()?
				.get_template(source)
				.map_err(|error| template_error(&error, definition))?;
		}

		Ok(evaluator)
	}

	pub(crate) fn evaluate(&self, definition: &str, scope: &Value) -> SynthgenResult<FieldValue> {
		let value = match self {
			Self::Literal => return Ok(FieldValue::coerce_numeric(definition)),
			Self::Template(source) => {
				let rendered = environment()?
					.get_template(source)
					.and_then(|template| template.render(scope))
					.map_err(|error| evaluation_error(&error, definition, scope))?;
				return Ok(FieldValue::coerce_numeric(&rendered));
			}
			Self::Expression(source) => {
				let template = environment()?
					.get_template(source)
					.map_err(|error| template_error(&error, definition))?;
				let state = template
					.eval_to_state(scope)
					.map_err(|error| evaluation_error(&error, definition, scope))?;
				let value = state.lookup(NATIVE_VALUE).unwrap_or_default();
				if value.is_undefined() {
					return Err(missing_row_field(definition, scope).unwrap_or_else(|| {
						SynthgenError::name(format!("`{}` is undefined", definition.trim()))
					}));
				}

				value
			}
		};

		match FieldValue::from_value(&value)? {
			FieldValue::String(text) => Ok(FieldValue::coerce_numeric(&text)),
			other => Ok(other),
		}
	}
}

/// The inner expression when `definition` is a single `<< ... >>`.
fn single_expression(definition: &str) -> Option<&str> {
	let inner = definition.strip_prefix("<<")?.strip_suffix(">>")?;
	let nested = inner.contains("<<") || inner.contains(">>") || inner.contains("<%");

	(!nested).then_some(inner)
}

fn evaluation_error(error: &minijinja::Error, definition: &str, scope: &Value) -> SynthgenError {
	if matches!(error.kind(), ErrorKind::UndefinedError) {
		if let Some(error) = missing_row_field(definition, scope) {
			return error;
		}
	}

	template_error(error, definition)
}

/// The first `row.field` in `definition` whose row has no such field.
fn missing_row_field(definition: &str, scope: &Value) -> Option<SynthgenError> {
	definition
		.split(|character: char| !(character.is_alphanumeric() || matches!(character, '_' | '.')))
		.filter_map(|path| path.split_once('.'))
		.find_map(|(object, field)| {
			if field.is_empty() || field.contains('.') {
				return None;
			}

			let value = scope.get_attr(object).ok()?;
			let row = value.downcast_object_ref::<RowHandle>()?;
			row.0.get(field).is_none().then(|| {
				SynthgenError::name(format!(
					"`{object}` ({}) has no field named `{field}`",
					row.0.table()
				))
			})
		})
}

fn template_error(error: &minijinja::Error, definition: &str) -> SynthgenError {
	let detail = error.detail().map_or_else(
		|| error.kind().to_string(),
		|detail| format!("{}: {detail}", error.kind()),
	);
	let message = format!("{detail} in `{}`", definition.trim());

	match error.kind() {
		ErrorKind::SyntaxError => SynthgenError::syntax(message),
		ErrorKind::UndefinedError
		| ErrorKind::UnknownFunction
		| ErrorKind::UnknownMethod
		| ErrorKind::UnknownFilter
		| ErrorKind::UnknownTest => SynthgenError::name(message),
		_ => SynthgenError::value(message),
	}
}

/// Everything an expression can see while a row of `context` is rendered.
pub(crate) fn scope(context: &RuntimeContext<'_>, globals: &Globals) -> Value {
	let mut variables: BTreeMap<String, Value> = context
		.options()
		.iter()
		.map(|(name, value)| (name.clone(), value.to_value()))
		.collect();

	for (name, row) in globals.visible_objects() {
		variables.insert(name.to_owned(), Value::from_object(RowHandle(row.clone())));
	}

	let ancestors: Vec<_> = context.ancestors().cloned().collect();
	for row in ancestors.iter().rev() {
		variables.insert(row.table().to_owned(), Value::from_object(RowHandle(row.clone())));
	}

	if let Some(id) = context.current_id() {
		variables.insert("id".to_owned(), Value::from(id));
	}

	if let Some(row) = context.obj() {
		variables.insert("this".to_owned(), Value::from_object(RowHandle(row.clone())));
	}

	variables.insert("number".to_owned(), Value::from(context.number()));
	variables.insert("today".to_owned(), FieldValue::Date(globals.today).to_value());
	variables.insert(
		"fake".to_owned(),
		Value::from_object(FakeHandle {
			provider: globals.fake.clone(),
			rng: globals.rng.clone(),
			locale: None,
		}),
	);
	variables.insert(
		functions::RUN_VARIABLE.to_owned(),
		Value::from_object(RunHandle {
			rng: globals.rng.clone(),
			provider: globals.fake.clone(),
			today: globals.today,
			objects: globals
				.findable_objects()
				.map(|(name, row)| (name.to_owned(), row.clone()))
				.collect(),
			counters: globals.counter_totals.snapshot(),
			ancestors,
		}),
	);

	if let Some(row) = context.obj() {
		for (name, value) in row.fields() {
			variables.insert(name, value.to_value());
		}
	}

	Value::from(variables)
}
