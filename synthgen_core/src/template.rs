use std::sync::Arc;
use std::sync::OnceLock;

use indexmap::IndexMap;
use tracing::debug;
use tracing::trace;

use crate::Dependency;
use crate::FieldValue;
use crate::Interpreter;
use crate::ObjectRow;
use crate::RowRef;
use crate::RuntimeContext;
use crate::SynthgenError;
use crate::SynthgenResult;
use crate::evaluator;
use crate::evaluator::Evaluator;
use crate::functions;
use crate::functions::Arguments;
use crate::functions::ContextHost;
use crate::functions::FunctionKind;

/// Anything in the template tree that produces a value.
pub trait Render {
	fn render(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<FieldValue>;
}

/// The right-hand side of a field.
#[derive(Debug, Clone)]
pub enum FieldDefinition {
	Simple(SimpleValue),
	Structured(StructuredValue),
	ChildRecord(ChildRecordValue),
}

impl FieldDefinition {
	pub fn line(&self) -> usize {
		match self {
			Self::Simple(value) => value.line,
			Self::Structured(value) => value.line,
			Self::ChildRecord(value) => value.line,
		}
	}
}

impl Render for FieldDefinition {
	fn render(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<FieldValue> {
		match self {
			Self::Simple(value) => value.render(context, interpreter),
			Self::Structured(value) => value.render(context, interpreter),
			Self::ChildRecord(value) => value.render(context, interpreter),
		}
	}
}

/// A literal, or a string that may embed expressions.
#[derive(Debug, Clone)]
pub struct SimpleValue {
	pub definition: FieldValue,
	pub filename: String,
	pub line: usize,
	evaluator: OnceLock<Evaluator>,
}

impl SimpleValue {
	pub fn new(definition: FieldValue, filename: impl Into<String>, line: usize) -> Self {
		Self {
			definition,
			filename: filename.into(),
			line,
			evaluator: OnceLock::new(),
		}
	}

	/// Compile the definition once; later calls reuse the result.
	pub(crate) fn compile(&self) -> SynthgenResult<Option<&Evaluator>> {
		let FieldValue::String(text) = &self.definition else {
			return Ok(None);
		};

		if let Some(evaluator) = self.evaluator.get() {
			return Ok(Some(evaluator));
		}

		let evaluator =
			Evaluator::compile(text).map_err(|error| error.at(&self.filename, self.line))?;
		Ok(Some(self.evaluator.get_or_init(|| evaluator)))
	}
}

impl Render for SimpleValue {
	fn render(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<FieldValue> {
		let (Some(evaluator), FieldValue::String(text)) = (self.compile()?, &self.definition) else {
			return Ok(self.definition.clone());
		};

		let scope = match evaluator {
			Evaluator::Literal => return Ok(FieldValue::coerce_numeric(text)),
			_ => evaluator::scope(context, &interpreter.globals),
		};

		evaluator
			.evaluate(text, &scope)
			.map_err(|error| error.with_location_if_missing(&self.filename, self.line))
	}
}

/// A function call: `random_number: {min: 1, max: 10}`, `fake: first_name`,
/// or a dotted `Account.Name` lookup.
#[derive(Debug, Clone)]
pub struct StructuredValue {
	pub function_name: String,
	pub args: Vec<FieldDefinition>,
	pub kwargs: IndexMap<String, FieldDefinition>,
	pub filename: String,
	pub line: usize,
}

impl StructuredValue {
	fn render_arguments(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<Arguments> {
		let mut positional = Vec::with_capacity(self.args.len());
		for argument in &self.args {
			positional.push(argument.render(context, interpreter)?);
		}

		let mut keyword = IndexMap::with_capacity(self.kwargs.len());
		for (name, argument) in &self.kwargs {
			keyword.insert(name.clone(), argument.render(context, interpreter)?);
		}

		Ok(Arguments::new(positional, keyword))
	}

	/// `object.method`: a field of a visible row, or a `fake` generator.
	fn render_dotted(
		&self,
		object: &str,
		method: &str,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<FieldValue> {
		if object == "fake" {
			let arguments = self.render_arguments(context, interpreter)?;
			let locale = arguments.locale();
			let globals = &interpreter.globals;
			return globals
				.rng
				.with(|rng| globals.fake.fake(method, locale.as_deref(), rng))
				.ok_or_else(|| SynthgenError::name(format!("unknown fake data type `{method}`")));
		}

		let row = if object == "this" {
			context.obj().cloned()
		} else {
			context
				.obj()
				.and_then(|row| row.get(object))
				.and_then(|value| value.as_row().cloned())
				.or_else(|| context.ancestor(object).cloned())
				.or_else(|| interpreter.globals.visible_object(object).cloned())
		};
		let row =
			row.ok_or_else(|| SynthgenError::name(format!("cannot find definition for `{object}`")))?;

		row.get(method).ok_or_else(|| {
			SynthgenError::name(format!(
				"`{object}` ({}) has no field named `{method}`",
				row.table()
			))
		})
	}

	fn call(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<FieldValue> {
		if let Some((object, method)) = self.function_name.split_once('.') {
			if method.contains('.') {
				return Err(SynthgenError::syntax(format!(
					"function names should have only one `.` in them: `{}`",
					self.function_name
				)));
			}

			return self.render_dotted(object, method, context, interpreter);
		}

		let function = functions::lookup(&self.function_name).ok_or_else(|| {
			SynthgenError::name(format!("cannot find a function named `{}`", self.function_name))
		})?;

		match function.kind {
			FunctionKind::Eager(call) => {
				let arguments = self.render_arguments(context, interpreter)?;
				let host = ContextHost {
					context,
					globals: &interpreter.globals,
				};
				call(&host, &arguments)
			}
			FunctionKind::Lazy(call) => call(self, context, interpreter),
		}
	}
}

impl Render for StructuredValue {
	fn render(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<FieldValue> {
		self.call(context, interpreter)
			.map_err(|error| error.with_location_if_missing(&self.filename, self.line))
	}
}

/// A nested `object:` used as a field value.
#[derive(Debug, Clone)]
pub struct ChildRecordValue {
	pub template: ObjectTemplate,
	pub filename: String,
	pub line: usize,
}

impl Render for ChildRecordValue {
	fn render(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<FieldValue> {
		self.template.render(context, interpreter)
	}
}

/// One `name: definition` pair of an object.
#[derive(Debug, Clone)]
pub struct FieldFactory {
	pub name: String,
	pub definition: FieldDefinition,
	pub filename: String,
	pub line: usize,
}

impl FieldFactory {
	pub fn generate_value(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<FieldValue> {
		self.definition
			.render(context, interpreter)
			.map_err(|error| {
				error
					.in_field(&self.name)
					.with_location_if_missing(&self.filename, self.line)
			})
	}

	/// Fields starting with `__` are visible to expressions but never
	/// written out.
	pub fn is_hidden(&self) -> bool {
		is_hidden_field(&self.name)
	}
}

pub(crate) fn is_hidden_field(name: &str) -> bool {
	name.starts_with("__")
}

/// How many rows an object template produces per activation.
#[derive(Debug, Clone)]
pub enum Count {
	Fixed(u64),
	/// Evaluated afresh on every activation.
	Deferred(SimpleValue),
}

/// An `object:` declaration.
#[derive(Debug, Clone)]
pub struct ObjectTemplate {
	pub tablename: String,
	pub nickname: Option<String>,
	pub count: Option<Count>,
	pub fields: Vec<FieldFactory>,
	pub friends: Vec<ObjectTemplate>,
	pub filename: String,
	pub line: usize,
}

impl ObjectTemplate {
	fn evaluate_count(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<u64> {
		let expression = match &self.count {
			None => return Ok(1),
			Some(Count::Fixed(count)) => return Ok(*count),
			Some(Count::Deferred(expression)) => expression,
		};

		let invalid = |value: &FieldValue| {
			SynthgenError::value(format!(
				"cannot evaluate `{}` as a row count (got `{value}`)",
				expression.definition
			))
			.at(&expression.filename, expression.line)
		};

		let value = expression.render(context, interpreter)?;
		match value {
			FieldValue::Int(count) if count >= 0 => Ok(count as u64),
			FieldValue::Float(count) if count.is_finite() && count >= 0.0 => Ok(count.trunc() as u64),
			other => Err(invalid(&other)),
		}
	}

	/// Produce this template's rows beneath `parent`; returns the last one.
	pub fn generate_rows(
		&self,
		interpreter: &mut Interpreter<'_>,
		parent: &RuntimeContext<'_>,
	) -> SynthgenResult<Option<RowRef>> {
		let mut context = parent.child(&self.tablename);
		let count = self.evaluate_count(&context, interpreter)?;
		debug!(table = %self.tablename, count, line = self.line, "generating rows");

		let mut last = None;
		for _ in 0..count {
			last = Some(self.generate_row(interpreter, &mut context)?);
		}

		Ok(last)
	}

	fn generate_row(
		&self,
		interpreter: &mut Interpreter<'_>,
		context: &mut RuntimeContext<'_>,
	) -> SynthgenResult<RowRef> {
		context.incr(&mut interpreter.globals);
		let id = interpreter.globals.id_manager.generate_id(&self.tablename);
		let row = Arc::new(ObjectRow::new(&self.tablename, id));
		context.start_row(&row, self.nickname.as_deref(), &mut interpreter.globals);

		let mut tracked = false;
		for field in &self.fields {
			let value = field
				.generate_value(context, interpreter)
				.map_err(|error| error.with_location_if_missing(&self.filename, self.line))?;
			if !tracked && matches!(value, FieldValue::Reference(_)) {
				interpreter.globals.track_references(&row);
				tracked = true;
			}
			row.set(&field.name, value);
		}

		for (name, value) in row.fields() {
			if let FieldValue::Reference(target) = value {
				if !is_hidden_field(&name) {
					interpreter
						.globals
						.register_dependency(Dependency::new(&self.tablename, target.table(), name));
				}
			}
		}

		trace!(table = %self.tablename, id, "writing row");
		interpreter
			.output
			.write_row(&self.tablename, &row)
			.map_err(|error| error.with_location_if_missing(&self.filename, self.line))?;

		for friend in &self.friends {
			friend.generate_rows(interpreter, context)?;
		}

		Ok(row)
	}
}

impl Render for ObjectTemplate {
	/// The last generated row, or null when the count was zero.
	fn render(
		&self,
		context: &RuntimeContext<'_>,
		interpreter: &mut Interpreter<'_>,
	) -> SynthgenResult<FieldValue> {
		Ok(self
			.generate_rows(interpreter, context)?
			.map_or(FieldValue::Null, FieldValue::Reference))
	}
}
