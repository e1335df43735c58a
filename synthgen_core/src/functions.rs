//! Template functions callable from structured values (`random_number:`) and
//! from inline expressions (`<<random_number(1, 6)>>`).
//!
//! Every function is registered with an explicit [`FunctionKind`]. Eager
//! functions receive rendered arguments. Lazy functions receive the raw
//! definitions and decide which of them to render, which is what keeps an
//! unchosen `random_choice` branch from generating rows.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Days;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use indexmap::IndexMap;
use minijinja::Environment;
use minijinja::ErrorKind;
use minijinja::State;
use minijinja::Value;
use minijinja::value::Kwargs;
use minijinja::value::Object;
use minijinja::value::Rest;
use rand::Rng;
use rand::distributions::Distribution;
use rand::distributions::WeightedIndex;

use crate::FakeDataProvider;
use crate::FieldDefinition;
use crate::FieldValue;
use crate::Globals;
use crate::Interpreter;
use crate::Render;
use crate::RowRef;
use crate::RuntimeContext;
use crate::StructuredValue;
use crate::SynthgenError;
use crate::SynthgenResult;
use crate::fake::FakeHandle;
use crate::fake::SharedRng;

/// Scope variable holding the run data inline functions need.
pub(crate) const RUN_VARIABLE: &str = "__run";

pub(crate) type EagerFunction = fn(&dyn FunctionHost, &Arguments) -> SynthgenResult<FieldValue>;
pub(crate) type LazyFunction =
	fn(&StructuredValue, &RuntimeContext<'_>, &mut Interpreter<'_>) -> SynthgenResult<FieldValue>;

/// How a function receives its arguments.
#[derive(Clone, Copy)]
pub(crate) enum FunctionKind {
	Eager(EagerFunction),
	Lazy(LazyFunction),
}

pub(crate) struct TemplateFunction {
	pub(crate) name: &'static str,
	pub(crate) kind: FunctionKind,
}

static TEMPLATE_FUNCTIONS: [TemplateFunction; 12] = [
	TemplateFunction {
		name: "int",
		kind: FunctionKind::Eager(int),
	},
	TemplateFunction {
		name: "random_number",
		kind: FunctionKind::Eager(random_number),
	},
	TemplateFunction {
		name: "date",
		kind: FunctionKind::Eager(date),
	},
	TemplateFunction {
		name: "datetime",
		kind: FunctionKind::Eager(datetime),
	},
	TemplateFunction {
		name: "date_between",
		kind: FunctionKind::Eager(date_between),
	},
	TemplateFunction {
		name: "reference",
		kind: FunctionKind::Eager(reference),
	},
	TemplateFunction {
		name: "counter",
		kind: FunctionKind::Eager(counter),
	},
	TemplateFunction {
		name: "fake",
		kind: FunctionKind::Eager(fake),
	},
	TemplateFunction {
		name: "ancestor",
		kind: FunctionKind::Eager(ancestor),
	},
	TemplateFunction {
		name: "random_choice",
		kind: FunctionKind::Lazy(random_choice),
	},
	TemplateFunction {
		name: "if",
		kind: FunctionKind::Lazy(if_),
	},
	TemplateFunction {
		name: "choice",
		kind: FunctionKind::Lazy(choice),
	},
];

pub(crate) fn lookup(name: &str) -> Option<&'static TemplateFunction> {
	TEMPLATE_FUNCTIONS
		.iter()
		.find(|function| function.name == name)
}

/// What a function may read from the run it is called in.
pub(crate) trait FunctionHost {
	fn rng(&self) -> &SharedRng;
	fn today(&self) -> NaiveDate;
	fn find_object(&self, name: &str) -> Option<RowRef>;
	fn counter_total(&self, name: &str) -> u64;
	fn ancestor(&self, table: &str) -> Option<RowRef>;
	fn fake(&self, name: &str, locale: Option<&str>) -> Option<FieldValue>;
}

/// Functions called from a structured value see the live run.
pub(crate) struct ContextHost<'a, 'p> {
	pub(crate) context: &'a RuntimeContext<'p>,
	pub(crate) globals: &'a Globals,
}

impl FunctionHost for ContextHost<'_, '_> {
	fn rng(&self) -> &SharedRng {
		&self.globals.rng
	}

	fn today(&self) -> NaiveDate {
		self.globals.today
	}

	fn find_object(&self, name: &str) -> Option<RowRef> {
		self.globals.find_object(name).cloned()
	}

	fn counter_total(&self, name: &str) -> u64 {
		self.globals.counter_totals.get_value(name)
	}

	fn ancestor(&self, table: &str) -> Option<RowRef> {
		self.context.ancestor(table).cloned()
	}

	fn fake(&self, name: &str, locale: Option<&str>) -> Option<FieldValue> {
		self.globals
			.rng
			.with(|rng| self.globals.fake.fake(name, locale, rng))
	}
}

/// Functions called inline see a snapshot of the run taken when the
/// expression's scope was built.
#[derive(Debug)]
pub(crate) struct RunHandle {
	pub(crate) rng: SharedRng,
	pub(crate) provider: Arc<dyn FakeDataProvider>,
	pub(crate) today: NaiveDate,
	pub(crate) objects: HashMap<String, RowRef>,
	pub(crate) counters: HashMap<String, u64>,
	pub(crate) ancestors: Vec<RowRef>,
}

impl Object for RunHandle {}

impl FunctionHost for RunHandle {
	fn rng(&self) -> &SharedRng {
		&self.rng
	}

	fn today(&self) -> NaiveDate {
		self.today
	}

	fn find_object(&self, name: &str) -> Option<RowRef> {
		self.objects.get(name).cloned()
	}

	fn counter_total(&self, name: &str) -> u64 {
		self.counters.get(name).copied().unwrap_or_default()
	}

	fn ancestor(&self, table: &str) -> Option<RowRef> {
		self.ancestors
			.iter()
			.find(|row| row.table() == table)
			.cloned()
	}

	fn fake(&self, name: &str, locale: Option<&str>) -> Option<FieldValue> {
		self.rng.with(|rng| self.provider.fake(name, locale, rng))
	}
}

/// Rendered arguments of an eager call.
#[derive(Debug, Default)]
pub(crate) struct Arguments {
	positional: Vec<FieldValue>,
	keyword: IndexMap<String, FieldValue>,
}

impl Arguments {
	pub(crate) fn new(positional: Vec<FieldValue>, keyword: IndexMap<String, FieldValue>) -> Self {
		Self {
			positional,
			keyword,
		}
	}

	fn from_inline(args: &[Value], kwargs: &Kwargs) -> SynthgenResult<Self> {
		let positional = args
			.iter()
			.map(FieldValue::from_value)
			.collect::<SynthgenResult<Vec<_>>>()?;
		let mut keyword = IndexMap::new();
		for name in kwargs.args() {
			let value = kwargs
				.get::<Value>(name)
				.map_err(|error| SynthgenError::value(error.to_string()))?;
			keyword.insert(name.to_owned(), FieldValue::from_value(&value)?);
		}

		Ok(Self::new(positional, keyword))
	}

	/// A keyword argument, or else the positional one at `index`.
	fn get(&self, index: usize, name: &str) -> Option<&FieldValue> {
		self.keyword
			.get(name)
			.or_else(|| self.positional.get(index))
	}

	fn require(&self, function: &str, index: usize, name: &str) -> SynthgenResult<&FieldValue> {
		self.get(index, name).ok_or_else(|| {
			SynthgenError::value(format!("`{function}` is missing the `{name}` argument"))
		})
	}

	fn len(&self) -> usize {
		self.positional.len() + self.keyword.len()
	}

	pub(crate) fn locale(&self) -> Option<String> {
		self.keyword
			.get("locale")
			.and_then(FieldValue::as_str)
			.map(str::to_owned)
	}
}

fn as_int(function: &str, value: &FieldValue) -> SynthgenResult<i64> {
	match value {
		FieldValue::Int(value) => Ok(*value),
		FieldValue::Float(value) => Ok(value.trunc() as i64),
		FieldValue::Bool(value) => Ok(i64::from(*value)),
		FieldValue::String(text) => {
			let text = text.trim();
			text.parse::<i64>()
				.ok()
				.or_else(|| text.parse::<f64>().ok().map(|value| value.trunc() as i64))
				.ok_or_else(|| {
					SynthgenError::value(format!("`{function}` cannot read `{text}` as an integer"))
				})
		}
		other => {
			Err(SynthgenError::value(format!(
				"`{function}` cannot read a {} as an integer",
				other.type_name()
			)))
		}
	}
}

fn parse_date(text: &str) -> Option<NaiveDate> {
	NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").ok()
}

/// Dates given as values, ISO strings, `today` or offsets like `-30d`, `+2y`.
fn as_date(function: &str, value: &FieldValue, today: NaiveDate) -> SynthgenResult<NaiveDate> {
	let date = match value {
		FieldValue::Date(date) => Some(*date),
		FieldValue::DateTime(datetime) => Some(datetime.date()),
		FieldValue::String(text) => parse_date(text).or_else(|| relative_date(text.trim(), today)),
		_ => None,
	};

	date.ok_or_else(|| SynthgenError::value(format!("`{function}` cannot read `{value}` as a date")))
}

fn relative_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
	if text == "today" {
		return Some(today);
	}

	let (forward, offset) = match text.strip_prefix('+') {
		Some(offset) => (true, offset),
		None => (false, text.strip_prefix('-')?),
	};
	let unit = offset.chars().last()?;
	let amount: u64 = offset[..offset.len() - unit.len_utf8()].parse().ok()?;
	let days = match unit {
		'd' => amount,
		'w' => amount * 7,
		'm' => amount * 30,
		'y' => amount * 365,
		_ => return None,
	};

	if forward {
		today.checked_add_days(Days::new(days))
	} else {
		today.checked_sub_days(Days::new(days))
	}
}

fn int(_host: &dyn FunctionHost, args: &Arguments) -> SynthgenResult<FieldValue> {
	as_int("int", args.require("int", 0, "value")?).map(FieldValue::Int)
}

fn random_number(host: &dyn FunctionHost, args: &Arguments) -> SynthgenResult<FieldValue> {
	let min = as_int("random_number", args.require("random_number", 0, "min")?)?;
	let max = as_int("random_number", args.require("random_number", 1, "max")?)?;
	if min > max {
		return Err(SynthgenError::value(format!(
			"`random_number` needs min <= max, got {min} and {max}"
		)));
	}

	Ok(FieldValue::Int(host.rng().with(|rng| rng.gen_range(min..=max))))
}

fn date(host: &dyn FunctionHost, args: &Arguments) -> SynthgenResult<FieldValue> {
	if args.len() == 1 {
		if let Some(value) = args.get(0, "date") {
			return as_date("date", value, host.today()).map(FieldValue::Date);
		}
	}

	let year = as_int("date", args.require("date", 0, "year")?)?;
	let month = as_int("date", args.require("date", 1, "month")?)?;
	let day = as_int("date", args.require("date", 2, "day")?)?;

	NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
		.map(FieldValue::Date)
		.ok_or_else(|| SynthgenError::value(format!("`{year}-{month}-{day}` is not a valid date")))
}

fn datetime(host: &dyn FunctionHost, args: &Arguments) -> SynthgenResult<FieldValue> {
	if args.len() == 1 {
		match args.get(0, "datetime") {
			Some(FieldValue::DateTime(value)) => return Ok(FieldValue::DateTime(*value)),
			Some(FieldValue::String(text)) => {
				if let Some(value) = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
					.iter()
					.find_map(|format| NaiveDateTime::parse_from_str(text.trim(), format).ok())
				{
					return Ok(FieldValue::DateTime(value));
				}
			}
			_ => {}
		}

		if let Some(value) = args.get(0, "datetime") {
			let date = as_date("datetime", value, host.today())?;
			return Ok(FieldValue::DateTime(date.and_hms_opt(0, 0, 0).unwrap_or_default()));
		}
	}

	let FieldValue::Date(day) = date(host, args)? else {
		return Ok(FieldValue::Null);
	};
	let component = |index: usize, name: &str| -> SynthgenResult<u32> {
		args.get(index, name)
			.map_or(Ok(0), |value| as_int("datetime", value))
			.map(|value| value as u32)
	};
	let hour = component(3, "hour")?;
	let minute = component(4, "minute")?;
	let second = component(5, "second")?;

	day.and_hms_opt(hour, minute, second)
		.map(FieldValue::DateTime)
		.ok_or_else(|| {
			SynthgenError::value(format!("`{hour}:{minute}:{second}` is not a valid time"))
		})
}

/// A uniformly random date in `[start_date, end_date]`.
///
/// An empty range yields null instead of an error.
fn date_between(host: &dyn FunctionHost, args: &Arguments) -> SynthgenResult<FieldValue> {
	let today = host.today();
	let start = as_date(
		"date_between",
		args.require("date_between", 0, "start_date")?,
		today,
	)?;
	let end = as_date(
		"date_between",
		args.require("date_between", 1, "end_date")?,
		today,
	)?;
	let span = end.signed_duration_since(start).num_days();
	if span < 0 {
		return Ok(FieldValue::Null);
	}

	let offset = host.rng().with(|rng| rng.gen_range(0..=span));
	Ok(start
		.checked_add_days(Days::new(offset as u64))
		.map_or(FieldValue::Null, FieldValue::Date))
}

fn reference(host: &dyn FunctionHost, args: &Arguments) -> SynthgenResult<FieldValue> {
	match args.require("reference", 0, "x")? {
		FieldValue::Reference(row) => Ok(FieldValue::Reference(row.clone())),
		FieldValue::String(name) => {
			host.find_object(name)
				.map(FieldValue::Reference)
				.ok_or_else(|| SynthgenError::name(format!("cannot find an object named `{name}`")))
		}
		other => {
			Err(SynthgenError::value(format!(
				"cannot reference a {} value: `{other}`",
				other.type_name()
			)))
		}
	}
}

fn counter(host: &dyn FunctionHost, args: &Arguments) -> SynthgenResult<FieldValue> {
	let name = args.require("counter", 0, "name")?;
	let name = name
		.as_str()
		.ok_or_else(|| SynthgenError::value("`counter` expects a table name"))?;

	Ok(FieldValue::Int(host.counter_total(name) as i64))
}

fn fake(host: &dyn FunctionHost, args: &Arguments) -> SynthgenResult<FieldValue> {
	let name = args.require("fake", 0, "name")?;
	let name = name
		.as_str()
		.ok_or_else(|| SynthgenError::value("`fake` expects the name of a generator"))?;
	let locale = args.get(1, "locale").and_then(FieldValue::as_str);

	host.fake(name, locale)
		.ok_or_else(|| SynthgenError::name(format!("unknown fake data type `{name}`")))
}

fn ancestor(host: &dyn FunctionHost, args: &Arguments) -> SynthgenResult<FieldValue> {
	let table = args.require("ancestor", 0, "table")?;
	let table = table
		.as_str()
		.ok_or_else(|| SynthgenError::value("`ancestor` expects a table name"))?;

	host.ancestor(table)
		.map(FieldValue::Reference)
		.ok_or_else(|| SynthgenError::name(format!("no enclosing `{table}` row")))
}

/// A `choice:` entry of `random_choice` or `if`.
pub(crate) struct Choice<'t> {
	pub(crate) probability: Option<&'t FieldDefinition>,
	pub(crate) when: Option<&'t FieldDefinition>,
	pub(crate) pick: &'t FieldDefinition,
}

impl<'t> Choice<'t> {
	/// `Some` when `definition` is a `choice` call.
	pub(crate) fn from_definition(definition: &'t FieldDefinition) -> SynthgenResult<Option<Self>> {
		let FieldDefinition::Structured(call) = definition else {
			return Ok(None);
		};
		if call.function_name != "choice" {
			return Ok(None);
		}

		if let Some(name) = call
			.kwargs
			.keys()
			.find(|name| !matches!(name.as_str(), "probability" | "when" | "pick"))
		{
			return Err(SynthgenError::value(format!("unexpected `choice` argument `{name}`"))
				.at(&call.filename, call.line));
		}

		let pick = call
			.kwargs
			.get("pick")
			.or_else(|| call.args.first())
			.ok_or_else(|| {
				SynthgenError::value("`choice` needs a `pick`").at(&call.filename, call.line)
			})?;

		Ok(Some(Self {
			probability: call.kwargs.get("probability"),
			when: call.kwargs.get("when"),
			pick,
		}))
	}
}

/// Parse a relative weight: `30`, `2.5` or `"30%"`.
pub(crate) fn parse_weight(value: &FieldValue) -> SynthgenResult<f64> {
	let weight = match value {
		FieldValue::String(text) => {
			let text = text.trim();
			text.strip_suffix('%')
				.unwrap_or(text)
				.trim()
				.parse::<f64>()
				.ok()
		}
		other => other.as_f64(),
	};

	weight
		.filter(|weight| weight.is_finite() && *weight >= 0.0)
		.ok_or_else(|| SynthgenError::value(format!("cannot use `{value}` as a probability")))
}

fn weighted_index(rng: &SharedRng, weights: &[f64]) -> SynthgenResult<usize> {
	let distribution = WeightedIndex::new(weights)
		.map_err(|error| SynthgenError::value(format!("invalid probabilities: {error}")))?;

	Ok(rng.with(|rng| distribution.sample(rng)))
}

/// Pick one option and render only that one.
fn random_choice(
	call: &StructuredValue,
	context: &RuntimeContext<'_>,
	interpreter: &mut Interpreter<'_>,
) -> SynthgenResult<FieldValue> {
	if !call.kwargs.is_empty() {
		if !call.args.is_empty() {
			return Err(SynthgenError::value(
				"`random_choice` takes either a list of options or a mapping of weights, not both",
			));
		}

		let mut weights = Vec::with_capacity(call.kwargs.len());
		for weight in call.kwargs.values() {
			weights.push(parse_weight(&weight.render(context, interpreter)?)?);
		}
		let index = weighted_index(&interpreter.globals.rng, &weights)?;
		let payload = call.kwargs.keys().nth(index).map_or("", String::as_str);

		return Ok(FieldValue::coerce_numeric(payload));
	}

	if call.args.is_empty() {
		return Err(SynthgenError::value("`random_choice` needs at least one option"));
	}

	let choices = call
		.args
		.iter()
		.map(Choice::from_definition)
		.collect::<SynthgenResult<Vec<_>>>()?;

	if choices.iter().all(Option::is_none) {
		let index = interpreter
			.globals
			.rng
			.with(|rng| rng.gen_range(0..call.args.len()));
		return call.args[index].render(context, interpreter);
	}

	let mut weights = Vec::with_capacity(choices.len());
	let mut picks = Vec::with_capacity(choices.len());
	for choice in choices {
		let Some(choice) = choice else {
			return Err(SynthgenError::value(
				"`random_choice` options must either all be `choice` entries or none of them",
			));
		};
		let probability = choice.probability.ok_or_else(|| {
			SynthgenError::value("every `choice` of a `random_choice` needs a `probability`")
		})?;
		weights.push(parse_weight(&probability.render(context, interpreter)?)?);
		picks.push(choice.pick);
	}

	let index = weighted_index(&interpreter.globals.rng, &weights)?;
	picks[index].render(context, interpreter)
}

/// Render the first branch whose `when` holds; the last branch may omit
/// `when`. No match yields null.
fn if_(
	call: &StructuredValue,
	context: &RuntimeContext<'_>,
	interpreter: &mut Interpreter<'_>,
) -> SynthgenResult<FieldValue> {
	if !call.kwargs.is_empty() {
		return Err(SynthgenError::value("`if` takes a list of `choice` entries"));
	}

	let mut branches = Vec::with_capacity(call.args.len());
	for argument in &call.args {
		let branch = Choice::from_definition(argument)?
			.ok_or_else(|| SynthgenError::value("every branch of an `if` must be a `choice`"))?;
		branches.push(branch);
	}

	let last = branches.len().saturating_sub(1);
	if let Some(index) = branches
		.iter()
		.position(|branch| branch.when.is_none())
		.filter(|index| *index != last)
	{
		return Err(SynthgenError::value(format!(
			"only the last `choice` of an `if` may omit `when` (branch {} has none)",
			index + 1
		)));
	}

	for branch in branches {
		let matched = match branch.when {
			Some(when) => when.render(context, interpreter)?.is_truthy(),
			None => true,
		};
		if matched {
			return branch.pick.render(context, interpreter);
		}
	}

	Ok(FieldValue::Null)
}

fn choice(
	_call: &StructuredValue,
	_context: &RuntimeContext<'_>,
	_interpreter: &mut Interpreter<'_>,
) -> SynthgenResult<FieldValue> {
	Err(SynthgenError::value(
		"`choice` can only be used inside `random_choice` or `if`",
	))
}

fn run_handle(state: &State<'_, '_>) -> Result<Arc<RunHandle>, minijinja::Error> {
	state
		.lookup(RUN_VARIABLE)
		.and_then(|value| value.downcast_object::<RunHandle>())
		.ok_or_else(|| {
			minijinja::Error::new(
				ErrorKind::InvalidOperation,
				"template functions are only available while rows are generated",
			)
		})
}

fn template_error(error: &SynthgenError) -> minijinja::Error {
	let kind = match error {
		SynthgenError::Name { .. } => ErrorKind::UndefinedError,
		SynthgenError::Syntax { .. } => ErrorKind::SyntaxError,
		_ => ErrorKind::InvalidOperation,
	};

	minijinja::Error::new(kind, error.message())
}

fn call_inline(
	state: &State<'_, '_>,
	function: EagerFunction,
	args: &[Value],
	kwargs: &Kwargs,
) -> Result<Value, minijinja::Error> {
	let host = run_handle(state)?;
	let arguments = Arguments::from_inline(args, kwargs).map_err(|error| template_error(&error))?;
	let value = function(&*host, &arguments).map_err(|error| template_error(&error))?;

	Ok(value.to_value())
}

/// Uniform over positional options, or weighted over `value=weight` pairs.
fn inline_random_choice(state: &State<'_, '_>, args: &[Value], kwargs: &Kwargs) -> Result<Value, minijinja::Error> {
	let host = run_handle(state)?;
	let arguments = Arguments::from_inline(args, kwargs).map_err(|error| template_error(&error))?;

	if !arguments.keyword.is_empty() {
		let weights = arguments
			.keyword
			.values()
			.map(parse_weight)
			.collect::<SynthgenResult<Vec<_>>>()
			.map_err(|error| template_error(&error))?;
		let index = weighted_index(&host.rng, &weights).map_err(|error| template_error(&error))?;
		let payload = arguments.keyword.keys().nth(index).map_or("", String::as_str);

		return Ok(FieldValue::coerce_numeric(payload).to_value());
	}

	if args.is_empty() {
		return Err(minijinja::Error::new(
			ErrorKind::MissingArgument,
			"`random_choice` needs at least one option",
		));
	}

	let index = host.rng.with(|rng| rng.gen_range(0..args.len()));
	Ok(args[index].clone())
}

fn fake_i18n(state: &State<'_, '_>, locale: &str) -> Result<Value, minijinja::Error> {
	let host = run_handle(state)?;

	Ok(Value::from_object(FakeHandle {
		provider: host.provider.clone(),
		rng: host.rng.clone(),
		locale: Some(locale.to_owned()),
	}))
}

/// Make every eager function callable from inline expressions.
pub(crate) fn register_inline_functions(env: &mut Environment<'static>) {
	for function in &TEMPLATE_FUNCTIONS {
		if let FunctionKind::Eager(call) = function.kind {
			env.add_function(
				function.name,
				move |state: &State, args: Rest<Value>, kwargs: Kwargs| {
					call_inline(state, call, &args, &kwargs)
				},
			);
		}
	}

	env.add_function(
		"random_choice",
		|state: &State, args: Rest<Value>, kwargs: Kwargs| {
			inline_random_choice(state, &args, &kwargs)
		},
	);
	env.add_function("fake_i18n", |state: &State, locale: String| {
		fake_i18n(state, &locale)
	});
}
