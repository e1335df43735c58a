use std::fmt;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;

use chrono::Datelike;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::Timelike;
use indexmap::IndexMap;
use minijinja::Value;
use minijinja::value::Object;
use minijinja::value::ValueKind;
use serde::Serialize;
use serde::Serializer;

use crate::SynthgenError;
use crate::SynthgenResult;

/// Shared handle to a generated row.
///
/// Rows are compared by identity: two rows with identical fields are still
/// different rows.
pub type RowRef = Arc<ObjectRow>;

pub(crate) const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A rendered field value.
#[derive(Debug, Clone, Default)]
pub enum FieldValue {
	#[default]
	Null,
	Bool(bool),
	Int(i64),
	Float(f64),
	String(String),
	Date(NaiveDate),
	DateTime(NaiveDateTime),
	/// Another row. Sinks flatten it to the row's id.
	Reference(RowRef),
}

impl FieldValue {
	/// Convert text that looks numeric into a number, preferring integers.
	///
	/// Every plain string produced by a recipe goes through this step, so a
	/// field written as `"42"` is written as the integer `42`. Surrounding
	/// whitespace is ignored; other text is kept as written.
	pub fn coerce_numeric(text: &str) -> Self {
		let number = text.trim();
		let looks_numeric = number.bytes().any(|byte| byte.is_ascii_digit())
			&& number
				.bytes()
				.all(|byte| byte.is_ascii_digit() || matches!(byte, b'+' | b'-' | b'.' | b'e' | b'E'));

		if looks_numeric {
			if let Ok(int) = number.parse::<i64>() {
				return Self::Int(int);
			}

			if let Ok(float) = number.parse::<f64>() {
				return Self::Float(float);
			}
		}

		Self::String(text.to_owned())
	}

	/// Name of the value's runtime type, used in error messages.
	pub fn type_name(&self) -> &'static str {
		match self {
			Self::Null => "null",
			Self::Bool(_) => "bool",
			Self::Int(_) => "int",
			Self::Float(_) => "float",
			Self::String(_) => "string",
			Self::Date(_) => "date",
			Self::DateTime(_) => "datetime",
			Self::Reference(_) => "row",
		}
	}

	pub fn is_truthy(&self) -> bool {
		match self {
			Self::Null => false,
			Self::Bool(value) => *value,
			Self::Int(value) => *value != 0,
			Self::Float(value) => *value != 0.0,
			Self::String(value) => !value.is_empty(),
			Self::Date(_) | Self::DateTime(_) | Self::Reference(_) => true,
		}
	}

	pub fn is_null(&self) -> bool {
		matches!(self, Self::Null)
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::String(value) => Some(value),
			_ => None,
		}
	}

	pub fn as_row(&self) -> Option<&RowRef> {
		match self {
			Self::Reference(row) => Some(row),
			_ => None,
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Self::Int(value) => Some(*value as f64),
			Self::Float(value) => Some(*value),
			_ => None,
		}
	}

	/// Expose the value to the expression language.
	pub(crate) fn to_value(&self) -> Value {
		match self {
			Self::Null => Value::from(()),
			Self::Bool(value) => Value::from(*value),
			Self::Int(value) => Value::from(*value),
			Self::Float(value) => Value::from(*value),
			Self::String(value) => Value::from(value.as_str()),
			Self::Date(value) => Value::from_object(DateHandle(*value)),
			Self::DateTime(value) => Value::from_object(DateTimeHandle(*value)),
			Self::Reference(row) => Value::from_object(RowHandle(row.clone())),
		}
	}

	/// Read a value produced by the expression language.
	///
	/// Anything outside the supported field types is a value error.
	pub(crate) fn from_value(value: &Value) -> SynthgenResult<Self> {
		if let Some(row) = value.downcast_object_ref::<RowHandle>() {
			return Ok(Self::Reference(row.0.clone()));
		}

		if let Some(date) = value.downcast_object_ref::<DateHandle>() {
			return Ok(Self::Date(date.0));
		}

		if let Some(datetime) = value.downcast_object_ref::<DateTimeHandle>() {
			return Ok(Self::DateTime(datetime.0));
		}

		match value.kind() {
			ValueKind::Undefined | ValueKind::None => Ok(Self::Null),
			ValueKind::Bool => Ok(Self::Bool(value.is_true())),
			ValueKind::Number => {
				if let Ok(int) = i64::try_from(value.clone()) {
					return Ok(Self::Int(int));
				}

				f64::try_from(value.clone()).map(Self::Float).map_err(|_| {
					SynthgenError::value(format!("cannot represent number `{value}`"))
				})
			}
			ValueKind::String => Ok(Self::String(value.as_str().unwrap_or_default().to_owned())),
			kind => {
				Err(SynthgenError::value(format!(
					"unexpected value `{value}` of type {kind:?}; fields may only hold null, bool, \
					 int, float, string, date, datetime or row values"
				)))
			}
		}
	}
}

impl PartialEq for FieldValue {
	fn eq(&self, other: &Self) -> bool {
		match (self, other) {
			(Self::Null, Self::Null) => true,
			(Self::Bool(left), Self::Bool(right)) => left == right,
			(Self::Int(left), Self::Int(right)) => left == right,
			(Self::Float(left), Self::Float(right)) => left == right,
			(Self::String(left), Self::String(right)) => left == right,
			(Self::Date(left), Self::Date(right)) => left == right,
			(Self::DateTime(left), Self::DateTime(right)) => left == right,
			(Self::Reference(left), Self::Reference(right)) => Arc::ptr_eq(left, right),
			_ => false,
		}
	}
}

impl fmt::Display for FieldValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Null => f.write_str("null"),
			Self::Bool(value) => write!(f, "{value}"),
			Self::Int(value) => write!(f, "{value}"),
			Self::Float(value) => write!(f, "{value}"),
			Self::String(value) => f.write_str(value),
			Self::Date(value) => write!(f, "{}", value.format("%Y-%m-%d")),
			Self::DateTime(value) => write!(f, "{}", value.format(DATETIME_FORMAT)),
			Self::Reference(row) => write!(f, "{row}"),
		}
	}
}

impl Serialize for FieldValue {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			Self::Null => serializer.serialize_none(),
			Self::Bool(value) => serializer.serialize_bool(*value),
			Self::Int(value) => serializer.serialize_i64(*value),
			Self::Float(value) => serializer.serialize_f64(*value),
			Self::String(value) => serializer.serialize_str(value),
			Self::Date(_) | Self::DateTime(_) => serializer.collect_str(self),
			Self::Reference(row) => serializer.serialize_u64(row.id()),
		}
	}
}

impl From<&str> for FieldValue {
	fn from(value: &str) -> Self {
		Self::String(value.to_owned())
	}
}

impl From<i64> for FieldValue {
	fn from(value: i64) -> Self {
		Self::Int(value)
	}
}

impl From<bool> for FieldValue {
	fn from(value: bool) -> Self {
		Self::Bool(value)
	}
}

impl From<RowRef> for FieldValue {
	fn from(value: RowRef) -> Self {
		Self::Reference(value)
	}
}

/// One generated row: its table, its id and the fields rendered so far.
///
/// Fields are filled in while the row is being built so that later fields
/// (and child rows) can read earlier ones through `this`.
pub struct ObjectRow {
	table: String,
	id: u64,
	fields: RwLock<IndexMap<String, FieldValue>>,
}

impl ObjectRow {
	pub fn new(table: impl Into<String>, id: u64) -> Self {
		Self {
			table: table.into(),
			id,
			fields: RwLock::new(IndexMap::new()),
		}
	}

	pub fn table(&self) -> &str {
		&self.table
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	/// Look up a field; `id` is always present.
	pub fn get(&self, field: &str) -> Option<FieldValue> {
		if field == "id" {
			return Some(FieldValue::Int(self.id as i64));
		}

		self.fields
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.get(field)
			.cloned()
	}

	/// Snapshot of the rendered fields, in declaration order, without `id`.
	pub fn fields(&self) -> IndexMap<String, FieldValue> {
		self.fields
			.read()
			.unwrap_or_else(PoisonError::into_inner)
			.clone()
	}

	/// Drop every field, releasing the rows this one references.
	pub(crate) fn clear(&self) {
		self.fields
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.clear();
	}

	pub(crate) fn set(&self, field: &str, value: FieldValue) {
		self.fields
			.write()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(field.to_owned(), value);
	}
}

impl fmt::Debug for ObjectRow {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		// Field values are left out: rows may reference each other in cycles.
		let fields = self.fields.read().unwrap_or_else(PoisonError::into_inner);
		f.debug_struct("ObjectRow")
			.field("table", &self.table)
			.field("id", &self.id)
			.field("fields", &fields.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl fmt::Display for ObjectRow {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}({})", self.table, self.id)
	}
}

/// A row as seen from inside an expression: `this.name`, `Account.id`.
#[derive(Debug)]
pub(crate) struct RowHandle(pub(crate) RowRef);

impl Object for RowHandle {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		let field = key.as_str()?;
		self.0.get(field).map(|value| value.to_value())
	}

	fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug)]
pub(crate) struct DateHandle(pub(crate) NaiveDate);

impl Object for DateHandle {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		let value = match key.as_str()? {
			"year" => i64::from(self.0.year()),
			"month" => i64::from(self.0.month()),
			"day" => i64::from(self.0.day()),
			_ => return None,
		};

		Some(Value::from(value))
	}

	fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.format("%Y-%m-%d"))
	}
}

#[derive(Debug)]
pub(crate) struct DateTimeHandle(pub(crate) NaiveDateTime);

impl Object for DateTimeHandle {
	fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
		let value = match key.as_str()? {
			"year" => i64::from(self.0.year()),
			"month" => i64::from(self.0.month()),
			"day" => i64::from(self.0.day()),
			"hour" => i64::from(self.0.hour()),
			"minute" => i64::from(self.0.minute()),
			"second" => i64::from(self.0.second()),
			_ => return None,
		};

		Some(Value::from(value))
	}

	fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.format(DATETIME_FORMAT))
	}
}
